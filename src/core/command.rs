//! 输入解析：以 / 开头的是命令，其余是练习者发言

use thiserror::Error;

/// 一行用户输入
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Message(String),
    Command(SlashCommand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashCommand {
    Help,
    Hint,
    Debrief,
    Quit,
    Save,
    /// 无参数时列出会话；n 从 1 开始
    Load(Option<usize>),
    /// 无参数时列出场景；参数可以是编号或名称
    Scenario(Option<String>),
    New(String),
    Rewind(usize),
    Branches,
    /// 分支编号或节点 id，由编排器先按编号再按 id 解析
    Goto(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("/{command}: {hint}")]
    MissingArgument {
        command: &'static str,
        hint: &'static str,
    },

    #[error("/{command}: invalid argument '{arg}'")]
    InvalidArgument { command: &'static str, arg: String },
}

pub const HELP_TEXT: &str = "Commands:
  /help          - Show this help
  /hint          - Get technique suggestion
  /debrief       - Full session analysis
  /quit          - Exit (saves the session)
  /save          - Save current session
  /load [n]      - List or load a saved session
  /scenario [n]  - List or select scenario
  /new <desc>    - Generate new scenario
  /rewind [n]    - Go back n messages
  /branches      - Show branches
  /goto <n|id>   - Jump to branch n or node id";

/// 解析一行输入；调用方保证已去掉首尾空白且非空
pub fn parse_input(text: &str) -> Result<Input, CommandError> {
    let Some(rest) = text.strip_prefix('/') else {
        return Ok(Input::Message(text.to_string()));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let arg = (!args.is_empty()).then(|| args.to_string());

    let command = match name.to_lowercase().as_str() {
        "help" => SlashCommand::Help,
        "hint" => SlashCommand::Hint,
        "debrief" => SlashCommand::Debrief,
        "quit" | "exit" => SlashCommand::Quit,
        "save" => SlashCommand::Save,
        "load" => SlashCommand::Load(parse_number("load", arg.as_deref())?),
        "scenario" => SlashCommand::Scenario(arg),
        "new" => SlashCommand::New(arg.ok_or(CommandError::MissingArgument {
            command: "new",
            hint: "please provide a description",
        })?),
        "rewind" => SlashCommand::Rewind(parse_number("rewind", arg.as_deref())?.unwrap_or(1)),
        "branches" => SlashCommand::Branches,
        "goto" => SlashCommand::Goto(arg.ok_or(CommandError::MissingArgument {
            command: "goto",
            hint: "please specify a branch number or node id",
        })?),
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Input::Command(command))
}

fn parse_number(command: &'static str, arg: Option<&str>) -> Result<Option<usize>, CommandError> {
    arg.map(|a| {
        a.parse::<usize>().map_err(|_| CommandError::InvalidArgument {
            command,
            arg: a.to_string(),
        })
    })
    .transpose()
}
