//! MI Trainer - 动机式访谈练习
//!
//! 入口：解析命令行、初始化日志、创建训练器编排器与 TUI，并运行主循环。

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use mi_trainer::config::{load_config, AppConfig};
use mi_trainer::core::{create_trainer, Command, StartupSession};
use mi_trainer::scenario::ScenarioLibrary;
use mi_trainer::{observability, ui::run_app};

/// 与模拟来访者练习动机式访谈，并获得逐条教练反馈
#[derive(Parser)]
#[command(name = "mi-trainer", version, about = "Practice Motivational Interviewing with live coaching feedback")]
struct Cli {
    /// 配置文件（叠加在 config/default.toml 之上）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 直接进入的场景（编号、id 或名称）
    #[arg(short, long, conflicts_with = "load")]
    scenario: Option<String>,

    /// 恢复一个已保存的会话文件
    #[arg(short, long)]
    load: Option<PathBuf>,

    /// 列出可用场景后退出
    #[arg(long)]
    list_scenarios: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 日志目录取决于配置，加载失败的告警要等日志初始化后再打
    let (cfg, config_error) = match load_config(cli.config.as_deref()) {
        Ok(cfg) => (cfg, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    let warn_config = || {
        if let Some(e) = &config_error {
            tracing::warn!("Config load failed ({}), using defaults", e);
        }
    };

    if cli.list_scenarios {
        observability::init_stderr();
        warn_config();
        let library = ScenarioLibrary::new(cfg.app.builtin_scenarios_dir(), cfg.app.user_scenarios_dir());
        let scenarios = library.list_all();
        if scenarios.is_empty() {
            println!("No scenarios available. Run the app and use /new <description> to create one.");
        }
        for s in scenarios {
            println!("  {} ({})\n    {}\n    Resistance: {}/5\n", s.name, s.id, s.description, s.resistance_level);
        }
        return Ok(());
    }

    // 日志写文件，TUI 占用终端
    observability::init(&cfg.app.log_path()).context("Failed to initialise logging")?;
    warn_config();

    let initial = match (cli.scenario, cli.load) {
        (Some(query), _) => StartupSession::Scenario(query),
        (None, Some(path)) => StartupSession::Resume(path),
        (None, None) => StartupSession::Pick,
    };

    let handle = create_trainer(&cfg, initial)
        .await
        .context("Failed to create trainer")?;
    let quit_tx = handle.cmd_tx.clone();

    run_app(handle.state_rx, handle.stream_rx, handle.cmd_tx)
        .await
        .context("App run failed")?;

    // 让编排器收尾并保存会话；它若已因 /quit 退出，发送会失败，直接等待即可
    let _ = quit_tx.send(Command::Quit);
    handle.task.await.context("Trainer task failed")?;
    Ok(())
}
