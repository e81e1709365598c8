//! 场景（来访者画像）数据模型
//!
//! 场景以 JSON 存放；to_prompt_context 渲染成来访者 system prompt 中的 Client Profile 段。

use serde::{Deserialize, Serialize};

/// 来访者对改变的矛盾心态
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ambivalence {
    /// 想改变的理由
    pub change: Vec<String>,
    /// 想维持现状的理由
    pub status_quo: Vec<String>,
}

/// 一个 MI 练习场景
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    pub description: String,
    pub demographics: String,
    pub presenting_issue: String,
    #[serde(default)]
    pub ambivalence: Ambivalence,
    /// 1 = 很配合，5 = 非常抗拒
    #[serde(default = "default_resistance_level")]
    pub resistance_level: u8,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub personality_notes: String,
    #[serde(default)]
    pub potential_change_talk_triggers: Vec<String>,
    #[serde(default)]
    pub common_sustain_talk: Vec<String>,
    /// 为空时由模型生成开场白
    #[serde(default)]
    pub opening_statement: String,
}

fn default_resistance_level() -> u8 {
    3
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            description: String::new(),
            demographics: String::new(),
            presenting_issue: String::new(),
            ambivalence: Ambivalence::default(),
            resistance_level: default_resistance_level(),
            background: String::new(),
            personality_notes: String::new(),
            potential_change_talk_triggers: Vec::new(),
            common_sustain_talk: Vec::new(),
            opening_statement: String::new(),
        }
    }
}

/// 非字母数字、-、_ 的字符替换为 _，全部小写
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

pub const MIN_RESISTANCE: u8 = 1;
pub const MAX_RESISTANCE: u8 = 5;

impl Scenario {
    /// 把抗拒程度夹到 1..=5
    pub fn normalized(mut self) -> Self {
        self.resistance_level = self.resistance_level.clamp(MIN_RESISTANCE, MAX_RESISTANCE);
        self
    }

    /// 文件名安全的 id
    pub fn file_stem(&self) -> String {
        sanitize_id(&self.id)
    }

    /// 渲染来访者画像，替换 client_system 模板中的 {scenario_context}
    pub fn to_prompt_context(&self) -> String {
        let bullets = |items: &[String]| -> String {
            items
                .iter()
                .map(|i| format!("- {}", i))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let mut ambivalence = String::from("Reasons for change:\n");
        for reason in &self.ambivalence.change {
            ambivalence.push_str(&format!("  - {}\n", reason));
        }
        ambivalence.push_str("\nReasons to stay the same:\n");
        for reason in &self.ambivalence.status_quo {
            ambivalence.push_str(&format!("  - {}\n", reason));
        }

        format!(
            "## Client Profile\n\n\
             **Demographics:** {}\n\
             **Presenting Issue:** {}\n\
             **Resistance Level:** {}/5\n\n\
             **Background:**\n{}\n\n\
             **Personality:**\n{}\n\n\
             **Ambivalence:**\n{}\n\
             **Things that might trigger change talk:**\n{}\n\n\
             **Common sustain talk patterns:**\n{}\n",
            self.demographics,
            self.presenting_issue,
            self.resistance_level,
            self.background,
            self.personality_notes,
            ambivalence,
            bullets(&self.potential_change_talk_triggers),
            bullets(&self.common_sustain_talk),
        )
    }
}
