//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MI__*` 覆盖（双下划线表示嵌套，如 `MI__LLM__PROVIDER=openai`）。

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub coach: CoachSection,
}

/// [app] 段：数据目录与内置场景目录
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppSection {
    /// 会话、用户场景、日志的根目录，未设置时用 ~/.mi-trainer
    pub data_dir: Option<PathBuf>,
    /// 内置场景目录，未设置时依次找 ./scenarios、../scenarios
    pub builtin_scenarios_dir: Option<PathBuf>,
}

impl AppSection {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".mi-trainer")
        })
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir().join("sessions")
    }

    pub fn user_scenarios_dir(&self) -> PathBuf {
        self.data_dir().join("scenarios")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir().join("mi-trainer.log")
    }

    pub fn builtin_scenarios_dir(&self) -> PathBuf {
        if let Some(dir) = &self.builtin_scenarios_dir {
            return dir.clone();
        }
        ["scenarios", "../scenarios"]
            .into_iter()
            .map(PathBuf::from)
            .find(|d| d.is_dir())
            .unwrap_or_else(|| PathBuf::from("scenarios"))
    }
}

/// [llm] 段：后端选择、单次回复上限与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；最终由 API Key 与 provider 共同决定
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: None,
            base_url: None,
            max_tokens: 1024,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

/// [llm.timeouts] 段（秒）：request 为非流式整次请求，stream 为流式两块之间的最长间隔
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    pub request: u64,
    pub stream: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
        }
    }
}

/// [coach] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoachSection {
    /// 反馈解析失败时，替代记录里保留的原文字符数
    pub excerpt_chars: usize,
    /// /debrief 至少需要的路径消息数
    pub min_debrief_messages: usize,
}

impl Default for CoachSection {
    fn default() -> Self {
        Self {
            excerpt_chars: 200,
            min_debrief_messages: 4,
        }
    }
}

/// 从 config 目录加载配置，环境变量 MI__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MI__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    if let Some(name) = default_names
        .into_iter()
        .find(|name| Path::new(&format!("{}.toml", name)).exists())
    {
        builder = builder.add_source(config::File::with_name(name).required(false));
    }

    if let Some(path) = config_path.filter(|p| p.exists()) {
        builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MI")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "deepseek");
        assert_eq!(cfg.llm.timeouts.stream, 120);
        assert_eq!(cfg.coach.excerpt_chars, 200);
        assert!(cfg.app.data_dir().ends_with(".mi-trainer"));
    }

    #[test]
    fn test_explicit_file_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[app]\ndata_dir = \"/tmp/mi\"\n\n[coach]\nexcerpt_chars = 50\n\n[llm.timeouts]\nstream = 5\n",
        )
        .unwrap();

        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.coach.excerpt_chars, 50);
        assert_eq!(cfg.coach.min_debrief_messages, 4);
        assert_eq!(cfg.llm.timeouts.stream, 5);
        assert_eq!(cfg.llm.timeouts.request, 60);
        assert_eq!(cfg.app.sessions_dir(), PathBuf::from("/tmp/mi/sessions"));
    }
}
