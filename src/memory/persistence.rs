//! 会话持久化
//!
//! 一个会话 = 场景 + 整棵对话树（含所有分支与已挂的反馈）+ 创建/更新时间，存为单个 JSON 文件。
//! 加载后先做树完整性校验，再交给调用方。

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::ConversationTree;
use crate::scenario::Scenario;

/// 一次完整的练习会话
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub scenario: Scenario,
    pub conversation: ConversationTree,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(scenario: Scenario) -> Self {
        let now = Utc::now();
        Self {
            scenario,
            conversation: ConversationTree::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 默认文件名：`YYYYmmdd_HHMMSS_<scenario id>.json`
    pub fn default_filename(&self) -> String {
        format!(
            "{}_{}.json",
            self.created_at.format("%Y%m%d_%H%M%S"),
            self.scenario.file_stem()
        )
    }
}

/// 会话列表项（/load 展示用）
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSummary {
    pub path: PathBuf,
    pub scenario_name: String,
    pub created_at: DateTime<Utc>,
}

/// 文件会话存储：一个目录，每个会话一个 JSON 文件
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 保存会话并刷新 updated_at；filename 为空时用默认文件名。目录不存在时自动创建
    pub fn save(&self, session: &mut Session, filename: Option<&str>) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;

        let name = filename
            .map(String::from)
            .unwrap_or_else(|| session.default_filename());
        let path = self.dir.join(name);

        session.updated_at = Utc::now().max(session.created_at);
        std::fs::write(&path, serde_json::to_string_pretty(session)?)
            .with_context(|| format!("write {}", path.display()))?;
        tracing::info!(
            "Saved session ({} nodes) to {}",
            session.conversation.len(),
            path.display()
        );
        Ok(path)
    }

    /// 加载会话；树结构不完整时报错
    pub fn load(&self, path: impl AsRef<Path>) -> anyhow::Result<Session> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let session: Session =
            serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
        session
            .conversation
            .validate()
            .with_context(|| format!("corrupt conversation in {}", path.display()))?;
        tracing::info!("Loaded session from {}", path.display());
        Ok(session)
    }

    /// 列出所有可读的会话，新的在前；读不了的文件跳过
    pub fn list(&self) -> Vec<SessionSummary> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut sessions: Vec<SessionSummary> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| {
                let data = std::fs::read_to_string(&path).ok()?;
                let header: SessionHeader = serde_json::from_str(&data).ok()?;
                Some(SessionSummary {
                    path,
                    scenario_name: header.scenario.name,
                    created_at: header.created_at,
                })
            })
            .collect();

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }
}

/// 列表只需要场景名与创建时间，不反序列化整棵树
#[derive(Deserialize)]
struct SessionHeader {
    scenario: ScenarioName,
    created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ScenarioName {
    name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{CoachFeedback, Speaker};
    use chrono::Duration;
    use tempfile::TempDir;

    fn scenario() -> Scenario {
        Scenario {
            id: "smoking".to_string(),
            name: "Ambivalent Smoker".to_string(),
            ..Scenario::default()
        }
    }

    #[test]
    fn test_round_trip_keeps_branches_feedback_and_current() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let mut session = Session::new(scenario());
        let tree = &mut session.conversation;
        tree.add_message(Speaker::Client, "I know I should quit.");
        let p = tree.add_message(Speaker::Practitioner, "You should.").id().clone();
        tree.attach_feedback(&p, CoachFeedback::unparsed("???", 200)).unwrap();
        tree.add_message(Speaker::Client, "Everyone says that.");
        tree.rewind(2);
        tree.add_message(Speaker::Practitioner, "Part of you wants to quit.");
        tree.rewind(1);

        let path = store.save(&mut session, None).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_smoking.json"));

        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.conversation.children_of_current().len(), 2);
    }

    #[test]
    fn test_list_newest_first_and_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let mut older = Session::new(scenario());
        older.created_at = older.created_at - Duration::hours(2);
        store.save(&mut older, Some("older.json")).unwrap();

        let mut newer = Session::new(Scenario {
            name: "Newer".to_string(),
            ..scenario()
        });
        store.save(&mut newer, Some("newer.json")).unwrap();

        std::fs::write(dir.path().join("garbage.json"), "not a session").unwrap();

        let names: Vec<_> = store.list().into_iter().map(|s| s.scenario_name).collect();
        assert_eq!(names, vec!["Newer", "Ambivalent Smoker"]);
    }

    #[test]
    fn test_load_rejects_corrupt_tree() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let mut session = Session::new(scenario());
        session.conversation.add_message(Speaker::Client, "hi");
        let path = store.save(&mut session, Some("s.json")).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        value["conversation"]["current"] = serde_json::Value::String("ghost".to_string());
        std::fs::write(&path, value.to_string()).unwrap();

        assert!(store.load(&path).is_err());
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let store = SessionStore::new("/nonexistent/sessions");
        assert!(store.list().is_empty());
    }
}
