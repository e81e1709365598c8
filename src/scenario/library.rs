//! 场景库
//!
//! 内置场景目录（随程序发布，只读）+ 用户场景目录（/new 生成的场景写在这里）。
//! 读不了的文件打一条 warn 后跳过，不影响其它场景。

use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::scenario::model::sanitize_id;
use crate::scenario::Scenario;

/// 场景库：两个目录，内置在前
#[derive(Debug, Clone)]
pub struct ScenarioLibrary {
    builtin_dir: PathBuf,
    user_dir: PathBuf,
}

impl ScenarioLibrary {
    pub fn new(builtin_dir: impl AsRef<Path>, user_dir: impl AsRef<Path>) -> Self {
        Self {
            builtin_dir: builtin_dir.as_ref().to_path_buf(),
            user_dir: user_dir.as_ref().to_path_buf(),
        }
    }

    pub fn list_builtin(&self) -> Vec<Scenario> {
        load_dir(&self.builtin_dir)
    }

    pub fn list_user(&self) -> Vec<Scenario> {
        load_dir(&self.user_dir)
    }

    /// 全部场景：内置在前，用户在后；编号（/scenario n）按此顺序
    pub fn list_all(&self) -> Vec<Scenario> {
        let mut all = self.list_builtin();
        all.extend(self.list_user());
        all
    }

    pub fn find_by_id(&self, id: &str) -> Option<Scenario> {
        self.list_all().into_iter().find(|s| s.id == id)
    }

    /// 名称不区分大小写的子串匹配，取第一个
    pub fn find_by_name(&self, name: &str) -> Option<Scenario> {
        let needle = name.to_lowercase();
        self.list_all()
            .into_iter()
            .find(|s| s.name.to_lowercase().contains(&needle))
    }

    /// 写入用户目录 `<id>.json`；目录不存在时自动创建
    pub fn save_user(&self, scenario: &Scenario) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.user_dir)
            .with_context(|| format!("create {}", self.user_dir.display()))?;
        let path = self.user_dir.join(format!("{}.json", scenario.file_stem()));
        std::fs::write(&path, serde_json::to_string_pretty(scenario)?)
            .with_context(|| format!("write {}", path.display()))?;
        tracing::info!("Saved user scenario {} to {}", scenario.id, path.display());
        Ok(path)
    }

    /// 删除用户场景；不存在时返回 false
    pub fn delete_user(&self, id: &str) -> anyhow::Result<bool> {
        let path = self.user_dir.join(format!("{}.json", sanitize_id(id)));
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
        Ok(true)
    }
}

/// 读取单个场景文件
pub fn load_scenario_file(path: &Path) -> anyhow::Result<Scenario> {
    let data = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let scenario: Scenario =
        serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))?;
    Ok(scenario.normalized())
}

fn load_dir(dir: &Path) -> Vec<Scenario> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    paths
        .iter()
        .filter_map(|p| match load_scenario_file(p) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("Skipping scenario file: {:#}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scenario(id: &str, name: &str) -> Scenario {
        Scenario {
            id: id.to_string(),
            name: name.to_string(),
            ..Scenario::default()
        }
    }

    #[test]
    fn test_builtin_before_user_and_bad_files_skipped() {
        let builtin = TempDir::new().unwrap();
        let user = TempDir::new().unwrap();
        let library = ScenarioLibrary::new(builtin.path(), user.path());

        std::fs::write(
            builtin.path().join("b.json"),
            serde_json::to_string(&scenario("b", "Builtin Smoker")).unwrap(),
        )
        .unwrap();
        std::fs::write(builtin.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(builtin.path().join("notes.txt"), "ignored").unwrap();
        library.save_user(&scenario("u", "User Gambler")).unwrap();

        let names: Vec<_> = library.list_all().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["Builtin Smoker", "User Gambler"]);
    }

    #[test]
    fn test_find_by_name_is_case_insensitive_substring() {
        let builtin = TempDir::new().unwrap();
        let library = ScenarioLibrary::new(builtin.path(), builtin.path().join("user"));
        library.save_user(&scenario("x", "Reluctant Drinker")).unwrap();

        assert_eq!(library.find_by_name("drink").map(|s| s.id), Some("x".to_string()));
        assert_eq!(library.find_by_id("x").map(|s| s.name), Some("Reluctant Drinker".to_string()));
        assert!(library.find_by_name("vaping").is_none());
    }

    #[test]
    fn test_delete_user() {
        let dir = TempDir::new().unwrap();
        let library = ScenarioLibrary::new(dir.path().join("builtin"), dir.path().join("user"));
        library.save_user(&scenario("Gone Soon", "Temp")).unwrap();
        assert!(library.delete_user("Gone Soon").unwrap());
        assert!(!library.delete_user("Gone Soon").unwrap());
        assert!(library.list_user().is_empty());
    }

    #[test]
    fn test_missing_dirs_are_empty() {
        let library = ScenarioLibrary::new("/nonexistent/builtin", "/nonexistent/user");
        assert!(library.list_all().is_empty());
    }
}
