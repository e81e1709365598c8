//! 场景生成：一句描述 -> 完整来访者画像

use std::sync::Arc;

use crate::core::TrainerError;
use crate::llm::LlmClient;
use crate::memory::{extract_json_block, Message};
use crate::scenario::{model::sanitize_id, Scenario};

pub struct ScenarioBuilder {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
}

impl ScenarioBuilder {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// 生成并解析场景；解析失败是硬错误，由用户重试
    pub async fn build(&self, description: &str) -> Result<Scenario, TrainerError> {
        let request = format!(
            "Create a detailed MI practice scenario based on this description:\n\n{}",
            description
        );
        let reply = self
            .llm
            .complete(&[Message::system(self.system_prompt.clone()), Message::user(request)])
            .await?;
        let scenario = parse_scenario(&reply)?;
        tracing::info!("Generated scenario '{}' ({})", scenario.name, scenario.id);
        Ok(scenario)
    }
}

/// 解析模型输出的场景 JSON；缺 id 时由 name 派生
pub fn parse_scenario(reply: &str) -> Result<Scenario, TrainerError> {
    let excerpt = || reply.chars().take(500).collect::<String>();

    let mut value: serde_json::Value = serde_json::from_str(extract_json_block(reply))
        .map_err(|e| TrainerError::ScenarioParse(format!("{}\n\nResponse: {}", e, excerpt())))?;

    if let Some(obj) = value.as_object_mut() {
        let has_id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .is_some_and(|s| !s.trim().is_empty());
        if !has_id {
            let name = obj.get("name").and_then(|v| v.as_str()).unwrap_or("scenario");
            let id = sanitize_id(&name.replace(' ', "-"));
            obj.insert("id".to_string(), serde_json::Value::String(id));
        }
    }

    let scenario: Scenario = serde_json::from_value(value)
        .map_err(|e| TrainerError::ScenarioParse(format!("{}\n\nResponse: {}", e, excerpt())))?;
    Ok(scenario.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlmClient, ScriptedLlmClient};
    use std::time::Duration;

    #[test]
    fn test_parse_fenced_scenario_derives_id_and_clamps() {
        let reply = "Sure!\n```json\n{\"name\": \"Teen Vaping\", \"description\": \"d\", \
                     \"demographics\": \"16\", \"presenting_issue\": \"vaping\", \"resistance_level\": 9}\n```";
        let scenario = parse_scenario(reply).unwrap();
        assert_eq!(scenario.id, "teen-vaping");
        assert_eq!(scenario.resistance_level, 5);
    }

    #[test]
    fn test_parse_failure_is_error() {
        assert!(matches!(
            parse_scenario("I can't do that."),
            Err(TrainerError::ScenarioParse(_))
        ));
    }

    #[tokio::test]
    async fn test_build_with_mock_backend() {
        let builder = ScenarioBuilder::new(Arc::new(MockLlmClient), "builder");
        let scenario = builder.build("someone unsure about exercise").await.unwrap();
        assert_eq!(scenario.id, "mock-scenario");
        assert!(!scenario.opening_statement.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let llm = ScriptedLlmClient::new(Vec::<String>::new()).failing_on_open(LlmError::Timeout(Duration::from_secs(60)));
        let builder = ScenarioBuilder::new(Arc::new(llm), "builder");
        assert!(matches!(
            builder.build("x").await,
            Err(TrainerError::Llm(LlmError::Timeout(d))) if d == Duration::from_secs(60)
        ));
    }
}
