//! 来访者角色：按场景画像扮演有矛盾心理的来访者

use std::sync::Arc;

use crate::llm::{LlmClient, LlmError, TextStream};
use crate::memory::Message;
use crate::scenario::Scenario;

const OPENING_REQUEST: &str = "Please begin the conversation with your opening statement. \
Introduce yourself briefly and share what brings you here today.";

pub struct ClientAgent {
    llm: Arc<dyn LlmClient>,
    scenario: Scenario,
    system_prompt: String,
}

impl ClientAgent {
    /// template 中的 {scenario_context} 替换为场景画像
    pub fn new(llm: Arc<dyn LlmClient>, scenario: Scenario, template: &str) -> Self {
        let system_prompt = template.replace("{scenario_context}", &scenario.to_prompt_context());
        Self {
            llm,
            scenario,
            system_prompt,
        }
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 根据对话历史流式生成来访者的下一句
    pub async fn respond(&self, history: &[Message]) -> Result<TextStream, LlmError> {
        self.llm.complete_stream(&self.with_system(history)).await
    }

    /// 开场白：场景自带则直接用，否则让模型生成
    pub async fn opening(&self) -> Result<String, LlmError> {
        let scripted = self.scenario.opening_statement.trim();
        if !scripted.is_empty() {
            return Ok(scripted.to_string());
        }
        let reply = self
            .llm
            .complete(&self.with_system(&[Message::user(OPENING_REQUEST)]))
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(reply.to_string())
    }

    fn with_system(&self, history: &[Message]) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(Message::system(self.system_prompt.clone()));
        messages.extend_from_slice(history);
        messages
    }
}
