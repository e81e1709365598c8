//! Mock / Scripted LLM 客户端（无需 API）
//!
//! - MockLlmClient：离线兜底。识别教练分析请求返回固定 JSON 反馈，识别场景生成请求返回固定场景，
//!   其余按「来访者」口吻回一句话，并按词切块模拟流式输出。
//! - ScriptedLlmClient：测试用，按脚本吐出固定文本块，可设置每块延迟与中途失败，并记录收到的上下文。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};

use crate::llm::{LlmClient, LlmError, TextStream};
use crate::memory::{Message, Role};

const MOCK_FEEDBACK: &str = r#"```json
{
  "techniques_used": ["open_question"],
  "mi_consistent": ["Invited the client to elaborate in their own words"],
  "mi_inconsistent": [],
  "suggestions": ["Try following up with a complex reflection"],
  "overall_note": "(mock coach) Solid, client-centred start."
}
```"#;

const MOCK_SCENARIO: &str = r#"{
  "id": "mock-scenario",
  "name": "Mock Scenario",
  "description": "Offline placeholder scenario",
  "demographics": "Adult, age unspecified",
  "presenting_issue": "Unspecified",
  "resistance_level": 2,
  "opening_statement": "Hi. I'm not really sure why I'm here, to be honest."
}"#;

/// Mock 客户端：没有配置任何 API Key 时使用
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn reply_for(messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        if last_user.contains("## Message to Analyze") {
            MOCK_FEEDBACK.to_string()
        } else if last_user.contains("MI practice scenario") {
            MOCK_SCENARIO.to_string()
        } else {
            "(mock client) I don't know... I guess part of me agrees with you, but it's hard."
                .to_string()
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        Ok(Self::reply_for(messages))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream, LlmError> {
        let content = Self::reply_for(messages);
        let chunks: Vec<Result<String, LlmError>> = content
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }
}

/// 脚本化客户端：complete 返回所有块的拼接；complete_stream 逐块吐出，可在第 N 块后失败
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlmClient {
    chunks: Vec<String>,
    fail_after: Option<(usize, LlmError)>,
    fail_on_open: Option<LlmError>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// 吐出前 n 块后以 err 结束流
    pub fn failing_after(mut self, n: usize, err: LlmError) -> Self {
        self.fail_after = Some((n, err));
        self
    }

    /// 连流都打不开（传输层错误）
    pub fn failing_on_open(mut self, err: LlmError) -> Self {
        self.fail_on_open = Some(err);
        self
    }

    /// 每块之前等待 delay
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 迄今收到的所有请求上下文（按调用顺序）
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    fn record(&self, messages: &[Message]) {
        if let Ok(mut r) = self.requests.lock() {
            r.push(messages.to_vec());
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.record(messages);
        if let Some(err) = &self.fail_on_open {
            return Err(err.clone());
        }
        if let Some((_, err)) = &self.fail_after {
            return Err(err.clone());
        }
        Ok(self.chunks.concat())
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream, LlmError> {
        self.record(messages);
        if let Some(err) = &self.fail_on_open {
            return Err(err.clone());
        }

        let mut items: Vec<Result<String, LlmError>> = match &self.fail_after {
            Some((n, _)) => self.chunks.iter().take(*n).cloned().map(Ok).collect(),
            None => self.chunks.iter().cloned().map(Ok).collect(),
        };
        if let Some((_, err)) = &self.fail_after {
            items.push(Err(err.clone()));
        }

        let delay = self.delay;
        let chunks = stream::iter(items).then(move |item| async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            item
        });
        Ok(Box::pin(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_stream_yields_chunks_in_order() {
        let client = ScriptedLlmClient::new(["a", "b", "c"]);
        let chunks: Vec<_> = client
            .complete_stream(&[Message::user("hi")])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![Ok("a".to_string()), Ok("b".to_string()), Ok("c".to_string())]
        );
        assert_eq!(client.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_stream_fails_midway() {
        let client = ScriptedLlmClient::new(["a", "b", "c"]).failing_after(1, LlmError::Timeout(Duration::from_secs(5)));
        let chunks: Vec<_> = client
            .complete_stream(&[])
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks, vec![Ok("a".to_string()), Err(LlmError::Timeout(Duration::from_secs(5)))]);
    }

    #[tokio::test]
    async fn test_mock_recognizes_coach_request() {
        let reply = MockLlmClient
            .complete(&[Message::user("## Message to Analyze\n\nPractitioner: hi")])
            .await
            .unwrap();
        assert!(reply.contains("techniques_used"));
    }
}
