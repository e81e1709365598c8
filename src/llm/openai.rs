//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；DeepSeek、OpenAI、自建代理均可。
//! complete_stream 走真正的 SSE 流，逐块转发 delta.content。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use futures_util::StreamExt;

use crate::llm::{LlmClient, LlmError, TextStream};
use crate::memory::{Message, Role};

/// DeepSeek 端点（OpenAI 兼容）
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// OpenAI 兼容客户端：持有 Client、model 名、单次回复 token 上限与非流式请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
    request_timeout: Duration,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(
        messages: &[Message],
    ) -> Result<Vec<ChatCompletionRequestMessage>, LlmError> {
        messages
            .iter()
            .map(|m| {
                let built = match m.role {
                    Role::System => ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::System),
                    Role::User => ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::User),
                    Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map(ChatCompletionRequestMessage::Assistant),
                };
                built.map_err(|e| LlmError::RequestBuild(e.to_string()))
            })
            .collect()
    }

    fn build_request(&self, messages: &[Message]) -> Result<CreateChatCompletionRequest, LlmError> {
        CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_completion_tokens(self.max_tokens)
            .messages(Self::to_openai_messages(messages)?)
            .build()
            .map_err(|e| LlmError::RequestBuild(e.to_string()))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let request = self.build_request(messages)?;

        let response = tokio::time::timeout(self.request_timeout, self.client.chat().create(request))
            .await
            .map_err(|_| LlmError::Timeout(self.request_timeout))?
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream, LlmError> {
        let request = self.build_request(messages)?;

        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| LlmError::ApiError(e.to_string()))?;

        // 只保留非空 delta；结束帧（finish_reason）无文本，直接跳过
        let chunks = stream.filter_map(|item| async move {
            match item {
                Ok(response) => {
                    let text: String = response
                        .choices
                        .iter()
                        .filter_map(|c| c.delta.content.as_deref())
                        .collect();
                    (!text.is_empty()).then_some(Ok(text))
                }
                Err(e) => Some(Err(LlmError::ApiError(e.to_string()))),
            }
        });

        Ok(Box::pin(chunks))
    }
}
