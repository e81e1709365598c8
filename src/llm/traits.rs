//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / Mock / Scripted）实现 LlmClient：complete（非流式）、complete_stream（流式文本块）。

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::memory::Message;

/// 流式文本块：每一项是一段增量文本，或一个中途失败
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 生成后端错误（超时、传输、请求构造、空回复、取消）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Request build error: {0}")]
    RequestBuild(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Empty response")]
    EmptyResponse,

    #[error("Cancelled")]
    Cancelled,
}

/// LLM 客户端 trait：非流式完成与流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成，返回完整文本
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回文本块流；块的顺序即生成顺序
    async fn complete_stream(&self, messages: &[Message]) -> Result<TextStream, LlmError>;
}
