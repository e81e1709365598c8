//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）

pub mod mock;
pub mod openai;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, DEEPSEEK_BASE_URL, DEEPSEEK_CHAT};
pub use traits::{LlmClient, LlmError, TextStream};
