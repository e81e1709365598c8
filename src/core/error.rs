//! 错误类型
//!
//! TrainerError：命令处理层的错误，在编排器里统一转成一条错误提示，不会终止进程。
//! TurnError：单轮中「来访者回复」这一半失败的原因；教练那一半从不失败（降级为替代记录）。

use thiserror::Error;

use crate::core::command::CommandError;
use crate::llm::LlmError;
use crate::memory::NodeId;

#[derive(Error, Debug)]
pub enum TrainerError {
    #[error("No active session. Use /scenario to start one.")]
    NoSession,

    #[error("A reply is still being generated; wait for it or press Esc to cancel.")]
    TurnInFlight,

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Failed to parse scenario: {0}")]
    ScenarioParse(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Have a longer conversation first (at least {0} messages on this path).")]
    ConversationTooShort(usize),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// 来访者回复没能落到树上的原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TurnError {
    #[error("Client reply failed: {0}")]
    ClientFailed(LlmError),

    #[error("Client reply was empty")]
    EmptyReply,

    #[error("Anchor node {0} no longer exists")]
    AnchorMissing(NodeId),

    #[error("Generation task ended without a result")]
    Abandoned,
}
