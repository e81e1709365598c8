//! 核心编排层：错误、输入解析、单轮编排、状态投影、会话监管、主控循环

pub mod command;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod turn;

pub use command::{parse_input, CommandError, Input, SlashCommand, HELP_TEXT};
pub use error::{TrainerError, TurnError};
pub use orchestrator::{
    create_llm_from_config, create_trainer, spawn_trainer, Command, StartupSession, TrainerDeps,
    TrainerHandle,
};
pub use session_supervisor::SessionSupervisor;
pub use state::{project, Notice, NoticeLevel, Notices, PathEntry, TrainerPhase, UiState};
pub use turn::{
    GenerationEvent, InFlightTurn, StreamEvent, StreamSink, StreamTag, TurnOrchestrator,
    TurnOutcome,
};
