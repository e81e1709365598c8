//! 智能体层：来访者、教练、场景生成与提示词

pub mod client;
pub mod coach;
pub mod prompts;
pub mod scenario_builder;

pub use client::ClientAgent;
pub use coach::{format_transcript, CoachAgent};
pub use prompts::PromptSet;
pub use scenario_builder::{parse_scenario, ScenarioBuilder};
