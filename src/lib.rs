//! MI Trainer - 动机式访谈练习工具
//!
//! 模块划分：
//! - **agents**: 来访者、教练、场景生成三个智能体与提示词
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 单轮编排、主控循环、命令解析、状态投影、取消管理
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **memory**: 分支对话树、教练反馈、会话持久化
//! - **observability**: tracing 初始化
//! - **scenario**: 场景模型与场景库
//! - **ui**: Ratatui TUI 界面

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod scenario;
pub mod ui;
