//! 记忆层：对话树、教练反馈记录、会话持久化

pub mod conversation;
pub mod feedback;
pub mod persistence;

pub use conversation::{ConversationNode, ConversationTree, Message, NodeId, Role, Speaker, TreeError};
pub use feedback::{extract_json_block, parse_feedback, CoachFeedback, FeedbackOrigin};
pub use persistence::{Session, SessionStore, SessionSummary};
