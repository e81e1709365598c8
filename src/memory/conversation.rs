//! 对话树
//!
//! 所有节点存放在以 NodeId 为键的 arena 中，父子关系只存 id，不存引用；
//! current 指向用户「所站」的节点，新消息总是挂在 current 之下。节点只增不删，
//! 回退（rewind）只移动 current，旧分支仍可通过 goto 到达。
//! 根到 current 的路径就是送给 LLM 的对话上下文，没有另外的线性记录。

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::memory::CoachFeedback;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 发往 LLM 的单条消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// 节点 id：v4 UUID 的前 8 位十六进制，便于在 /goto 中手输
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    fn generate() -> Self {
        let mut s = Uuid::new_v4().simple().to_string();
        s.truncate(8);
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// 发言方
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Practitioner,
    Client,
}

impl Speaker {
    pub fn label(self) -> &'static str {
        match self {
            Speaker::Practitioner => "Practitioner",
            Speaker::Client => "Client",
        }
    }

    /// 练习者扮演对话中的 user，来访者由模型扮演（assistant）
    pub fn llm_role(self) -> Role {
        match self {
            Speaker::Practitioner => Role::User,
            Speaker::Client => Role::Assistant,
        }
    }
}

/// 树上的一条发言。内容创建后不可变，唯一可后补的是 feedback
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationNode {
    id: NodeId,
    speaker: Speaker,
    content: String,
    created_at: DateTime<Utc>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    feedback: Option<CoachFeedback>,
}

impl ConversationNode {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn speaker(&self) -> Speaker {
        self.speaker
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn parent(&self) -> Option<&NodeId> {
        self.parent.as_ref()
    }

    /// 子节点 id，按创建顺序（即分支编号顺序）
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn feedback(&self) -> Option<&CoachFeedback> {
        self.feedback.as_ref()
    }
}

/// 树结构错误（反馈挂载失败、加载后完整性校验失败）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Feedback can only be attached to practitioner nodes: {0}")]
    NotPractitioner(NodeId),

    #[error("Feedback already attached to node {0}")]
    FeedbackAlreadyAttached(NodeId),

    #[error("Tree integrity violated: {0}")]
    Integrity(String),
}

/// 对话树：arena + 唯一根 + current 指针
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationTree {
    nodes: HashMap<NodeId, ConversationNode>,
    root: Option<NodeId>,
    current: Option<NodeId>,
}

impl ConversationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn root_id(&self) -> Option<&NodeId> {
        self.root.as_ref()
    }

    pub fn current_id(&self) -> Option<&NodeId> {
        self.current.as_ref()
    }

    pub fn current(&self) -> Option<&ConversationNode> {
        self.current.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&ConversationNode> {
        self.nodes.get(id)
    }

    /// 在 current 下新增一条发言（树为空时成为根），并把 current 移到新节点
    pub fn add_message(&mut self, speaker: Speaker, content: impl Into<String>) -> &ConversationNode {
        let id = match self.current.clone() {
            Some(parent) => self.insert(Some(parent), speaker, content.into()),
            None => {
                debug_assert!(self.root.is_none(), "current is unset only while the tree is empty");
                let id = self.insert(None, speaker, content.into());
                self.root = Some(id.clone());
                id
            }
        };
        self.current = Some(id.clone());
        &self.nodes[&id]
    }

    /// 在指定父节点下追加子节点，不移动 current；父节点不存在时返回 None
    pub fn append_child(
        &mut self,
        parent: &NodeId,
        speaker: Speaker,
        content: impl Into<String>,
    ) -> Option<NodeId> {
        if !self.nodes.contains_key(parent) {
            return None;
        }
        Some(self.insert(Some(parent.clone()), speaker, content.into()))
    }

    fn insert(&mut self, parent: Option<NodeId>, speaker: Speaker, content: String) -> NodeId {
        let mut id = NodeId::generate();
        while self.nodes.contains_key(&id) {
            id = NodeId::generate();
        }

        // 时间戳沿路径单调不减（系统时钟回拨时夹到父节点时间）
        let now = Utc::now();
        let created_at = parent
            .as_ref()
            .and_then(|p| self.nodes.get(p))
            .map(|p| p.created_at.max(now))
            .unwrap_or(now);

        if let Some(p) = parent.as_ref().and_then(|p| self.nodes.get_mut(p)) {
            p.children.push(id.clone());
        }

        self.nodes.insert(
            id.clone(),
            ConversationNode {
                id: id.clone(),
                speaker,
                content,
                created_at,
                parent,
                children: Vec::new(),
                feedback: None,
            },
        );
        id
    }

    /// 根到 current 的路径（单条直线，不含旁支）；树为空时为空
    pub fn current_path(&self) -> Vec<&ConversationNode> {
        let mut path = Vec::new();
        let mut cursor = self.current.as_ref();
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            path.push(node);
            cursor = node.parent.as_ref();
        }
        path.reverse();
        path
    }

    /// 向根方向移动 steps 步，到根即停；树为空时返回 None
    pub fn rewind(&mut self, steps: usize) -> Option<&ConversationNode> {
        let mut id = self.current.clone()?;
        for _ in 0..steps {
            match self.nodes.get(&id).and_then(|n| n.parent.clone()) {
                Some(parent) => id = parent,
                None => break,
            }
        }
        self.current = Some(id);
        self.current()
    }

    /// 跳到指定节点；id 不存在时返回 None 且不改变 current
    pub fn goto(&mut self, id: &str) -> Option<&ConversationNode> {
        let node = self.nodes.get(id)?;
        self.current = Some(node.id.clone());
        Some(node)
    }

    /// current 的子节点（分支），按创建顺序
    pub fn children_of_current(&self) -> Vec<&ConversationNode> {
        self.current()
            .map(|n| n.children.iter().filter_map(|c| self.nodes.get(c)).collect())
            .unwrap_or_default()
    }

    /// 给练习者节点挂教练反馈；每个节点最多一次
    pub fn attach_feedback(&mut self, id: &NodeId, feedback: CoachFeedback) -> Result<(), TreeError> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| TreeError::UnknownNode(id.clone()))?;
        if node.speaker != Speaker::Practitioner {
            return Err(TreeError::NotPractitioner(id.clone()));
        }
        if node.feedback.is_some() {
            return Err(TreeError::FeedbackAlreadyAttached(id.clone()));
        }
        node.feedback = Some(feedback);
        Ok(())
    }

    /// 把一条路径转成 LLM 消息（练习者 -> user，来访者 -> assistant）
    pub fn to_llm_messages(path: &[&ConversationNode]) -> Vec<Message> {
        path.iter()
            .map(|n| Message {
                role: n.speaker.llm_role(),
                content: n.content.clone(),
            })
            .collect()
    }

    /// 当前路径的 LLM 上下文
    pub fn conversation_for_llm(&self) -> Vec<Message> {
        Self::to_llm_messages(&self.current_path())
    }

    /// 完整性校验：引用完整、唯一根、父子互指、无环、current 有效、反馈只在练习者节点上
    pub fn validate(&self) -> Result<(), TreeError> {
        let integrity = |msg: String| Err(TreeError::Integrity(msg));

        if self.nodes.is_empty() {
            if self.root.is_some() || self.current.is_some() {
                return integrity("empty tree with root or current set".to_string());
            }
            return Ok(());
        }

        let Some(root) = self.root.as_ref() else {
            return integrity("non-empty tree without root".to_string());
        };
        match self.nodes.get(root) {
            Some(n) if n.parent.is_none() => {}
            Some(_) => return integrity(format!("root {} has a parent", root)),
            None => return integrity(format!("root {} missing from nodes", root)),
        }
        match self.current.as_ref() {
            Some(c) if self.nodes.contains_key(c) => {}
            Some(c) => return integrity(format!("current {} missing from nodes", c)),
            None => return integrity("non-empty tree without current".to_string()),
        }

        for (key, node) in &self.nodes {
            if key != &node.id {
                return integrity(format!("node stored under {} has id {}", key, node.id));
            }
            match node.parent.as_ref() {
                None if key != root => return integrity(format!("second root {}", key)),
                None => {}
                Some(p) => {
                    let Some(parent) = self.nodes.get(p) else {
                        return integrity(format!("parent {} of {} missing", p, key));
                    };
                    let links = parent.children.iter().filter(|c| *c == key).count();
                    if links != 1 {
                        return integrity(format!("{} listed {} times under parent {}", key, links, p));
                    }
                }
            }
            let mut seen = HashSet::new();
            for child in &node.children {
                if !seen.insert(child) {
                    return integrity(format!("duplicate child {} under {}", child, key));
                }
                match self.nodes.get(child) {
                    Some(c) if c.parent.as_ref() == Some(key) => {}
                    Some(_) => return integrity(format!("child {} does not point back to {}", child, key)),
                    None => return integrity(format!("child {} of {} missing", child, key)),
                }
            }
            if node.feedback.is_some() && node.speaker != Speaker::Practitioner {
                return integrity(format!("feedback on non-practitioner node {}", key));
            }
        }

        // 每个节点都必须在 len 步以内走到根
        for key in self.nodes.keys() {
            let mut cursor = key;
            let mut hops = 0;
            while let Some(parent) = self.nodes.get(cursor).and_then(|n| n.parent.as_ref()) {
                cursor = parent;
                hops += 1;
                if hops > self.nodes.len() {
                    return integrity(format!("cycle through {}", key));
                }
            }
        }

        Ok(())
    }
}
