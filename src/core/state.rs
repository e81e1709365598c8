//! 状态定义：UiState 投影
//!
//! UI 只持有轻量的 UiState（阶段、当前路径、提示）；会话与对话树由编排器独占，每次变化后投影一份发给 UI。

use std::collections::VecDeque;

use serde::Serialize;

use crate::memory::{CoachFeedback, ConversationTree, Session, Speaker};

/// 提示区最多保留的条数
pub const NOTICE_LIMIT: usize = 50;

/// 训练器阶段（UI 投影用）
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum TrainerPhase {
    #[default]
    Idle,
    /// 正在取来访者开场白
    Opening,
    /// 一轮进行中（教练与来访者都在生成）
    Responding,
    /// 提示、复盘、场景生成等非流式请求
    Thinking,
    Exited,
}

impl TrainerPhase {
    pub fn label(self) -> &'static str {
        match self {
            TrainerPhase::Idle => "Ready",
            TrainerPhase::Opening => "Client is speaking...",
            TrainerPhase::Responding => "Processing...",
            TrainerPhase::Thinking => "Thinking...",
            TrainerPhase::Exited => "Exited",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

/// 有上限的提示队列，旧的先丢
#[derive(Clone, Debug, Default)]
pub struct Notices {
    items: VecDeque<Notice>,
}

impl Notices {
    pub fn info(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Info, text.into());
    }

    pub fn error(&mut self, text: impl Into<String>) {
        self.push(NoticeLevel::Error, text.into());
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn to_vec(&self) -> Vec<Notice> {
        self.items.iter().cloned().collect()
    }

    fn push(&mut self, level: NoticeLevel, text: String) {
        if self.items.len() == NOTICE_LIMIT {
            self.items.pop_front();
        }
        self.items.push_back(Notice { level, text });
    }
}

/// 当前路径上的一条发言
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PathEntry {
    pub id: String,
    pub speaker: Speaker,
    pub content: String,
    /// 该节点连同自己在内的兄弟数，大于 1 表示此处有分支
    pub siblings: usize,
    pub feedback: Option<CoachFeedback>,
}

/// UI 看到的「投影」状态
#[derive(Clone, Debug, Default, Serialize)]
pub struct UiState {
    pub phase: TrainerPhase,
    pub scenario_name: Option<String>,
    pub path: Vec<PathEntry>,
    /// current 的子节点数
    pub branches_here: usize,
    pub notices: Vec<Notice>,
    pub turn_in_flight: bool,
}

impl UiState {
    /// 路径上最后一个带反馈的练习者节点
    pub fn latest_feedback(&self) -> Option<&CoachFeedback> {
        self.path
            .iter()
            .rev()
            .filter(|e| e.speaker == Speaker::Practitioner)
            .find_map(|e| e.feedback.as_ref())
    }

    pub fn is_exited(&self) -> bool {
        self.phase == TrainerPhase::Exited
    }
}

/// 由会话与编排器状态投影出 UiState
pub fn project(
    session: Option<&Session>,
    phase: TrainerPhase,
    notices: &Notices,
    turn_in_flight: bool,
) -> UiState {
    let (scenario_name, path, branches_here) = match session {
        Some(s) => (
            Some(s.scenario.name.clone()),
            path_entries(&s.conversation),
            s.conversation.children_of_current().len(),
        ),
        None => (None, Vec::new(), 0),
    };
    UiState {
        phase,
        scenario_name,
        path,
        branches_here,
        notices: notices.to_vec(),
        turn_in_flight,
    }
}

fn path_entries(tree: &ConversationTree) -> Vec<PathEntry> {
    tree.current_path()
        .into_iter()
        .map(|node| {
            let siblings = node
                .parent()
                .and_then(|p| tree.get(p.as_str()))
                .map(|p| p.children().len())
                .unwrap_or(1);
            PathEntry {
                id: node.id().to_string(),
                speaker: node.speaker(),
                content: node.content().to_string(),
                siblings,
                feedback: node.feedback().cloned(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::Scenario;

    #[test]
    fn test_notices_are_bounded() {
        let mut notices = Notices::default();
        for i in 0..NOTICE_LIMIT + 5 {
            notices.info(format!("n{}", i));
        }
        let all = notices.to_vec();
        assert_eq!(all.len(), NOTICE_LIMIT);
        assert_eq!(all[0].text, "n5");
    }

    #[test]
    fn test_projection_marks_branches_and_feedback() {
        let mut session = Session::new(Scenario {
            name: "Smoker".to_string(),
            ..Scenario::default()
        });
        let tree = &mut session.conversation;
        tree.add_message(Speaker::Client, "Hi.");
        let p = tree.add_message(Speaker::Practitioner, "Hello").id().clone();
        tree.attach_feedback(&p, CoachFeedback::unavailable("offline")).unwrap();
        tree.rewind(1);
        tree.add_message(Speaker::Practitioner, "Welcome");
        tree.rewind(1);

        let state = project(Some(&session), TrainerPhase::Idle, &Notices::default(), false);
        assert_eq!(state.scenario_name.as_deref(), Some("Smoker"));
        assert_eq!(state.path.len(), 1);
        assert_eq!(state.branches_here, 2);
        assert!(state.latest_feedback().is_none());

        session.conversation.goto(p.as_str());
        let state = project(Some(&session), TrainerPhase::Responding, &Notices::default(), true);
        assert_eq!(state.path[1].siblings, 2);
        assert!(state.latest_feedback().is_some());
        assert_eq!(state.phase, TrainerPhase::Responding);
    }
}
