//! 单轮编排：练习者发言 -> 教练反馈 + 来访者回复（并发、流式）
//!
//! 流程：
//! 1. 练习者节点同步落树，记下 anchor；立即快照根到 current 的路径
//! 2. 两个生成任务在快照上并发运行，只通过通道回传文本块与结果，从不碰树
//! 3. 拥有树的一方（run_turn 或编排器主循环）逐条 apply 事件：
//!    教练结果挂到 anchor（解析失败或后端失败时用替代记录）；
//!    来访者结果挂在 anchor 之下，若期间 current 被导航移走，则仍挂在 anchor 下并把 current 拉回新节点
//! 4. 两半都提交后本轮结束，顺序不限

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agents::{ClientAgent, CoachAgent};
use crate::core::error::TurnError;
use crate::llm::{LlmError, TextStream};
use crate::memory::{CoachFeedback, ConversationTree, FeedbackOrigin, NodeId, Speaker};

/// 逻辑流标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTag {
    Coach,
    Client,
}

/// 流式输出的接收方（渲染层）。失败只表示「不会再有块」，已显示的内容不撤回
pub trait StreamSink {
    fn append_chunk(&mut self, stream: StreamTag, text: &str);
    fn finish_stream(&mut self, stream: StreamTag);
    fn notify_failure(&mut self, stream: StreamTag, reason: &str);
}

/// 发往 UI 的流事件
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Chunk { stream: StreamTag, text: String },
    Finished { stream: StreamTag },
    Failed { stream: StreamTag, reason: String },
}

impl StreamSink for broadcast::Sender<StreamEvent> {
    fn append_chunk(&mut self, stream: StreamTag, text: &str) {
        let _ = self.send(StreamEvent::Chunk {
            stream,
            text: text.to_string(),
        });
    }

    fn finish_stream(&mut self, stream: StreamTag) {
        let _ = self.send(StreamEvent::Finished { stream });
    }

    fn notify_failure(&mut self, stream: StreamTag, reason: &str) {
        let _ = self.send(StreamEvent::Failed {
            stream,
            reason: reason.to_string(),
        });
    }
}

impl StreamSink for Vec<StreamEvent> {
    fn append_chunk(&mut self, stream: StreamTag, text: &str) {
        self.push(StreamEvent::Chunk {
            stream,
            text: text.to_string(),
        });
    }

    fn finish_stream(&mut self, stream: StreamTag) {
        self.push(StreamEvent::Finished { stream });
    }

    fn notify_failure(&mut self, stream: StreamTag, reason: &str) {
        self.push(StreamEvent::Failed {
            stream,
            reason: reason.to_string(),
        });
    }
}

/// 生成任务回传给树拥有者的事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationEvent {
    Chunk(StreamTag, String),
    Completed(StreamTag, String),
    /// 失败原因 + 失败前已流出的文本
    Failed(StreamTag, LlmError, String),
}

/// 一轮结束后的结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnOutcome {
    /// 本轮练习者节点
    pub anchor: NodeId,
    /// 来访者节点 id，或没能产出回复的原因
    pub reply: Result<NodeId, TurnError>,
    /// 挂到 anchor 上的反馈来自哪里
    pub feedback: FeedbackOrigin,
}

pub struct TurnOrchestrator {
    client: Arc<ClientAgent>,
    coach: Arc<CoachAgent>,
    stream_timeout: Duration,
}

impl TurnOrchestrator {
    pub fn new(client: Arc<ClientAgent>, coach: Arc<CoachAgent>) -> Self {
        Self {
            client,
            coach,
            stream_timeout: Duration::from_secs(120),
        }
    }

    /// 两块之间的最长等待
    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Arc<ClientAgent> {
        &self.client
    }

    pub fn coach(&self) -> &Arc<CoachAgent> {
        &self.coach
    }

    /// 开始一轮：练习者节点落树、快照上下文、派发两个生成任务。需在 tokio 运行时中调用
    pub fn begin_turn(
        &self,
        tree: &mut ConversationTree,
        text: &str,
        cancel: CancellationToken,
    ) -> InFlightTurn {
        let anchor = tree.add_message(Speaker::Practitioner, text).id().clone();
        let history = tree.conversation_for_llm();
        tracing::info!("Turn started at {} ({} messages of context)", anchor, history.len());

        let (tx, rx) = mpsc::unbounded_channel();

        let coach = self.coach.clone();
        let coach_history = history.clone();
        let latest = text.to_string();
        tokio::spawn(drive_stream(
            StreamTag::Coach,
            async move { coach.analyze_stream(&coach_history, &latest).await },
            tx.clone(),
            self.stream_timeout,
            cancel.clone(),
        ));

        let client = self.client.clone();
        tokio::spawn(drive_stream(
            StreamTag::Client,
            async move { client.respond(&history).await },
            tx,
            self.stream_timeout,
            cancel.clone(),
        ));

        InFlightTurn {
            anchor,
            events: rx,
            coach: self.coach.clone(),
            cancel,
            feedback: None,
            reply: None,
        }
    }

    /// 跑完整的一轮（调用方独占树，期间没有导航）
    pub async fn run_turn(
        &self,
        tree: &mut ConversationTree,
        text: &str,
        sink: &mut impl StreamSink,
    ) -> TurnOutcome {
        let mut turn = self.begin_turn(tree, text, CancellationToken::new());
        loop {
            match turn.next_event().await {
                Some(event) => {
                    if let Some(outcome) = turn.apply(event, tree, sink) {
                        return outcome;
                    }
                }
                None => return turn.finish_abandoned(tree, sink),
            }
        }
    }
}

/// 进行中的一轮：持有 anchor 与事件接收端，由树的拥有者逐条 apply
pub struct InFlightTurn {
    anchor: NodeId,
    events: mpsc::UnboundedReceiver<GenerationEvent>,
    coach: Arc<CoachAgent>,
    cancel: CancellationToken,
    feedback: Option<FeedbackOrigin>,
    reply: Option<Result<NodeId, TurnError>>,
}

impl InFlightTurn {
    pub fn anchor(&self) -> &NodeId {
        &self.anchor
    }

    /// 取消两个生成任务；它们随后以 Cancelled 失败结束
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 下一条生成事件；两个任务都结束且事件取尽后返回 None
    pub async fn next_event(&mut self) -> Option<GenerationEvent> {
        self.events.recv().await
    }

    /// 应用一条事件；两半都提交后返回本轮结果
    pub fn apply(
        &mut self,
        event: GenerationEvent,
        tree: &mut ConversationTree,
        sink: &mut impl StreamSink,
    ) -> Option<TurnOutcome> {
        match event {
            GenerationEvent::Chunk(stream, text) => {
                if !self.is_done(stream) {
                    sink.append_chunk(stream, &text);
                }
            }
            GenerationEvent::Completed(StreamTag::Coach, raw) => {
                if self.feedback.is_none() {
                    let (feedback, origin) = self.coach.parse_feedback(&raw);
                    self.commit_feedback(tree, feedback, origin);
                    sink.finish_stream(StreamTag::Coach);
                }
            }
            GenerationEvent::Failed(StreamTag::Coach, err, partial) => {
                if self.feedback.is_none() {
                    tracing::warn!("Coach generation failed for {}: {}", self.anchor, err);
                    let reason = err.to_string();
                    let (feedback, origin) = self.coach.feedback_after_failure(&partial, &reason);
                    self.commit_feedback(tree, feedback, origin);
                    sink.notify_failure(StreamTag::Coach, &reason);
                }
            }
            GenerationEvent::Completed(StreamTag::Client, text) => {
                if self.reply.is_none() {
                    let reply = self.commit_reply(tree, text.trim());
                    match &reply {
                        Ok(_) => sink.finish_stream(StreamTag::Client),
                        Err(e) => sink.notify_failure(StreamTag::Client, &e.to_string()),
                    }
                    self.reply = Some(reply);
                }
            }
            GenerationEvent::Failed(StreamTag::Client, err, _) => {
                if self.reply.is_none() {
                    tracing::warn!("Client generation failed for {}: {}", self.anchor, err);
                    sink.notify_failure(StreamTag::Client, &err.to_string());
                    self.reply = Some(Err(TurnError::ClientFailed(err)));
                }
            }
        }
        self.outcome()
    }

    /// 事件通道提前关闭（任务 panic 等）：未完成的一半按失败收尾
    pub fn finish_abandoned(
        &mut self,
        tree: &mut ConversationTree,
        sink: &mut impl StreamSink,
    ) -> TurnOutcome {
        if self.feedback.is_none() {
            let reason = TurnError::Abandoned.to_string();
            self.commit_feedback(tree, CoachFeedback::unavailable(&reason), FeedbackOrigin::Unavailable);
            sink.notify_failure(StreamTag::Coach, &reason);
        }
        if self.reply.is_none() {
            sink.notify_failure(StreamTag::Client, &TurnError::Abandoned.to_string());
            self.reply = Some(Err(TurnError::Abandoned));
        }
        TurnOutcome {
            anchor: self.anchor.clone(),
            reply: self.reply.clone().unwrap_or(Err(TurnError::Abandoned)),
            feedback: self.feedback.unwrap_or(FeedbackOrigin::Unavailable),
        }
    }

    fn is_done(&self, stream: StreamTag) -> bool {
        match stream {
            StreamTag::Coach => self.feedback.is_some(),
            StreamTag::Client => self.reply.is_some(),
        }
    }

    fn outcome(&self) -> Option<TurnOutcome> {
        Some(TurnOutcome {
            anchor: self.anchor.clone(),
            reply: self.reply.clone()?,
            feedback: self.feedback?,
        })
    }

    /// 反馈按 anchor 寻址，与 current 无关
    fn commit_feedback(&mut self, tree: &mut ConversationTree, feedback: CoachFeedback, origin: FeedbackOrigin) {
        match tree.attach_feedback(&self.anchor, feedback) {
            Ok(()) => tracing::info!("Feedback attached to {} ({:?})", self.anchor, origin),
            Err(e) => tracing::warn!("Feedback for {} dropped: {}", self.anchor, e),
        }
        self.feedback = Some(origin);
    }

    fn commit_reply(&self, tree: &mut ConversationTree, text: &str) -> Result<NodeId, TurnError> {
        if text.is_empty() {
            tracing::warn!("Client reply for {} was empty", self.anchor);
            return Err(TurnError::EmptyReply);
        }

        if tree.current_id() == Some(&self.anchor) {
            let id = tree.add_message(Speaker::Client, text).id().clone();
            tracing::info!("Client reply committed as {}", id);
            return Ok(id);
        }

        // current 已被导航移走：仍挂在 anchor 下，然后把焦点拉到新节点
        let id = tree
            .append_child(&self.anchor, Speaker::Client, text)
            .ok_or_else(|| TurnError::AnchorMissing(self.anchor.clone()))?;
        let moved_from = tree.current_id().map(|c| c.to_string()).unwrap_or_default();
        tree.goto(id.as_str());
        tracing::info!(
            "Client reply committed as {} under {}; focus moved from {} to the new branch",
            id,
            self.anchor,
            moved_from
        );
        Ok(id)
    }
}

impl Drop for InFlightTurn {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 驱动一个生成流：逐块转发，块间超时与取消都视为失败，最后回传完整文本或错误
async fn drive_stream<F>(
    tag: StreamTag,
    open: F,
    tx: mpsc::UnboundedSender<GenerationEvent>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) where
    F: Future<Output = Result<TextStream, LlmError>>,
{
    let mut full = String::new();
    let result = collect_stream(tag, open, &tx, idle_timeout, &cancel, &mut full).await;
    let event = match result {
        Ok(()) => GenerationEvent::Completed(tag, full),
        Err(e) => GenerationEvent::Failed(tag, e, full),
    };
    let _ = tx.send(event);
}

async fn collect_stream<F>(
    tag: StreamTag,
    open: F,
    tx: &mpsc::UnboundedSender<GenerationEvent>,
    idle_timeout: Duration,
    cancel: &CancellationToken,
    full: &mut String,
) -> Result<(), LlmError>
where
    F: Future<Output = Result<TextStream, LlmError>>,
{
    let timed_out = || LlmError::Timeout(idle_timeout);

    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        opened = tokio::time::timeout(idle_timeout, open) => opened.map_err(|_| timed_out())??,
    };

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            next = tokio::time::timeout(idle_timeout, stream.next()) => next.map_err(|_| timed_out())?,
        };
        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                full.push_str(&chunk);
                let _ = tx.send(GenerationEvent::Chunk(tag, chunk));
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}
