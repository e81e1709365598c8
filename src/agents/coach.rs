//! 教练：逐条分析练习者发言（流式 JSON 反馈）、给提示、做整场复盘

use std::sync::Arc;

use crate::llm::{LlmClient, LlmError, TextStream};
use crate::memory::{parse_feedback, CoachFeedback, FeedbackOrigin, Message, Role};
use crate::scenario::Scenario;

pub struct CoachAgent {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    hint_prompt: String,
    debrief_prompt: String,
    excerpt_chars: usize,
}

impl CoachAgent {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        system_prompt: impl Into<String>,
        hint_prompt: impl Into<String>,
        debrief_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            hint_prompt: hint_prompt.into(),
            debrief_prompt: debrief_prompt.into(),
            excerpt_chars: 200,
        }
    }

    pub fn with_excerpt_chars(mut self, excerpt_chars: usize) -> Self {
        self.excerpt_chars = excerpt_chars;
        self
    }

    /// 流式分析最新一条练习者发言。history 以该发言结尾，分析请求里不重复它
    pub async fn analyze_stream(&self, history: &[Message], latest: &str) -> Result<TextStream, LlmError> {
        let request = build_analysis_request(history, latest);
        self.llm
            .complete_stream(&[
                Message::system(self.system_prompt.clone()),
                Message::user(request),
            ])
            .await
    }

    /// 把原始输出解析成反馈；失败时得到替代记录
    pub fn parse_feedback(&self, raw: &str) -> (CoachFeedback, FeedbackOrigin) {
        parse_feedback(raw, self.excerpt_chars)
    }

    /// 流中途失败：已流出的部分能解析就用，否则保留原文摘录与失败原因；一字未出时为 unavailable
    pub fn feedback_after_failure(&self, partial: &str, reason: &str) -> (CoachFeedback, FeedbackOrigin) {
        if partial.trim().is_empty() {
            return (CoachFeedback::unavailable(reason), FeedbackOrigin::Unavailable);
        }
        match CoachFeedback::from_raw(partial) {
            Ok(feedback) => (feedback, FeedbackOrigin::Parsed),
            Err(e) => {
                tracing::debug!("Partial coach output did not parse: {}", e);
                (
                    CoachFeedback::interrupted(partial, reason, self.excerpt_chars),
                    FeedbackOrigin::Unparsed,
                )
            }
        }
    }

    /// 下一步可以尝试的技术
    pub async fn hint(&self, history: &[Message]) -> Result<String, LlmError> {
        let request = format!(
            "## Conversation So Far\n\n{}\n\nWhat should the practitioner try next?",
            format_transcript(history)
        );
        self.complete_nonempty(&self.hint_prompt, request).await
    }

    /// 整场复盘（Markdown 文本）
    pub async fn debrief(&self, scenario: &Scenario, history: &[Message]) -> Result<String, LlmError> {
        let request = format!(
            "## Scenario\n\n{}: {}\n\n## Transcript\n\n{}\n\nPlease debrief this session.",
            scenario.name,
            scenario.presenting_issue,
            format_transcript(history)
        );
        self.complete_nonempty(&self.debrief_prompt, request).await
    }

    async fn complete_nonempty(&self, system: &str, request: String) -> Result<String, LlmError> {
        let reply = self
            .llm
            .complete(&[Message::system(system), Message::user(request)])
            .await?;
        let reply = reply.trim();
        if reply.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(reply.to_string())
    }
}

/// 分析请求：此前的对话 + 待分析的那一条
fn build_analysis_request(history: &[Message], latest: &str) -> String {
    let earlier = history.split_last().map(|(_, rest)| rest).unwrap_or(&[]);
    format!(
        "## Conversation History\n\n{}\n\n## Message to Analyze\n\nPractitioner: {}\n\n\
         Please analyze this practitioner response and provide feedback in the specified JSON format.",
        format_transcript(earlier),
        latest
    )
}

/// 以 Practitioner / Client 标注的纯文本记录，跳过 system 消息
pub fn format_transcript(history: &[Message]) -> String {
    history
        .iter()
        .filter_map(|m| {
            let label = match m.role {
                Role::User => "Practitioner",
                Role::Assistant => "Client",
                Role::System => return None,
            };
            Some(format!("{}: {}", label, m.content))
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
