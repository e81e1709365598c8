//! 教练反馈记录
//!
//! 挂在「练习者」节点上的结构化结果。解析对外包裹宽容（```json 围栏、普通围栏、前后杂文），
//! 解析失败时替换为一条只带原文摘录的记录，保证练习者总能看到点什么。

use serde::{Deserialize, Serialize};

/// 单条练习者发言的教练反馈
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachFeedback {
    /// 识别到的 MI 技术（如 open_question、reflection、affirmation）
    pub techniques_used: Vec<String>,
    /// 符合 MI 精神的表现
    pub mi_consistent: Vec<String>,
    /// 不符合 MI 的表现
    pub mi_inconsistent: Vec<String>,
    /// 替代说法或改进建议
    pub suggestions: Vec<String>,
    /// 总体评语
    pub overall_note: String,
}

impl CoachFeedback {
    pub fn has_issues(&self) -> bool {
        !self.mi_inconsistent.is_empty()
    }

    pub fn has_suggestions(&self) -> bool {
        !self.suggestions.is_empty()
    }

    /// 严格解析：先剥掉外层包裹，再按 JSON 反序列化
    pub fn from_raw(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(extract_json_block(raw))
    }

    /// 原文无法解析时的替代记录：评语里带原文前 excerpt_chars 个字符
    pub fn unparsed(raw: &str, excerpt_chars: usize) -> Self {
        let excerpt: String = raw.chars().take(excerpt_chars).collect();
        Self {
            overall_note: format!("Unable to parse feedback: {}...", excerpt),
            ..Self::default()
        }
    }

    /// 教练流中途失败、已流出部分原文时的替代记录：原文摘录 + 失败原因
    pub fn interrupted(raw: &str, reason: &str, excerpt_chars: usize) -> Self {
        let mut feedback = Self::unparsed(raw, excerpt_chars);
        feedback.overall_note = format!("{} (coach stopped early: {})", feedback.overall_note, reason);
        feedback
    }

    /// 教练后端本身失败（超时、传输错误、取消）时的替代记录
    pub fn unavailable(reason: &str) -> Self {
        Self {
            overall_note: format!("Coach feedback unavailable: {}", reason),
            ..Self::default()
        }
    }
}

/// 反馈来源：正常解析 / 解析失败替代 / 后端失败替代
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackOrigin {
    Parsed,
    Unparsed,
    Unavailable,
}

/// 宽容解析：永不失败，失败时返回替代记录
pub fn parse_feedback(raw: &str, excerpt_chars: usize) -> (CoachFeedback, FeedbackOrigin) {
    match CoachFeedback::from_raw(raw) {
        Ok(feedback) => (feedback, FeedbackOrigin::Parsed),
        Err(e) => {
            tracing::debug!("Coach feedback parse failed: {}", e);
            (
                CoachFeedback::unparsed(raw, excerpt_chars),
                FeedbackOrigin::Unparsed,
            )
        }
    }
}

/// 从模型输出中取出 JSON 主体：```json 围栏 > 普通 ``` 围栏 > 最外层 {...} > 原文
pub fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + "```json".len()..];
        return rest.find("```").map(|end| &rest[..end]).unwrap_or(rest).trim();
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}
