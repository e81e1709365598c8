//! 界面渲染
//!
//! 左侧为当前路径上的对话（按发言方着色，有分支处标出兄弟数，节点 id 暗色显示）与来访者流式文本；
//! 右侧为路径上最近一条教练反馈、教练流式文本与提示；底部为输入框与快捷键提示。

use ratatui::{
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Paragraph, Scrollbar, ScrollbarOrientation, ScrollbarState, Wrap},
    Frame,
};

use crate::core::{NoticeLevel, StreamEvent, StreamTag, TrainerPhase, UiState};
use crate::memory::{CoachFeedback, Speaker};

const SKIPPED_MARKER: &str = "[some streamed output was skipped]";

/// 某一逻辑流尚未提交的文本
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialStream {
    pub text: String,
    /// 流失败的原因；已显示的文本保留
    pub failed: Option<String>,
    /// 接收端落后时丢过块，文本不完整
    pub gap: bool,
}

/// 两个逻辑流的缓冲：Finished 时清空（内容已进入 UiState），Failed 时保留并标记
#[derive(Debug, Clone, Default)]
pub struct StreamBuffers {
    pub client: Option<PartialStream>,
    pub coach: Option<PartialStream>,
    /// 落后期间可能丢了某个流的开头：之后新建的缓冲同样标记为不完整，直到本轮结束
    lag_pending: bool,
}

impl StreamBuffers {
    pub fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Chunk { stream, text } => {
                let gap = self.lag_pending;
                let slot = self.slot(stream);
                // 上一轮失败留下的文本在新一轮开始时丢弃
                if slot.as_ref().is_some_and(|p| p.failed.is_some()) {
                    *slot = None;
                }
                slot.get_or_insert_with(|| PartialStream {
                    gap,
                    ..PartialStream::default()
                })
                .text
                .push_str(&text);
            }
            StreamEvent::Finished { stream } => *self.slot(stream) = None,
            StreamEvent::Failed { stream, reason } => {
                self.slot(stream).get_or_insert_with(PartialStream::default).failed = Some(reason);
            }
        }
    }

    /// broadcast 接收端落后、丢了事件：进行中的缓冲标记为不完整
    pub fn mark_lagged(&mut self, missed: u64) {
        tracing::warn!("UI fell behind by {} stream events; partial output is incomplete", missed);
        for partial in [&mut self.client, &mut self.coach].into_iter().flatten() {
            if partial.failed.is_none() {
                partial.gap = true;
            }
        }
        self.lag_pending = true;
    }

    /// 一轮结束：丢弃没收到 Finished 的残留（结果已在 UiState 里），失败的保留
    pub fn settle(&mut self) {
        for slot in [&mut self.client, &mut self.coach] {
            if slot.as_ref().is_some_and(|p| p.failed.is_none()) {
                *slot = None;
            }
        }
        self.lag_pending = false;
    }

    fn slot(&mut self, stream: StreamTag) -> &mut Option<PartialStream> {
        match stream {
            StreamTag::Client => &mut self.client,
            StreamTag::Coach => &mut self.coach,
        }
    }
}

/// 两个面板的滚动位置；usize::MAX 表示贴底
#[derive(Debug, Clone, Copy)]
pub struct ScrollState {
    pub conversation: usize,
    pub feedback: usize,
}

impl Default for ScrollState {
    fn default() -> Self {
        Self {
            conversation: usize::MAX,
            feedback: usize::MAX,
        }
    }
}

/// 将内容按宽度换行，支持 UTF-8（按字符数，避免在 UTF-8 中间截断）
pub fn wrap_text(s: &str, width: usize) -> Vec<String> {
    if width == 0 {
        return vec![s.to_string()];
    }
    let mut lines = Vec::new();
    for para in s.split('\n') {
        let mut line = String::new();
        for ch in para.chars() {
            if line.chars().count() >= width {
                lines.push(std::mem::take(&mut line));
            }
            line.push(ch);
        }
        lines.push(line);
    }
    lines
}

fn speaker_style(speaker: Speaker) -> (&'static str, Color) {
    match speaker {
        Speaker::Practitioner => ("You    ", Color::Cyan),
        Speaker::Client => ("Client ", Color::Green),
    }
}

/// 对话面板内容
pub fn conversation_lines(state: &UiState, streams: &StreamBuffers, width: usize) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();
    let dim = Style::default().fg(Color::DarkGray);

    if state.path.is_empty() && state.scenario_name.is_none() {
        lines.push(Line::from(Span::styled("No active session. Use /scenario to start one.", dim)));
    }

    for (idx, entry) in state.path.iter().enumerate() {
        if idx > 0 {
            lines.push(Line::from(""));
        }
        let (prefix, color) = speaker_style(entry.speaker);
        let mut header = vec![
            Span::styled(prefix, Style::default().fg(color).add_modifier(Modifier::BOLD)),
            Span::styled(format!("[{}]", entry.id), dim),
        ];
        if entry.siblings > 1 {
            header.push(Span::styled(
                format!(" ⑂ {} branches", entry.siblings),
                Style::default().fg(Color::Magenta),
            ));
        }
        lines.push(Line::from(header));
        for line in wrap_text(&entry.content, width) {
            lines.push(Line::from(Span::raw(line)));
        }
    }

    if state.branches_here > 1 {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            format!("{} branches continue from here (/branches)", state.branches_here),
            Style::default().fg(Color::Magenta),
        )));
    }

    if let Some(partial) = &streams.client {
        lines.push(Line::from(""));
        let (prefix, color) = speaker_style(Speaker::Client);
        lines.push(Line::from(Span::styled(
            prefix,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
        if partial.gap {
            lines.push(Line::from(Span::styled(SKIPPED_MARKER, dim)));
        }
        for line in wrap_text(&partial.text, width) {
            lines.push(Line::from(Span::styled(line, Style::default().fg(Color::Gray))));
        }
        if let Some(reason) = &partial.failed {
            lines.push(Line::from(Span::styled(
                format!("[interrupted: {}]", reason),
                Style::default().fg(Color::Red),
            )));
        } else {
            lines.push(Line::from(Span::styled("▌", dim)));
        }
    }

    lines
}

fn feedback_block(feedback: &CoachFeedback, width: usize, lines: &mut Vec<Line<'static>>) {
    if !feedback.techniques_used.is_empty() {
        lines.push(Line::from(vec![
            Span::styled("Techniques: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(feedback.techniques_used.join(", ")),
        ]));
    }
    let groups = [
        ("✓ ", Color::Green, &feedback.mi_consistent),
        ("✗ ", Color::Red, &feedback.mi_inconsistent),
        ("→ ", Color::Yellow, &feedback.suggestions),
    ];
    for (marker, color, items) in groups {
        for item in items {
            for (i, line) in wrap_text(item, width.saturating_sub(2)).into_iter().enumerate() {
                let lead = if i == 0 { marker } else { "  " };
                lines.push(Line::from(vec![
                    Span::styled(lead, Style::default().fg(color)),
                    Span::raw(line),
                ]));
            }
        }
    }
    if !feedback.overall_note.is_empty() {
        for line in wrap_text(&feedback.overall_note, width) {
            lines.push(Line::from(Span::styled(
                line,
                Style::default().add_modifier(Modifier::ITALIC),
            )));
        }
    }
}

/// 反馈面板内容：最近反馈、教练流式文本、提示
pub fn feedback_lines(state: &UiState, streams: &StreamBuffers, width: usize) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();
    let heading = Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD);

    if let Some(feedback) = state.latest_feedback() {
        lines.push(Line::from(Span::styled("Coach Feedback", heading)));
        feedback_block(feedback, width, &mut lines);
    }

    if let Some(partial) = &streams.coach {
        if !lines.is_empty() {
            lines.push(Line::from(""));
        }
        lines.push(Line::from(Span::styled("Coach is analyzing...", heading)));
        if partial.gap {
            lines.push(Line::from(Span::styled(
                SKIPPED_MARKER,
                Style::default().fg(Color::DarkGray).add_modifier(Modifier::ITALIC),
            )));
        }
        for line in wrap_text(&partial.text, width) {
            lines.push(Line::from(Span::styled(line, Style::default().fg(Color::DarkGray))));
        }
        if let Some(reason) = &partial.failed {
            lines.push(Line::from(Span::styled(
                format!("[interrupted: {}]", reason),
                Style::default().fg(Color::Red),
            )));
        }
    }

    if !state.notices.is_empty() {
        if !lines.is_empty() {
            lines.push(Line::from(""));
        }
        for notice in &state.notices {
            let style = match notice.level {
                NoticeLevel::Info => Style::default(),
                NoticeLevel::Error => Style::default().fg(Color::Red),
            };
            for line in wrap_text(&notice.text, width) {
                lines.push(Line::from(Span::styled(line, style)));
            }
        }
    }

    lines
}

/// 渲染一个可滚动面板，返回夹紧后的滚动位置
fn scrolled_panel(f: &mut Frame, area: Rect, block: Block, lines: Vec<Line<'static>>, scroll: usize) -> usize {
    let inner = block.inner(area);
    let content_height = inner.height as usize;
    let total_lines = lines.len();
    let scroll_offset = scroll.min(total_lines.saturating_sub(content_height));

    let paragraph = Paragraph::new(Text::from(lines))
        .block(block)
        .scroll((scroll_offset.min(u16::MAX as usize) as u16, 0));
    f.render_widget(paragraph, area);

    if total_lines > content_height {
        let mut scrollbar_state = ScrollbarState::new(total_lines)
            .position(scroll_offset)
            .viewport_content_length(content_height);
        let scrollbar = Scrollbar::new(ScrollbarOrientation::VerticalRight)
            .thumb_symbol("█")
            .track_symbol(Some("░"));
        f.render_stateful_widget(scrollbar, inner, &mut scrollbar_state);
    }
    scroll_offset
}

/// 绘制一帧；贴底的面板保持 usize::MAX，手动滚动过的写回夹紧后的位置
pub fn draw(
    f: &mut Frame,
    state: &UiState,
    streams: &StreamBuffers,
    input_buffer: &str,
    scroll: &mut ScrollState,
) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(5), Constraint::Length(4)])
        .split(f.area());
    let panes = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(60), Constraint::Percentage(40)])
        .split(rows[0]);

    let scenario = state.scenario_name.as_deref().unwrap_or("No scenario");
    let title = format!(" MI Trainer │ {} │ {} ", scenario, state.phase.label());
    let conv_block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Blue));
    // 边框 + 滚动条
    let conv_width = panes[0].width.saturating_sub(3) as usize;
    let conv = conversation_lines(state, streams, conv_width.max(20));
    let offset = scrolled_panel(f, panes[0], conv_block, conv, scroll.conversation);
    if scroll.conversation != usize::MAX {
        scroll.conversation = offset;
    }

    let fb_block = Block::default()
        .title(" Coach ")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));
    let fb_width = panes[1].width.saturating_sub(3) as usize;
    let fb = feedback_lines(state, streams, fb_width.max(20));
    let offset = scrolled_panel(f, panes[1], fb_block, fb, scroll.feedback);
    if scroll.feedback != usize::MAX {
        scroll.feedback = offset;
    }

    let input_title = if state.turn_in_flight {
        " Waiting for reply… (navigation still works, Esc to cancel) "
    } else if state.phase == TrainerPhase::Idle {
        " Message or /command "
    } else {
        " Busy… "
    };
    let hint = " Enter send │ PgUp/PgDn scroll │ Shift+PgUp/PgDn coach │ Esc cancel │ Ctrl+S save │ Ctrl+Q quit ";
    let input_block = Block::default()
        .title(input_title)
        .title_bottom(Line::from(Span::styled(hint, Style::default().fg(Color::DarkGray))))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));
    let input = Paragraph::new(input_buffer)
        .block(input_block)
        .wrap(Wrap { trim: false });
    f.render_widget(input, rows[1]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::PathEntry;

    #[test]
    fn test_wrap_text_counts_chars() {
        assert_eq!(wrap_text("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(wrap_text("我们一起聊聊", 4), vec!["我们一起", "聊聊"]);
        assert_eq!(wrap_text("a\n\nb", 10), vec!["a", "", "b"]);
    }

    #[test]
    fn test_stream_buffers_keep_partial_text_on_failure() {
        let mut buffers = StreamBuffers::default();
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Client,
            text: "I guess".to_string(),
        });
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Coach,
            text: "{".to_string(),
        });
        buffers.apply(StreamEvent::Finished { stream: StreamTag::Coach });
        buffers.apply(StreamEvent::Failed {
            stream: StreamTag::Client,
            reason: "Timed out after 120s".to_string(),
        });

        assert!(buffers.coach.is_none());
        let client = buffers.client.clone().unwrap();
        assert_eq!(client.text, "I guess");
        assert_eq!(client.failed.as_deref(), Some("Timed out after 120s"));

        // 下一轮的第一块替换掉失败残留
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Client,
            text: "Well".to_string(),
        });
        assert_eq!(buffers.client.unwrap(), PartialStream {
            text: "Well".to_string(),
            failed: None,
            gap: false,
        });
    }

    #[test]
    fn test_lag_marks_partial_streams_incomplete() {
        let mut buffers = StreamBuffers::default();
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Client,
            text: "I ".to_string(),
        });
        buffers.mark_lagged(300);
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Client,
            text: "know.".to_string(),
        });
        // 教练流的开头可能落在丢掉的那段里
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Coach,
            text: "ion\"]}".to_string(),
        });

        assert!(buffers.client.as_ref().unwrap().gap);
        assert!(buffers.coach.as_ref().unwrap().gap);
        let lines = feedback_lines(&UiState::default(), &buffers, 40);
        assert!(lines.iter().any(|l| l.to_string() == SKIPPED_MARKER));

        buffers.settle();
        assert!(buffers.client.is_none() && buffers.coach.is_none());
        buffers.apply(StreamEvent::Chunk {
            stream: StreamTag::Client,
            text: "Next turn".to_string(),
        });
        assert!(!buffers.client.unwrap().gap);
    }

    #[test]
    fn test_settle_keeps_failed_stream() {
        let mut buffers = StreamBuffers::default();
        buffers.apply(StreamEvent::Failed {
            stream: StreamTag::Client,
            reason: "Cancelled".to_string(),
        });
        buffers.settle();
        assert_eq!(buffers.client.unwrap().failed.as_deref(), Some("Cancelled"));
    }

    #[test]
    fn test_conversation_lines_mark_branches() {
        let state = UiState {
            scenario_name: Some("Smoker".to_string()),
            path: vec![PathEntry {
                id: "a1b2c3d4".to_string(),
                speaker: Speaker::Client,
                content: "Hi.".to_string(),
                siblings: 2,
                feedback: None,
            }],
            ..UiState::default()
        };
        let lines = conversation_lines(&state, &StreamBuffers::default(), 40);
        let header: String = lines[0].spans.iter().map(|s| s.content.as_ref()).collect();
        assert!(header.contains("[a1b2c3d4]"));
        assert!(header.contains("2 branches"));
    }
}
