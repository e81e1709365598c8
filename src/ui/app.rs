//! TUI 应用主循环
//!
//! 进入全屏/原始模式，每帧读取最新 UiState、取尽流事件，处理键盘输入并渲染。
//! 进行中的一轮不锁输入：导航命令随时可发，其余由编排器决定是否拒绝。

use std::io::{self, Stdout};

use crossterm::event::{KeyCode, KeyModifiers};
use crossterm::{
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::sync::{broadcast, mpsc, watch};

use crate::core::{Command, StreamEvent, UiState};
use crate::ui::event::{AppEvent, EventHandler};
use crate::ui::render::{draw, ScrollState, StreamBuffers};

/// 运行 TUI：启用原始模式与全屏，循环 poll 事件 + 渲染，退出时恢复终端
pub async fn run_app(
    state_rx: watch::Receiver<UiState>,
    mut stream_rx: broadcast::Receiver<StreamEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, state_rx, &mut stream_rx, cmd_tx).await;

    restore_terminal(&mut terminal)?;
    result
}

async fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    state_rx: watch::Receiver<UiState>,
    stream_rx: &mut broadcast::Receiver<StreamEvent>,
    cmd_tx: mpsc::UnboundedSender<Command>,
) -> anyhow::Result<()> {
    let event_handler = EventHandler::new(cmd_tx);
    let mut input_buffer = String::new();
    let mut streams = StreamBuffers::default();
    let mut scroll = ScrollState::default();
    let mut last_path_len = 0usize;
    let mut last_notice_count = 0usize;

    loop {
        let state = state_rx.borrow().clone();
        if state.is_exited() {
            break;
        }

        // 状态先于本轮的流事件发布，空闲时清掉残留不会误删下一轮的块
        if !state.turn_in_flight {
            streams.settle();
        }
        loop {
            match stream_rx.try_recv() {
                Ok(event) => streams.apply(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => streams.mark_lagged(n),
                Err(_) => break,
            }
        }

        // 有新内容时贴底
        if state.path.len() != last_path_len || streams.client.is_some() {
            last_path_len = state.path.len();
            scroll.conversation = usize::MAX;
        }
        if state.notices.len() != last_notice_count || streams.coach.is_some() {
            last_notice_count = state.notices.len();
            scroll.feedback = usize::MAX;
        }

        if let Some(ev) = event_handler.poll()? {
            match ev {
                AppEvent::Command(Command::Quit) => break,
                AppEvent::Command(_) => {}
                AppEvent::Key(key) => {
                    let shift = key.modifiers.contains(KeyModifiers::SHIFT);
                    match key.code {
                        KeyCode::Enter => {
                            let input = input_buffer.trim().to_string();
                            input_buffer.clear();
                            if !input.is_empty() {
                                event_handler.send_submit(input);
                            }
                        }
                        KeyCode::Backspace => {
                            input_buffer.pop();
                        }
                        KeyCode::Char(c) => input_buffer.push(c),
                        KeyCode::PageUp if shift => {
                            scroll.feedback = scroll.feedback.saturating_sub(10);
                        }
                        KeyCode::PageDown if shift => {
                            scroll.feedback = scroll.feedback.saturating_add(10);
                        }
                        KeyCode::Up => scroll.conversation = scroll.conversation.saturating_sub(1),
                        KeyCode::Down => scroll.conversation = scroll.conversation.saturating_add(1),
                        KeyCode::PageUp => {
                            scroll.conversation = scroll.conversation.saturating_sub(10);
                        }
                        KeyCode::PageDown => {
                            scroll.conversation = scroll.conversation.saturating_add(10);
                        }
                        KeyCode::Home => scroll.conversation = 0,
                        KeyCode::End => scroll.conversation = usize::MAX,
                        _ => {}
                    }
                }
            }
        }

        terminal.draw(|f| draw(f, &state, &streams, &input_buffer, &mut scroll))?;

        tokio::task::yield_now().await;
    }
    Ok(())
}

fn restore_terminal(terminal: &mut Terminal<CrosstermBackend<Stdout>>) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
