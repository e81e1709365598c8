//! 事件处理
//!
//! 轮询 crossterm 键盘事件：Ctrl+C / Esc 取消进行中的一轮，Ctrl+S 保存，Ctrl+Q 退出；
//! 其余按键交给 run_app 拼 input_buffer，Enter 时 send_submit。

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc;

use crate::core::Command;

/// 应用事件：来自快捷键的 Command 或原始 KeyEvent
#[derive(Debug, Clone)]
pub enum AppEvent {
    Command(Command),
    Key(KeyEvent),
}

/// 事件处理器：持有 cmd_tx，poll 时读键盘并返回 AppEvent，send_submit 发送用户输入
pub struct EventHandler {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl EventHandler {
    pub fn new(cmd_tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { cmd_tx }
    }

    pub fn poll(&self) -> anyhow::Result<Option<AppEvent>> {
        if event::poll(std::time::Duration::from_millis(50))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(Some(self.handle_key(key)));
                }
            }
        }
        Ok(None)
    }

    fn handle_key(&self, key: KeyEvent) -> AppEvent {
        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Char('c') if ctrl => self.forward(Command::Cancel),
            KeyCode::Esc => self.forward(Command::Cancel),
            KeyCode::Char('s') if ctrl => self.forward(Command::Submit("/save".to_string())),
            // 退出由 run_app 结束循环，main 再发 Quit 并等待保存完成
            KeyCode::Char('q') if ctrl => AppEvent::Command(Command::Quit),
            _ => AppEvent::Key(key),
        }
    }

    fn forward(&self, command: Command) -> AppEvent {
        let _ = self.cmd_tx.send(command.clone());
        AppEvent::Command(command)
    }

    pub fn send_submit(&self, input: String) {
        let _ = self.cmd_tx.send(Command::Submit(input));
    }
}
