//! 会话监管：取消管理
//!
//! 根 token 随进程退出取消；每一轮派生一个子 token，Esc / Ctrl+C 只取消当前这一轮。

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    root: CancellationToken,
    turn: Option<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新一轮派生子 token，替换上一轮的
    pub fn turn_token(&mut self) -> CancellationToken {
        let token = self.root.child_token();
        self.turn = Some(token.clone());
        token
    }

    /// 取消当前这一轮；没有进行中的轮次时返回 false
    pub fn cancel_turn(&mut self) -> bool {
        match self.turn.take() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// 本轮正常结束，丢弃其 token
    pub fn finish_turn(&mut self) {
        self.turn = None;
    }

    /// 退出：取消所有派生 token
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_only_current_turn() {
        let mut supervisor = SessionSupervisor::new();
        let first = supervisor.turn_token();
        supervisor.finish_turn();
        let second = supervisor.turn_token();

        assert!(supervisor.cancel_turn());
        assert!(second.is_cancelled());
        assert!(!first.is_cancelled());
        assert!(!supervisor.cancel_turn());
    }

    #[test]
    fn test_shutdown_cancels_children() {
        let mut supervisor = SessionSupervisor::new();
        let token = supervisor.turn_token();
        supervisor.shutdown();
        assert!(token.is_cancelled());
        assert!(supervisor.is_shutdown());
    }
}
