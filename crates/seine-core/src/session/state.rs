use parking_lot::RwLock;

use crate::error::{codes, SeineError};

/// 会话状态格。
///
/// # 状态机约束（What）
/// - 合法跃迁：
///   - `Created → Connected | Securing | Closing`
///   - `Connected → Securing | Closing`
///   - `Securing → Secured | Closing`
///   - `Secured → Connected | Securing | Closing`
///   - `Closing → Closed`
/// - `Closed` 为终态，任何离开它的跃迁都被拒绝；
/// - 其余组合均为非法，由 [`SessionStateCell::transition`] 以
///   [`codes::SESSION_INVALID_STATE`] 拒绝，拒绝时状态保持不变。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum SessionState {
    /// 会话已创建，尚未注册到选择器。
    Created,
    /// 明文连接已建立，可收发数据。
    Connected,
    /// TLS 握手进行中。
    Securing,
    /// TLS 握手完成，应用字节经加密传输。
    Secured,
    /// 关闭流程已启动。
    Closing,
    /// 会话终态，资源已回收。
    Closed,
}

impl SessionState {
    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Created, SessionState::Connected)
                | (SessionState::Created, SessionState::Securing)
                | (SessionState::Created, SessionState::Closing)
                | (SessionState::Connected, SessionState::Securing)
                | (SessionState::Connected, SessionState::Closing)
                | (SessionState::Securing, SessionState::Secured)
                | (SessionState::Securing, SessionState::Closing)
                | (SessionState::Secured, SessionState::Connected)
                | (SessionState::Secured, SessionState::Securing)
                | (SessionState::Secured, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
        )
    }

    /// 状态是否已终止。
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// 会话状态单元：以读写锁串行化跃迁，读者并发观察。
///
/// # 逻辑解析（How）
/// - 写者持写锁校验并落定跃迁；并发跃迁由锁串行化，先到者生效，
///   后到者按新状态重新校验；
/// - 读者持读锁做快照，多条过滤线程可同时观察状态而互不阻塞。
pub struct SessionStateCell {
    state: RwLock<SessionState>,
}

impl SessionStateCell {
    /// 以 `Created` 初始化。
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Created),
        }
    }

    /// 读取当前状态快照。
    pub fn get(&self) -> SessionState {
        *self.state.read()
    }

    /// 执行一次状态跃迁，返回跃迁前的状态。
    ///
    /// 非法跃迁返回 [`codes::SESSION_INVALID_STATE`] 错误，状态不变。
    pub fn transition(&self, target: SessionState) -> Result<SessionState, SeineError> {
        let mut state = self.state.write();
        let current = *state;
        if !current.can_transition_to(target) {
            return Err(SeineError::state(
                codes::SESSION_INVALID_STATE,
                format!("cannot transit from {current:?} to {target:?}"),
            ));
        }
        *state = target;
        Ok(current)
    }
}

impl Default for SessionStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Created,
        SessionState::Connected,
        SessionState::Securing,
        SessionState::Secured,
        SessionState::Closing,
        SessionState::Closed,
    ];

    /// 穷举全部 36 个组合，确认跃迁表与状态格一致。
    #[test]
    fn transition_table_is_exact() {
        use SessionState::*;
        let allowed = [
            (Created, Connected),
            (Created, Securing),
            (Created, Closing),
            (Connected, Securing),
            (Connected, Closing),
            (Securing, Secured),
            (Securing, Closing),
            (Secured, Connected),
            (Secured, Securing),
            (Secured, Closing),
            (Closing, Closed),
        ];
        for from in ALL {
            for to in ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from:?} -> {to:?} 的判定与状态格不符"
                );
            }
        }
    }

    #[test]
    fn rejected_transition_leaves_state_unchanged() {
        let cell = SessionStateCell::new();
        let err = cell
            .transition(SessionState::Secured)
            .expect_err("Created -> Secured 必须被拒绝");
        assert_eq!(err.code(), codes::SESSION_INVALID_STATE);
        assert_eq!(cell.get(), SessionState::Created);
    }

    #[test]
    fn closed_is_terminal() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Closing).expect("进入 Closing");
        cell.transition(SessionState::Closed).expect("进入 Closed");
        assert!(cell.get().is_terminal());
        for target in ALL {
            assert!(cell.transition(target).is_err(), "Closed 不允许任何跃迁");
        }
    }

    #[test]
    fn secured_may_fall_back_for_renegotiation() {
        let cell = SessionStateCell::new();
        cell.transition(SessionState::Securing).expect("开始握手");
        cell.transition(SessionState::Secured).expect("握手完成");
        cell.transition(SessionState::Securing)
            .expect("重协商回到 Securing");
        assert_eq!(cell.get(), SessionState::Securing);
    }
}
