use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{codes, SeineError};

/// 写操作的完成 Future：载荷全部写入内核后以 `()` 完成。
pub type WriteFuture = Arc<IoFuture<()>>;

/// 关闭操作的完成 Future：会话进入 Closed 终态后完成。
pub type CloseFuture = Arc<IoFuture<()>>;

/// 注册在 Future 上的一次性监听器。
pub type CompletionListener<T> = Box<dyn FnOnce(&Result<T, SeineError>) + Send>;

/// Future 的内部终态。
enum FutureState<T> {
    Pending,
    Completed(T),
    Failed(SeineError),
    Cancelled,
}

struct FutureInner<T> {
    state: FutureState<T>,
    listeners: Vec<CompletionListener<T>>,
    canceller: Option<Box<dyn FnOnce() -> bool + Send>>,
}

/// `IoFuture` 是框架的一次性完成原语，写入与连接都以它交付结果。
///
/// # 设计背景（Why）
/// - 选择器循环是线程模型，不是异步任务模型：等待方需要可阻塞的
///   `get`，完成方（循环线程）需要非阻塞的 `complete`/`fail`；
/// - 监听器允许在完成点内联派发，避免为回调再引入一层调度。
///
/// # 逻辑解析（How）
/// - `Mutex<FutureInner>` 保存终态与监听器列表，`Condvar` 唤醒阻塞的
///   `get`/`get_timeout`；
/// - 完成路径在锁内落定状态、取出监听器，在锁外逐个调用，避免监听器
///   反向调用 Future 时自锁；
/// - 取消委托给注册的 canceller（属主），属主接受后才进入 Cancelled。
///
/// # 契约说明（What）
/// - **一次性**：`complete` 与 `fail` 至多成功一次，第二次终态写入是
///   编程错误，由断言捕获；
/// - **监听器活性**：完成前注册的监听器在完成点被调用恰好一次；完成后
///   注册的监听器被同步调用恰好一次；
/// - `get_timeout` 超时返回 [`codes::FUTURE_TIMEOUT`] 错误，Future 本身
///   保持 Pending，不构成终态。
pub struct IoFuture<T> {
    inner: Mutex<FutureInner<T>>,
    done: Condvar,
}

impl<T: Clone> IoFuture<T> {
    /// 创建 Pending 状态的 Future。
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FutureInner {
                state: FutureState::Pending,
                listeners: Vec::new(),
                canceller: None,
            }),
            done: Condvar::new(),
        }
    }

    /// 注册取消委托。属主（如连接发起方）通过它决定是否接受取消。
    pub fn set_canceller(&self, canceller: impl FnOnce() -> bool + Send + 'static) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, FutureState::Pending) {
            inner.canceller = Some(Box::new(canceller));
        }
    }

    /// 是否已进入任一终态。
    pub fn is_done(&self) -> bool {
        !matches!(self.inner.lock().state, FutureState::Pending)
    }

    /// 是否以取消终结。
    pub fn is_cancelled(&self) -> bool {
        matches!(self.inner.lock().state, FutureState::Cancelled)
    }

    /// 以成功值终结 Future，并内联通知所有监听器。
    pub fn complete(&self, value: T) {
        assert!(
            self.finish(FutureState::Completed(value)),
            "completion future already terminated"
        );
    }

    /// 以失败终结 Future，并内联通知所有监听器。
    pub fn fail(&self, error: SeineError) {
        assert!(
            self.finish(FutureState::Failed(error)),
            "completion future already terminated"
        );
    }

    /// 竞态容忍的成功终结：已有终态时返回 `false`，不触发断言。
    ///
    /// 供内部管线在多条收尾路径（关闭、超时、取消）可能赛跑时使用；
    /// 应用侧的重复完成仍应走 [`IoFuture::complete`] 暴露编程错误。
    pub fn try_complete(&self, value: T) -> bool {
        self.finish(FutureState::Completed(value))
    }

    /// 竞态容忍的失败终结，语义同 [`IoFuture::try_complete`]。
    pub fn try_fail(&self, error: SeineError) -> bool {
        self.finish(FutureState::Failed(error))
    }

    /// 请求取消：委托给属主，属主接受后转入 Cancelled 终态。
    ///
    /// 返回是否确已取消。未注册 canceller 或已有终态时取消失败。
    pub fn cancel(&self) -> bool {
        let canceller = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, FutureState::Pending) {
                return matches!(inner.state, FutureState::Cancelled);
            }
            match inner.canceller.take() {
                Some(canceller) => canceller,
                None => return false,
            }
        };
        // 属主回调在锁外执行，允许它反向触碰本 Future。
        if !canceller() {
            return false;
        }
        let mut inner = self.inner.lock();
        if matches!(inner.state, FutureState::Pending) {
            self.transition(&mut inner, FutureState::Cancelled);
        }
        matches!(inner.state, FutureState::Cancelled)
    }

    /// 阻塞直至终态，返回结果副本。
    pub fn get(&self) -> Result<T, SeineError> {
        let mut inner = self.inner.lock();
        while matches!(inner.state, FutureState::Pending) {
            self.done.wait(&mut inner);
        }
        Self::snapshot(&inner.state)
    }

    /// 带期限的阻塞等待；超时返回 [`codes::FUTURE_TIMEOUT`] 错误。
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, SeineError> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while matches!(inner.state, FutureState::Pending) {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(SeineError::timeout(
                    codes::FUTURE_TIMEOUT,
                    format!("future not complete within {timeout:?}"),
                ));
            }
            self.done.wait_for(&mut inner, deadline - now);
        }
        Self::snapshot(&inner.state)
    }

    /// 注册完成监听器：未完成则挂起等待完成点，已完成则同步调用。
    pub fn on_complete(&self, listener: impl FnOnce(&Result<T, SeineError>) + Send + 'static) {
        let result = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, FutureState::Pending) {
                inner.listeners.push(Box::new(listener));
                return;
            }
            Self::snapshot(&inner.state)
        };
        listener(&result);
    }

    /// 终态写入；成功落定返回 `true`，已有终态返回 `false`。
    fn finish(&self, terminal: FutureState<T>) -> bool {
        let (result, listeners) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, FutureState::Pending) {
                return false;
            }
            self.transition(&mut inner, terminal);
            let listeners = std::mem::take(&mut inner.listeners);
            (Self::snapshot(&inner.state), listeners)
        };
        for listener in listeners {
            listener(&result);
        }
        true
    }

    fn transition(&self, inner: &mut FutureInner<T>, terminal: FutureState<T>) {
        inner.state = terminal;
        inner.canceller = None;
        self.done.notify_all();
    }

    fn snapshot(state: &FutureState<T>) -> Result<T, SeineError> {
        match state {
            FutureState::Completed(value) => Ok(value.clone()),
            FutureState::Failed(error) => Err(error.clone()),
            FutureState::Cancelled => Err(SeineError::cancelled("future was cancelled")),
            FutureState::Pending => unreachable!("snapshot taken before terminal state"),
        }
    }
}

impl<T: Clone> Default for IoFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn listener_before_completion_fires_exactly_once() {
        let future = IoFuture::<u32>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        future.on_complete(move |result| {
            assert_eq!(*result.as_ref().expect("应为成功结果"), 7);
            observed.fetch_add(1, Ordering::SeqCst);
        });
        future.complete(7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_after_completion_is_invoked_synchronously() {
        let future = IoFuture::<u32>::new();
        future.complete(3);
        let hits = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&hits);
        future.on_complete(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn get_blocks_until_completion_from_another_thread() {
        let future = Arc::new(IoFuture::<&'static str>::new());
        let completer = Arc::clone(&future);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            completer.complete("done");
        });
        assert_eq!(future.get().expect("应收到成功值"), "done");
        handle.join().expect("完成线程不应 panic");
    }

    #[test]
    fn get_timeout_expires_without_terminating_future() {
        let future = IoFuture::<()>::new();
        let start = Instant::now();
        let err = future
            .get_timeout(Duration::from_millis(40))
            .expect_err("超时应返回错误");
        assert_eq!(err.code(), codes::FUTURE_TIMEOUT);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!future.is_done());
    }

    #[test]
    #[should_panic(expected = "already terminated")]
    fn second_completion_is_an_assertion_failure() {
        let future = IoFuture::<u32>::new();
        future.complete(1);
        future.complete(2);
    }

    #[test]
    fn cancel_delegates_to_owner() {
        let future = IoFuture::<()>::new();
        assert!(!future.cancel(), "未注册属主时取消应失败");

        let future = IoFuture::<()>::new();
        future.set_canceller(|| true);
        assert!(future.cancel());
        assert!(future.is_cancelled());
        let err = future.get().expect_err("取消后应交付取消错误");
        assert_eq!(err.code(), codes::FUTURE_CANCELLED);
    }

    #[test]
    fn owner_may_refuse_cancellation() {
        let future = IoFuture::<u8>::new();
        future.set_canceller(|| false);
        assert!(!future.cancel());
        future.complete(9);
        assert_eq!(future.get().expect("拒绝取消后仍可完成"), 9);
    }
}
