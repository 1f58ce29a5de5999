//! 双向过滤链：控制器驱动的拦截器管线。
//!
//! # 模块架构（Why）
//! - 入站方向（wire → handler）按索引 0 → N−1 派发，链尾是应用处理器；
//! - 出站方向（handler → wire）按索引 N−1 → 0 派发，下溢时把最终字节
//!   入队会话写队列；
//! - 链在会话创建时快照，会话存续期内不可变：服务层以 `arc-swap`
//!   维护模板，换链只影响其后创建的会话。
//!
//! # 异常安全（What）
//! - 过滤器回调中的 panic 被派发器捕获、记日志，并自索引 0 起以
//!   `exception_caught` 回放；`exception_caught` 自身的 panic 记日志后
//!   吞掉，避免无界递归。循环线程永不因过滤器而终止。

mod controller;
mod filter;

pub use controller::ChainController;
pub use filter::{IdleStatus, IoFilter};

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error};

use crate::buffer::CompositeBuf;
use crate::error::{codes, SeineError};
use crate::future::WriteFuture;
use crate::handler::IoHandler;
use crate::session::IoSession;

/// 管线中流动的消息：线缆层字节或业务层对象。
///
/// # 设计背景（Why）
/// - 解码器把字节改写为业务对象、编码器反向改写，同一条链上两类
///   消息并存；以枚举 + `Any` 擦除承载，过滤器按需下转型。
///
/// # 契约说明（What）
/// - `Buffer` 自持有字节段，过滤器可任意保留或克隆；
/// - `User` 的内部类型必须满足 `Send + Sync`，消费方必须显式处理
///   下转型失败分支。
pub enum ChainMessage {
    /// 线缆层字节载荷。
    Buffer(CompositeBuf),
    /// 业务层消息。
    User(Box<dyn Any + Send + Sync>),
}

impl ChainMessage {
    /// 以字节载荷构造消息。
    pub fn from_buffer(buffer: CompositeBuf) -> Self {
        ChainMessage::Buffer(buffer)
    }

    /// 以业务对象构造消息。
    pub fn from_user<T: Any + Send + Sync>(value: T) -> Self {
        ChainMessage::User(Box::new(value))
    }

    /// 若为字节载荷则取出，否则原样返还。
    pub fn into_buffer(self) -> Result<CompositeBuf, ChainMessage> {
        match self {
            ChainMessage::Buffer(buffer) => Ok(buffer),
            other => Err(other),
        }
    }

    /// 尝试以引用形式下转型业务消息。
    pub fn downcast_user<T: Any>(&self) -> Option<&T> {
        match self {
            ChainMessage::User(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl fmt::Debug for ChainMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainMessage::Buffer(buffer) => f.debug_tuple("Buffer").field(buffer).finish(),
            ChainMessage::User(_) => f.debug_tuple("User").field(&"<erased>").finish(),
        }
    }
}

impl From<CompositeBuf> for ChainMessage {
    fn from(buffer: CompositeBuf) -> Self {
        ChainMessage::Buffer(buffer)
    }
}

impl From<bytes::Bytes> for ChainMessage {
    fn from(bytes: bytes::Bytes) -> Self {
        ChainMessage::Buffer(CompositeBuf::from_bytes(bytes))
    }
}

impl From<Vec<u8>> for ChainMessage {
    fn from(bytes: Vec<u8>) -> Self {
        ChainMessage::Buffer(CompositeBuf::from(bytes))
    }
}

/// 某会话的过滤链快照：有序过滤器序列加链尾处理器。
pub struct FilterChain {
    filters: Vec<Arc<dyn IoFilter>>,
    handler: Arc<dyn IoHandler>,
}

impl FilterChain {
    /// 以过滤器序列与链尾处理器构造链。
    pub fn new(filters: Vec<Arc<dyn IoFilter>>, handler: Arc<dyn IoHandler>) -> Self {
        Self { filters, handler }
    }

    /// 过滤器序列（执行顺序即入站顺序）。
    pub fn filters(&self) -> &[Arc<dyn IoFilter>] {
        &self.filters
    }

    /// 链尾处理器。
    pub fn handler(&self) -> &Arc<dyn IoHandler> {
        &self.handler
    }

    /// 广播会话创建事件。
    pub fn process_session_created(&self, session: &Arc<dyn IoSession>) {
        debug!(session_id = session.id(), "processing session created event");
        for filter in &self.filters {
            self.guarded(session, || filter.session_created(session));
        }
    }

    /// 广播会话打开事件，并通知链尾处理器。
    pub fn process_session_opened(&self, session: &Arc<dyn IoSession>) {
        debug!(session_id = session.id(), "processing session opened event");
        for filter in &self.filters {
            self.guarded(session, || filter.session_opened(session));
        }
        self.guarded(session, || self.handler.session_opened(session));
    }

    /// 广播会话关闭事件，并通知链尾处理器。
    pub fn process_session_closed(&self, session: &Arc<dyn IoSession>) {
        debug!(session_id = session.id(), "processing session closed event");
        for filter in &self.filters {
            self.guarded(session, || filter.session_closed(session));
        }
        self.guarded(session, || self.handler.session_closed(session));
    }

    /// 广播会话空闲事件，并通知链尾处理器。
    pub fn process_session_idle(&self, session: &Arc<dyn IoSession>, status: IdleStatus) {
        debug!(
            session_id = session.id(),
            status = ?status,
            "processing session idle event"
        );
        for filter in &self.filters {
            self.guarded(session, || filter.session_idle(session, status));
        }
        self.guarded(session, || self.handler.session_idle(session, status));
    }

    /// 入站派发：消息自索引 0 流向链尾处理器。
    pub fn dispatch_message_received(
        chain: &Arc<FilterChain>,
        session: &Arc<dyn IoSession>,
        message: ChainMessage,
    ) {
        let controller = ChainController::new(Arc::clone(chain), Arc::clone(session));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            controller.dispatch_read(message);
        }));
        if let Err(payload) = outcome {
            chain.replay_panic(session, payload);
        }
    }

    /// 出站派发：消息自索引 N−1 流向写队列，随后挂接完成 Future。
    pub fn dispatch_message_writing(
        chain: &Arc<FilterChain>,
        session: &Arc<dyn IoSession>,
        message: ChainMessage,
        future: Option<WriteFuture>,
    ) {
        let controller = ChainController::new(Arc::clone(chain), Arc::clone(session));
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            controller.dispatch_write(message);
        }));
        match outcome {
            Ok(()) => {
                if let Some(future) = future {
                    // 挂到本次派发入队的最后一个请求上：过滤器可能把一条
                    // 消息拆成多个请求，载荷“全部写完”以末请求为准。
                    match controller.take_last_request() {
                        Some(request) => request.attach_future(future),
                        None => future.fail(SeineError::state(
                            codes::SESSION_CLOSED,
                            "write chain produced no request",
                        )),
                    }
                }
            }
            Err(payload) => {
                if let Some(future) = future {
                    future.fail(SeineError::protocol(
                        codes::CHAIN_FILTER_PANIC,
                        "a filter panicked while processing the write",
                    ));
                }
                chain.replay_panic(session, payload);
            }
        }
    }

    /// 异常回放：自索引 0 逐个通知过滤器，再通知处理器。
    pub fn process_exception(&self, session: &Arc<dyn IoSession>, error: &SeineError) {
        error!(
            session_id = session.id(),
            code = error.code(),
            "replaying exception through the chain: {error}"
        );
        for filter in &self.filters {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                filter.exception_caught(session, error);
            }));
            if outcome.is_err() {
                // exception_caught 自身的 panic 被吞掉，避免无界递归。
                error!(
                    session_id = session.id(),
                    "a filter panicked inside exception_caught, suppressed"
                );
            }
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.exception_caught(session, error);
        }));
        if outcome.is_err() {
            error!(
                session_id = session.id(),
                "the handler panicked inside exception_caught, suppressed"
            );
        }
    }

    /// 把 panic 载荷转成协议错误后回放。
    fn replay_panic(&self, session: &Arc<dyn IoSession>, payload: Box<dyn Any + Send>) {
        let message = panic_message(payload.as_ref());
        let err = SeineError::protocol(
            codes::CHAIN_FILTER_PANIC,
            format!("filter panicked: {message}"),
        );
        self.process_exception(session, &err);
    }

    /// 捕获生命周期广播中的 panic 并转入异常回放。
    fn guarded(&self, session: &Arc<dyn IoSession>, event: impl FnOnce()) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(event));
        if let Err(payload) = outcome {
            self.replay_panic(session, payload);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::test_stubs::{RecordingHandler, StubSession};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 把入站字节改写为大写后继续传播的过滤器。
    struct UpperCase;

    impl IoFilter for UpperCase {
        fn message_received(
            &self,
            _session: &Arc<dyn IoSession>,
            message: ChainMessage,
            controller: &ChainController,
        ) {
            let transformed = match message.into_buffer() {
                Ok(buffer) => {
                    let upper: Vec<u8> = buffer.to_vec().to_ascii_uppercase();
                    ChainMessage::from(upper)
                }
                Err(other) => other,
            };
            controller.call_read_next(transformed);
        }
    }

    /// 吞掉一切消息的过滤器。
    struct BlackHole;

    impl IoFilter for BlackHole {
        fn message_received(
            &self,
            _session: &Arc<dyn IoSession>,
            _message: ChainMessage,
            _controller: &ChainController,
        ) {
        }
    }

    /// 一进链就 panic 的过滤器。
    struct Faulty;

    impl IoFilter for Faulty {
        fn message_received(
            &self,
            _session: &Arc<dyn IoSession>,
            _message: ChainMessage,
            _controller: &ChainController,
        ) {
            panic!("boom");
        }
    }

    /// 统计异常回放次数的过滤器。
    #[derive(Default)]
    struct ExceptionCounter {
        hits: AtomicUsize,
    }

    impl IoFilter for ExceptionCounter {
        fn exception_caught(&self, _session: &Arc<dyn IoSession>, error: &SeineError) {
            assert_eq!(error.code(), codes::CHAIN_FILTER_PANIC);
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 空链入站：消息原样抵达链尾处理器（不变量 6 前半）。
    #[test]
    fn empty_chain_delivers_to_tail_unchanged() {
        let handler = Arc::new(RecordingHandler::default());
        let session = StubSession::with_chain(Vec::new(), handler.clone());
        let chain = Arc::clone(session.core().filter_chain());
        let dyn_session: Arc<dyn IoSession> = session.clone();

        FilterChain::dispatch_message_received(
            &chain,
            &dyn_session,
            ChainMessage::from(b"ping".to_vec()),
        );
        assert_eq!(handler.received(), vec![b"ping".to_vec()]);
    }

    /// 空链出站：消息原样入队（不变量 6 后半）。
    #[test]
    fn empty_chain_enqueues_write_unchanged() {
        let session = StubSession::plain();
        session.write(ChainMessage::from(b"pong".to_vec()));
        let request = session
            .core()
            .write_queue()
            .pop_front()
            .expect("空链写入应直接入队");
        assert_eq!(request.payload().to_vec(), b"pong");
    }

    /// 过滤器改写消息后继续传播。
    #[test]
    fn transform_filter_rewrites_payload() {
        let handler = Arc::new(RecordingHandler::default());
        let session =
            StubSession::with_chain(vec![Arc::new(UpperCase) as Arc<dyn IoFilter>], handler.clone());
        let chain = Arc::clone(session.core().filter_chain());
        let dyn_session: Arc<dyn IoSession> = session.clone();

        FilterChain::dispatch_message_received(
            &chain,
            &dyn_session,
            ChainMessage::from(b"abc".to_vec()),
        );
        assert_eq!(handler.received(), vec![b"ABC".to_vec()]);
    }

    /// 不调用控制器即短路，事件就地终止。
    #[test]
    fn short_circuit_stops_propagation() {
        let handler = Arc::new(RecordingHandler::default());
        let session =
            StubSession::with_chain(vec![Arc::new(BlackHole) as Arc<dyn IoFilter>], handler.clone());
        let chain = Arc::clone(session.core().filter_chain());
        let dyn_session: Arc<dyn IoSession> = session.clone();

        FilterChain::dispatch_message_received(
            &chain,
            &dyn_session,
            ChainMessage::from(b"lost".to_vec()),
        );
        assert!(handler.received().is_empty(), "短路后处理器不应收到消息");
    }

    /// 过滤器 panic 被捕获并自索引 0 回放为 exception_caught。
    #[test]
    fn panic_is_replayed_as_exception() {
        let counter = Arc::new(ExceptionCounter::default());
        let handler = Arc::new(RecordingHandler::default());
        let session = StubSession::with_chain(
            vec![counter.clone() as Arc<dyn IoFilter>, Arc::new(Faulty)],
            handler.clone(),
        );
        let chain = Arc::clone(session.core().filter_chain());
        let dyn_session: Arc<dyn IoSession> = session.clone();

        FilterChain::dispatch_message_received(
            &chain,
            &dyn_session,
            ChainMessage::from(b"x".to_vec()),
        );
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
        assert!(handler.received().is_empty());
    }

    /// 过滤器保留控制器并从另一线程续传：传播自原位置继续。
    #[test]
    fn deferred_resume_continues_from_the_stored_position() {
        use parking_lot::Mutex;

        #[derive(Default)]
        struct Deferring {
            parked: Mutex<Option<(ChainMessage, ChainController)>>,
        }

        impl IoFilter for Deferring {
            fn message_received(
                &self,
                _session: &Arc<dyn IoSession>,
                message: ChainMessage,
                controller: &ChainController,
            ) {
                *self.parked.lock() = Some((message, controller.clone()));
            }
        }

        let deferring = Arc::new(Deferring::default());
        let handler = Arc::new(RecordingHandler::default());
        let session = StubSession::with_chain(
            vec![
                deferring.clone() as Arc<dyn IoFilter>,
                Arc::new(UpperCase),
            ],
            handler.clone(),
        );
        let chain = Arc::clone(session.core().filter_chain());
        let dyn_session: Arc<dyn IoSession> = session.clone();

        FilterChain::dispatch_message_received(
            &chain,
            &dyn_session,
            ChainMessage::from(b"abc".to_vec()),
        );
        assert!(handler.received().is_empty(), "事件应停在延迟过滤器处");

        let (message, controller) = deferring
            .parked
            .lock()
            .take()
            .expect("控制器应已被保留");
        std::thread::spawn(move || controller.call_read_next(message))
            .join()
            .expect("续传线程不应 panic");
        assert_eq!(handler.received(), vec![b"ABC".to_vec()], "续传应走完剩余链路");
    }

    /// 写方向按 N−1 → 0 逆序执行。
    #[test]
    fn write_direction_runs_in_reverse() {
        struct Tagger(&'static str);

        impl IoFilter for Tagger {
            fn message_writing(
                &self,
                _session: &Arc<dyn IoSession>,
                message: ChainMessage,
                controller: &ChainController,
            ) {
                let mut bytes = match message.into_buffer() {
                    Ok(buffer) => buffer.to_vec(),
                    Err(_) => return,
                };
                bytes.extend_from_slice(self.0.as_bytes());
                controller.call_write_next(ChainMessage::from(bytes));
            }
        }

        let session = StubSession::with_chain(
            vec![
                Arc::new(Tagger("<head>")) as Arc<dyn IoFilter>,
                Arc::new(Tagger("<tail>")),
            ],
            Arc::new(RecordingHandler::default()),
        );
        session.write(ChainMessage::from(b"msg".to_vec()));
        let request = session
            .core()
            .write_queue()
            .pop_front()
            .expect("写请求应已入队");
        // 先过索引 1（tail），后过索引 0（head）。
        assert_eq!(request.payload().to_vec(), b"msg<tail><head>");
    }

    /// 写方向链尾收到业务消息：以协议错误回放，不入队。
    #[test]
    fn user_message_at_write_tail_is_a_protocol_error() {
        #[derive(Default)]
        struct TailErrorProbe {
            hits: AtomicUsize,
        }
        impl IoFilter for TailErrorProbe {
            fn exception_caught(&self, _session: &Arc<dyn IoSession>, error: &SeineError) {
                assert_eq!(error.code(), codes::CHAIN_TAIL_NOT_BUFFER);
                self.hits.fetch_add(1, Ordering::SeqCst);
            }
        }

        let probe = Arc::new(TailErrorProbe::default());
        let session = StubSession::with_chain(
            vec![probe.clone() as Arc<dyn IoFilter>],
            Arc::new(RecordingHandler::default()),
        );
        session.write(ChainMessage::from_user("not bytes"));
        assert_eq!(probe.hits.load(Ordering::SeqCst), 1);
        assert!(session.core().write_queue().is_empty());
    }
}
