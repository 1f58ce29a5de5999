use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::chain::{ChainMessage, FilterChain};
use crate::error::{codes, SeineError};
use crate::handler::IoHandler;
use crate::session::{IoSession, WriteRequest};

/// 过滤链的游标控制器：每次消息派发创建一个，交到过滤器手中。
///
/// # 设计背景（Why）
/// - 早期实现用简单循环驱动链路，过滤器无法延迟或分叉传播；把游标
///   从派发器挪到一个可克隆、可跨线程持有的控制器对象上之后，
///   过滤器可以：不调用（短路）、改写消息后调用（转换）、克隆控制器
///   异步续传（从任意线程恢复传播）。
///
/// # 逻辑解析（How）
/// - 读写两个方向各维护一个游标，记录“当前执行中的过滤器位置”；
///   入站派发自索引 0 进入并递增，出站派发自索引 N−1 进入并递减；
/// - `call_read_next` 越过末位时把消息交给链尾处理器；
///   `call_write_next` 下溢时把最终字节载荷入队会话写队列；
/// - 调用前推进游标、返回后复原到调用者位置：同一过滤器二次调用
///   `call_*_next` 仍沿原路径传播（消息分叉），返回前未调用的过滤器
///   保留位置，延迟续传从该位置继续。
///
/// # 契约说明（What）
/// - 一个控制器只服务一次在途事件；延迟续传时由持有方保证同一时刻
///   只有一条线程驱动它；
/// - 写方向链尾只接受 [`ChainMessage::Buffer`]，其余类型按协议错误
///   回放到 `exception_caught`。
#[derive(Clone)]
pub struct ChainController {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    chain: Arc<FilterChain>,
    session: Arc<dyn IoSession>,
    read_cursor: AtomicIsize,
    write_cursor: AtomicIsize,
    /// 本次写方向派发入队的最后一个请求，链路事后在它上面挂接 Future。
    last_request: Mutex<Option<WriteRequest>>,
}

impl ChainController {
    pub(crate) fn new(chain: Arc<FilterChain>, session: Arc<dyn IoSession>) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                chain,
                session,
                read_cursor: AtomicIsize::new(0),
                write_cursor: AtomicIsize::new(0),
                last_request: Mutex::new(None),
            }),
        }
    }

    /// 本次派发所属的会话。
    pub fn session(&self) -> &Arc<dyn IoSession> {
        &self.inner.session
    }

    /// 入站派发入口：游标落在索引 0 上，把消息交给首个过滤器。
    ///
    /// 空链时消息直达链尾处理器。游标保持“当前执行中过滤器的位置”，
    /// 因此延迟续传的过滤器稍后调用 [`ChainController::call_read_next`]
    /// 仍会沿原位置继续向后传播。
    pub(crate) fn dispatch_read(&self, message: ChainMessage) {
        let inner = &self.inner;
        let filters = inner.chain.filters();
        if filters.is_empty() {
            inner
                .chain
                .handler()
                .message_received(&inner.session, message);
            return;
        }
        inner.read_cursor.store(0, Ordering::Release);
        filters[0].message_received(&inner.session, message, self);
    }

    /// 出站派发入口：游标落在索引 N−1 上，把消息交给末位过滤器。
    pub(crate) fn dispatch_write(&self, message: ChainMessage) {
        let inner = &self.inner;
        let filters = inner.chain.filters();
        if filters.is_empty() {
            self.enqueue_at_tail(message);
            return;
        }
        let last = filters.len() - 1;
        inner.write_cursor.store(last as isize, Ordering::Release);
        filters[last].message_writing(&inner.session, message, self);
    }

    /// 继续向链尾（处理器方向）传播入站消息。
    pub fn call_read_next(&self, message: ChainMessage) {
        let inner = &self.inner;
        let filters = inner.chain.filters();
        let current = inner.read_cursor.load(Ordering::Acquire);
        let next = current + 1;
        if next as usize >= filters.len() {
            inner
                .chain
                .handler()
                .message_received(&inner.session, message);
            return;
        }
        inner.read_cursor.store(next, Ordering::Release);
        filters[next as usize].message_received(&inner.session, message, self);
        inner.read_cursor.store(current, Ordering::Release);
    }

    /// 继续向链头（套接字方向）传播出站消息。
    pub fn call_write_next(&self, message: ChainMessage) {
        let inner = &self.inner;
        let filters = inner.chain.filters();
        let current = inner.write_cursor.load(Ordering::Acquire);
        let next = current - 1;
        if next < 0 {
            self.enqueue_at_tail(message);
            return;
        }
        inner.write_cursor.store(next, Ordering::Release);
        filters[next as usize].message_writing(&inner.session, message, self);
        inner.write_cursor.store(current, Ordering::Release);
    }

    /// 写方向走到链尾：校验载荷类型并入队。
    fn enqueue_at_tail(&self, message: ChainMessage) {
        match message {
            ChainMessage::Buffer(payload) => {
                debug!(
                    session_id = self.inner.session.id(),
                    bytes = payload.remaining(),
                    "write chain reached the tail, enqueueing payload"
                );
                let request = self.inner.session.enqueue_write_request(payload);
                *self.inner.last_request.lock() = Some(request);
            }
            other => {
                error!(
                    session_id = self.inner.session.id(),
                    message = ?other,
                    "write chain tail expects bytes, got a user message"
                );
                let err = SeineError::protocol(
                    codes::CHAIN_TAIL_NOT_BUFFER,
                    "write chain tail expects a byte buffer",
                );
                self.inner
                    .chain
                    .process_exception(&self.inner.session, &err);
            }
        }
    }

    /// 取走本次派发入队的最后一个写请求。
    pub(crate) fn take_last_request(&self) -> Option<WriteRequest> {
        self.inner.last_request.lock().take()
    }
}
