use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use seine_core::buffer::CompositeBuf;
use seine_core::chain::{ChainMessage, FilterChain};
use seine_core::future::{CloseFuture, WriteFuture};
use seine_core::service::{IoService, SessionConfig};
use seine_core::session::{
    AttributeMap, IoSession, SessionCore, SessionState, SessionStats, WriteRequest,
};

use crate::server::DatagramLoopHandle;

/// 共享数据报套接字上的退化会话。
///
/// # 契约说明（What）
/// - 会话按对端地址标识，不持有独立套接字；
/// - 写队列中的每个请求对应一个数据报，不存在部分写入；
/// - 状态格没有 Securing/Secured 分支；
/// - `close(false)` 先排空写队列再收尾，`close(true)` 立即收尾并使
///   未发送请求的 Future 失败，与 TCP 会话同一契约。
pub struct UdpSession {
    core: SessionCore,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    io_loop: DatagramLoopHandle,
    this: std::sync::OnceLock<Weak<UdpSession>>,
    close_after_flush: AtomicBool,
}

impl UdpSession {
    pub(crate) fn create(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        io_loop: DatagramLoopHandle,
        service: Weak<dyn IoService>,
        chain: Arc<FilterChain>,
        config: Arc<SessionConfig>,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            core: SessionCore::new(service, chain, config),
            local_addr,
            peer_addr,
            io_loop,
            this: std::sync::OnceLock::new(),
            close_after_flush: AtomicBool::new(false),
        });
        let _ = session.this.set(Arc::downgrade(&session));
        session
            .core
            .bind_self(Arc::downgrade(&session) as Weak<dyn IoSession>);
        session
    }

    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }

    pub(crate) fn strong(&self) -> Option<Arc<UdpSession>> {
        self.this.get().and_then(Weak::upgrade)
    }

    pub(crate) fn as_dyn(&self) -> Arc<dyn IoSession> {
        self.core
            .session()
            .expect("session self reference must outlive the datagram loop")
    }

    pub(crate) fn close_after_flush(&self) -> bool {
        self.close_after_flush.load(Ordering::Acquire)
    }

    pub(crate) fn set_close_after_flush(&self) {
        self.close_after_flush.store(true, Ordering::Release);
    }
}

impl IoSession for UdpSession {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn state(&self) -> SessionState {
        self.core.state()
    }

    fn is_secured(&self) -> bool {
        false
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn created_at_ms(&self) -> u64 {
        self.core.created_at_ms()
    }

    fn stats(&self) -> &SessionStats {
        self.core.stats()
    }

    fn attributes(&self) -> &AttributeMap {
        self.core.attributes()
    }

    fn config(&self) -> &SessionConfig {
        self.core.config()
    }

    fn filter_chain(&self) -> &Arc<FilterChain> {
        self.core.filter_chain()
    }

    fn service(&self) -> Option<Arc<dyn IoService>> {
        self.core.service()
    }

    fn write(&self, message: ChainMessage) {
        self.core.write(message);
    }

    fn write_with_future(&self, message: ChainMessage) -> WriteFuture {
        self.core.write_with_future(message)
    }

    fn close(&self, immediately: bool) -> CloseFuture {
        let future = self.core.close_future();
        if self
            .core
            .state_cell()
            .transition(SessionState::Closing)
            .is_ok()
        {
            debug!(
                session_id = self.core.id(),
                immediately,
                "udp session closing"
            );
            if let Some(this) = self.strong() {
                self.io_loop.enqueue_close(this, immediately);
            }
        }
        future
    }

    fn suspend_read(&self) {
        self.core.read_suspended().store(true, Ordering::Release);
    }

    fn resume_read(&self) {
        self.core.read_suspended().store(false, Ordering::Release);
    }

    fn suspend_write(&self) {
        self.core.write_suspended().store(true, Ordering::Release);
        if let Some(this) = self.strong() {
            self.io_loop.enqueue_flush(this);
        }
    }

    fn resume_write(&self) {
        self.core.write_suspended().store(false, Ordering::Release);
        if let Some(this) = self.strong() {
            self.io_loop.enqueue_flush(this);
        }
    }

    fn is_read_suspended(&self) -> bool {
        self.core.read_suspended().load(Ordering::Acquire)
    }

    fn is_write_suspended(&self) -> bool {
        self.core.write_suspended().load(Ordering::Acquire)
    }

    fn enqueue_write_request(&self, payload: CompositeBuf) -> WriteRequest {
        let request = WriteRequest::new(payload);
        self.core.write_queue().offer(request.clone());
        if self.core.write_queue().try_claim_flush() {
            if let Some(this) = self.strong() {
                self.io_loop.enqueue_flush(this);
            }
        }
        request
    }
}
