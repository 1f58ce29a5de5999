//! 单元测试用的会话桩件：无套接字，写请求只入队不排空。

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::CompositeBuf;
use crate::chain::{ChainMessage, FilterChain, IdleStatus, IoFilter};
use crate::future::{CloseFuture, WriteFuture};
use crate::handler::{IoHandler, NoopHandler};
use crate::service::{IoService, SessionConfig};
use crate::session::{
    AttributeMap, IoSession, SessionCore, SessionState, SessionStats, WriteRequest,
};

/// 空服务桩：构造后立即丢弃，使会话的服务回指呈“服务已销毁”。
struct StubService;

impl IoService for StubService {
    fn chain_template(&self) -> Arc<FilterChain> {
        Arc::new(FilterChain::new(Vec::new(), Arc::new(NoopHandler)))
    }

    fn session_count(&self) -> usize {
        0
    }

    fn find_session(&self, _id: u64) -> Option<Arc<dyn IoSession>> {
        None
    }

    fn managed_sessions(&self) -> Vec<Arc<dyn IoSession>> {
        Vec::new()
    }
}

/// 记录链尾收到的全部字节消息的处理器。
#[derive(Default)]
pub(crate) struct RecordingHandler {
    received: Mutex<Vec<Vec<u8>>>,
}

impl RecordingHandler {
    pub(crate) fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }
}

impl IoHandler for RecordingHandler {
    fn message_received(&self, _session: &Arc<dyn IoSession>, message: ChainMessage) {
        if let Ok(buffer) = message.into_buffer() {
            self.received.lock().push(buffer.to_vec());
        }
    }
}

/// 统计空闲事件次数的过滤器。
#[derive(Default)]
pub(crate) struct IdleProbe {
    read_idle: AtomicUsize,
    write_idle: AtomicUsize,
}

impl IdleProbe {
    pub(crate) fn read_idle_count(&self) -> usize {
        self.read_idle.load(Ordering::SeqCst)
    }

    pub(crate) fn write_idle_count(&self) -> usize {
        self.write_idle.load(Ordering::SeqCst)
    }
}

impl IoFilter for IdleProbe {
    fn session_idle(&self, _session: &Arc<dyn IoSession>, status: IdleStatus) {
        match status {
            IdleStatus::ReadIdle => self.read_idle.fetch_add(1, Ordering::SeqCst),
            IdleStatus::WriteIdle => self.write_idle.fetch_add(1, Ordering::SeqCst),
        };
    }
}

/// 无套接字的会话桩。
pub(crate) struct StubSession {
    core: SessionCore,
    addr: SocketAddr,
}

impl StubSession {
    /// 空链 + 丢弃式处理器。
    pub(crate) fn plain() -> Arc<Self> {
        Self::with_chain(Vec::new(), Arc::new(NoopHandler))
    }

    /// 指定过滤器与处理器。
    pub(crate) fn with_chain(
        filters: Vec<Arc<dyn IoFilter>>,
        handler: Arc<dyn IoHandler>,
    ) -> Arc<Self> {
        Self::build(filters, handler, SessionConfig::new())
    }

    /// 带空闲探针的配置化会话。
    pub(crate) fn with_idle_probe(config: SessionConfig, probe: Arc<IdleProbe>) -> Arc<Self> {
        Self::build(vec![probe as Arc<dyn IoFilter>], Arc::new(NoopHandler), config)
    }

    fn build(
        filters: Vec<Arc<dyn IoFilter>>,
        handler: Arc<dyn IoHandler>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let service: Arc<dyn IoService> = Arc::new(StubService);
        let service_ref: Weak<dyn IoService> = Arc::downgrade(&service);
        drop(service);

        let chain = Arc::new(FilterChain::new(filters, handler));
        let session = Arc::new(Self {
            core: SessionCore::new(service_ref, chain, Arc::new(config)),
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
        });
        let weak: Weak<dyn IoSession> = Arc::downgrade(&session) as Weak<dyn IoSession>;
        session.core.bind_self(weak);
        session
    }

    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }
}

impl IoSession for StubSession {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn state(&self) -> SessionState {
        self.core.state()
    }

    fn is_secured(&self) -> bool {
        self.core.is_secured()
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.addr
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

    fn close(&self, _immediately: bool) -> CloseFuture {
        let future = self.core.close_future();
        let _ = self.core.state_cell().transition(SessionState::Closing);
        if self.core.state_cell().transition(SessionState::Closed).is_ok() && !future.is_done() {
            future.complete(());
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
    }

    fn resume_write(&self) {
        self.core.write_suspended().store(false, Ordering::Release);
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
        self.core.write_queue().try_claim_flush();
        request
    }
}
