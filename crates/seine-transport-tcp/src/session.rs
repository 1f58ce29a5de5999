use std::io::{self, IoSlice, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use mio::net::TcpStream;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use seine_core::buffer::CompositeBuf;
use seine_core::chain::{ChainMessage, FilterChain};
use seine_core::clock;
use seine_core::future::{CloseFuture, WriteFuture};
use seine_core::service::{IoService, ServiceCore, SessionConfig};
use seine_core::session::{
    AttributeMap, IoSession, SessionCore, SessionState, SessionStats, WriteRequest,
};
use seine_core::SeineError;
use seine_tls::TlsHelper;

use crate::selector::SelectorLoop;

/// 单次向量化写最多携带的段数。
const MAX_WRITE_SEGMENTS: usize = 16;

/// 一轮写队列排空的结果。
pub(crate) enum DrainOutcome {
    /// 队列已空。
    Drained { wrote_any: bool },
    /// 套接字暂不可写，剩余载荷已回插队首。
    Blocked { wrote_any: bool },
    /// 套接字写失败，会话应关闭。
    Failed(io::Error),
}

/// mio 支撑的具体 TCP 会话。
///
/// # 逻辑解析（How）
/// - [`SessionCore`] 提供状态格、属性、统计、写队列与链路快照；本类型
///   补上套接字、注册令牌、兴趣集记账与 TLS 助手；
/// - 读派发、写排空只发生在归属循环线程；`write`/`close`/`suspend_*`
///   可从任意线程进入，经由循环的意向队列收敛到循环线程执行；
/// - 服务启用 TLS 时，写请求在入队前经 TLS 助手替换为密文，
///   排空路径对加密无感。
pub struct TcpSession {
    core: SessionCore,
    stream: Mutex<TcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    io_loop: SelectorLoop,
    registry: Weak<ServiceCore>,
    this: OnceLock<Weak<TcpSession>>,
    /// 选择器令牌；0 表示尚未注册。
    token: AtomicUsize,
    registered: AtomicBool,
    opened_fired: AtomicBool,
    close_after_flush: AtomicBool,
    client_side: bool,
    tls: Option<Mutex<TlsHelper>>,
}

impl TcpSession {
    /// 构造会话并注入弱自引用。
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create(
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        io_loop: SelectorLoop,
        service: Weak<dyn IoService>,
        registry: Weak<ServiceCore>,
        chain: Arc<FilterChain>,
        config: Arc<SessionConfig>,
        tls: Option<TlsHelper>,
        client_side: bool,
    ) -> Arc<Self> {
        let session = Arc::new(Self {
            core: SessionCore::new(service, chain, config),
            stream: Mutex::new(stream),
            local_addr,
            peer_addr,
            io_loop,
            registry,
            this: OnceLock::new(),
            token: AtomicUsize::new(0),
            registered: AtomicBool::new(false),
            opened_fired: AtomicBool::new(false),
            close_after_flush: AtomicBool::new(false),
            client_side,
            tls: tls.map(Mutex::new),
        });
        let _ = session.this.set(Arc::downgrade(&session));
        session
            .core
            .bind_self(Arc::downgrade(&session) as Weak<dyn IoSession>);
        session
    }

    /// 共有会话机件。
    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }

    /// 套接字句柄（仅循环线程在注册后访问）。
    pub(crate) fn stream(&self) -> &Mutex<TcpStream> {
        &self.stream
    }

    /// 会话回指的服务注册表。
    pub(crate) fn registry(&self) -> Option<Arc<ServiceCore>> {
        self.registry.upgrade()
    }

    /// 取强自引用。
    pub(crate) fn strong(&self) -> Option<Arc<TcpSession>> {
        self.this.get().and_then(Weak::upgrade)
    }

    /// 以 `Arc<dyn IoSession>` 形态取自引用；循环持有会话期间必然成功。
    pub(crate) fn as_dyn(&self) -> Arc<dyn IoSession> {
        self.core
            .session()
            .expect("session self reference must outlive the selector registration")
    }

    pub(crate) fn token(&self) -> usize {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: usize) {
        self.token.store(token, Ordering::Release);
    }

    pub(crate) fn registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    pub(crate) fn is_client_side(&self) -> bool {
        self.client_side
    }

    pub(crate) fn has_tls(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn close_after_flush(&self) -> bool {
        self.close_after_flush.load(Ordering::Acquire)
    }

    pub(crate) fn set_close_after_flush(&self) {
        self.close_after_flush.store(true, Ordering::Release);
    }

    /// 首次打开事件：幂等地走一遍过滤链。
    pub(crate) fn mark_opened(&self) {
        if !self.opened_fired.swap(true, Ordering::AcqRel) {
            let session = self.as_dyn();
            self.core.filter_chain().process_session_opened(&session);
        }
    }

    /// 客户端侧发起 TLS 握手：取 ClientHello 记录直接入队。
    pub(crate) fn start_client_handshake(&self) -> Result<(), SeineError> {
        let Some(tls) = &self.tls else {
            return Ok(());
        };
        let records = tls.lock().initial_records()?;
        if !records.is_empty() {
            self.enqueue_raw(CompositeBuf::from_bytes(records));
        }
        Ok(())
    }

    /// 循环读派发入口：明文直通过滤链，密文先经引擎解包。
    pub(crate) fn process_read(&self, data: &[u8]) -> Result<(), SeineError> {
        let session = self.as_dyn();
        let Some(tls) = &self.tls else {
            let view = CompositeBuf::copy_from_slice(data);
            FilterChain::dispatch_message_received(
                self.core.filter_chain(),
                &session,
                ChainMessage::Buffer(view),
            );
            return Ok(());
        };

        let progress = tls.lock().unwrap_ciphertext(data)?;
        if !progress.records.is_empty() {
            // 握手应答沿原始路径入队，不再次加密。
            self.enqueue_raw(CompositeBuf::from_bytes(progress.records));
        }
        if progress.handshake_complete && self.core.state() == SessionState::Securing {
            self.core.state_cell().transition(SessionState::Secured)?;
            self.core.set_secured(true);
            info!(
                session_id = self.core.id(),
                "tls handshake complete, session secured"
            );
            self.mark_opened();
        }
        for chunk in progress.plaintext {
            FilterChain::dispatch_message_received(
                self.core.filter_chain(),
                &session,
                ChainMessage::Buffer(CompositeBuf::from_bytes(chunk)),
            );
        }
        if progress.peer_closed {
            debug!(session_id = self.core.id(), "peer closed the tls channel");
        }
        Ok(())
    }

    /// 绕过 TLS 的原始入队：用于引擎自身产生的记录。
    pub(crate) fn enqueue_raw(&self, payload: CompositeBuf) -> WriteRequest {
        let request = WriteRequest::new(payload);
        self.core.write_queue().offer(request.clone());
        if self.core.write_queue().try_claim_flush() {
            if let Some(this) = self.strong() {
                self.io_loop.enqueue_flush(this);
            }
        }
        request
    }

    /// 排空写队列，直至队空、套接字阻塞或出错。
    ///
    /// 仅由归属循环线程调用。部分写入把剩余载荷回插队首，字节
    /// 不丢失也不重复；写完整个请求后完成其 Future。
    pub(crate) fn drain_once(&self) -> DrainOutcome {
        let queue = self.core.write_queue();
        let mut wrote_any = false;
        loop {
            let Some(request) = queue.pop_front() else {
                return DrainOutcome::Drained { wrote_any };
            };
            let mut blocked = false;
            let mut failed: Option<io::Error> = None;
            {
                let mut payload = request.payload();
                let mut stream = self.stream.lock();
                while payload.remaining() > 0 {
                    let written = {
                        let mut slices = [IoSlice::new(&[]); MAX_WRITE_SEGMENTS];
                        let count = payload.chunks_vectored(&mut slices);
                        stream.write_vectored(&slices[..count])
                    };
                    match written {
                        Ok(0) => {
                            failed = Some(io::Error::new(
                                io::ErrorKind::WriteZero,
                                "socket accepted zero bytes",
                            ));
                            break;
                        }
                        Ok(count) => {
                            let now = clock::now_millis();
                            self.core.stats().record_written(count as u64, now);
                            // count 不会超过 remaining，推进必然成功。
                            let _ = payload.advance(count);
                            wrote_any = true;
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            blocked = true;
                            break;
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => {
                            failed = Some(err);
                            break;
                        }
                    }
                }
            }
            if let Some(err) = failed {
                queue.push_front(request);
                return DrainOutcome::Failed(err);
            }
            if blocked {
                queue.push_front(request);
                return DrainOutcome::Blocked { wrote_any };
            }
            request.complete_written();
        }
    }

    /// 非阻塞连接的完成检查。
    pub(crate) fn check_connect(&self) -> ConnectCheck {
        let stream = self.stream.lock();
        match stream.take_error() {
            Ok(Some(err)) => return ConnectCheck::Failed(err),
            Ok(None) => {}
            Err(err) => return ConnectCheck::Failed(err),
        }
        match stream.peer_addr() {
            Ok(_) => ConnectCheck::Connected,
            Err(err)
                if err.kind() == io::ErrorKind::NotConnected
                    || err.raw_os_error() == Some(EINPROGRESS) =>
            {
                ConnectCheck::Pending
            }
            Err(err) => ConnectCheck::Failed(err),
        }
    }
}

/// Linux `EINPROGRESS`：非阻塞连接仍在进行。
const EINPROGRESS: i32 = 115;

/// 连接完成检查的三态结果。
pub(crate) enum ConnectCheck {
    Connected,
    Pending,
    Failed(io::Error),
}

impl IoSession for TcpSession {
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
        match self.core.state_cell().transition(SessionState::Closing) {
            Ok(previous) => {
                debug!(
                    session_id = self.core.id(),
                    from = ?previous,
                    immediately,
                    "session closing"
                );
                if !immediately {
                    if let Some(tls) = &self.tls {
                        if matches!(
                            previous,
                            SessionState::Securing | SessionState::Secured
                        ) {
                            // 有序 TLS 关闭：close_notify 随队列排空后出线。
                            match tls.lock().close_notify() {
                                Ok(records) if !records.is_empty() => {
                                    self.enqueue_raw(CompositeBuf::from_bytes(records));
                                }
                                Ok(_) => {}
                                Err(err) => debug!(
                                    session_id = self.core.id(),
                                    "close_notify failed, closing anyway: {err}"
                                ),
                            }
                        }
                    }
                }
                if let Some(this) = self.strong() {
                    self.io_loop.enqueue_close(this, immediately);
                }
            }
            Err(_) => {
                // 已在关闭流程中：沿用首次关闭的 Future。
            }
        }
        future
    }

    fn suspend_read(&self) {
        self.core.read_suspended().store(true, Ordering::Release);
        if let Some(this) = self.strong() {
            self.io_loop.enqueue_flush(this);
        }
    }

    fn resume_read(&self) {
        self.core.read_suspended().store(false, Ordering::Release);
        if let Some(this) = self.strong() {
            self.io_loop.enqueue_flush(this);
        }
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
        let payload = match &self.tls {
            Some(tls) => {
                // 加密替换发生在入队之前，排空路径对 TLS 无感。握手尚未
                // 完成时引擎缓存明文，完成后自动随记录流出。
                match tls.lock().wrap(&payload.to_vec()) {
                    Ok(records) => CompositeBuf::from_bytes(records),
                    Err(err) => {
                        error!(
                            session_id = self.core.id(),
                            code = err.code(),
                            "tls wrap failed, closing session: {err}"
                        );
                        let request = WriteRequest::new(CompositeBuf::new());
                        request.fail(err);
                        self.close(true);
                        return request;
                    }
                }
            }
            None => payload,
        };
        self.enqueue_raw(payload)
    }
}
