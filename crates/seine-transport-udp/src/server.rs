use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use seine_core::buffer::CompositeBuf;
use seine_core::chain::{ChainMessage, FilterChain, IoFilter};
use seine_core::clock;
use seine_core::error::{codes as core_codes, ErrorKind};
use seine_core::handler::IoHandler;
use seine_core::service::{IoService, IoServiceListener, ServiceCore, SessionConfig};
use seine_core::session::{IoSession, SessionState};
use seine_core::{IndexedIdleTracker, SeineError};

use crate::session::UdpSession;

const WAKER_TOKEN: Token = Token(0);
const SOCKET_TOKEN: Token = Token(1);
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 投递给数据报循环的意向。
enum LoopIntent {
    Flush(Arc<UdpSession>),
    Close {
        session: Arc<UdpSession>,
        immediately: bool,
    },
    Shutdown,
}

/// 会话侧持有的循环句柄。
#[derive(Clone)]
pub(crate) struct DatagramLoopHandle {
    tx: Sender<LoopIntent>,
    waker: Arc<Waker>,
}

impl DatagramLoopHandle {
    pub(crate) fn enqueue_flush(&self, session: Arc<UdpSession>) {
        let _ = self.tx.send(LoopIntent::Flush(session));
        let _ = self.waker.wake();
    }

    pub(crate) fn enqueue_close(&self, session: Arc<UdpSession>, immediately: bool) {
        let _ = self.tx.send(LoopIntent::Close {
            session,
            immediately,
        });
        let _ = self.waker.wake();
    }

    fn enqueue_shutdown(&self) {
        let _ = self.tx.send(LoopIntent::Shutdown);
        let _ = self.waker.wake();
    }
}

struct UdpServerInner {
    core: Arc<ServiceCore>,
    session_config: Arc<SessionConfig>,
    bound: Mutex<Option<BoundState>>,
    this: OnceLock<Weak<UdpServerInner>>,
}

struct BoundState {
    addr: SocketAddr,
    handle: DatagramLoopHandle,
}

/// UDP 服务端：一个共享套接字、按对端地址派生的退化会话。
///
/// # 逻辑解析（How）
/// - `bind` 创建套接字与专用循环线程；循环对套接字保持读兴趣，
///   首个来自某对端的数据报为其创建会话（Created → Connected，
///   依次投递 created/opened）；
/// - 会话写入进入各自的写队列，冲刷意向合并后由循环以 `send_to`
///   排空；`WouldBlock` 时装上写兴趣等待重试；
/// - 空闲检测与 TCP 循环共用同一套按秒桶索引的跟踪器。
pub struct UdpServer {
    inner: Arc<UdpServerInner>,
}

impl UdpServer {
    /// 创建未绑定的服务端。
    pub fn new(config: SessionConfig) -> Self {
        let inner = Arc::new(UdpServerInner {
            core: Arc::new(ServiceCore::new()),
            session_config: Arc::new(config),
            bound: Mutex::new(None),
            this: OnceLock::new(),
        });
        let _ = inner.this.set(Arc::downgrade(&inner));
        Self { inner }
    }

    /// 设置应用处理器。
    pub fn set_handler(&self, handler: Arc<dyn IoHandler>) {
        self.inner.core.set_handler(handler);
    }

    /// 设置过滤器序列。
    pub fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>) {
        self.inner.core.set_filters(filters);
    }

    /// 注册服务监听器。
    pub fn add_listener(&self, listener: Arc<dyn IoServiceListener>) {
        self.inner.core.add_listener(listener);
    }

    /// 绑定地址并启动循环，返回实际绑定地址。
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, SeineError> {
        let mut bound = self.inner.bound.lock();
        if bound.is_some() {
            return Err(SeineError::state(
                "seine.udp.already_bound",
                "server already bound",
            ));
        }

        let mut socket = UdpSocket::bind(addr).map_err(bind_error)?;
        let local_addr = socket.local_addr().map_err(bind_error)?;
        let poll = Poll::new().map_err(bind_error)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)
            .map_err(bind_error)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(bind_error)?);
        let (tx, rx) = mpsc::channel();
        let handle = DatagramLoopHandle {
            tx,
            waker: Arc::clone(&waker),
        };

        let worker = DatagramWorker {
            poll,
            socket,
            local_addr,
            rx,
            handle: handle.clone(),
            inner: Arc::downgrade(&self.inner),
            sessions: HashMap::new(),
            blocked: Vec::new(),
            idle: IndexedIdleTracker::new(),
            write_interest: false,
        };
        std::thread::Builder::new()
            .name("seine-udp".to_string())
            .spawn(move || worker.run())
            .map_err(bind_error)?;

        info!(%local_addr, "udp server bound");
        *bound = Some(BoundState {
            addr: local_addr,
            handle,
        });
        drop(bound);
        let service: &dyn IoService = self.inner.as_ref();
        self.inner.core.fire_service_activated(service);
        Ok(local_addr)
    }

    /// 解除绑定：循环线程退出，全部会话走关闭流程。
    pub fn unbind(&self) -> Result<(), SeineError> {
        let Some(bound) = self.inner.bound.lock().take() else {
            return Err(SeineError::state(
                "seine.udp.not_bound",
                "server is not bound",
            ));
        };
        info!(addr = %bound.addr, "udp server unbinding");
        bound.handle.enqueue_shutdown();
        let service: &dyn IoService = self.inner.as_ref();
        self.inner.core.fire_service_inactivated(service);
        Ok(())
    }

    /// 当前绑定地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().as_ref().map(|bound| bound.addr)
    }

    /// 受管会话数量。
    pub fn session_count(&self) -> usize {
        self.inner.core.session_count()
    }

    /// 受管会话快照。
    pub fn managed_sessions(&self) -> Vec<Arc<dyn IoSession>> {
        self.inner.core.managed_sessions()
    }
}

fn bind_error(err: io::Error) -> SeineError {
    SeineError::new(
        "seine.udp.bind_failed",
        ErrorKind::Transport,
        format!("udp bind: {err}"),
    )
    .with_cause(err)
}

impl IoService for UdpServerInner {
    fn chain_template(&self) -> Arc<FilterChain> {
        self.core.chain_template()
    }

    fn session_count(&self) -> usize {
        self.core.session_count()
    }

    fn find_session(&self, id: u64) -> Option<Arc<dyn IoSession>> {
        self.core.find_session(id)
    }

    fn managed_sessions(&self) -> Vec<Arc<dyn IoSession>> {
        self.core.managed_sessions()
    }
}

struct DatagramWorker {
    poll: Poll,
    socket: UdpSocket,
    local_addr: SocketAddr,
    rx: Receiver<LoopIntent>,
    handle: DatagramLoopHandle,
    inner: Weak<UdpServerInner>,
    sessions: HashMap<SocketAddr, Arc<UdpSession>>,
    /// 因 `WouldBlock` 悬置的会话，待可写事件重试。
    blocked: Vec<Arc<UdpSession>>,
    idle: IndexedIdleTracker,
    write_interest: bool,
}

impl DatagramWorker {
    fn run(mut self) {
        debug!("datagram worker started");
        let mut events = Events::with_capacity(256);
        let mut scratch = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if !self.process_intents() {
                break;
            }
            if let Err(err) = self.poll.poll(&mut events, Some(SELECT_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("datagram poll failed, retrying: {err}");
            }
            let mut readable = false;
            let mut writable = false;
            for event in events.iter() {
                if event.token() == SOCKET_TOKEN {
                    readable |= event.is_readable();
                    writable |= event.is_writable();
                }
            }
            if readable {
                self.read_ready(&mut scratch);
            }
            if writable {
                self.retry_blocked();
            }
            self.idle.process_idle(clock::now_millis());
        }
        self.shutdown();
    }

    /// 排空意向队列；收到 Shutdown 时返回 `false`。
    fn process_intents(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(LoopIntent::Flush(session)) => self.flush_session(&session),
                Ok(LoopIntent::Close {
                    session,
                    immediately,
                }) => self.close_session(&session, immediately),
                Ok(LoopIntent::Shutdown) => return false,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn read_ready(&mut self, scratch: &mut [u8]) {
        loop {
            match self.socket.recv_from(scratch) {
                Ok((count, peer_addr)) => {
                    let session = match self.session_for(peer_addr) {
                        Some(session) => session,
                        None => continue,
                    };
                    if session.is_read_suspended() {
                        continue;
                    }
                    let now = clock::now_millis();
                    session.core().stats().record_read(count as u64, now);
                    let dyn_session = session.as_dyn();
                    self.idle.session_read(&dyn_session, now);
                    FilterChain::dispatch_message_received(
                        session.core().filter_chain(),
                        &dyn_session,
                        ChainMessage::Buffer(CompositeBuf::copy_from_slice(&scratch[..count])),
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!("udp recv failed: {err}");
                    break;
                }
            }
        }
    }

    /// 查找或创建对端会话。
    fn session_for(&mut self, peer_addr: SocketAddr) -> Option<Arc<UdpSession>> {
        if let Some(session) = self.sessions.get(&peer_addr) {
            return Some(Arc::clone(session));
        }
        let inner = self.inner.upgrade()?;
        let dyn_service: Arc<dyn IoService> = Arc::clone(&inner) as Arc<dyn IoService>;
        let session = UdpSession::create(
            self.local_addr,
            peer_addr,
            self.handle.clone(),
            Arc::downgrade(&dyn_service),
            inner.core.chain_template(),
            Arc::clone(&inner.session_config),
        );
        if let Err(err) = session
            .core()
            .state_cell()
            .transition(SessionState::Connected)
        {
            error!("fresh udp session refused Connected: {err}");
            return None;
        }
        debug!(session_id = session.core().id(), %peer_addr, "udp session created");
        let dyn_session = session.as_dyn();
        session
            .core()
            .filter_chain()
            .process_session_created(&dyn_session);
        inner.core.register_session(Arc::clone(&dyn_session));
        session
            .core()
            .filter_chain()
            .process_session_opened(&dyn_session);
        let now = clock::now_millis();
        self.idle.session_read(&dyn_session, now);
        self.idle.session_written(&dyn_session, now);
        self.sessions.insert(peer_addr, Arc::clone(&session));
        Some(session)
    }

    /// 逐请求发送：一个写请求对应一个数据报。
    fn flush_session(&mut self, session: &Arc<UdpSession>) {
        if session.is_write_suspended() {
            return;
        }
        let queue = session.core().write_queue();
        loop {
            let Some(request) = queue.pop_front() else {
                queue.clear_flush_claim();
                if !queue.is_empty() {
                    queue.try_claim_flush();
                    continue;
                }
                break;
            };
            let datagram = request.payload().to_vec();
            match self.socket.send_to(&datagram, session.peer_addr()) {
                Ok(_) => {
                    let now = clock::now_millis();
                    session
                        .core()
                        .stats()
                        .record_written(datagram.len() as u64, now);
                    let dyn_session = session.as_dyn();
                    self.idle.session_written(&dyn_session, now);
                    request.complete_written();
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    queue.push_front(request);
                    self.block_session(session);
                    return;
                }
                Err(err) => {
                    warn!(
                        session_id = session.core().id(),
                        "udp send failed, dropping datagram: {err}"
                    );
                    request.fail(
                        SeineError::new(
                            "seine.udp.send_failed",
                            ErrorKind::Transport,
                            format!("udp send: {err}"),
                        )
                        .with_cause(err),
                    );
                }
            }
        }
        self.maybe_clear_write_interest();
        // 优雅关闭挂起在本会话上：队列见底即收尾。
        if session.close_after_flush() && session.core().write_queue().is_empty() {
            self.finish_close_session(session);
        }
    }

    fn block_session(&mut self, session: &Arc<UdpSession>) {
        if !self
            .blocked
            .iter()
            .any(|candidate| candidate.core().id() == session.core().id())
        {
            self.blocked.push(Arc::clone(session));
        }
        if !self.write_interest {
            self.write_interest = true;
            if let Err(err) = self.poll.registry().reregister(
                &mut self.socket,
                SOCKET_TOKEN,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                error!("udp write interest install failed: {err}");
            }
        }
    }

    fn retry_blocked(&mut self) {
        let retry: Vec<Arc<UdpSession>> = self.blocked.drain(..).collect();
        for session in retry {
            self.flush_session(&session);
        }
        self.maybe_clear_write_interest();
    }

    fn maybe_clear_write_interest(&mut self) {
        if self.write_interest && self.blocked.is_empty() {
            self.write_interest = false;
            if let Err(err) =
                self.poll
                    .registry()
                    .reregister(&mut self.socket, SOCKET_TOKEN, Interest::READABLE)
            {
                error!("udp write interest clear failed: {err}");
            }
        }
    }

    /// 关闭入口：优雅关闭先经 `send_to` 排空队列，排不空（套接字阻塞
    /// 或写方向暂停）则挂起到排空完成；立即关闭直接收尾。
    fn close_session(&mut self, session: &Arc<UdpSession>, immediately: bool) {
        if !immediately && !session.core().write_queue().is_empty() {
            self.flush_session(session);
            if !session.core().write_queue().is_empty() {
                session.set_close_after_flush();
                return;
            }
            // flush 尾部的收尾钩子只在挂起标志置位后生效；此处队列
            // 已排空且标志未置位，仍须显式收尾。
        }
        self.finish_close_session(session);
    }

    /// 会话收尾：失败残余请求、回放 closed、脱离注册表。幂等。
    fn finish_close_session(&mut self, session: &Arc<UdpSession>) {
        let peer = session.peer_addr();
        if self.sessions.remove(&peer).is_none() {
            return;
        }
        self.blocked
            .retain(|candidate| candidate.core().id() != session.core().id());
        let cell = session.core().state_cell();
        let _ = cell.transition(SessionState::Closing);
        let _ = cell.transition(SessionState::Closed);
        for request in session.core().write_queue().drain_all() {
            request.fail(SeineError::state(
                core_codes::SESSION_CLOSED,
                "session closed before the datagram was sent",
            ));
        }
        self.idle.session_closed(session.core().id());
        let dyn_session = session.as_dyn();
        session
            .core()
            .filter_chain()
            .process_session_closed(&dyn_session);
        if let Some(inner) = self.inner.upgrade() {
            inner.core.unregister_session(session.core().id());
        }
        session.core().close_future().try_complete(());
        debug!(session_id = session.core().id(), "udp session closed");
    }

    /// 解绑收尾：尽力排空每个会话的队列后关闭全部会话，退出线程。
    fn shutdown(&mut self) {
        let sessions: Vec<Arc<UdpSession>> = self.sessions.values().cloned().collect();
        for session in sessions {
            self.flush_session(&session);
            self.finish_close_session(&session);
        }
        debug!("datagram worker exited");
    }
}
