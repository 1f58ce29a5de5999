use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use seine_core::clock;
use seine_core::error::codes as core_codes;
use seine_core::session::{ConnectFuture, IoSession, SessionState};
use seine_core::{IndexedIdleTracker, SeineError};

use crate::error::{self, map_io_error};
use crate::session::{ConnectCheck, DrainOutcome, TcpSession};

/// 唤醒器令牌；会话与服务器令牌自 1 起分配。
const WAKER_TOKEN: Token = Token(0);

/// 选择超时上界：保证空闲 tick 每秒有机会触发。
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// 循环共享读缓冲大小（64 KiB）。
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// 事件容器容量。
const EVENTS_CAPACITY: usize = 1024;

/// 服务器在选择器上的注册句柄；令牌由循环线程回填。
pub(crate) struct ServerRegistration {
    token: AtomicUsize,
}

impl ServerRegistration {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            token: AtomicUsize::new(0),
        })
    }
}

/// 接受就绪的回调目标：服务器在此完成 accept 与会话创建。
pub(crate) trait AcceptTarget: Send + Sync + 'static {
    fn accept_ready(&self, listener: &mut TcpListener);
}

/// 注册意向：接受的会话直接登记读兴趣，连接中的会话等待可写确认。
pub(crate) enum SessionIntent {
    Accepted(Arc<TcpSession>),
    Connecting {
        session: Arc<TcpSession>,
        future: ConnectFuture,
        deadline_ms: u64,
    },
}

struct ServerIntent {
    listener: TcpListener,
    registration: Arc<ServerRegistration>,
    acceptor: Arc<dyn AcceptTarget>,
}

struct CloseIntent {
    session: Arc<TcpSession>,
    immediately: bool,
}

struct PendingConnect {
    future: ConnectFuture,
    deadline_ms: u64,
}

struct ServerEntry {
    listener: TcpListener,
    registration: Arc<ServerRegistration>,
    acceptor: Arc<dyn AcceptTarget>,
}

/// 选择器循环：一条专用线程驱动多条非阻塞通道。
///
/// # 设计背景（Why）
/// - 每条循环独占一个就绪多路复用器；跨线程的注册、关闭、冲刷意向
///   经由多生产者队列投递并唤醒循环，多路复用器只被循环线程触碰；
/// - 工作线程按需惰性创建，注册清零后自行收摊，下一个意向再把它
///   拉起来。
///
/// # 主循环（How）
/// 每轮依次：排空服务器移除队列 → 服务器新增队列 → 会话注册队列 →
/// 会话关闭队列 → 以 1 秒上界阻塞选择 → 按就绪位派发
/// （接受/读/写/异常）→ 排空冲刷队列（装写兴趣，按会话合并）→
/// 空闲检测 tick → 建连期限清扫 → 注册清零则收摊退出。
///
/// # 错误策略（What）
/// - 会话上的 I/O 错误关闭该会话；多路复用器自身的错误记日志后在
///   下一轮重试；过滤器异常由链路派发器捕获，绝不终止循环。
#[derive(Clone)]
pub struct SelectorLoop {
    shared: Arc<LoopShared>,
}

struct LoopShared {
    waker: Waker,
    add_server_tx: Sender<ServerIntent>,
    remove_server_tx: Sender<Arc<ServerRegistration>>,
    register_tx: Sender<SessionIntent>,
    close_tx: Sender<CloseIntent>,
    flush_tx: Sender<Arc<TcpSession>>,
    /// 尚未被循环消化的意向数；与注册数共同决定收摊时机。
    pending: AtomicUsize,
    /// `Some` 表示循环处于收摊状态（线程未运行，状态寄存于此）。
    parked: Mutex<Option<Box<WorkerState>>>,
}

struct WorkerState {
    poll: Poll,
    events: Events,
    scratch: Vec<u8>,
    add_server_rx: Receiver<ServerIntent>,
    remove_server_rx: Receiver<Arc<ServerRegistration>>,
    register_rx: Receiver<SessionIntent>,
    close_rx: Receiver<CloseIntent>,
    flush_rx: Receiver<Arc<TcpSession>>,
    servers: HashMap<usize, ServerEntry>,
    sessions: HashMap<usize, Arc<TcpSession>>,
    connects: HashMap<usize, PendingConnect>,
    idle: IndexedIdleTracker,
    next_token: usize,
}

impl SelectorLoop {
    /// 创建循环；工作线程在首个意向到达时才启动。
    pub fn new() -> Result<Self, SeineError> {
        let poll = Poll::new().map_err(|err| map_io_error(error::SELECTOR, err))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|err| map_io_error(error::SELECTOR, err))?;
        let (add_server_tx, add_server_rx) = mpsc::channel();
        let (remove_server_tx, remove_server_rx) = mpsc::channel();
        let (register_tx, register_rx) = mpsc::channel();
        let (close_tx, close_rx) = mpsc::channel();
        let (flush_tx, flush_rx) = mpsc::channel();

        let state = Box::new(WorkerState {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            scratch: vec![0u8; READ_BUFFER_SIZE],
            add_server_rx,
            remove_server_rx,
            register_rx,
            close_rx,
            flush_rx,
            servers: HashMap::new(),
            sessions: HashMap::new(),
            connects: HashMap::new(),
            idle: IndexedIdleTracker::new(),
            next_token: 1,
        });

        Ok(Self {
            shared: Arc::new(LoopShared {
                waker,
                add_server_tx,
                remove_server_tx,
                register_tx,
                close_tx,
                flush_tx,
                pending: AtomicUsize::new(0),
                parked: Mutex::new(Some(state)),
            }),
        })
    }

    pub(crate) fn enqueue_add_server(
        &self,
        listener: TcpListener,
        registration: Arc<ServerRegistration>,
        acceptor: Arc<dyn AcceptTarget>,
    ) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.add_server_tx.send(ServerIntent {
            listener,
            registration,
            acceptor,
        });
        self.kick();
    }

    pub(crate) fn enqueue_remove_server(&self, registration: Arc<ServerRegistration>) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.remove_server_tx.send(registration);
        self.kick();
    }

    pub(crate) fn enqueue_register(&self, intent: SessionIntent) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.register_tx.send(intent);
        self.kick();
    }

    pub(crate) fn enqueue_close(&self, session: Arc<TcpSession>, immediately: bool) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.close_tx.send(CloseIntent {
            session,
            immediately,
        });
        self.kick();
    }

    pub(crate) fn enqueue_flush(&self, session: Arc<TcpSession>) {
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        let _ = self.shared.flush_tx.send(session);
        self.kick();
    }

    /// 唤醒循环；线程未运行时把它拉起来。
    fn kick(&self) {
        {
            let mut parked = self.shared.parked.lock();
            if let Some(state) = parked.take() {
                let shared = Arc::clone(&self.shared);
                std::thread::Builder::new()
                    .name("seine-selector".to_string())
                    .spawn(move || run_worker(shared, state))
                    .expect("selector worker thread could not be spawned");
            }
        }
        if let Err(err) = self.shared.waker.wake() {
            warn!("selector wakeup failed: {err}");
        }
    }
}

/// 工作线程主体。
fn run_worker(shared: Arc<LoopShared>, mut state: Box<WorkerState>) {
    debug!("selector worker started");
    loop {
        state.process_remove_servers(&shared);
        state.process_add_servers(&shared);
        state.process_register_sessions(&shared);
        state.process_close_sessions(&shared);

        if let Err(err) = state.poll_once() {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // 多路复用器自身的故障：记日志并在下一轮重试。
            error!("selector poll failed, retrying: {err}");
        }
        state.dispatch_ready();

        state.process_flush_sessions(&shared);

        let now = clock::now_millis();
        state.idle.process_idle(now);
        state.sweep_connect_deadlines(now);

        if state.registration_count() == 0 {
            let mut parked = shared.parked.lock();
            if shared.pending.load(Ordering::Acquire) == 0 {
                debug!("selector worker parking: no registrations remain");
                *parked = Some(state);
                return;
            }
        }
    }
}

impl WorkerState {
    fn registration_count(&self) -> usize {
        self.sessions.len() + self.servers.len()
    }

    fn alloc_token(&mut self) -> usize {
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1).max(1);
        token
    }

    fn poll_once(&mut self) -> io::Result<()> {
        trace!("selecting...");
        match self.poll.poll(&mut self.events, Some(SELECT_TIMEOUT)) {
            Ok(()) => Ok(()),
            Err(err) => {
                // 失败轮不派发残留事件。
                self.events.clear();
                Err(err)
            }
        }
    }

    fn consume<T>(rx: &Receiver<T>, shared: &LoopShared) -> Option<T> {
        match rx.try_recv() {
            Ok(intent) => {
                shared.pending.fetch_sub(1, Ordering::AcqRel);
                Some(intent)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn process_add_servers(&mut self, shared: &LoopShared) {
        while let Some(intent) = Self::consume(&self.add_server_rx, shared) {
            let ServerIntent {
                mut listener,
                registration,
                acceptor,
            } = intent;
            let token = self.alloc_token();
            if let Err(err) =
                self.poll
                    .registry()
                    .register(&mut listener, Token(token), Interest::READABLE)
            {
                error!("failed to register a server for accept: {err}");
                continue;
            }
            registration.token.store(token, Ordering::Release);
            debug!(token, "server registered for accept");
            self.servers.insert(
                token,
                ServerEntry {
                    listener,
                    registration,
                    acceptor,
                },
            );
        }
    }

    fn process_remove_servers(&mut self, shared: &LoopShared) {
        while let Some(registration) = Self::consume(&self.remove_server_rx, shared) {
            let token = registration.token.load(Ordering::Acquire);
            match self.servers.remove(&token) {
                Some(mut entry) => {
                    let _ = self.poll.registry().deregister(&mut entry.listener);
                    debug!(token, "server removed from the selector");
                }
                None => warn!(token, "remove requested for an unknown server"),
            }
        }
    }

    fn process_register_sessions(&mut self, shared: &LoopShared) {
        while let Some(intent) = Self::consume(&self.register_rx, shared) {
            match intent {
                SessionIntent::Accepted(session) => {
                    let token = self.alloc_token();
                    session.set_token(token);
                    self.sessions.insert(token, Arc::clone(&session));
                    self.activate_session(&session, None);
                }
                SessionIntent::Connecting {
                    session,
                    future,
                    deadline_ms,
                } => {
                    let token = self.alloc_token();
                    session.set_token(token);
                    self.sessions.insert(token, Arc::clone(&session));
                    self.connects
                        .insert(token, PendingConnect { future, deadline_ms });
                    self.update_interest(&session);
                }
            }
        }
    }

    fn process_close_sessions(&mut self, shared: &LoopShared) {
        while let Some(intent) = Self::consume(&self.close_rx, shared) {
            let session = intent.session;
            if !intent.immediately && !session.core().write_queue().is_empty() {
                // 优雅关闭：排空写队列后再收尾。
                session.set_close_after_flush();
                self.update_interest(&session);
                continue;
            }
            self.finish_close(&session);
        }
    }

    fn process_flush_sessions(&mut self, shared: &LoopShared) {
        while let Some(session) = Self::consume(&self.flush_rx, shared) {
            trace!(session_id = session.core().id(), "flush scheduled");
            self.update_interest(&session);
        }
    }

    /// 新会话（接受侧或建连完成侧）进入工作状态。
    fn activate_session(&mut self, session: &Arc<TcpSession>, connect: Option<ConnectFuture>) {
        let dyn_session = session.as_dyn();
        let now = clock::now_millis();

        if session.has_tls() {
            // TLS 会话：Created → Securing，opened 推迟到握手完成。
            if let Err(err) = session
                .core()
                .state_cell()
                .transition(SessionState::Securing)
            {
                error!(
                    session_id = session.core().id(),
                    "cannot start securing: {err}"
                );
                if let Some(future) = connect {
                    future.try_fail(err);
                }
                self.finish_close(session);
                return;
            }
            if session.is_client_side() {
                if let Err(err) = session.start_client_handshake() {
                    error!(
                        session_id = session.core().id(),
                        "client handshake start failed: {err}"
                    );
                    if let Some(future) = connect {
                        future.try_fail(err);
                    }
                    self.finish_close(session);
                    return;
                }
            }
        } else {
            if let Err(err) = session
                .core()
                .state_cell()
                .transition(SessionState::Connected)
            {
                error!(
                    session_id = session.core().id(),
                    "cannot mark session connected: {err}"
                );
                if let Some(future) = connect {
                    future.try_fail(err);
                }
                self.finish_close(session);
                return;
            }
            session.mark_opened();
        }

        // 以激活时刻为基准建立两个方向的空闲跟踪。
        self.idle.session_read(&dyn_session, now);
        self.idle.session_written(&dyn_session, now);

        if let Some(future) = connect {
            future.try_complete(Arc::clone(&dyn_session));
        }
        self.update_interest(session);
    }

    /// 依据暂停标志与写队列占用重算注册兴趣。
    fn update_interest(&mut self, session: &Arc<TcpSession>) {
        let token = session.token();
        if !self.sessions.contains_key(&token) {
            return;
        }
        let wants_read = !session.is_read_suspended();
        let wants_write = self.connects.contains_key(&token)
            || (!session.core().write_queue().is_empty() && !session.is_write_suspended())
            || session.close_after_flush();
        let interest = match (wants_read, wants_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let mut stream = session.stream().lock();
        let outcome = match interest {
            Some(interest) => {
                if session.registered() {
                    self.poll
                        .registry()
                        .reregister(&mut *stream, Token(token), interest)
                } else {
                    session.set_registered(true);
                    self.poll
                        .registry()
                        .register(&mut *stream, Token(token), interest)
                }
            }
            None => {
                if session.registered() {
                    session.set_registered(false);
                    self.poll.registry().deregister(&mut *stream)
                } else {
                    Ok(())
                }
            }
        };
        drop(stream);
        if let Err(err) = outcome {
            let err = map_io_error(error::REGISTER, err);
            error!(
                session_id = session.core().id(),
                code = err.code(),
                "interest update failed, closing session: {err}"
            );
            self.finish_close(session);
        }
    }

    fn dispatch_ready(&mut self) {
        struct Ready {
            token: usize,
            readable: bool,
            writable: bool,
            faulted: bool,
        }
        let ready: Vec<Ready> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| Ready {
                token: event.token().0,
                readable: event.is_readable(),
                writable: event.is_writable(),
                faulted: event.is_error(),
            })
            .collect();

        for event in ready {
            if self.servers.contains_key(&event.token) {
                if event.readable {
                    self.accept_ready(event.token);
                }
                continue;
            }
            let Some(session) = self.sessions.get(&event.token).cloned() else {
                continue;
            };
            if event.writable {
                self.write_ready(&session);
            }
            if event.readable && self.sessions.contains_key(&event.token) {
                self.read_ready(&session);
            }
            if event.faulted && self.sessions.contains_key(&event.token) {
                warn!(
                    session_id = session.core().id(),
                    "socket error event, closing session"
                );
                self.fail_pending_connect(&session);
                self.finish_close(&session);
            }
        }
    }

    fn accept_ready(&mut self, token: usize) {
        let Some(entry) = self.servers.get_mut(&token) else {
            return;
        };
        let acceptor = Arc::clone(&entry.acceptor);
        acceptor.accept_ready(&mut entry.listener);
    }

    fn read_ready(&mut self, session: &Arc<TcpSession>) {
        if session.is_read_suspended() {
            return;
        }
        let mut eof = false;
        let mut failure: Option<io::Error> = None;
        loop {
            let outcome = {
                let mut stream = session.stream().lock();
                stream.read(&mut self.scratch)
            };
            match outcome {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(count) => {
                    let now = clock::now_millis();
                    session.core().stats().record_read(count as u64, now);
                    let dyn_session = session.as_dyn();
                    self.idle.session_read(&dyn_session, now);
                    if let Err(err) = session.process_read(&self.scratch[..count]) {
                        error!(
                            session_id = session.core().id(),
                            code = err.code(),
                            "inbound processing failed, closing session: {err}"
                        );
                        self.finish_close(session);
                        return;
                    }
                    if session.core().state() == SessionState::Closed {
                        return;
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            let err = map_io_error(error::READ, err);
            warn!(
                session_id = session.core().id(),
                code = err.code(),
                "read failed, closing session: {err}"
            );
            self.finish_close(session);
        } else if eof {
            debug!(session_id = session.core().id(), "peer closed the stream");
            self.finish_close(session);
        }
    }

    fn write_ready(&mut self, session: &Arc<TcpSession>) {
        let token = session.token();

        // 在途连接：可写事件意味着建连揭晓。
        if self.connects.contains_key(&token) {
            match session.check_connect() {
                ConnectCheck::Connected => {
                    let pending = self.connects.remove(&token).expect("pending connect exists");
                    debug!(session_id = session.core().id(), "outbound connect established");
                    self.activate_session(session, Some(pending.future));
                }
                ConnectCheck::Pending => {}
                ConnectCheck::Failed(err) => {
                    let pending = self.connects.remove(&token).expect("pending connect exists");
                    pending
                        .future
                        .try_fail(map_io_error(error::CONNECT, err));
                    self.finish_close(session);
                }
            }
            return;
        }

        if session.is_write_suspended() {
            return;
        }

        match session.drain_once() {
            DrainOutcome::Drained { wrote_any } => {
                if wrote_any {
                    let now = clock::now_millis();
                    let dyn_session = session.as_dyn();
                    self.idle.session_written(&dyn_session, now);
                }
                let queue = session.core().write_queue();
                queue.clear_flush_claim();
                if queue.is_empty() {
                    if session.close_after_flush() {
                        debug!(
                            session_id = session.core().id(),
                            "write queue drained, completing graceful close"
                        );
                        self.finish_close(session);
                        return;
                    }
                    self.update_interest(session);
                } else {
                    // 清旗与复检之间又有新请求：重新认领，保持写兴趣。
                    queue.try_claim_flush();
                    self.update_interest(session);
                }
            }
            DrainOutcome::Blocked { wrote_any } => {
                if wrote_any {
                    let now = clock::now_millis();
                    let dyn_session = session.as_dyn();
                    self.idle.session_written(&dyn_session, now);
                }
                self.update_interest(session);
            }
            DrainOutcome::Failed(err) => {
                let err = map_io_error(error::WRITE, err);
                warn!(
                    session_id = session.core().id(),
                    code = err.code(),
                    "write failed, closing session: {err}"
                );
                self.finish_close(session);
            }
        }
    }

    fn fail_pending_connect(&mut self, session: &Arc<TcpSession>) {
        if let Some(pending) = self.connects.remove(&session.token()) {
            pending.future.try_fail(map_io_error(
                error::CONNECT,
                io::Error::new(io::ErrorKind::ConnectionReset, "socket faulted"),
            ));
        }
    }

    /// 会话收尾：注销、关闭套接字、回放 closed、脱离服务注册表。
    ///
    /// 幂等：第二次进入（重复关闭意向、EOF 与用户关闭竞争）直接返回。
    fn finish_close(&mut self, session: &Arc<TcpSession>) {
        let token = session.token();
        if self.sessions.remove(&token).is_none() {
            return;
        }
        if let Some(pending) = self.connects.remove(&token) {
            pending.future.try_fail(SeineError::state(
                core_codes::SESSION_CLOSED,
                "session closed before the connect completed",
            ));
        }

        {
            let mut stream = session.stream().lock();
            if session.registered() {
                session.set_registered(false);
                let _ = self.poll.registry().deregister(&mut *stream);
            }
            // 关闭阶段的错误吞掉，只留日志。
            if let Err(err) = stream.shutdown(std::net::Shutdown::Both) {
                trace!(
                    session_id = session.core().id(),
                    "socket shutdown during close: {err}"
                );
            }
        }

        let cell = session.core().state_cell();
        let _ = cell.transition(SessionState::Closing);
        let _ = cell.transition(SessionState::Closed);

        for request in session.core().write_queue().drain_all() {
            request.fail(SeineError::state(
                core_codes::SESSION_CLOSED,
                "session closed before the payload was written",
            ));
        }
        session.core().write_queue().clear_flush_claim();

        self.idle.session_closed(session.core().id());

        let dyn_session = session.as_dyn();
        session
            .core()
            .filter_chain()
            .process_session_closed(&dyn_session);

        if let Some(registry) = session.registry() {
            registry.unregister_session(session.core().id());
        }

        session.core().close_future().try_complete(());
        debug!(session_id = session.core().id(), "session closed");
    }

    fn sweep_connect_deadlines(&mut self, now: u64) {
        if self.connects.is_empty() {
            return;
        }
        let expired: Vec<usize> = self
            .connects
            .iter()
            .filter(|(_, pending)| pending.deadline_ms <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            let Some(pending) = self.connects.remove(&token) else {
                continue;
            };
            let Some(session) = self.sessions.get(&token).cloned() else {
                continue;
            };
            warn!(
                session_id = session.core().id(),
                "connect deadline exceeded"
            );
            pending.future.try_fail(error::connect_timeout_error());
            self.finish_close(&session);
        }
    }
}
