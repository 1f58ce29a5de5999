use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};

use mio::net::{TcpListener, TcpStream};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, error, info};

use seine_core::chain::{FilterChain, IoFilter};
use seine_core::handler::IoHandler;
use seine_core::service::{IoService, IoServiceListener, ServiceCore, SessionConfig, TcpConfig};
use seine_core::session::IoSession;
use seine_core::SeineError;
use seine_tls::TlsHelper;

use crate::error::{self, map_io_error};
use crate::selector::{AcceptTarget, SelectorLoop, ServerRegistration, SessionIntent};
use crate::session::TcpSession;
use crate::strategy::{RoundRobinStrategy, SelectorStrategy};

/// 监听端积压队列长度。
const LISTEN_BACKLOG: i32 = 1024;

struct BoundServer {
    registration: Arc<ServerRegistration>,
    addr: SocketAddr,
}

pub(crate) struct TcpServerInner {
    core: Arc<ServiceCore>,
    config: TcpConfig,
    session_config: Arc<SessionConfig>,
    accept_loop: SelectorLoop,
    rw_loops: Vec<SelectorLoop>,
    strategy: Arc<dyn SelectorStrategy>,
    tls: Mutex<Option<Arc<rustls::ServerConfig>>>,
    bound: Mutex<Option<BoundServer>>,
    this: OnceLock<Weak<TcpServerInner>>,
}

/// 非阻塞 TCP 服务端。
///
/// # 体系定位（Why）
/// - accept 与读写分离：接受循环只处理监听套接字的可读事件，新会话
///   经选择器策略分派到读写循环；二者也可以共用同一条循环；
/// - 处理器、过滤器与 TLS 配置是服务级模板，会话在创建时快照。
///
/// # 契约说明（What）
/// - `bind` 在调用线程同步完成监听套接字创建与绑定（端口随之确定），
///   注册以意向形式投递给接受循环；
/// - `unbind` 投递移除意向，服务不再产生新会话，既有会话不受影响；
/// - 配置修改（处理器、过滤器、TLS）只影响其后接受的会话。
pub struct TcpServer {
    inner: Arc<TcpServerInner>,
}

impl TcpServer {
    /// 以独享的接受循环与单条读写循环创建服务端。
    pub fn new(config: TcpConfig) -> Result<Self, SeineError> {
        let accept_loop = SelectorLoop::new()?;
        let rw_loop = SelectorLoop::new()?;
        Ok(Self::with_loops(
            config,
            accept_loop,
            vec![rw_loop],
            Arc::new(RoundRobinStrategy::new()),
        ))
    }

    /// 以外部循环与策略创建服务端；`rw_loops` 非空。
    pub fn with_loops(
        config: TcpConfig,
        accept_loop: SelectorLoop,
        rw_loops: Vec<SelectorLoop>,
        strategy: Arc<dyn SelectorStrategy>,
    ) -> Self {
        assert!(!rw_loops.is_empty(), "at least one read/write loop required");
        let session_config = Arc::new(config.session().clone());
        let inner = Arc::new(TcpServerInner {
            core: Arc::new(ServiceCore::new()),
            config,
            session_config,
            accept_loop,
            rw_loops,
            strategy,
            tls: Mutex::new(None),
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

    /// 设置过滤器序列；链序即入站顺序。
    pub fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>) {
        self.inner.core.set_filters(filters);
    }

    /// 注册服务监听器。
    pub fn add_listener(&self, listener: Arc<dyn IoServiceListener>) {
        self.inner.core.add_listener(listener);
    }

    /// 启用 TLS：其后接受的会话在明文链与套接字之间加入加密层。
    pub fn set_tls(&self, config: Option<Arc<rustls::ServerConfig>>) {
        *self.inner.tls.lock() = config;
    }

    /// 绑定监听地址，返回实际绑定地址（含内核分配的端口）。
    pub fn bind(&self, addr: SocketAddr) -> Result<SocketAddr, SeineError> {
        let mut bound = self.inner.bound.lock();
        if let Some(existing) = bound.as_ref() {
            return Err(SeineError::state(
                "seine.tcp.already_bound",
                format!("server already bound to {}", existing.addr),
            ));
        }

        let (listener, local_addr) = self.inner.build_listener(addr)?;
        info!(%local_addr, "binding tcp server");

        let registration = ServerRegistration::new();
        self.inner.accept_loop.enqueue_add_server(
            listener,
            Arc::clone(&registration),
            Arc::clone(&self.inner) as Arc<dyn AcceptTarget>,
        );
        *bound = Some(BoundServer {
            registration,
            addr: local_addr,
        });
        drop(bound);

        let service: &dyn IoService = self.inner.as_ref();
        self.inner.core.fire_service_activated(service);
        Ok(local_addr)
    }

    /// 解除绑定；既有会话不受影响。
    pub fn unbind(&self) -> Result<(), SeineError> {
        let Some(bound) = self.inner.bound.lock().take() else {
            return Err(SeineError::state(
                "seine.tcp.not_bound",
                "server is not bound",
            ));
        };
        info!(addr = %bound.addr, "unbinding tcp server");
        self.inner
            .accept_loop
            .enqueue_remove_server(bound.registration);
        let service: &dyn IoService = self.inner.as_ref();
        self.inner.core.fire_service_inactivated(service);
        Ok(())
    }

    /// 当前绑定地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.bound.lock().as_ref().map(|bound| bound.addr)
    }

    /// 以服务视角访问（注册表查询等）。
    pub fn service(&self) -> Arc<dyn IoService> {
        Arc::clone(&self.inner) as Arc<dyn IoService>
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

impl TcpServerInner {
    /// 创建监听套接字：reuse_address 缺省开启，其余选项按配置落地。
    fn build_listener(&self, addr: SocketAddr) -> Result<(TcpListener, SocketAddr), SeineError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .set_reuse_address(self.config.reuse_address().unwrap_or(true))
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        socket
            .bind(&addr.into())
            .map_err(|err| map_io_error(error::BIND, err))?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|err| map_io_error(error::BIND, err))?;
        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        Ok((TcpListener::from_std(std_listener), local_addr))
    }

    /// 把服务级套接字配置落到新会话的套接字上。
    fn apply_stream_options(&self, stream: &TcpStream) -> io::Result<()> {
        let sock = SockRef::from(stream);
        if let Some(keep_alive) = self.config.keep_alive() {
            sock.set_keepalive(keep_alive)?;
        }
        if let Some(no_delay) = self.config.tcp_no_delay() {
            sock.set_nodelay(no_delay)?;
        }
        if let Some(size) = self.config.send_buffer_size() {
            sock.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.receive_buffer_size() {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(tos) = self.config.traffic_class() {
            sock.set_tos(tos)?;
        }
        if let Some(linger) = self.config.linger() {
            sock.set_linger(Some(linger))?;
        }
        if let Some(oob_inline) = self.config.oob_inline() {
            sock.set_out_of_band_inline(oob_inline)?;
        }
        Ok(())
    }

    /// 为接受的连接创建会话：链/配置快照、TLS 装配、事件与注册表登记。
    fn create_session(&self, stream: TcpStream, peer_addr: SocketAddr) {
        debug!(%peer_addr, "accepted new client");
        if let Err(err) = self.apply_stream_options(&stream) {
            error!(%peer_addr, "socket option apply failed, dropping connection: {err}");
            return;
        }
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!(%peer_addr, "cannot resolve the local address: {err}");
                return;
            }
        };

        let tls = {
            let config = self.tls.lock().clone();
            match config {
                Some(config) => match TlsHelper::server(config) {
                    Ok(helper) => Some(helper),
                    Err(err) => {
                        error!(%peer_addr, "tls engine init failed, dropping connection: {err}");
                        return;
                    }
                },
                None => None,
            }
        };

        let chain: Arc<FilterChain> = self.core.chain_template();
        let target = self.strategy.next_loop(&self.rw_loops).clone();
        let Some(strong) = self.this.get().and_then(Weak::upgrade) else {
            return;
        };
        let dyn_self: Arc<dyn IoService> = strong;
        let service: Weak<dyn IoService> = Arc::downgrade(&dyn_self);

        let session = TcpSession::create(
            stream,
            local_addr,
            peer_addr,
            target.clone(),
            service,
            Arc::downgrade(&self.core),
            chain,
            Arc::clone(&self.session_config),
            tls,
            false,
        );

        let dyn_session = session.as_dyn();
        session
            .core()
            .filter_chain()
            .process_session_created(&dyn_session);
        self.core.register_session(dyn_session);

        target.enqueue_register(SessionIntent::Accepted(session));
    }
}

impl AcceptTarget for TcpServerInner {
    fn accept_ready(&self, listener: &mut TcpListener) {
        let Some(this) = self.this.get().and_then(Weak::upgrade) else {
            return;
        };
        // 边沿触发：必须把本轮可接受的连接全部取尽。
        loop {
            match listener.accept() {
                Ok((stream, peer_addr)) => this.create_session(stream, peer_addr),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    let err = map_io_error(error::ACCEPT, err);
                    error!(code = err.code(), "error while accepting a new client: {err}");
                    break;
                }
            }
        }
    }
}

impl IoService for TcpServerInner {
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
