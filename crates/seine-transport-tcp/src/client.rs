use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use mio::net::TcpStream;
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error};

use seine_core::chain::IoFilter;
use seine_core::clock;
use seine_core::future::IoFuture;
use seine_core::handler::IoHandler;
use seine_core::service::{IoService, IoServiceListener, ServiceCore, SessionConfig, TcpConfig};
use seine_core::session::{ConnectFuture, IoSession};
use seine_core::SeineError;
use seine_tls::TlsHelper;

use crate::error::{self, map_io_error};
use crate::selector::{SelectorLoop, SessionIntent};
use crate::session::TcpSession;

/// Linux `EINPROGRESS`：非阻塞连接已发起、尚未完成。
const EINPROGRESS: i32 = 115;

struct ClientTls {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

struct TcpClientInner {
    core: Arc<ServiceCore>,
    config: TcpConfig,
    session_config: Arc<SessionConfig>,
    io_loop: SelectorLoop,
    tls: Mutex<Option<ClientTls>>,
    this: std::sync::OnceLock<Weak<TcpClientInner>>,
}

/// 非阻塞 TCP 客户端。
///
/// # 契约说明（What）
/// - `connect` 立即返回连接 Future；建连在归属循环上以可写就绪揭晓，
///   期限由 [`SessionConfig::connect_timeout`] 约束，逾期 Future 以
///   超时错误失败；
/// - Future 的取消委托给客户端：接受取消后立即关闭在途会话；
/// - 处理器/过滤器/TLS 配置同样是模板，在 `connect` 时快照。
pub struct TcpClient {
    inner: Arc<TcpClientInner>,
}

impl TcpClient {
    /// 以独享循环创建客户端。
    pub fn new(config: TcpConfig) -> Result<Self, SeineError> {
        let io_loop = SelectorLoop::new()?;
        Ok(Self::with_loop(config, io_loop))
    }

    /// 复用外部循环创建客户端（与服务端共享循环的常见拓扑）。
    pub fn with_loop(config: TcpConfig, io_loop: SelectorLoop) -> Self {
        let session_config = Arc::new(config.session().clone());
        let inner = Arc::new(TcpClientInner {
            core: Arc::new(ServiceCore::new()),
            config,
            session_config,
            io_loop,
            tls: Mutex::new(None),
            this: std::sync::OnceLock::new(),
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

    /// 启用 TLS：其后建立的连接在握手完成前不投递 `session_opened`。
    pub fn set_tls(&self, config: Arc<rustls::ClientConfig>, server_name: ServerName<'static>) {
        *self.inner.tls.lock() = Some(ClientTls {
            config,
            server_name,
        });
    }

    /// 发起连接。
    pub fn connect(&self, remote: SocketAddr) -> ConnectFuture {
        self.connect_with_local(remote, None)
    }

    /// 发起连接并绑定指定本地地址。
    pub fn connect_with_local(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> ConnectFuture {
        let future: ConnectFuture = Arc::new(IoFuture::new());

        let stream = match self.inner.build_stream(remote, local) {
            Ok(stream) => stream,
            Err(err) => {
                error!(%remote, "connect setup failed: {err}");
                future.fail(err);
                return future;
            }
        };
        let local_addr = stream
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), 0));

        let tls = {
            let guard = self.inner.tls.lock();
            match guard.as_ref() {
                Some(tls) => {
                    match TlsHelper::client(Arc::clone(&tls.config), tls.server_name.clone()) {
                        Ok(helper) => Some(helper),
                        Err(err) => {
                            error!(%remote, "tls engine init failed: {err}");
                            future.fail(err);
                            return future;
                        }
                    }
                }
                None => None,
            }
        };

        let Some(strong) = self.inner.this.get().and_then(Weak::upgrade) else {
            future.fail(SeineError::state(
                "seine.tcp.client_gone",
                "client dropped during connect",
            ));
            return future;
        };
        let dyn_self: Arc<dyn IoService> = strong;
        let service: Weak<dyn IoService> = Arc::downgrade(&dyn_self);

        let session = TcpSession::create(
            stream,
            local_addr,
            remote,
            self.inner.io_loop.clone(),
            service,
            Arc::downgrade(&self.inner.core),
            self.inner.core.chain_template(),
            Arc::clone(&self.inner.session_config),
            tls,
            true,
        );

        let dyn_session = session.as_dyn();
        session
            .core()
            .filter_chain()
            .process_session_created(&dyn_session);
        self.inner.core.register_session(dyn_session);

        // 取消委托：接受取消即关闭在途会话，未决状态在循环里统一收尾。
        {
            let weak_session = Arc::downgrade(&session);
            future.set_canceller(move || {
                if let Some(session) = weak_session.upgrade() {
                    debug!(session_id = session.core().id(), "connect cancelled");
                    session.close(true);
                }
                true
            });
        }

        let deadline_ms = clock::now_millis()
            + self.inner.session_config.connect_timeout().as_millis() as u64;
        self.inner.io_loop.enqueue_register(SessionIntent::Connecting {
            session,
            future: Arc::clone(&future),
            deadline_ms,
        });
        future
    }

    /// 以服务视角访问（注册表查询等）。
    pub fn service(&self) -> Arc<dyn IoService> {
        Arc::clone(&self.inner) as Arc<dyn IoService>
    }

    /// 受管会话数量。
    pub fn session_count(&self) -> usize {
        self.inner.core.session_count()
    }
}

impl TcpClientInner {
    /// 建出处于连接中的非阻塞套接字，按配置落套接字选项。
    fn build_stream(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
    ) -> Result<TcpStream, SeineError> {
        let socket = Socket::new(Domain::for_address(remote), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        self.apply_socket_options(&socket)
            .map_err(|err| map_io_error(error::CONFIGURE, err))?;
        if let Some(local) = local {
            socket
                .bind(&local.into())
                .map_err(|err| map_io_error(error::CONNECT, err))?;
        }
        match socket.connect(&remote.into()) {
            Ok(()) => {}
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.raw_os_error() == Some(EINPROGRESS) => {}
            Err(err) => return Err(map_io_error(error::CONNECT, err)),
        }
        let std_stream: std::net::TcpStream = socket.into();
        Ok(TcpStream::from_std(std_stream))
    }

    fn apply_socket_options(&self, socket: &Socket) -> io::Result<()> {
        if let Some(keep_alive) = self.config.keep_alive() {
            socket.set_keepalive(keep_alive)?;
        }
        if let Some(no_delay) = self.config.tcp_no_delay() {
            socket.set_nodelay(no_delay)?;
        }
        if let Some(reuse) = self.config.reuse_address() {
            socket.set_reuse_address(reuse)?;
        }
        if let Some(size) = self.config.send_buffer_size() {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.config.receive_buffer_size() {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(tos) = self.config.traffic_class() {
            socket.set_tos(tos)?;
        }
        if let Some(linger) = self.config.linger() {
            socket.set_linger(Some(linger))?;
        }
        if let Some(oob_inline) = self.config.oob_inline() {
            socket.set_out_of_band_inline(oob_inline)?;
        }
        Ok(())
    }
}

impl IoService for TcpClientInner {
    fn chain_template(&self) -> Arc<seine_core::chain::FilterChain> {
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
