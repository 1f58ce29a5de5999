use std::time::Duration;

use crate::chain::IdleStatus;

/// 传输无关的会话配置。
///
/// # 契约说明（What）
/// - `read_idle_timeout` / `write_idle_timeout`：对应方向无活动超过该
///   时长后触发空闲事件，`None` 表示不检测；
/// - `connect_timeout`：客户端建连的期限，超过后连接 Future 以超时
///   错误失败。
///
/// # 逻辑解析（How）
/// - Builder 风格的 `with_*` 消费并返回自身，配置在服务构造期组装，
///   会话创建时以 `Arc` 快照共享，不支持会话期内修改。
#[derive(Clone, Debug)]
pub struct SessionConfig {
    read_idle_timeout: Option<Duration>,
    write_idle_timeout: Option<Duration>,
    connect_timeout: Duration,
}

impl SessionConfig {
    /// 创建默认配置：不检测空闲，建连期限 10 秒。
    pub fn new() -> Self {
        Self {
            read_idle_timeout: None,
            write_idle_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// 设置读空闲超时。
    pub fn with_read_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_idle_timeout = timeout;
        self
    }

    /// 设置写空闲超时。
    pub fn with_write_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_idle_timeout = timeout;
        self
    }

    /// 设置建连期限。
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// 按方向读取空闲超时。
    pub fn idle_timeout(&self, status: IdleStatus) -> Option<Duration> {
        match status {
            IdleStatus::ReadIdle => self.read_idle_timeout,
            IdleStatus::WriteIdle => self.write_idle_timeout,
        }
    }

    /// 建连期限。
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// TCP 套接字级配置，在接受/建连时经 `socket2` 落到内核。
///
/// # 设计背景（Why）
/// - 把平台相关的套接字选项显式配置化，调用方不直接操作 `socket2`
///   或平台常量；
/// - `Option` 字段表示“沿用内核默认”，只有显式设置的选项才会写入。
#[derive(Clone, Debug, Default)]
pub struct TcpConfig {
    session: SessionConfig,
    keep_alive: Option<bool>,
    reuse_address: Option<bool>,
    tcp_no_delay: Option<bool>,
    send_buffer_size: Option<usize>,
    receive_buffer_size: Option<usize>,
    traffic_class: Option<u32>,
    linger: Option<Duration>,
    oob_inline: Option<bool>,
}

impl TcpConfig {
    /// 创建全默认配置。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以既有会话配置为基础构造。
    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// 设置 `SO_KEEPALIVE`。
    pub fn with_keep_alive(mut self, keep_alive: Option<bool>) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// 设置 `SO_REUSEADDR`。
    pub fn with_reuse_address(mut self, reuse_address: Option<bool>) -> Self {
        self.reuse_address = reuse_address;
        self
    }

    /// 设置 `TCP_NODELAY`。
    pub fn with_tcp_no_delay(mut self, no_delay: Option<bool>) -> Self {
        self.tcp_no_delay = no_delay;
        self
    }

    /// 设置发送缓冲区大小。
    pub fn with_send_buffer_size(mut self, size: Option<usize>) -> Self {
        self.send_buffer_size = size;
        self
    }

    /// 设置接收缓冲区大小。
    pub fn with_receive_buffer_size(mut self, size: Option<usize>) -> Self {
        self.receive_buffer_size = size;
        self
    }

    /// 设置 IP 服务类型字段（TOS）。
    pub fn with_traffic_class(mut self, traffic_class: Option<u32>) -> Self {
        self.traffic_class = traffic_class;
        self
    }

    /// 设置 `SO_LINGER` 超时时长。
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// 设置带外数据内联（`SO_OOBINLINE`）。
    pub fn with_oob_inline(mut self, oob_inline: Option<bool>) -> Self {
        self.oob_inline = oob_inline;
        self
    }

    /// 会话层配置。
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    /// `SO_KEEPALIVE` 配置值。
    pub fn keep_alive(&self) -> Option<bool> {
        self.keep_alive
    }

    /// `SO_REUSEADDR` 配置值。
    pub fn reuse_address(&self) -> Option<bool> {
        self.reuse_address
    }

    /// `TCP_NODELAY` 配置值。
    pub fn tcp_no_delay(&self) -> Option<bool> {
        self.tcp_no_delay
    }

    /// 发送缓冲区配置值。
    pub fn send_buffer_size(&self) -> Option<usize> {
        self.send_buffer_size
    }

    /// 接收缓冲区配置值。
    pub fn receive_buffer_size(&self) -> Option<usize> {
        self.receive_buffer_size
    }

    /// TOS 配置值。
    pub fn traffic_class(&self) -> Option<u32> {
        self.traffic_class
    }

    /// `SO_LINGER` 配置值。
    pub fn linger(&self) -> Option<Duration> {
        self.linger
    }

    /// `SO_OOBINLINE` 配置值。
    pub fn oob_inline(&self) -> Option<bool> {
        self.oob_inline
    }
}
