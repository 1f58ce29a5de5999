use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// 错误链的底层原因，保持 `Send + Sync` 以便跨线程传递；
/// 采用 `Arc` 而非 `Box`，使 [`SeineError`] 可被克隆（完成 Future 需要向
/// 多个等待者重复交付同一个失败结果）。
pub type ErrorCause = Arc<dyn StdError + Send + Sync + 'static>;

/// 框架统一的错误类别。
///
/// # 设计背景（Why）
/// - 日志、指标与调用方的容错策略都需要一个机器可读的粗粒度分类，
///   而不是去解析人类可读的消息文本。
/// - 类别集合覆盖框架的全部失败域：传输 I/O、TLS、协议（过滤器）、
///   状态机、取消与超时。
///
/// # 契约说明（What）
/// - `Transport`：操作系统层面的 I/O 失败，通常导致会话关闭；
/// - `Tls`：握手或解密失败，导致会话关闭；
/// - `Protocol`：过滤器抛出的协议错误，经由 `exception_caught` 回放；
/// - `State`：非法状态跃迁或对已关闭会话的使用，同步返回给调用方；
/// - `Cancelled`：Future 被取消后的终态；
/// - `Timeout`：仅由 `get_timeout` 与连接超时产生。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    Transport,
    Tls,
    Protocol,
    State,
    Cancelled,
    Timeout,
}

/// `SeineError` 是框架的统一错误域。
///
/// # 设计背景（Why）
/// - 跨层传递稳定错误码，使可观测性系统能做机器可读的根因识别；
/// - 错误需要在完成 Future 中缓存并多次交付，因此整体可克隆。
///
/// # 逻辑解析（How）
/// - `code` 承载 `domain.reason` 形式的稳定错误码，`message` 面向人类调试；
/// - Builder 风格的 `with_cause` 累积底层原因，形成错误链；
/// - `kind` 给出粗粒度类别，细粒度语义由 `code` 表达。
///
/// # 契约说明（What）
/// - **前置条件**：`code` 应在 [`codes`] 模块中声明，或遵守 `domain.reason` 约定；
/// - **后置条件**：所有构造方法返回拥有所有权的实例，可跨线程移动与克隆。
#[derive(Clone, Debug)]
pub struct SeineError {
    code: &'static str,
    kind: ErrorKind,
    message: String,
    cause: Option<ErrorCause>,
}

impl SeineError {
    /// 使用稳定错误码、类别与消息创建错误。
    pub fn new(code: &'static str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// 构造状态机错误（非法跃迁、对已关闭会话的操作）。
    pub fn state(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorKind::State, message)
    }

    /// 构造协议错误（过滤器语义违例）。
    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorKind::Protocol, message)
    }

    /// 构造取消错误，用于已取消 Future 的结果交付。
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(codes::FUTURE_CANCELLED, ErrorKind::Cancelled, message)
    }

    /// 构造超时错误，仅用于 `get_timeout` 与连接超时。
    pub fn timeout(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(code, ErrorKind::Timeout, message)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取错误类别。
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// 获取人类可读的错误描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 附带一个底层原因，形成错误链。
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 获取可选的底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }
}

impl fmt::Display for SeineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl StdError for SeineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn StdError + 'static))
    }
}

/// 框架内置的稳定错误码集合。
///
/// 各传输 crate 在自身 `error` 模块中补充 `seine.tcp.*` 等操作级错误码；
/// 这里只声明核心机件产生的码点。
pub mod codes {
    /// 组合缓冲读取越界。
    pub const BUFFER_UNDERFLOW: &str = "buffer.underflow";
    /// 非法会话状态跃迁。
    pub const SESSION_INVALID_STATE: &str = "session.invalid_state";
    /// 对处于 Closing/Closed 状态会话的写入。
    pub const SESSION_CLOSED: &str = "session.closed";
    /// 过滤器回调发生 panic，被链路捕获。
    pub const CHAIN_FILTER_PANIC: &str = "chain.filter_panic";
    /// 写方向链尾收到非字节消息。
    pub const CHAIN_TAIL_NOT_BUFFER: &str = "chain.tail_not_buffer";
    /// Future 被取消。
    pub const FUTURE_CANCELLED: &str = "future.cancelled";
    /// `get_timeout` 等待超时。
    pub const FUTURE_TIMEOUT: &str = "future.timeout";
}
