use std::io;

use seine_core::error::ErrorKind;
use seine_core::SeineError;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "seine.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "seine.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "seine.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "seine.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "seine.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "seine.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "seine.tcp.register_failed",
    message: "selector register",
};
pub(crate) const SELECTOR: OperationKind = OperationKind {
    code: "seine.tcp.selector_failed",
    message: "selector setup",
};

pub(crate) const CONNECT_TIMEOUT_CODE: &str = "seine.tcp.connect_timeout";

/// 把 IO 错误映射为传输类 [`SeineError`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> SeineError {
    SeineError::new(
        kind.code,
        ErrorKind::Transport,
        format!("{}: {}", kind.message, error),
    )
    .with_cause(error)
}

/// 构造连接超时错误。
pub(crate) fn connect_timeout_error() -> SeineError {
    SeineError::timeout(
        CONNECT_TIMEOUT_CODE,
        "connect not established within the configured deadline",
    )
}
