#![doc = "seine-tls：驱动 rustls 引擎的 sans-io TLS 助手。"]
#![doc = ""]
#![doc = "助手不做任何密码学，只负责搬运：入站密文喂给引擎、取回明文与待发记录；"]
#![doc = "出站明文交给引擎加密为记录。套接字与事件循环一概不涉及，由传输层集成。"]

mod helper;

pub use helper::{TlsHelper, TlsProgress};

/// TLS 操作的稳定错误码。
pub mod codes {
    /// 引擎初始化失败（证书链/密钥/SNI 无效）。
    pub const TLS_INIT: &str = "seine.tls.init_failed";
    /// 握手或记录处理失败。
    pub const TLS_HANDSHAKE: &str = "seine.tls.handshake_failed";
    /// 明文读取失败。
    pub const TLS_PLAINTEXT: &str = "seine.tls.plaintext_failed";
    /// 记录写出失败。
    pub const TLS_RECORD: &str = "seine.tls.record_failed";
}
