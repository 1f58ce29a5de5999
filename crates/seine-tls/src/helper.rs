use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tracing::{debug, warn};

use seine_core::error::ErrorKind;
use seine_core::SeineError;

use crate::codes;

/// 一次密文喂入产生的推进结果。
#[derive(Debug, Default)]
pub struct TlsProgress {
    /// 解密出的明文段，按到达顺序排列。
    pub plaintext: Vec<Bytes>,
    /// 引擎要求立即上线缆的记录（握手应答、告警等）。
    pub records: Bytes,
    /// 本次推进后握手是否已完成。
    pub handshake_complete: bool,
    /// 对端是否已发送 close_notify。
    pub peer_closed: bool,
}

/// 服务端/客户端引擎的统一封装。
enum EngineConnection {
    Server(ServerConnection),
    Client(ClientConnection),
}

macro_rules! with_conn {
    ($self:expr, $conn:ident => $body:expr) => {
        match &mut $self.conn {
            EngineConnection::Server($conn) => $body,
            EngineConnection::Client($conn) => $body,
        }
    };
}

/// 介于明文过滤链与套接字之间的 TLS 助手。
///
/// # 设计背景（Why）
/// - 选择器循环是线程模型，套接字操作全部非阻塞；助手因此以纯
///   sans-io 形态驱动引擎：调用方喂入字节、取回字节，时序完全由
///   循环掌控；
/// - 加密替换发生在写请求入队之前：会话把明文交给 [`TlsHelper::wrap`]，
///   以返回的密文记录替换原载荷入队，排空路径对 TLS 无感。
///
/// # 逻辑解析（How）
/// - `unwrap_ciphertext` 把入站密文切片循环喂给 `read_tls`，每次喂入后
///   `process_new_packets` 推进状态机，读尽可读明文；末了统一排出
///   引擎积压的出站记录（握手应答沿此路径产生）；
/// - `wrap` 把明文写进引擎缓冲再排出记录；握手未完成时引擎先行缓存
///   明文，完成后自动随记录流出；
/// - `initial_records` 供客户端侧取第一束 ClientHello 记录。
///
/// # 契约说明（What）
/// - 握手完成与否以 [`TlsHelper::is_handshaking`] 为准，完成当轮的
///   `TlsProgress::handshake_complete` 为 `true`；
/// - 任何引擎错误都以 [`ErrorKind::Tls`] 类错误返回，调用方应关闭会话。
pub struct TlsHelper {
    conn: EngineConnection,
}

impl TlsHelper {
    /// 创建服务端助手。
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, SeineError> {
        let conn = ServerConnection::new(config)
            .map_err(|err| tls_error(codes::TLS_INIT, "server engine init", err))?;
        Ok(Self {
            conn: EngineConnection::Server(conn),
        })
    }

    /// 创建客户端助手；`server_name` 用于 SNI 与证书校验。
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, SeineError> {
        let conn = ClientConnection::new(config, server_name)
            .map_err(|err| tls_error(codes::TLS_INIT, "client engine init", err))?;
        Ok(Self {
            conn: EngineConnection::Client(conn),
        })
    }

    /// 握手是否仍在进行。
    pub fn is_handshaking(&self) -> bool {
        match &self.conn {
            EngineConnection::Server(conn) => conn.is_handshaking(),
            EngineConnection::Client(conn) => conn.is_handshaking(),
        }
    }

    /// 协商出的协议版本，握手完成前为 `None`。
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match &self.conn {
            EngineConnection::Server(conn) => conn.protocol_version(),
            EngineConnection::Client(conn) => conn.protocol_version(),
        }
    }

    /// 取客户端握手的首束记录（ClientHello）。
    pub fn initial_records(&mut self) -> Result<Bytes, SeineError> {
        self.drain_records()
    }

    /// 喂入入站密文，返回解密明文与待发记录。
    pub fn unwrap_ciphertext(&mut self, mut ciphertext: &[u8]) -> Result<TlsProgress, SeineError> {
        let mut progress = TlsProgress::default();
        while !ciphertext.is_empty() {
            let consumed = with_conn!(self, conn => conn.read_tls(&mut ciphertext))
                .map_err(|err| tls_error(codes::TLS_RECORD, "feeding inbound records", err))?;
            if consumed == 0 {
                // 引擎缓冲已满却无法推进，只能视作协议破坏。
                return Err(SeineError::new(
                    codes::TLS_RECORD,
                    ErrorKind::Tls,
                    "engine refused inbound records",
                ));
            }
            let state = with_conn!(self, conn => conn.process_new_packets())
                .map_err(|err| tls_error(codes::TLS_HANDSHAKE, "processing records", err))?;

            let readable = state.plaintext_bytes_to_read();
            if readable > 0 {
                let mut plain = vec![0u8; readable];
                with_conn!(self, conn => conn.reader().read_exact(&mut plain))
                    .map_err(|err| tls_error(codes::TLS_PLAINTEXT, "draining plaintext", err))?;
                progress.plaintext.push(Bytes::from(plain));
            }
            if state.peer_has_closed() {
                debug!("peer sent close_notify");
                progress.peer_closed = true;
            }
        }
        progress.records = self.drain_records()?;
        progress.handshake_complete = !self.is_handshaking();
        Ok(progress)
    }

    /// 把出站明文加密为记录。
    ///
    /// 握手尚未完成时引擎会缓存明文，待完成后随后续记录流出；
    /// 因此返回空记录并不代表丢弃。
    pub fn wrap(&mut self, plaintext: &[u8]) -> Result<Bytes, SeineError> {
        with_conn!(self, conn => conn.writer().write_all(plaintext))
            .map_err(|err| tls_error(codes::TLS_RECORD, "buffering plaintext", err))?;
        self.drain_records()
    }

    /// 发起有序关闭：产生 close_notify 记录。
    pub fn close_notify(&mut self) -> Result<Bytes, SeineError> {
        with_conn!(self, conn => conn.send_close_notify());
        self.drain_records()
    }

    /// 排出引擎当前积压的全部出站记录。
    fn drain_records(&mut self) -> Result<Bytes, SeineError> {
        let mut out = Vec::new();
        loop {
            let wants_write = match &self.conn {
                EngineConnection::Server(conn) => conn.wants_write(),
                EngineConnection::Client(conn) => conn.wants_write(),
            };
            if !wants_write {
                break;
            }
            with_conn!(self, conn => conn.write_tls(&mut out))
                .map_err(|err| tls_error(codes::TLS_RECORD, "draining outbound records", err))?;
        }
        Ok(Bytes::from(out))
    }
}

fn tls_error(
    code: &'static str,
    context: &str,
    err: impl std::error::Error + Send + Sync + 'static,
) -> SeineError {
    warn!(code, "tls engine failure while {context}: {err}");
    SeineError::new(code, ErrorKind::Tls, format!("{context}: {err}")).with_cause(err)
}
