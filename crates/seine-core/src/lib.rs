#![doc = "seine-core：选择器驱动的非阻塞 I/O 框架核心。"]
#![doc = ""]
#![doc = "== 体系分层 =="]
#![doc = "1. 数据面：`buffer`（组合缓冲视图）与 `chain`（双向过滤链）承载单连接上的事件流。"]
#![doc = "2. 会话面：`session` 管理连接身份、状态格、属性与写队列；`idle` 以桶索引检测读写空闲。"]
#![doc = "3. 服务面：`service` 聚合会话注册表、处理器与过滤链模板；`future` 提供一次性完成原语。"]
#![doc = ""]
#![doc = "具体传输（TCP/UDP/TLS）由 `seine-transport-*` 系 crate 提供，本 crate 不触碰套接字。"]

pub mod buffer;
pub mod chain;
pub mod clock;
pub mod error;
pub mod future;
pub mod handler;
pub mod idle;
pub mod service;
pub mod session;

pub use buffer::CompositeBuf;
pub use chain::{ChainController, ChainMessage, FilterChain, IdleStatus, IoFilter};
pub use error::{ErrorKind, SeineError};
pub use future::{CloseFuture, IoFuture, WriteFuture};
pub use handler::IoHandler;
pub use idle::IndexedIdleTracker;
pub use service::{IoService, IoServiceListener, ServiceCore, SessionConfig};
pub use session::{
    AttributeKey, AttributeMap, ConnectFuture, IoSession, SessionCore, SessionState, SessionStats,
    WriteQueue, WriteRequest,
};
