#![doc = "seine-transport-tcp：mio 支撑的 TCP 传输。"]
#![doc = ""]
#![doc = "选择器循环（`SelectorLoop`）是 I/O 引擎：一条惰性创建的专用线程独占"]
#![doc = "一个就绪多路复用器，经由意向队列接收跨线程的注册/关闭/冲刷请求。"]
#![doc = "`TcpServer` 绑定监听、按策略把新会话分派到读写循环；`TcpClient` 发起"]
#![doc = "非阻塞连接并以 Future 交付结果。"]

mod client;
mod error;
mod selector;
mod server;
mod session;
mod strategy;

pub use client::TcpClient;
pub use selector::SelectorLoop;
pub use server::TcpServer;
pub use session::TcpSession;
pub use strategy::{RoundRobinStrategy, SelectorStrategy};
