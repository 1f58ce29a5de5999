#![doc = "seine-transport-udp：共享数据报套接字上的退化会话。"]
#![doc = ""]
#![doc = "UDP 会话没有独立套接字，也没有 Securing 状态：同一监听套接字按对端"]
#![doc = "地址派生会话，首个数据报创建会话，状态格退化为"]
#![doc = "Created → Connected → Closing → Closed。"]

mod server;
mod session;

pub use server::UdpServer;
pub use session::UdpSession;
