//! 数据报会话的端到端验证：按对端派生会话、回显与注册表生命周期。

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use seine_core::chain::{ChainController, ChainMessage, IoFilter};
use seine_core::service::SessionConfig;
use seine_core::session::IoSession;
use seine_transport_udp::UdpServer;

fn loopback() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

/// 回显过滤器：收到什么写回什么。
struct EchoFilter;

impl IoFilter for EchoFilter {
    fn message_received(
        &self,
        session: &Arc<dyn IoSession>,
        message: ChainMessage,
        _controller: &ChainController,
    ) {
        if let Ok(buffer) = message.into_buffer() {
            session.write(ChainMessage::Buffer(buffer));
        }
    }
}

#[test]
fn datagram_echo_roundtrip() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = UdpServer::new(SessionConfig::new());
    server.set_filters(vec![Arc::new(EchoFilter) as Arc<dyn IoFilter>]);
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let client = UdpSocket::bind(loopback()).expect("客户端套接字");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    client.send_to(b"ping", addr).expect("发送数据报");

    let mut reply = [0u8; 16];
    let (count, from) = client.recv_from(&mut reply).expect("读取回显");
    assert_eq!(&reply[..count], b"ping");
    assert_eq!(from, addr);
    assert_eq!(server.session_count(), 1, "首个数据报应派生一个会话");

    // 同一对端再次发送不应再建会话。
    client.send_to(b"pong", addr).expect("再次发送");
    let (count, _) = client.recv_from(&mut reply).expect("再次读取");
    assert_eq!(&reply[..count], b"pong");
    assert_eq!(server.session_count(), 1);
}

/// 优雅关闭先排空写队列：挂起期间积压的数据报在关闭完成前全部出线，
/// 对应的写 Future 全部成功（不丢字节）。
#[test]
fn graceful_close_flushes_queued_datagrams() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = UdpServer::new(SessionConfig::new());
    server.set_filters(vec![Arc::new(EchoFilter) as Arc<dyn IoFilter>]);
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let client = UdpSocket::bind(loopback()).expect("客户端套接字");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    client.send_to(b"hi", addr).expect("发送数据报");
    let mut reply = [0u8; 16];
    client.recv_from(&mut reply).expect("等待回显");

    let session = server
        .managed_sessions()
        .first()
        .cloned()
        .expect("首个数据报应已派生会话");

    // 暂停写方向，把三个数据报压进队列，再发起优雅关闭。
    session.suspend_write();
    let futures: Vec<_> = [b"a".as_slice(), b"b".as_slice(), b"c".as_slice()]
        .into_iter()
        .map(|payload| session.write_with_future(ChainMessage::from(payload.to_vec())))
        .collect();
    let close = session.close(false);
    assert!(!close.is_done(), "队列未排空前不应完成关闭");

    session.resume_write();
    close
        .get_timeout(Duration::from_secs(5))
        .expect("优雅关闭应在队列排空后完成");
    for future in &futures {
        future
            .get_timeout(Duration::from_secs(2))
            .expect("排队的数据报应在关闭前成功写出");
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        let (count, _) = client.recv_from(&mut reply).expect("读取排空的数据报");
        received.push(reply[..count].to_vec());
    }
    received.sort();
    assert_eq!(
        received,
        vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()],
        "排队载荷必须全部抵达对端"
    );
}

#[test]
fn unbind_closes_every_session() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server = UdpServer::new(SessionConfig::new());
    server.set_filters(vec![Arc::new(EchoFilter) as Arc<dyn IoFilter>]);
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let client = UdpSocket::bind(loopback()).expect("客户端套接字");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");
    client.send_to(b"hi", addr).expect("发送数据报");
    let mut reply = [0u8; 8];
    client.recv_from(&mut reply).expect("等待回显");

    server.unbind().expect("解绑");
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while server.session_count() != 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "解绑后会话应全部关闭"
        );
        std::thread::sleep(Duration::from_millis(20));
    }
}
