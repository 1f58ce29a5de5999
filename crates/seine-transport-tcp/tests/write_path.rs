//! 写路径的端到端验证：并发写合并、字节不丢不重、关闭后写入被丢弃。

mod support;

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use seine_core::chain::ChainMessage;
use seine_core::service::TcpConfig;
use seine_core::session::{IoSession, SessionState};
use seine_transport_tcp::TcpServer;

use support::CollectingHandler;

fn loopback() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

/// 并发写合并：多线程对同一会话写入 1000 个单字节载荷，
/// 对端读到恰好 1000 字节且多重集一致，全部写 Future 在限期内完成。
#[test]
fn concurrent_writes_coalesce_without_loss() {
    support::init_tracing();
    let opened = CollectingHandler::new();
    let server = TcpServer::new(TcpConfig::new()).expect("创建服务端");
    server.set_handler(opened.clone());
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let mut client = TcpStream::connect(addr).expect("客户端连接");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("设置读超时");

    let session = opened.wait_for_session(Duration::from_secs(5));

    const WRITERS: usize = 100;
    const PER_WRITER: usize = 10;
    let futures: Vec<_> = (0..WRITERS)
        .map(|writer| {
            let session = Arc::clone(&session);
            std::thread::spawn(move || {
                (0..PER_WRITER)
                    .map(|slot| {
                        let value = (writer * PER_WRITER + slot) as u8;
                        session.write_with_future(ChainMessage::from(vec![value]))
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flat_map(|handle| handle.join().expect("写线程不应 panic"))
        .collect();

    // 写队列必须在最后一次入队后的短时间内排空。
    for future in &futures {
        future
            .get_timeout(Duration::from_secs(2))
            .expect("写 Future 应成功完成");
    }

    let mut received = vec![0u8; WRITERS * PER_WRITER];
    client.read_exact(&mut received).expect("读取全部字节");

    let mut expected: Vec<u8> = (0..WRITERS * PER_WRITER).map(|i| i as u8).collect();
    expected.sort_unstable();
    received.sort_unstable();
    assert_eq!(received, expected, "多重集必须一致：不丢字节、不重字节");

    // 队列排空后不应再有任何残留字节到达。
    client
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("缩短读超时");
    let mut probe = [0u8; 1];
    match client.read(&mut probe) {
        Ok(0) | Err(_) => {}
        Ok(_) => panic!("排空后不应再有字节"),
    }
}

/// 对已关闭会话写入：调用静默返回，对端看到干净的 EOF，零额外字节。
#[test]
fn write_to_closed_session_is_discarded() {
    support::init_tracing();
    let opened = CollectingHandler::new();
    let server = TcpServer::new(TcpConfig::new()).expect("创建服务端");
    server.set_handler(opened.clone());
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let mut client = TcpStream::connect(addr).expect("客户端连接");
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("设置读超时");

    let session = opened.wait_for_session(Duration::from_secs(5));
    session
        .close(true)
        .get_timeout(Duration::from_secs(5))
        .expect("立即关闭应完成");
    assert_eq!(session.state(), SessionState::Closed);

    // 关闭后的写入：不得恐慌、不得产生字节。
    session.write(ChainMessage::from(b"x".to_vec()));

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).expect("读到 EOF");
    assert!(rest.is_empty(), "关闭后对端不应收到任何额外字节");
}

/// 关闭后的带 Future 写入以状态错误失败。
#[test]
fn write_future_fails_after_close() {
    support::init_tracing();
    let opened = CollectingHandler::new();
    let server = TcpServer::new(TcpConfig::new()).expect("创建服务端");
    server.set_handler(opened.clone());
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let _client = TcpStream::connect(addr).expect("客户端连接");
    let session = opened.wait_for_session(Duration::from_secs(5));
    session
        .close(true)
        .get_timeout(Duration::from_secs(5))
        .expect("关闭完成");

    let future = session.write_with_future(ChainMessage::from(b"y".to_vec()));
    let err = future.get().expect_err("关闭后的写 Future 应失败");
    assert_eq!(err.code(), "session.closed");
}
