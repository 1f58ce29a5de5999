//! 空闲检测的端到端验证：无流量时按周期触发，活动后静默一个完整周期。

mod support;

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use seine_core::chain::IoFilter;
use seine_core::service::{SessionConfig, TcpConfig};
use seine_transport_tcp::TcpServer;

use support::IdleCounterFilter;

fn loopback() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
}

/// 读空闲 500 ms、无流量：1.8 秒内触发 1 至 3 次 READ_IDLE
/// （每经过一个窗口至多一次，首次在超时 + 1 秒内）。
#[test]
fn read_idle_fires_per_elapsed_window() {
    support::init_tracing();
    let counter = Arc::new(IdleCounterFilter::default());
    let config = TcpConfig::new().with_session(
        SessionConfig::new().with_read_idle_timeout(Some(Duration::from_millis(500))),
    );
    let server = TcpServer::new(config).expect("创建服务端");
    server.set_filters(vec![counter.clone() as Arc<dyn IoFilter>]);
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let _client = TcpStream::connect(addr).expect("客户端连接");
    std::thread::sleep(Duration::from_millis(1800));

    let fired = counter.read_idle_count();
    assert!(
        (1..=3).contains(&fired),
        "1.8 秒无流量应触发 1..=3 次读空闲，实际 {fired} 次"
    );
}

/// 持续有读活动时不触发读空闲。
#[test]
fn activity_resets_the_idle_window() {
    support::init_tracing();
    let counter = Arc::new(IdleCounterFilter::default());
    let config = TcpConfig::new().with_session(
        SessionConfig::new().with_read_idle_timeout(Some(Duration::from_millis(900))),
    );
    let server = TcpServer::new(config).expect("创建服务端");
    server.set_filters(vec![counter.clone() as Arc<dyn IoFilter>]);
    let addr = server.bind(loopback()).expect("绑定回环地址");

    let mut client = TcpStream::connect(addr).expect("客户端连接");
    // 每 300 ms 一次写入，总时长约 1.5 秒：窗口不断被推走。
    for _ in 0..5 {
        client.write_all(b"tick").expect("保持活跃");
        std::thread::sleep(Duration::from_millis(300));
    }
    assert_eq!(
        counter.read_idle_count(),
        0,
        "持续活动期间不应有读空闲事件"
    );
}
