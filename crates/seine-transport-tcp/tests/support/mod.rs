//! 端到端测试共用件：回显过滤器、收集式处理器与等待工具。

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use seine_core::chain::{ChainController, ChainMessage, IdleStatus, IoFilter};
use seine_core::handler::IoHandler;
use seine_core::session::IoSession;

/// 回显过滤器：收到什么写回什么，事件就地终止。
pub struct EchoFilter;

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

/// 大写化过滤器：改写后继续向链尾传播。
pub struct UpperCaseFilter;

impl IoFilter for UpperCaseFilter {
    fn message_received(
        &self,
        _session: &Arc<dyn IoSession>,
        message: ChainMessage,
        controller: &ChainController,
    ) {
        match message.into_buffer() {
            Ok(buffer) => {
                let upper = buffer.to_vec().to_ascii_uppercase();
                controller.call_read_next(ChainMessage::from(upper));
            }
            Err(other) => controller.call_read_next(other),
        }
    }
}

/// 统计空闲事件的过滤器。
#[derive(Default)]
pub struct IdleCounterFilter {
    read_idle: std::sync::atomic::AtomicUsize,
    write_idle: std::sync::atomic::AtomicUsize,
}

impl IdleCounterFilter {
    pub fn read_idle_count(&self) -> usize {
        self.read_idle.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn write_idle_count(&self) -> usize {
        self.write_idle.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl IoFilter for IdleCounterFilter {
    fn session_idle(&self, _session: &Arc<dyn IoSession>, status: IdleStatus) {
        match status {
            IdleStatus::ReadIdle => self
                .read_idle
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
            IdleStatus::WriteIdle => self
                .write_idle
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst),
        };
    }
}

/// 链尾回显处理器：把抵达的字节原样写回。
pub struct EchoHandler;

impl IoHandler for EchoHandler {
    fn message_received(&self, session: &Arc<dyn IoSession>, message: ChainMessage) {
        if let Ok(buffer) = message.into_buffer() {
            session.write(ChainMessage::Buffer(buffer));
        }
    }
}

#[derive(Default)]
struct CollectorState {
    bytes: Vec<u8>,
    sessions: Vec<Arc<dyn IoSession>>,
    closed: usize,
}

/// 收集式处理器：积累收到的字节与打开的会话，供测试线程等待。
#[derive(Default)]
pub struct CollectingHandler {
    state: Mutex<CollectorState>,
    changed: Condvar,
}

impl CollectingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 等待累计字节数达到 `count`，返回快照。
    pub fn wait_for_bytes(&self, count: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.bytes.len() < count {
            let now = Instant::now();
            if now >= deadline {
                panic!(
                    "等待 {count} 字节超时，目前只有 {} 字节",
                    state.bytes.len()
                );
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
        state.bytes.clone()
    }

    /// 等待首个会话打开。
    pub fn wait_for_session(&self, timeout: Duration) -> Arc<dyn IoSession> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.sessions.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                panic!("等待会话打开超时");
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
        Arc::clone(&state.sessions[0])
    }

    /// 等待至少一个会话关闭。
    pub fn wait_for_close(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while state.closed == 0 {
            let now = Instant::now();
            if now >= deadline {
                panic!("等待会话关闭超时");
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
    }

    /// 当前累计字节快照。
    pub fn bytes(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }
}

impl IoHandler for CollectingHandler {
    fn session_opened(&self, session: &Arc<dyn IoSession>) {
        let mut state = self.state.lock();
        state.sessions.push(Arc::clone(session));
        self.changed.notify_all();
    }

    fn session_closed(&self, _session: &Arc<dyn IoSession>) {
        let mut state = self.state.lock();
        state.closed += 1;
        self.changed.notify_all();
    }

    fn message_received(&self, _session: &Arc<dyn IoSession>, message: ChainMessage) {
        if let Ok(buffer) = message.into_buffer() {
            let mut state = self.state.lock();
            state.bytes.extend_from_slice(&buffer.to_vec());
            self.changed.notify_all();
        }
    }
}

/// 轮询等待条件成立。
pub fn await_condition(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// 初始化测试日志输出（幂等）。
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}
