//! 会话面：连接身份、状态格、属性、统计与写队列。
//!
//! # 模块架构（Why）
//! - [`IoSession`] 是对象安全的会话契约，过滤器、空闲检测与服务注册表
//!   都只面向它；
//! - [`SessionCore`] 承载各传输共有的机件（id 分配、状态单元、属性表、
//!   统计、写队列、链路快照、弱引用回指），具体传输以组合方式嵌入，
//!   只补上套接字与兴趣集管理。
//!
//! # 所有权（What）
//! - 服务拥有会话（id → 会话映射），会话经弱引用回指服务，生命周期
//!   构成以服务为根的有向无环图；
//! - 会话拥有写队列与属性表；过滤链为创建时快照，会话存续期内只读。

mod attributes;
mod state;
mod stats;
mod write_queue;

pub use attributes::{AttributeKey, AttributeMap};
pub use state::{SessionState, SessionStateCell};
pub use stats::SessionStats;
pub use write_queue::{WriteQueue, WriteRequest};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use tracing::{debug, error};

use crate::buffer::CompositeBuf;
use crate::chain::{ChainMessage, FilterChain};
use crate::clock;
use crate::error::{codes, SeineError};
use crate::future::{CloseFuture, IoFuture, WriteFuture};
use crate::service::{IoService, SessionConfig};

/// 连接操作的完成 Future，成功时交付新会话。
pub type ConnectFuture = Arc<IoFuture<Arc<dyn IoSession>>>;

/// 进程级会话 id 生成器，保证任意两个会话 id 不同。
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// 对象安全的会话契约。
///
/// # 契约说明（What）
/// - `write` 为即发即弃：Closing/Closed 状态下丢弃消息并记录错误日志；
/// - `write_with_future` 返回的 Future 在本载荷（经过滤链处理后）的
///   全部字节进入内核时完成；
/// - `close(true)` 立即关闭并丢弃未写载荷，`close(false)` 先排空写队列
///   再关闭；
/// - `suspend_read`/`suspend_write` 期间循环不投递对应方向的事件；
/// - 统计读数允许轻微滞后；状态读取走读锁，不阻塞并发观察者。
pub trait IoSession: Send + Sync + 'static {
    /// 会话唯一标识，进程内单调递增。
    fn id(&self) -> u64;

    /// 当前状态快照。
    fn state(&self) -> SessionState;

    /// 应用字节当前是否经 TLS 加密传输。
    fn is_secured(&self) -> bool;

    /// 本端地址。
    fn local_addr(&self) -> SocketAddr;

    /// 对端地址。
    fn peer_addr(&self) -> SocketAddr;

    /// 会话创建时间戳（[`clock::now_millis`] 刻度）。
    fn created_at_ms(&self) -> u64;

    /// 基础统计。
    fn stats(&self) -> &SessionStats;

    /// 属性表。
    fn attributes(&self) -> &AttributeMap;

    /// 会话配置快照。
    fn config(&self) -> &SessionConfig;

    /// 本会话的过滤链快照（创建时固定）。
    fn filter_chain(&self) -> &Arc<FilterChain>;

    /// 归属服务；服务已销毁时返回 `None`。
    fn service(&self) -> Option<Arc<dyn IoService>>;

    /// 即发即弃写入。
    fn write(&self, message: ChainMessage);

    /// 带完成 Future 的写入。
    fn write_with_future(&self, message: ChainMessage) -> WriteFuture;

    /// 启动关闭流程，返回进入 Closed 终态时完成的 Future。
    fn close(&self, immediately: bool) -> CloseFuture;

    /// 暂停读方向事件投递。
    fn suspend_read(&self);

    /// 恢复读方向事件投递。
    fn resume_read(&self);

    /// 暂停写方向排空。
    fn suspend_write(&self);

    /// 恢复写方向排空。
    fn resume_write(&self);

    /// 读方向是否处于暂停。
    fn is_read_suspended(&self) -> bool;

    /// 写方向是否处于暂停。
    fn is_write_suspended(&self) -> bool;

    /// 写方向链尾回调：把最终字节载荷入队，返回请求句柄。
    ///
    /// 由过滤链在写方向游标下溢时调用；具体传输在此处完成 TLS 替换
    /// 与合并冲刷登记。应用代码不应直接调用。
    fn enqueue_write_request(&self, payload: CompositeBuf) -> WriteRequest;
}

/// 各传输共有的会话机件。
///
/// # 逻辑解析（How）
/// - 具体传输（TCP/UDP）以字段形式嵌入本结构，构造完成后调用
///   [`SessionCore::bind_self`] 注入弱自引用，使核心机件能在过滤链
///   派发时把 `&self` 还原为 `Arc<dyn IoSession>`；
/// - 写路径集中在 [`SessionCore::dispatch_write`]：状态闸门、链路派发
///   与 Future 挂接都在这里，传输层只负责链尾的入队动作。
pub struct SessionCore {
    id: u64,
    created_at_ms: u64,
    state: SessionStateCell,
    secured: AtomicBool,
    attributes: AttributeMap,
    stats: SessionStats,
    write_queue: WriteQueue,
    chain: Arc<FilterChain>,
    config: Arc<SessionConfig>,
    service: Weak<dyn IoService>,
    this: OnceLock<Weak<dyn IoSession>>,
    read_suspended: AtomicBool,
    write_suspended: AtomicBool,
    close_future: OnceLock<CloseFuture>,
}

impl SessionCore {
    /// 创建会话机件，分配唯一 id。
    pub fn new(
        service: Weak<dyn IoService>,
        chain: Arc<FilterChain>,
        config: Arc<SessionConfig>,
    ) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = id, "created new session core");
        Self {
            id,
            created_at_ms: clock::now_millis(),
            state: SessionStateCell::new(),
            secured: AtomicBool::new(false),
            attributes: AttributeMap::new(),
            stats: SessionStats::new(),
            write_queue: WriteQueue::new(),
            chain,
            config,
            service,
            this: OnceLock::new(),
            read_suspended: AtomicBool::new(false),
            write_suspended: AtomicBool::new(false),
            close_future: OnceLock::new(),
        }
    }

    /// 注入弱自引用；必须在 `Arc` 构造完成后、会话投入使用前调用一次。
    pub fn bind_self(&self, this: Weak<dyn IoSession>) {
        if self.this.set(this).is_err() {
            error!(session_id = self.id, "session self reference bound twice");
        }
    }

    /// 把弱自引用还原为 `Arc`。
    pub fn session(&self) -> Option<Arc<dyn IoSession>> {
        self.this.get().and_then(Weak::upgrade)
    }

    /// 会话 id。
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 创建时间戳。
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// 状态单元。
    pub fn state_cell(&self) -> &SessionStateCell {
        &self.state
    }

    /// 当前状态快照。
    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// 加密标志。
    pub fn is_secured(&self) -> bool {
        self.secured.load(Ordering::Acquire)
    }

    /// 设置加密标志（由 TLS 集成在握手完成/降级时调用）。
    pub fn set_secured(&self, secured: bool) {
        self.secured.store(secured, Ordering::Release);
    }

    /// 属性表。
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// 统计。
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// 写队列。
    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    /// 过滤链快照。
    pub fn filter_chain(&self) -> &Arc<FilterChain> {
        &self.chain
    }

    /// 配置快照。
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// 归属服务。
    pub fn service(&self) -> Option<Arc<dyn IoService>> {
        self.service.upgrade()
    }

    /// 读暂停标志。
    pub fn read_suspended(&self) -> &AtomicBool {
        &self.read_suspended
    }

    /// 写暂停标志。
    pub fn write_suspended(&self) -> &AtomicBool {
        &self.write_suspended
    }

    /// 关闭 Future，首次调用时创建。
    pub fn close_future(&self) -> CloseFuture {
        Arc::clone(self.close_future.get_or_init(|| Arc::new(IoFuture::new())))
    }

    /// 即发即弃写入的公共实现。
    pub fn write(&self, message: ChainMessage) {
        self.dispatch_write(message, None);
    }

    /// 带 Future 写入的公共实现。
    pub fn write_with_future(&self, message: ChainMessage) -> WriteFuture {
        let future: WriteFuture = Arc::new(IoFuture::new());
        self.dispatch_write(message, Some(Arc::clone(&future)));
        future
    }

    /// 写路径入口：状态闸门 + 过滤链写方向派发。
    fn dispatch_write(&self, message: ChainMessage, future: Option<WriteFuture>) {
        let state = self.state();
        if matches!(state, SessionState::Closing | SessionState::Closed) {
            error!(
                session_id = self.id,
                state = ?state,
                "writing to a closing or closed session, the message is discarded"
            );
            if let Some(future) = future {
                future.fail(SeineError::state(
                    codes::SESSION_CLOSED,
                    "session is closing or closed",
                ));
            }
            return;
        }
        let Some(session) = self.session() else {
            error!(session_id = self.id, "session dropped before write dispatch");
            return;
        };
        FilterChain::dispatch_message_writing(&self.chain, &session, message, future);
    }
}

#[cfg(test)]
pub(crate) mod test_stubs;

#[cfg(test)]
mod tests {
    use super::test_stubs::StubSession;
    use super::*;

    /// 任意两个会话的 id 必须不同（不变量 1）。
    #[test]
    fn session_ids_are_unique() {
        let sessions: Vec<_> = (0..64).map(|_| StubSession::plain()).collect();
        let mut ids: Vec<u64> = sessions.iter().map(|s| s.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 64, "出现了重复的会话 id");
    }

    /// 对 Closing/Closed 会话写入：消息被丢弃，Future 以状态错误失败。
    #[test]
    fn write_to_closed_session_is_discarded() {
        let session = StubSession::plain();
        session
            .core()
            .state_cell()
            .transition(SessionState::Closing)
            .expect("进入 Closing");
        session
            .core()
            .state_cell()
            .transition(SessionState::Closed)
            .expect("进入 Closed");

        session.write(ChainMessage::from_buffer(CompositeBuf::from("x")));
        assert!(
            session.core().write_queue().is_empty(),
            "关闭后的写入不得进入队列"
        );

        let future = session.write_with_future(ChainMessage::from_buffer(CompositeBuf::from("y")));
        let err = future.get().expect_err("关闭后的带 Future 写入应失败");
        assert_eq!(err.code(), codes::SESSION_CLOSED);
    }
}
