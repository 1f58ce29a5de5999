use std::sync::Arc;

use crate::chain::{ChainMessage, IdleStatus};
use crate::error::SeineError;
use crate::session::IoSession;

/// 应用处理器：过滤链入站方向的链尾。
///
/// # 契约说明（What）
/// - 过滤链处理完的入站消息最终抵达 `message_received`；
/// - 回调运行在会话所属的循环线程上，必须无阻塞，耗时工作应移交
///   应用自己的线程；
/// - 所有方法默认空实现，应用只覆写关心的事件。
pub trait IoHandler: Send + Sync + 'static {
    /// 会话进入可用状态。
    fn session_opened(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话已关闭。
    fn session_closed(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话空闲。
    fn session_idle(&self, _session: &Arc<dyn IoSession>, _status: IdleStatus) {}

    /// 收到经过滤链处理后的入站消息。
    fn message_received(&self, _session: &Arc<dyn IoSession>, _message: ChainMessage) {}

    /// 链路异常抵达尾端。
    fn exception_caught(&self, _session: &Arc<dyn IoSession>, _error: &SeineError) {}
}

/// 缺省处理器：丢弃一切事件。服务在未配置处理器时使用。
#[derive(Debug, Default)]
pub struct NoopHandler;

impl IoHandler for NoopHandler {}
