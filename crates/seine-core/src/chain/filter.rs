use std::sync::Arc;

use crate::chain::{ChainController, ChainMessage};
use crate::error::SeineError;
use crate::session::IoSession;

/// 空闲事件的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdleStatus {
    /// 读方向超过配置时长无数据到达。
    ReadIdle,
    /// 写方向超过配置时长无数据写出。
    WriteIdle,
}

/// 会话管线中的拦截器契约。
///
/// # 设计背景（Why）
/// - 应用逻辑以有状态拦截器的管线表达：编解码、防火墙、日志等横切
///   关注点各自成环节，链序即语义；
/// - 消息事件携带 [`ChainController`]，由过滤器自行决定是否继续传播，
///   从而支持短路、改写与跨线程的延迟续传三种形态。
///
/// # 契约说明（What）
/// - 生命周期事件（created/opened/closed/idle）按链序广播，无控制器；
/// - `message_received` 默认实现继续向后传播，`message_writing` 默认
///   继续向前传播；覆写后不调用控制器即构成短路，事件就地终止；
/// - 同一过滤器实例可能被多条 I/O 线程同时进入，实现必须自身线程安全；
/// - 回调中的 panic 由链路派发器捕获，转为 `exception_caught` 回放，
///   不会终止选择器循环。
pub trait IoFilter: Send + Sync + 'static {
    /// 会话创建（尚未注册到选择器）。
    fn session_created(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话进入可用状态。
    fn session_opened(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话已关闭。
    fn session_closed(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话空闲。
    fn session_idle(&self, _session: &Arc<dyn IoSession>, _status: IdleStatus) {}

    /// 收到一条入站消息；默认继续向链尾传播。
    fn message_received(
        &self,
        _session: &Arc<dyn IoSession>,
        message: ChainMessage,
        controller: &ChainController,
    ) {
        controller.call_read_next(message);
    }

    /// 一条出站消息正在写出；默认继续向链头传播。
    fn message_writing(
        &self,
        _session: &Arc<dyn IoSession>,
        message: ChainMessage,
        controller: &ChainController,
    ) {
        controller.call_write_next(message);
    }

    /// 链路异常回放。
    fn exception_caught(&self, _session: &Arc<dyn IoSession>, _error: &SeineError) {}
}
