use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::chain::IdleStatus;
use crate::session::IoSession;

/// 缺省轮盘跨度：一小时，覆盖常见空闲超时配置。
const DEFAULT_HORIZON_SECS: usize = 3600;

/// 按秒桶索引的空闲检测器。
///
/// # 设计背景（Why）
/// - 每轮循环逐一检查所有会话的最后活动时间是 O(n)；把会话按
///   “预期空闲时刻”挂进环形秒桶后，每个 tick 只触碰到期桶，摊销
///   O(1)；
/// - 检测器由所属选择器循环独占驱动（单线程访问），无须内部加锁。
///
/// # 逻辑解析（How）
/// - 每方向一张环形桶数组：`session_read`/`session_written` 把会话
///   重新索引到 `活动刻 + 超时秒数 (mod 跨度)` 的桶；
/// - 每会话每方向在 `slots` 里记录当前桶位与到期刻，重索引先摘旧桶；
/// - `process_idle(now)` 自上次处理刻逐桶推进：桶内到期刻 ≤ now 的
///   会话触发空闲事件并重索引到下一个周期，未到期（环形回绕）的
///   原位保留。
///
/// # 契约说明（What）
/// - 不变量：一个会话每方向至多出现在一个桶中；
/// - 超时已届满则至少触发一次；同方向每秒至多触发一次；
/// - 超时为 `None` 的方向不参与索引。
pub struct IndexedIdleTracker {
    read_wheel: DirectionWheel,
    write_wheel: DirectionWheel,
    last_tick: Option<u64>,
    horizon_secs: usize,
}

struct DirectionWheel {
    buckets: Vec<HashMap<u64, Arc<dyn IoSession>>>,
    /// 会话 id → (桶位, 到期刻)。
    slots: HashMap<u64, (usize, u64)>,
    status: IdleStatus,
}

impl DirectionWheel {
    fn new(status: IdleStatus, horizon_secs: usize) -> Self {
        Self {
            buckets: (0..horizon_secs).map(|_| HashMap::new()).collect(),
            slots: HashMap::new(),
            status,
        }
    }

    /// 把会话重索引到“活动时刻 + 超时”所在的秒桶。
    ///
    /// 到期刻向上取整到秒：新活动至少为会话买到一个完整超时周期，
    /// 触发延迟上限为超时 + 1 秒。
    fn reindex(&mut self, session: &Arc<dyn IoSession>, activity_ms: u64) {
        let id = session.id();
        self.remove(id);
        let Some(timeout) = session.config().idle_timeout(self.status) else {
            return;
        };
        let timeout_ms = (timeout.as_millis() as u64).max(1);
        let due_tick = (activity_ms + timeout_ms).div_ceil(1000);
        let slot = (due_tick % self.buckets.len() as u64) as usize;
        self.buckets[slot].insert(id, Arc::clone(session));
        self.slots.insert(id, (slot, due_tick));
    }

    fn remove(&mut self, id: u64) {
        if let Some((slot, _)) = self.slots.remove(&id) {
            self.buckets[slot].remove(&id);
        }
    }

    /// 收集 `tick` 桶内到期的会话。
    fn take_due(&mut self, tick: u64) -> Vec<Arc<dyn IoSession>> {
        let slot = (tick % self.buckets.len() as u64) as usize;
        let mut due = Vec::new();
        let bucket = &mut self.buckets[slot];
        let ids: Vec<u64> = bucket.keys().copied().collect();
        for id in ids {
            let expired = self
                .slots
                .get(&id)
                .map(|(_, due_tick)| *due_tick <= tick)
                .unwrap_or(false);
            if expired {
                if let Some(session) = bucket.remove(&id) {
                    self.slots.remove(&id);
                    due.push(session);
                }
            }
        }
        due
    }
}

impl IndexedIdleTracker {
    /// 以缺省跨度创建检测器。
    pub fn new() -> Self {
        Self::with_horizon(DEFAULT_HORIZON_SECS)
    }

    /// 以给定跨度（秒）创建检测器；跨度应不小于最大配置超时。
    pub fn with_horizon(horizon_secs: usize) -> Self {
        let horizon_secs = horizon_secs.max(2);
        Self {
            read_wheel: DirectionWheel::new(IdleStatus::ReadIdle, horizon_secs),
            write_wheel: DirectionWheel::new(IdleStatus::WriteIdle, horizon_secs),
            last_tick: None,
            horizon_secs,
        }
    }

    /// 记录一次读活动并重索引读方向。
    pub fn session_read(&mut self, session: &Arc<dyn IoSession>, now_ms: u64) {
        self.read_wheel.reindex(session, now_ms);
    }

    /// 记录一次写活动并重索引写方向。
    pub fn session_written(&mut self, session: &Arc<dyn IoSession>, now_ms: u64) {
        self.write_wheel.reindex(session, now_ms);
    }

    /// 会话关闭：从两个方向摘除。
    pub fn session_closed(&mut self, id: u64) {
        self.read_wheel.remove(id);
        self.write_wheel.remove(id);
    }

    /// 推进检测：触发自上次处理以来所有到期桶的空闲事件。
    ///
    /// 返回本次触发的事件数。事件经会话的过滤链派发；触发后会话被
    /// 重索引到下一个周期。
    pub fn process_idle(&mut self, now_ms: u64) -> usize {
        let now_tick = now_ms / 1000;
        let floor = now_tick.saturating_sub(self.horizon_secs as u64 - 1);
        let start = match self.last_tick {
            // 单次处理至多绕轮盘一圈。
            Some(last) if now_tick > last => floor.max(last + 1),
            Some(_) => return 0,
            // 首次处理：扫过整段可能的历史桶。
            None => floor,
        };
        self.last_tick = Some(now_tick);

        let mut fired = 0;
        for tick in start..=now_tick {
            for wheel in [&mut self.read_wheel, &mut self.write_wheel] {
                let status = wheel.status;
                for session in wheel.take_due(tick) {
                    if session.state().is_terminal() {
                        continue;
                    }
                    debug!(
                        session_id = session.id(),
                        status = ?status,
                        "session idle event fired"
                    );
                    session
                        .filter_chain()
                        .process_session_idle(&session, status);
                    wheel.reindex(&session, now_ms);
                    fired += 1;
                }
            }
        }
        fired
    }
}

impl Default for IndexedIdleTracker {
    fn default() -> Self {
        Self::new()
    }
}
