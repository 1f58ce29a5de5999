//! 服务面：会话注册表、处理器与过滤链模板、生命周期监听。
//!
//! # 模块架构（Why）
//! - 服务是生命周期的根：它拥有全部会话（id → 会话映射），会话以
//!   弱引用回指，析构顺序因此无环；
//! - 处理器与过滤器在服务层是可替换的模板（`arc-swap`），每个会话
//!   创建时对其做一次快照，既允许运行期换链，又保证既有会话的链序
//!   不被扰动。

mod config;

pub use config::{SessionConfig, TcpConfig};

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::chain::{FilterChain, IoFilter};
use crate::handler::{IoHandler, NoopHandler};
use crate::session::IoSession;

/// 对象安全的服务契约。
pub trait IoService: Send + Sync + 'static {
    /// 当前过滤链模板快照。
    fn chain_template(&self) -> Arc<FilterChain>;

    /// 受管会话数量。
    fn session_count(&self) -> usize;

    /// 按 id 查找受管会话。
    fn find_session(&self, id: u64) -> Option<Arc<dyn IoSession>>;

    /// 受管会话快照。
    fn managed_sessions(&self) -> Vec<Arc<dyn IoSession>>;
}

/// 服务生命周期监听器。
///
/// 回调在触发事件的线程上执行（激活/去激活在服务调用方线程，
/// 会话事件在循环线程），实现必须无阻塞。
pub trait IoServiceListener: Send + Sync + 'static {
    /// 服务绑定第一个地址，开始对外可用。
    fn service_activated(&self, _service: &dyn IoService) {}

    /// 服务解除绑定，不再接受新会话。
    fn service_inactivated(&self, _service: &dyn IoService) {}

    /// 新会话创建。
    fn session_created(&self, _session: &Arc<dyn IoSession>) {}

    /// 会话销毁并脱离注册表。
    fn session_destroyed(&self, _session: &Arc<dyn IoSession>) {}
}

/// 各服务共有的机件：注册表、模板槽与监听器列表。
///
/// # 逻辑解析（How）
/// - `chain` 用 `ArcSwap` 存放过滤链模板：`set_filters`/`set_handler`
///   重建模板原子替换，代价只落在配置路径；会话创建路径是一次
///   `load_full`；
/// - 注册表读多写少，使用读写锁；会话增删只发生在循环线程与绑定/
///   解绑路径。
pub struct ServiceCore {
    sessions: RwLock<HashMap<u64, Arc<dyn IoSession>>>,
    chain: ArcSwap<FilterChain>,
    listeners: RwLock<Vec<Arc<dyn IoServiceListener>>>,
}

impl ServiceCore {
    /// 创建服务机件，初始为空链 + 丢弃式处理器。
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            chain: ArcSwap::from_pointee(FilterChain::new(
                Vec::new(),
                Arc::new(NoopHandler),
            )),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// 替换过滤器序列，保留现有处理器；只影响其后创建的会话。
    pub fn set_filters(&self, filters: Vec<Arc<dyn IoFilter>>) {
        let handler = Arc::clone(self.chain.load().handler());
        self.chain
            .store(Arc::new(FilterChain::new(filters, handler)));
    }

    /// 替换链尾处理器，保留现有过滤器；只影响其后创建的会话。
    pub fn set_handler(&self, handler: Arc<dyn IoHandler>) {
        let filters = self.chain.load().filters().to_vec();
        self.chain
            .store(Arc::new(FilterChain::new(filters, handler)));
    }

    /// 取当前过滤链模板快照。
    pub fn chain_template(&self) -> Arc<FilterChain> {
        self.chain.load_full()
    }

    /// 注册服务监听器。
    pub fn add_listener(&self, listener: Arc<dyn IoServiceListener>) {
        self.listeners.write().push(listener);
    }

    /// 移除服务监听器（按 `Arc` 指针同一性）。
    pub fn remove_listener(&self, listener: &Arc<dyn IoServiceListener>) {
        self.listeners
            .write()
            .retain(|candidate| !Arc::ptr_eq(candidate, listener));
    }

    /// 会话进入注册表，并向监听器广播创建事件。
    pub fn register_session(&self, session: Arc<dyn IoSession>) {
        let id = session.id();
        let previous = self.sessions.write().insert(id, Arc::clone(&session));
        if previous.is_some() {
            warn!(session_id = id, "session id registered twice");
        }
        debug!(session_id = id, "session registered with the service");
        for listener in self.listeners.read().iter() {
            listener.session_created(&session);
        }
    }

    /// 会话脱离注册表，并向监听器广播销毁事件。
    pub fn unregister_session(&self, id: u64) -> Option<Arc<dyn IoSession>> {
        let removed = self.sessions.write().remove(&id);
        if let Some(session) = &removed {
            debug!(session_id = id, "session removed from the service");
            for listener in self.listeners.read().iter() {
                listener.session_destroyed(session);
            }
        }
        removed
    }

    /// 受管会话数量。
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// 按 id 查找。
    pub fn find_session(&self, id: u64) -> Option<Arc<dyn IoSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// 受管会话快照。
    pub fn managed_sessions(&self) -> Vec<Arc<dyn IoSession>> {
        self.sessions.read().values().cloned().collect()
    }

    /// 广播服务激活事件。
    pub fn fire_service_activated(&self, service: &dyn IoService) {
        for listener in self.listeners.read().iter() {
            listener.service_activated(service);
        }
    }

    /// 广播服务去激活事件。
    pub fn fire_service_inactivated(&self, service: &dyn IoService) {
        for listener in self.listeners.read().iter() {
            listener.service_inactivated(service);
        }
    }
}

impl Default for ServiceCore {
    fn default() -> Self {
        Self::new()
    }
}
