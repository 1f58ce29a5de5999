use std::sync::atomic::{AtomicUsize, Ordering};

use crate::selector::SelectorLoop;

/// 接受端挑选读写循环的策略。
///
/// # 设计背景（Why）
/// - 接受循环只做 accept，新会话交由哪个读写循环拥有由策略决定，
///   使 accept 与 I/O 隔离，并把会话分摊到多条循环上。
pub trait SelectorStrategy: Send + Sync + 'static {
    /// 为新会话挑选归属循环；`loops` 非空。
    fn next_loop<'a>(&self, loops: &'a [SelectorLoop]) -> &'a SelectorLoop;
}

/// 缺省策略：轮转。
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    /// 创建轮转策略。
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectorStrategy for RoundRobinStrategy {
    fn next_loop<'a>(&self, loops: &'a [SelectorLoop]) -> &'a SelectorLoop {
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % loops.len();
        &loops[index]
    }
}
