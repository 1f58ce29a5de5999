use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::buffer::CompositeBuf;
use crate::error::SeineError;
use crate::future::WriteFuture;

/// 一次待发送的写请求：载荷加可选的完成 Future。
///
/// # 逻辑解析（How）
/// - 请求以 `Arc` 共享：入队方保留句柄用于事后挂接 Future，
///   循环线程经由队列取得同一请求执行排空；
/// - `written` 标志与 Future 槽共同闭合“先写完、后挂接”的窗口：
///   排空线程完成写入时若 Future 未到位则只落标志，`attach_future`
///   发现标志已置位时立即内联完成。
///
/// # 契约说明（What）
/// - 载荷只被排空线程（单写者）访问；
/// - `complete_written` 与 `fail` 至多各生效一次，由 Future 的
///   一次性语义兜底。
#[derive(Clone)]
pub struct WriteRequest {
    inner: Arc<WriteRequestInner>,
}

struct WriteRequestInner {
    payload: Mutex<CompositeBuf>,
    future: Mutex<Option<WriteFuture>>,
    written: AtomicBool,
}

impl WriteRequest {
    /// 以载荷构造写请求。
    pub fn new(payload: CompositeBuf) -> Self {
        Self {
            inner: Arc::new(WriteRequestInner {
                payload: Mutex::new(payload),
                future: Mutex::new(None),
                written: AtomicBool::new(false),
            }),
        }
    }

    /// 锁定载荷，供排空线程做向量化写与部分写推进。
    pub fn payload(&self) -> MutexGuard<'_, CompositeBuf> {
        self.inner.payload.lock()
    }

    /// 剩余未写字节数。
    pub fn remaining(&self) -> usize {
        self.inner.payload.lock().remaining()
    }

    /// 事后挂接完成 Future。
    ///
    /// 若排空线程已先一步写完本请求，则在此处立即完成，保证监听方
    /// 不会因时序竞争而永久悬挂。
    pub fn attach_future(&self, future: WriteFuture) {
        {
            let mut slot = self.inner.future.lock();
            if !self.inner.written.load(Ordering::Acquire) {
                *slot = Some(future);
                return;
            }
        }
        future.complete(());
    }

    /// 标记载荷已全部进入内核，并完成挂接的 Future。
    pub fn complete_written(&self) {
        self.inner.written.store(true, Ordering::Release);
        let future = self.inner.future.lock().take();
        if let Some(future) = future {
            future.complete(());
        }
    }

    /// 以失败终结本请求（会话关闭时丢弃未写载荷）。
    pub fn fail(&self, error: SeineError) {
        self.inner.written.store(true, Ordering::Release);
        let future = self.inner.future.lock().take();
        if let Some(future) = future {
            future.fail(error);
        }
    }
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 只打印剩余量，避免把载荷打进日志。
        f.debug_struct("WriteRequest")
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// 会话的写请求 FIFO 队列，附带合并冲刷标志。
///
/// # 设计背景（Why）
/// - 生产者是任意应用线程，消费者只有会话所属的选择器循环；
/// - `registered_for_flush` 把并发 `write` 合并为至多一次冲刷登记：
///   第一个把它从 false 翻为 true 的生产者负责把会话放入循环的冲刷
///   队列，循环排空完毕后复位。
///
/// # 契约说明（What）
/// - 入队、出队、队首回插均为 O(1)；
/// - 部分写入时剩余载荷以原请求回插队首，字节既不丢失也不重复。
pub struct WriteQueue {
    queue: Mutex<VecDeque<WriteRequest>>,
    registered_for_flush: AtomicBool,
}

impl WriteQueue {
    /// 创建空队列。
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            registered_for_flush: AtomicBool::new(false),
        }
    }

    /// 入队一个写请求。
    pub fn offer(&self, request: WriteRequest) {
        self.queue.lock().push_back(request);
    }

    /// 尝试认领冲刷登记：仅首个翻转标志的调用者获得 `true`。
    pub fn try_claim_flush(&self) -> bool {
        !self.registered_for_flush.swap(true, Ordering::AcqRel)
    }

    /// 复位冲刷登记，由循环在排空完毕后调用。
    pub fn clear_flush_claim(&self) {
        self.registered_for_flush.store(false, Ordering::Release);
    }

    /// 取出队首请求。
    pub fn pop_front(&self) -> Option<WriteRequest> {
        self.queue.lock().pop_front()
    }

    /// 把部分写入后的请求放回队首。
    pub fn push_front(&self, request: WriteRequest) {
        self.queue.lock().push_front(request);
    }

    /// 队列长度。
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// 队列是否为空。
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// 清空队列并返回全部请求，供关闭路径统一判定失败。
    pub fn drain_all(&self) -> Vec<WriteRequest> {
        self.queue.lock().drain(..).collect()
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::IoFuture;

    #[test]
    fn fifo_order_is_preserved() {
        let queue = WriteQueue::new();
        queue.offer(WriteRequest::new(CompositeBuf::from("a")));
        queue.offer(WriteRequest::new(CompositeBuf::from("bb")));
        queue.offer(WriteRequest::new(CompositeBuf::from("ccc")));
        assert_eq!(queue.pop_front().expect("队首存在").remaining(), 1);
        assert_eq!(queue.pop_front().expect("第二项存在").remaining(), 2);
        assert_eq!(queue.pop_front().expect("第三项存在").remaining(), 3);
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn partial_remainder_returns_to_head() {
        let queue = WriteQueue::new();
        queue.offer(WriteRequest::new(CompositeBuf::from("abcdef")));
        queue.offer(WriteRequest::new(CompositeBuf::from("xyz")));

        let head = queue.pop_front().expect("取队首");
        head.payload().advance(4).expect("模拟部分写入");
        queue.push_front(head);

        let resumed = queue.pop_front().expect("剩余段应回到队首");
        assert_eq!(resumed.payload().to_vec(), b"ef");
    }

    #[test]
    fn flush_claim_coalesces_concurrent_producers() {
        let queue = Arc::new(WriteQueue::new());
        let claims = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let producers: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let claims = Arc::clone(&claims);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        queue.offer(WriteRequest::new(CompositeBuf::from("x")));
                        if queue.try_claim_flush() {
                            claims.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("生产线程不应 panic");
        }
        // 未经复位时，冲刷登记只会被认领一次。
        assert_eq!(claims.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 400);
    }

    #[test]
    fn future_attached_after_completion_still_fires() {
        let request = WriteRequest::new(CompositeBuf::from("late"));
        request.complete_written();
        let future: WriteFuture = Arc::new(IoFuture::new());
        request.attach_future(Arc::clone(&future));
        assert!(future.is_done(), "迟到的 Future 必须被立即完成");
    }

    #[test]
    fn future_attached_before_completion_fires_on_write() {
        let request = WriteRequest::new(CompositeBuf::from("early"));
        let future: WriteFuture = Arc::new(IoFuture::new());
        request.attach_future(Arc::clone(&future));
        assert!(!future.is_done());
        request.complete_written();
        assert!(future.is_done());
    }
}
