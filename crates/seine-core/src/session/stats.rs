use std::sync::atomic::{AtomicU64, Ordering};

/// 会话基础统计。
///
/// 计数单调递增并以原子写更新；读取端允许轻微滞后，换取读写路径上
/// 零锁开销。时间戳为 [`crate::clock::now_millis`] 刻度。
#[derive(Debug, Default)]
pub struct SessionStats {
    read_bytes: AtomicU64,
    written_bytes: AtomicU64,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
}

impl SessionStats {
    /// 创建零值统计。
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次读取。
    pub fn record_read(&self, bytes: u64, now_ms: u64) {
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_read_ms.store(now_ms, Ordering::Relaxed);
    }

    /// 记录一次写入（以实际进入内核的字节数计）。
    pub fn record_written(&self, bytes: u64, now_ms: u64) {
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_write_ms.store(now_ms, Ordering::Relaxed);
    }

    /// 会话累计读取字节数。
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    /// 会话累计写入字节数。
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    /// 最近一次读取的时间戳。
    pub fn last_read_ms(&self) -> u64 {
        self.last_read_ms.load(Ordering::Relaxed)
    }

    /// 最近一次写入的时间戳。
    pub fn last_write_ms(&self) -> u64 {
        self.last_write_ms.load(Ordering::Relaxed)
    }

    /// 最近一次任意方向 I/O 的时间戳。
    pub fn last_io_ms(&self) -> u64 {
        self.last_read_ms().max(self.last_write_ms())
    }
}
