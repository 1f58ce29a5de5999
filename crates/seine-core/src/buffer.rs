use std::collections::VecDeque;
use std::fmt;
use std::io::IoSlice;

use bytes::{Buf, Bytes};

use crate::error::{codes, SeineError};

/// `CompositeBuf` 是对一串字节切片的零拷贝只读视图。
///
/// # 设计背景（Why）
/// - 过滤链与写队列都以“消息”为单位搬运字节；消息可能由多段来源拼接
///   （解码器切片、TLS 记录、部分写入后的剩余段），逐段拷贝会在热路径
///   上产生不必要的分配。
/// - 以引用计数的 [`Bytes`] 段为底层存储，`push`、`advance`、`split_to`
///   都只移动段指针，不触碰字节本身。
///
/// # 逻辑解析（How）
/// - 内部维护 `VecDeque<Bytes>` 与缓存的剩余字节数；
/// - 读取遵循“观察-推进-拆分”三段式：`chunk` 暴露首段连续字节，
///   `advance` 丢弃已消费前缀，`split_to` 把前缀拆出为新的视图；
/// - `chunks_vectored` 把所有段填充为 `IoSlice`，供向量化套接字写使用。
///
/// # 契约说明（What）
/// - `advance(n)` / `split_to(n)` 要求 `n <= remaining()`，越界返回
///   [`codes::BUFFER_UNDERFLOW`] 错误且视图保持不变；
/// - 空段在 `push` 时被丢弃，因此 `chunk()` 返回空切片当且仅当
///   `remaining() == 0`。
///
/// # 设计取舍（Trade-offs）
/// - 放弃了 trait 对象化的缓冲抽象：单一具体类型让
///   `chunks_vectored` 免于装箱，也让部分写入的剩余段保留为队首语义。
pub struct CompositeBuf {
    segments: VecDeque<Bytes>,
    remaining: usize,
}

impl CompositeBuf {
    /// 创建空视图。
    pub fn new() -> Self {
        Self {
            segments: VecDeque::new(),
            remaining: 0,
        }
    }

    /// 以单个 [`Bytes`] 段构造视图，不发生拷贝。
    pub fn from_bytes(bytes: Bytes) -> Self {
        let mut buf = Self::new();
        buf.push(bytes);
        buf
    }

    /// 拷贝一份切片内容构造视图。
    ///
    /// 选择器循环把共享读缓冲中的本轮字节经由此入口转为自持有视图，
    /// 之后过滤器可以任意保留或克隆，不再受读缓冲复用的约束。
    pub fn copy_from_slice(data: &[u8]) -> Self {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// 追加一段字节，空段被忽略。
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.remaining += bytes.len();
        self.segments.push_back(bytes);
    }

    /// 剩余可读字节数。
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// 视图是否已读空。
    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// 返回当前可直接读取的首段连续字节。
    pub fn chunk(&self) -> &[u8] {
        self.segments.front().map(Bytes::as_ref).unwrap_or(&[])
    }

    /// 将读指针前移 `len` 字节，丢弃对应数据。
    pub fn advance(&mut self, len: usize) -> Result<(), SeineError> {
        if len > self.remaining {
            return Err(underflow(len, self.remaining));
        }
        let mut left = len;
        while left > 0 {
            let front = self
                .segments
                .front_mut()
                .expect("remaining 与段列表不一致");
            if front.len() > left {
                front.advance(left);
                left = 0;
            } else {
                left -= front.len();
                self.segments.pop_front();
            }
        }
        self.remaining -= len;
        Ok(())
    }

    /// 拆分出前 `len` 字节，返回新的视图；原视图保留其余部分。
    pub fn split_to(&mut self, len: usize) -> Result<CompositeBuf, SeineError> {
        if len > self.remaining {
            return Err(underflow(len, self.remaining));
        }
        let mut head = CompositeBuf::new();
        let mut left = len;
        while left > 0 {
            let front = self
                .segments
                .front_mut()
                .expect("remaining 与段列表不一致");
            if front.len() > left {
                head.push(front.split_to(left));
                left = 0;
            } else {
                left -= front.len();
                let segment = self.segments.pop_front().expect("front 已确认存在");
                head.push(segment);
            }
        }
        self.remaining -= len;
        Ok(head)
    }

    /// 把 `dst.len()` 字节拷贝进目标切片并推进读指针。
    pub fn copy_into_slice(&mut self, dst: &mut [u8]) -> Result<(), SeineError> {
        if dst.len() > self.remaining {
            return Err(underflow(dst.len(), self.remaining));
        }
        let mut copied = 0;
        while copied < dst.len() {
            let chunk = self.chunk();
            let take = chunk.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[..take]);
            copied += take;
            self.advance(take)?;
        }
        Ok(())
    }

    /// 将剩余内容快照为 `Vec<u8>`，不推进读指针。
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining);
        for segment in &self.segments {
            out.extend_from_slice(segment);
        }
        out
    }

    /// 把各段填充为 [`IoSlice`]，返回填充数量，供向量化写使用。
    pub fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for segment in &self.segments {
            if filled == dst.len() {
                break;
            }
            dst[filled] = IoSlice::new(segment);
            filled += 1;
        }
        filled
    }
}

fn underflow(requested: usize, remaining: usize) -> SeineError {
    SeineError::protocol(
        codes::BUFFER_UNDERFLOW,
        format!("requested {requested} bytes but only {remaining} remain"),
    )
}

impl Default for CompositeBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Bytes> for CompositeBuf {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for CompositeBuf {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(bytes))
    }
}

impl From<&[u8]> for CompositeBuf {
    fn from(data: &[u8]) -> Self {
        Self::copy_from_slice(data)
    }
}

impl From<&str> for CompositeBuf {
    fn from(data: &str) -> Self {
        Self::copy_from_slice(data.as_bytes())
    }
}

impl fmt::Debug for CompositeBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 刻意不打印内容，避免日志泄漏载荷。
        f.debug_struct("CompositeBuf")
            .field("segments", &self.segments.len())
            .field("remaining", &self.remaining)
            .finish()
    }
}
