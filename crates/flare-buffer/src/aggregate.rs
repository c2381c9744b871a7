use std::collections::VecDeque;
use std::fmt;
use std::io::IoSlice;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::BufferError;

/// `ByteSpanAggregate` 把一组不可变字节片段组织成一条逻辑连续的字节流。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 反应器每次读就绪最多交付一个片段，应用侧却常常需要跨片段解析帧头或行；
/// - 通过共享 `Bytes` 句柄而非拷贝，读路径与应用之间的数据交接保持零拷贝。
///
/// ## 逻辑（How）
/// - 内部以 `VecDeque<Bytes>` 保存片段，并缓存剩余总长度，`len()` 为 O(1)；
/// - 读取时从队首片段切分：若单个片段足够长则直接 `split_to`，否则才拼接为新的 `Bytes`；
/// - 空片段在入队时被丢弃，保证队列中每个片段都至少有一个字节。
///
/// ## 契约（What）
/// - `len()` 始终等于所有片段长度之和；
/// - `take_all()` 返回当前全部内容并把自身置空，调用者独占返回值；
/// - 读取类方法失败时不修改聚合状态。
///
/// ## 注意事项（Trade-offs）
/// - `index_of` 为朴素匹配，适合行分隔符等短模式；长模式请先 `copy_to_vec`。
#[derive(Clone, Default)]
pub struct ByteSpanAggregate {
    spans: VecDeque<Bytes>,
    remaining: usize,
}

impl ByteSpanAggregate {
    /// 创建空聚合。
    pub fn new() -> Self {
        Self::default()
    }

    /// 以单个片段初始化。
    pub fn from_span(span: impl Into<Bytes>) -> Self {
        let mut aggregate = Self::new();
        aggregate.push(span.into());
        aggregate
    }

    /// 在尾部追加一个片段；空片段直接忽略。
    pub fn push(&mut self, span: Bytes) {
        if span.is_empty() {
            return;
        }
        self.remaining += span.len();
        self.spans.push_back(span);
    }

    /// 将 `other` 的全部片段按序移入自身尾部，`other` 随后为空。
    pub fn append(&mut self, other: &mut ByteSpanAggregate) {
        self.remaining += other.remaining;
        self.spans.append(&mut other.spans);
        other.remaining = 0;
    }

    /// 剩余可读字节总数。
    pub fn len(&self) -> usize {
        self.remaining
    }

    pub fn is_empty(&self) -> bool {
        self.remaining == 0
    }

    /// 当前持有的片段数量。
    pub fn span_count(&self) -> usize {
        self.spans.len()
    }

    /// 按序遍历片段，不消费。
    pub fn spans(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.spans.iter()
    }

    /// 消费并复制：转移全部内容，自身变为空。
    pub fn take_all(&mut self) -> ByteSpanAggregate {
        std::mem::take(self)
    }

    /// 丢弃前 `n` 个字节。
    pub fn discard(&mut self, n: usize) -> Result<(), BufferError> {
        self.ensure(n)?;
        self.advance(n);
        Ok(())
    }

    /// 取出前 `n` 个字节作为一个连续的 `Bytes`。
    ///
    /// 若前 `n` 个字节完全落在队首片段内，返回值与原片段共享内存；否则拼接一次。
    pub fn pull_bytes(&mut self, n: usize) -> Result<Bytes, BufferError> {
        self.ensure(n)?;
        if n == 0 {
            return Ok(Bytes::new());
        }

        if let Some(front) = self.spans.front_mut() {
            if front.len() >= n {
                let out = front.split_to(n);
                if front.is_empty() {
                    self.spans.pop_front();
                }
                self.remaining -= n;
                return Ok(out);
            }
        }

        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            let Some(front) = self.spans.front_mut() else {
                break;
            };
            let take = (n - out.len()).min(front.len());
            out.extend_from_slice(&front[..take]);
            front.advance(take);
            if front.is_empty() {
                self.spans.pop_front();
            }
        }
        self.remaining -= n;
        Ok(out.freeze())
    }

    /// 以 UTF-8 解码并消费前 `n` 个字节；解码失败时不消费。
    pub fn get_as_string(&mut self, n: usize) -> Result<String, BufferError> {
        self.ensure(n)?;
        let raw: Vec<u8> = self.bytes_from(0).take(n).collect();
        let text = String::from_utf8(raw).map_err(|_| BufferError::InvalidUtf8 { len: n })?;
        self.advance(n);
        Ok(text)
    }

    /// 读取逻辑偏移 `index` 处的字节，不消费。
    pub fn peek(&self, index: usize) -> Option<u8> {
        if index >= self.remaining {
            return None;
        }
        self.bytes_from(index).next()
    }

    /// 查找 `pattern` 首次出现的逻辑偏移。空模式匹配偏移 0。
    pub fn index_of(&self, pattern: &[u8]) -> Option<usize> {
        if pattern.is_empty() {
            return Some(0);
        }
        if pattern.len() > self.remaining {
            return None;
        }
        (0..=self.remaining - pattern.len()).find(|&start| {
            self.bytes_from(start)
                .take(pattern.len())
                .eq(pattern.iter().copied())
        })
    }

    /// 拷贝出全部内容，不消费。
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining);
        for span in &self.spans {
            out.extend_from_slice(span);
        }
        out
    }

    fn ensure(&self, requested: usize) -> Result<(), BufferError> {
        if requested > self.remaining {
            return Err(BufferError::Underflow {
                requested,
                remaining: self.remaining,
            });
        }
        Ok(())
    }

    fn bytes_from(&self, mut start: usize) -> impl Iterator<Item = u8> + '_ {
        self.spans
            .iter()
            .filter_map(move |span| {
                if start >= span.len() {
                    start -= span.len();
                    None
                } else {
                    let tail = &span[start..];
                    start = 0;
                    Some(tail)
                }
            })
            .flat_map(|tail| tail.iter().copied())
    }
}

impl Buf for ByteSpanAggregate {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        self.spans.front().map(|span| span.as_ref()).unwrap_or(&[])
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for (slot, span) in dst.iter_mut().zip(self.spans.iter()) {
            *slot = IoSlice::new(span);
            filled += 1;
        }
        filled
    }

    fn advance(&mut self, mut cnt: usize) {
        assert!(
            cnt <= self.remaining,
            "cannot advance past the end of the aggregate: {cnt} > {}",
            self.remaining
        );
        self.remaining -= cnt;
        while cnt > 0 {
            let Some(front) = self.spans.front_mut() else {
                break;
            };
            if front.len() > cnt {
                front.advance(cnt);
                break;
            }
            cnt -= front.len();
            self.spans.pop_front();
        }
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        match self.pull_bytes(len) {
            Ok(bytes) => bytes,
            Err(err) => panic!("{err}"),
        }
    }
}

impl fmt::Debug for ByteSpanAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSpanAggregate")
            .field("len", &self.remaining)
            .field("spans", &self.spans.len())
            .finish()
    }
}

impl From<Bytes> for ByteSpanAggregate {
    fn from(span: Bytes) -> Self {
        Self::from_span(span)
    }
}

impl From<Vec<u8>> for ByteSpanAggregate {
    fn from(data: Vec<u8>) -> Self {
        Self::from_span(data)
    }
}

impl From<&'static str> for ByteSpanAggregate {
    fn from(text: &'static str) -> Self {
        Self::from_span(text)
    }
}

impl Extend<Bytes> for ByteSpanAggregate {
    fn extend<I: IntoIterator<Item = Bytes>>(&mut self, iter: I) {
        for span in iter {
            self.push(span);
        }
    }
}

impl FromIterator<Bytes> for ByteSpanAggregate {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        let mut aggregate = Self::new();
        aggregate.extend(iter);
        aggregate
    }
}
