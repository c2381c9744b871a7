use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;
use parking_lot::Mutex;

/// `ChunkPool` 为反应器读路径提供固定大小的读缓冲块，并回收已被切分完的残块。
///
/// # 模块角色（Why）
/// - 读暂存区每次 `read` 后把已填充部分切分为只读 `Bytes` 交给应用，剩余空间不足时需要换块；
/// - 旧块的内存仍被应用持有的片段引用，只有这些片段全部释放后才能整体复用；
/// - 块池把“等待释放的旧块”挂在退休队列上，下次取块时尝试无分配地回收。
///
/// # 核心机制（How）
/// - `retired` 队列保存退休块；`acquire` 依次对其 `clear()` 后调用 `try_reclaim`，
///   成功即说明所有片段已释放，可原地复用整块内存；
/// - 退休队列超过 `retired_limit` 时丢弃最旧的块，内存随最后一个片段释放而归还分配器；
/// - `PoolMetrics` 以原子计数记录新分配、复用、丢弃次数，支撑 `statistics` 快照。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态由 `parking_lot::Mutex` 与原子计数保护，可跨线程克隆使用；
/// - **后置条件**：`acquire` 返回长度恰为 `chunk_size` 的零填充缓冲；
/// - `retire` 接收任意残块，调用后调用方不得再持有该 `BytesMut`。
///
/// # 设计权衡（Trade-offs）
/// - 回收检测是线性扫描，退休队列通常很短，扫描成本远低于一次大块分配；
/// - `shrink_to_fit` 直接清空退休队列，便于压测后快速归还峰值内存。
#[derive(Clone)]
pub struct ChunkPool {
    inner: Arc<PoolInner>,
}

/// 块池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub chunk_size: usize,
    pub chunks_allocated: u64,
    pub chunks_recycled: u64,
    pub chunks_discarded: u64,
    pub retired_chunks: usize,
}

impl ChunkPool {
    /// 创建块池。`chunk_size` 为 0 时按 1 处理。
    pub fn new(chunk_size: usize, retired_limit: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                chunk_size: chunk_size.max(1),
                retired_limit,
                retired: Mutex::new(VecDeque::new()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// 取一个完整大小的读缓冲块，优先复用退休块。
    pub fn acquire(&self) -> BytesMut {
        let chunk_size = self.inner.chunk_size;
        if let Some(mut chunk) = self.inner.reclaim_retired() {
            chunk.resize(chunk_size, 0);
            self.inner
                .metrics
                .chunks_recycled
                .fetch_add(1, Ordering::Relaxed);
            return chunk;
        }
        self.inner
            .metrics
            .chunks_allocated
            .fetch_add(1, Ordering::Relaxed);
        BytesMut::zeroed(chunk_size)
    }

    /// 归还一个残块，待其片段全部释放后复用。
    pub fn retire(&self, chunk: BytesMut) {
        if chunk.capacity() == 0 {
            return;
        }
        let mut retired = self.inner.retired.lock();
        retired.push_back(chunk);
        while retired.len() > self.inner.retired_limit {
            retired.pop_front();
            self.inner
                .metrics
                .chunks_discarded
                .fetch_add(1, Ordering::Relaxed);
        }
        self.inner
            .metrics
            .retired_chunks
            .store(retired.len(), Ordering::Relaxed);
    }

    /// 清空退休队列，返回被丢弃的块数。
    pub fn shrink_to_fit(&self) -> usize {
        let mut retired = self.inner.retired.lock();
        let dropped = retired.len();
        retired.clear();
        self.inner.metrics.retired_chunks.store(0, Ordering::Relaxed);
        dropped
    }

    pub fn statistics(&self) -> PoolStats {
        let metrics = &self.inner.metrics;
        PoolStats {
            chunk_size: self.inner.chunk_size,
            chunks_allocated: metrics.chunks_allocated.load(Ordering::Relaxed),
            chunks_recycled: metrics.chunks_recycled.load(Ordering::Relaxed),
            chunks_discarded: metrics.chunks_discarded.load(Ordering::Relaxed),
            retired_chunks: metrics.retired_chunks.load(Ordering::Relaxed),
        }
    }
}

struct PoolInner {
    chunk_size: usize,
    retired_limit: usize,
    retired: Mutex<VecDeque<BytesMut>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    /// 找到第一个已无外部引用的退休块并取出。
    fn reclaim_retired(&self) -> Option<BytesMut> {
        let mut retired = self.retired.lock();
        let index = retired.iter_mut().position(|chunk| {
            chunk.clear();
            chunk.try_reclaim(self.chunk_size)
        })?;
        let chunk = retired.remove(index);
        self.metrics
            .retired_chunks
            .store(retired.len(), Ordering::Relaxed);
        chunk
    }
}

#[derive(Default)]
struct PoolMetrics {
    chunks_allocated: AtomicU64,
    chunks_recycled: AtomicU64,
    chunks_discarded: AtomicU64,
    retired_chunks: AtomicUsize,
}
