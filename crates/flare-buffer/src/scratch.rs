use std::io;

use bytes::{Bytes, BytesMut};

use crate::pool::ChunkPool;

/// 单个轮询线程独占的读暂存区。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 每次读就绪都需要一块可写内存；复用同一块的剩余空间可以把多次小读合并到一次分配里；
/// - 读出的数据被切分为独立的 `Bytes` 片段交给连接，暂存区随即继续使用剩余空间。
///
/// ## 逻辑（How）
/// - `current` 是当前块尚未使用的尾部；`fill` 前若其长度低于 `floor`，
///   便把残块退还给 [`ChunkPool`] 并换一块新块；
/// - 读取闭包直接写入 `current`，成功后 `split_to(n)` 产出共享底层内存的只读片段；
/// - `copy_out` 为真时改为拷贝出精确长度的新 `Bytes`，暂存区空间原地复用，
///   适合连接希望尽快释放大块内存的场景。
///
/// ## 契约（What）
/// - 不是 `Sync`，不得在线程间共享；每个轮询线程各持有一个；
/// - `fill` 返回空 `Bytes` 表示读取闭包返回了 0 字节（对 TCP 即 EOF）。
pub struct ReadScratch {
    pool: ChunkPool,
    floor: usize,
    current: BytesMut,
}

impl ReadScratch {
    pub fn new(pool: ChunkPool, floor: usize) -> Self {
        Self {
            pool,
            floor: floor.max(1),
            current: BytesMut::new(),
        }
    }

    /// 当前块剩余的可写字节数。
    pub fn available(&self) -> usize {
        self.current.len()
    }

    /// 执行一次读取。
    ///
    /// - `min_len`：本次读取至少需要的连续空间，例如数据报的最大帧长；
    /// - `copy_out`：是否把结果拷贝成独立分配；
    /// - `read`：向给定缓冲写入数据并返回写入长度与附带值（如数据报来源地址）。
    pub fn fill<T, F>(&mut self, min_len: usize, copy_out: bool, read: F) -> io::Result<(Bytes, T)>
    where
        F: FnOnce(&mut [u8]) -> io::Result<(usize, T)>,
    {
        self.ensure(min_len);
        let (n, extra) = read(&mut self.current[..])?;
        let n = n.min(self.current.len());
        if n == 0 {
            return Ok((Bytes::new(), extra));
        }
        let span = if copy_out {
            Bytes::copy_from_slice(&self.current[..n])
        } else {
            self.current.split_to(n).freeze()
        };
        Ok((span, extra))
    }

    fn ensure(&mut self, min_len: usize) {
        let needed = self.floor.max(min_len).min(self.pool.chunk_size());
        if self.current.len() >= needed {
            return;
        }
        let retired = std::mem::replace(&mut self.current, self.pool.acquire());
        self.pool.retire(retired);
    }
}
