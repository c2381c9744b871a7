#![doc = r#"
# flare-buffer

## 设计动机（Why）
- 反应器读路径需要把内核交付的字节以“片段”形式交给应用，而不是每次拷贝进一块连续缓冲；
- 应用侧解析时又希望把多个片段当作一条逻辑字节流来消费；
- 读路径的临时内存需要复用，避免每次 `read` 都向分配器申请新块。

## 核心构成（How）
- [`ByteSpanAggregate`]：不可变字节片段的有序队列，提供逻辑连续的读取视图并实现 [`bytes::Buf`]；
- [`ChunkPool`]：按固定块大小分配与回收 `BytesMut` 的读缓冲块池，带原子统计；
- [`ReadScratch`]：单线程持有的读暂存区，从块池取块、切分出只读片段，低于下限时换新块。

## 契约（What）
- 片段一旦入队即不可变，多个 `Bytes` 句柄可安全共享同一块底层内存；
- `ByteSpanAggregate::take_all` 原子地转移全部内容并清空自身，是“消费并复制”语义的唯一入口；
- 所有长度校验失败以 [`BufferError`] 返回，而不是 panic（`Buf` trait 约定的方法除外）。
"#]

mod aggregate;
mod error;
mod pool;
mod scratch;

pub use aggregate::ByteSpanAggregate;
pub use error::BufferError;
pub use pool::{ChunkPool, PoolStats};
pub use scratch::ReadScratch;
