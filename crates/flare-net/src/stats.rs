use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::FlareError;

/// 单条连接的字节计数。
///
/// # 契约（What）
/// - 计数只增不减：`record_read`/`record_written` 拒绝负增量并返回 `InvalidArgument`；
/// - 速率以“自创建以来的平均字节每秒”给出，创建后不足 1 毫秒时按 1 毫秒计。
#[derive(Debug)]
pub struct ByteStats {
    read: AtomicU64,
    written: AtomicU64,
    started: Instant,
}

impl Default for ByteStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteStats {
    pub fn new() -> Self {
        Self {
            read: AtomicU64::new(0),
            written: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn record_read(&self, delta: i64) -> Result<(), FlareError> {
        let delta = non_negative("read_delta", delta)?;
        self.read.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    pub fn record_written(&self, delta: i64) -> Result<(), FlareError> {
        let delta = non_negative("written_delta", delta)?;
        self.written.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn add_read(&self, n: usize) {
        self.read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn total_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    pub fn total_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// 平均读取速率（字节/秒）。
    pub fn read_rate(&self) -> f64 {
        self.total_read() as f64 / self.elapsed_secs()
    }

    /// 平均写入速率（字节/秒）。
    pub fn write_rate(&self) -> f64 {
        self.total_written() as f64 / self.elapsed_secs()
    }

    fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64().max(0.001)
    }
}

fn non_negative(name: &'static str, delta: i64) -> Result<u64, FlareError> {
    u64::try_from(delta).map_err(|_| FlareError::InvalidArgument {
        name,
        message: format!("byte counts only grow, got {delta}"),
    })
}
