//! 串行回调通道。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同一连接的读回调、关闭回调必须按调度顺序、互不重叠地执行；不同连接之间则应尽量并行；
//! - 用户回调可能阻塞或 panic，绝不能在轮询线程上直接执行。
//!
//! ## 逻辑（How）
//! - [`ThreadLanes`]：固定数量的工作线程，每个线程独占一条无锁队列（`crossbeam_queue::SegQueue`），
//!   连接按 id 散列到某一条通道，因此同一连接的任务天然串行；
//! - [`InlineLanes`]：手动驱动模式下的单队列实现，由 `Reactor::poll_once` 在调用线程上排空；
//! - 任务以 `catch_unwind` 包裹，panic 只记录日志，不影响通道继续服务。
//!
//! ## 契约（What）
//! - 同一通道上的任务按提交顺序执行，且不会并发；
//! - 关闭通道后仍会排空已提交的任务再退出。

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, Thread};
use std::time::Duration;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{FlareError, SPAWN, map_io_error};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

const PARK_TIMEOUT: Duration = Duration::from_millis(50);

/// 一组可按下标寻址的串行通道。
pub(crate) trait SerialLanes: Send + Sync {
    fn lane_count(&self) -> usize;
    fn submit(&self, lane: usize, task: Task);
    fn shutdown(&self);
}

/// 把 id 均匀散列到 `count` 条通道之一。
pub(crate) fn lane_for(id: u64, count: usize) -> usize {
    let mixed = id.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32;
    (mixed as usize) % count.max(1)
}

/// 绑定到某一条通道的执行器句柄。
///
/// 同一连接的所有回调都经由同一个 `LaneExecutor` 调度，应用也可以借它把自己的任务
/// 与该连接的回调串行化。
#[derive(Clone)]
pub struct LaneExecutor {
    lanes: Arc<dyn SerialLanes>,
    lane: usize,
}

impl LaneExecutor {
    pub(crate) fn new(lanes: Arc<dyn SerialLanes>, lane: usize) -> Self {
        Self { lanes, lane }
    }

    /// 在该通道上排队执行 `task`。
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lanes.submit(self.lane, Box::new(task));
    }

    pub fn lane(&self) -> usize {
        self.lane
    }
}

impl fmt::Debug for LaneExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaneExecutor")
            .field("lane", &self.lane)
            .field("lanes", &self.lanes.lane_count())
            .finish()
    }
}

struct Lane {
    queue: SegQueue<Task>,
    stopping: AtomicBool,
    thread: OnceLock<Thread>,
}

/// 每条通道一个工作线程的实现。
pub(crate) struct ThreadLanes {
    lanes: Vec<Arc<Lane>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadLanes {
    pub(crate) fn spawn(count: usize, name_prefix: &str) -> Result<Self, FlareError> {
        let mut lanes = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count.max(1) {
            let lane = Arc::new(Lane {
                queue: SegQueue::new(),
                stopping: AtomicBool::new(false),
                thread: OnceLock::new(),
            });
            let worker = Arc::clone(&lane);
            let handle = thread::Builder::new()
                .name(format!("{name_prefix}-lane-{index}"))
                .spawn(move || run_lane(worker))
                .map_err(|err| map_io_error(SPAWN, err))?;
            let _ = lane.thread.set(handle.thread().clone());
            lanes.push(lane);
            handles.push(handle);
        }
        Ok(Self {
            lanes,
            handles: Mutex::new(handles),
        })
    }
}

impl SerialLanes for ThreadLanes {
    fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    fn submit(&self, lane: usize, task: Task) {
        let lane = &self.lanes[lane % self.lanes.len()];
        lane.queue.push(task);
        if let Some(thread) = lane.thread.get() {
            thread.unpark();
        }
    }

    fn shutdown(&self) {
        for lane in &self.lanes {
            lane.stopping.store(true, Ordering::Release);
            if let Some(thread) = lane.thread.get() {
                thread.unpark();
            }
        }
        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("callback lane exited abnormally");
            }
        }
    }
}

fn run_lane(lane: Arc<Lane>) {
    loop {
        while let Some(task) = lane.queue.pop() {
            run_task(task);
        }
        if lane.stopping.load(Ordering::Acquire) && lane.queue.is_empty() {
            break;
        }
        thread::park_timeout(PARK_TIMEOUT);
    }
    debug!("callback lane stopped");
}

/// 执行一个任务；panic 被记录后吞掉。
pub(crate) fn run_task(task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        error!(panic = %panic_message(payload.as_ref()), "callback panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// 手动驱动模式：所有通道共享一条队列，由驱动线程排空。
pub(crate) struct InlineLanes {
    lanes: usize,
    queue: SegQueue<Task>,
}

impl InlineLanes {
    pub(crate) fn new(lanes: usize) -> Self {
        Self {
            lanes: lanes.max(1),
            queue: SegQueue::new(),
        }
    }

    /// 排空队列，包括执行过程中新提交的任务；返回执行的任务数。
    pub(crate) fn drain(&self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.queue.pop() {
            run_task(task);
            executed += 1;
        }
        executed
    }
}

impl SerialLanes for InlineLanes {
    fn lane_count(&self) -> usize {
        self.lanes
    }

    fn submit(&self, _lane: usize, task: Task) {
        self.queue.push(task);
    }

    fn shutdown(&self) {
        self.drain();
    }
}
