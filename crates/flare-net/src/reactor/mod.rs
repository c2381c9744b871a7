//! 反应器：拥有就绪多路复用、驱动套接字读写、把回调派发到串行通道。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 套接字的系统调用集中在少数轮询线程上完成，应用线程只与缓冲和完成令牌打交道；
//! - 同一套分片逻辑既可以由专属线程驱动（[`ExecutionMode::Threaded`]），
//!   也可以由宿主程序在自己的循环里逐步驱动（[`ExecutionMode::Manual`]）。
//!
//! ## 逻辑（How）
//! - 每个分片（`shard::ShardCore`）独占一个 `mio::Poll`、一张令牌表和一块读暂存区；
//!   连接按 id 取模分配到分片，按 id 散列分配到回调通道；
//! - 其它线程对分片的一切请求都经由无锁命令队列加 `mio::Waker` 传递；
//! - 手动模式只有一个分片，回调进入单条内联队列，在 [`Reactor::poll_once`] 的末尾于调用线程上执行。
//!
//! ## 契约（What）
//! - `register_*` 对同一对象只能成功一次，重复注册返回 `AlreadyRegistered`；
//! - `deregister_endpoint` 幂等；
//! - `stop` 幂等：关闭所有已注册的连接与监听端，等待轮询线程退出并排空回调通道。

mod shard;
mod timer;

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flare_buffer::ChunkPool;
use mio::Token;
use parking_lot::Mutex;
use tracing::{debug, error, info};

pub(crate) use shard::{Command, ShardHandle};

use crate::config::FlareConfig;
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{FlareError, POLL, SPAWN, map_io_error};
use crate::lanes::{InlineLanes, LaneExecutor, SerialLanes, ThreadLanes, lane_for};
use crate::listener::Listener;
use shard::ShardCore;

/// 连接或监听端注册到反应器后获得的路由信息。
pub(crate) struct Binding {
    pub(crate) shard: Arc<ShardHandle>,
    pub(crate) lane: LaneExecutor,
    pub(crate) token: Token,
}

/// 谁来执行轮询步骤。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    /// 反应器自带轮询线程与回调线程池。
    Threaded,
    /// 宿主程序调用 [`Reactor::poll_once`]，回调在调用线程上执行。
    Manual,
}

/// 反应器句柄，可廉价克隆。
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<ReactorInner>,
}

pub(crate) struct ReactorInner {
    config: FlareConfig,
    mode: ExecutionMode,
    shards: Vec<Arc<ShardHandle>>,
    lanes: Arc<dyn SerialLanes>,
    inline: Option<Arc<InlineLanes>>,
    /// 尚未交给轮询线程的分片；手动模式下常驻于此。
    cores: Mutex<Vec<ShardCore>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    stopped: AtomicBool,
    pool: ChunkPool,
}

impl Reactor {
    /// 创建由专属线程驱动的反应器；回调线程立即启动，轮询线程在 [`Reactor::start`] 时启动。
    pub fn threaded(config: FlareConfig) -> Result<Reactor, FlareError> {
        Self::build(config, ExecutionMode::Threaded)
    }

    /// 创建手动驱动的单分片反应器。
    pub fn manual(config: FlareConfig) -> Result<Reactor, FlareError> {
        Self::build(config, ExecutionMode::Manual)
    }

    fn build(config: FlareConfig, mode: ExecutionMode) -> Result<Reactor, FlareError> {
        config.validate()?;
        let pool = ChunkPool::new(
            config.reactor.read_chunk_size,
            config.reactor.retired_chunk_limit,
        );
        let shard_count = match mode {
            ExecutionMode::Threaded => config.reactor.poll_threads,
            ExecutionMode::Manual => 1,
        };
        let mut cores = Vec::with_capacity(shard_count);
        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let (core, handle) = ShardCore::new(index, &config.reactor, pool.clone())
                .map_err(|err| map_io_error(POLL, err))?;
            cores.push(core);
            shards.push(handle);
        }
        let (lanes, inline): (Arc<dyn SerialLanes>, _) = match mode {
            ExecutionMode::Threaded => (
                Arc::new(ThreadLanes::spawn(config.reactor.callback_lanes, "flare")?),
                None,
            ),
            ExecutionMode::Manual => {
                let inline = Arc::new(InlineLanes::new(config.reactor.callback_lanes));
                (Arc::clone(&inline) as Arc<dyn SerialLanes>, Some(inline))
            }
        };

        let inner = Arc::new(ReactorInner {
            config,
            mode,
            shards,
            lanes,
            inline,
            cores: Mutex::new(cores),
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            pool,
        });
        let weak = Arc::downgrade(&inner);
        for core in inner.cores.lock().iter_mut() {
            core.attach_reactor(weak.clone());
        }
        info!(
            ?mode,
            shards = shard_count,
            lanes = inner.lanes.lane_count(),
            "reactor created"
        );
        Ok(Reactor { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ReactorInner>) -> Self {
        Self { inner }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.inner.mode
    }

    pub fn config(&self) -> &FlareConfig {
        &self.inner.config
    }

    /// 启动轮询；重复调用无副作用，停止后不可再启动。
    pub fn start(&self) -> Result<(), FlareError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(FlareError::state("start", "stopped"));
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.inner.mode == ExecutionMode::Threaded {
            let cores = mem::take(&mut *self.inner.cores.lock());
            let timeout = self.inner.config.reactor.poll_timeout();
            let mut threads = self.inner.threads.lock();
            for core in cores {
                let handle = thread::Builder::new()
                    .name(format!("flare-poll-{}", core.index()))
                    .spawn(move || shard::run(core, timeout))
                    .map_err(|err| map_io_error(SPAWN, err))?;
                threads.push(handle);
            }
        }
        info!(mode = ?self.inner.mode, "reactor started");
        Ok(())
    }

    /// 停止反应器：关闭所有已注册对象，等待轮询线程退出，排空回调。
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.running.store(false, Ordering::Release);
        info!(mode = ?self.inner.mode, "reactor stopping");
        self.inner.halt();
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// 手动模式下执行一轮：最多阻塞 `timeout` 等待就绪，然后在调用线程上执行排队的回调。
    ///
    /// 返回本轮处理的就绪事件数。
    pub fn poll_once(&self, timeout: Option<Duration>) -> Result<usize, FlareError> {
        let Some(inline) = &self.inner.inline else {
            return Err(FlareError::state("poll_once", "a threaded reactor"));
        };
        if !self.is_running() {
            return Err(FlareError::state("poll_once", "not running"));
        }
        let handled = {
            let mut cores = self.inner.cores.lock();
            let mut handled = 0;
            for (index, core) in cores.iter_mut().enumerate() {
                let timeout = if index == 0 { timeout } else { Some(Duration::ZERO) };
                handled += core.step(timeout).map_err(|err| map_io_error(POLL, err))?;
            }
            handled
        };
        inline.drain();
        Ok(handled)
    }

    /// 唤醒所有阻塞在 `select` 中的分片。
    pub fn wake(&self) {
        for shard in &self.inner.shards {
            shard.wake();
        }
    }

    /// 注册连接。连接可以处于未连接、连接中或已连接状态。
    pub fn register_endpoint(&self, endpoint: &Endpoint) -> Result<(), FlareError> {
        self.ensure_accepting()?;
        let inner = &endpoint.inner;
        if inner.state().is_closing_or_closed() {
            return Err(FlareError::Closed);
        }
        let shard = self.inner.shard_for(inner.id);
        self.inner.bind(&inner.binding, "endpoint", inner.id, shard)?;
        self.inner.shards[shard].send(Command::AttachEndpoint(Arc::clone(inner)));
        debug!(id = %inner.id, shard, "endpoint registration queued");
        Ok(())
    }

    /// 把连接移出就绪集合；连接本身保持打开，重复调用无副作用。
    pub fn deregister_endpoint(&self, endpoint: &Endpoint) {
        if let Some(binding) = endpoint.inner.binding.get() {
            binding.shard.send(Command::Detach(binding.token));
        }
    }

    pub fn register_listener(&self, listener: &Listener) -> Result<(), FlareError> {
        self.ensure_accepting()?;
        let inner = &listener.inner;
        if !inner.is_open() {
            return Err(FlareError::Closed);
        }
        let shard = self.inner.shard_for(inner.id);
        self.inner.bind(&inner.binding, "listener", inner.id, shard)?;
        self.inner.shards[shard].send(Command::AttachListener(Arc::clone(inner)));
        debug!(id = %inner.id, shard, "listener registration queued");
        Ok(())
    }

    /// 该连接的回调所在的串行通道；注册前后结果一致。
    pub fn executor_for(&self, endpoint: &Endpoint) -> LaneExecutor {
        endpoint.executor().unwrap_or_else(|| {
            let lanes = Arc::clone(&self.inner.lanes);
            let lane = lane_for(endpoint.id().get(), lanes.lane_count());
            LaneExecutor::new(lanes, lane)
        })
    }

    /// 创建并注册一个 TCP 客户端；调用方随后设置回调并 `connect`。
    pub fn create_tcp_client(&self, host: &str, port: u16) -> Result<Endpoint, FlareError> {
        let endpoint = Endpoint::tcp_with_config(host, port, &self.inner.config.endpoint)?;
        self.register_endpoint(&endpoint)?;
        Ok(endpoint)
    }

    /// 接管一条已建立的标准库 TCP 流并注册。
    pub fn adopt_tcp_stream(&self, stream: std::net::TcpStream) -> Result<Endpoint, FlareError> {
        let endpoint = Endpoint::from_std_stream(stream, &self.inner.config.endpoint)?;
        self.register_endpoint(&endpoint)?;
        Ok(endpoint)
    }

    /// 以反应器的连接配置绑定 TCP 监听端；设置接受回调后调用 [`Listener::start`]。
    pub fn create_tcp_listener(&self, host: &str, port: u16) -> Result<Listener, FlareError> {
        Listener::bind_tcp_with(host, port, 128, &self.inner.config.endpoint)
    }

    /// 以反应器的连接配置绑定 UDP 监听端；设置接受回调后调用 [`Listener::start`]。
    pub fn create_udp_listener(&self, host: &str, port: u16) -> Result<Listener, FlareError> {
        Listener::bind_udp_with(host, port, &self.inner.config.endpoint)
    }

    /// 已注册且仍存活的连接数，在每轮轮询结束时更新。
    pub fn endpoint_count(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.endpoint_count())
            .sum()
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|shard| shard.listener_count())
            .sum()
    }

    /// 读缓冲块池的统计信息。
    pub fn buffer_stats(&self) -> flare_buffer::PoolStats {
        self.inner.pool.statistics()
    }

    fn ensure_accepting(&self) -> Result<(), FlareError> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(FlareError::state("register", "stopped"));
        }
        Ok(())
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("mode", &self.inner.mode)
            .field("shards", &self.inner.shards.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ReactorInner {
    fn shard_for(&self, id: EndpointId) -> usize {
        (id.get() % self.shards.len() as u64) as usize
    }

    /// 为对象分配分片与回调通道；同一对象只能绑定一次。
    pub(crate) fn bind(
        &self,
        slot: &OnceLock<Binding>,
        kind: &'static str,
        id: EndpointId,
        shard: usize,
    ) -> Result<(), FlareError> {
        let lane = lane_for(id.get(), self.lanes.lane_count());
        let binding = Binding {
            shard: Arc::clone(&self.shards[shard]),
            lane: LaneExecutor::new(Arc::clone(&self.lanes), lane),
            token: id.token(),
        };
        slot.set(binding).map_err(|_| FlareError::AlreadyRegistered {
            kind,
            id: id.get(),
        })
    }

    fn halt(&self) {
        for shard in &self.shards {
            shard.stopping.store(true, Ordering::Release);
            shard.wake();
        }
        let mut cores = mem::take(&mut *self.cores.lock());
        for core in &mut cores {
            core.shutdown();
        }
        drop(cores);

        let threads = mem::take(&mut *self.threads.lock());
        let current = thread::current().id();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("poll thread exited abnormally");
            }
        }
        self.lanes.shutdown();
        info!(mode = ?self.mode, "reactor stopped");
    }
}

impl Drop for ReactorInner {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.halt();
        }
    }
}
