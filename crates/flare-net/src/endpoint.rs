use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Write};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use flare_buffer::ByteSpanAggregate;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::SockRef;
use tracing::{debug, info, trace, warn};

use crate::completion::Completion;
use crate::config::EndpointConfig;
use crate::error::{
    ACCEPT, CONNECT, FlareError, RESOLVE, WRITE, connection_error, map_io_error,
};
use crate::filter::{FilterInfo, FilterOutput, FilterSlot, HandshakeState, StreamFilter};
use crate::lanes::LaneExecutor;
use crate::lifecycle::{CloseReason, Lifecycle};
use crate::listener::ListenerInner;
use crate::options::{SocketOption, SocketOptions, apply_option};
use crate::reactor::{Binding, Command};
use crate::stats::ByteStats;

/// 读回调：读聚合由空变为非空时在该连接的回调通道上调用。
pub type ReadCallback = Arc<dyn Fn(&Endpoint) + Send + Sync + 'static>;
/// 关闭回调：连接进入 `Closed` 后调用一次。
pub type CloseCallback = Arc<dyn Fn(&Endpoint, &CloseReason) + Send + Sync + 'static>;

const MAX_IOV: usize = 64;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// 连接与监听端共享的标识，同时用作选择器令牌。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub(crate) fn fresh() -> Self {
        Self(next_id())
    }

    pub fn get(self) -> u64 {
        self.0
    }

    pub(crate) fn token(self) -> Token {
        Token(self.0 as usize)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 传输协议标签。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WireProtocol {
    Tcp,
    Udp,
}

/// 一条双向字节流连接（TCP），或监听端上某个远端地址对应的数据报会话（UDP）。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 应用通过回调与缓冲和连接交互，不直接接触套接字：读就绪由反应器搬进读聚合，
///   写入排进写队列后由反应器在可写时冲刷；
/// - 同一连接的所有回调在同一条串行通道上执行，应用无需为单连接状态加锁。
///
/// ## 逻辑（How）
/// - `Endpoint` 是 `Arc<EndpointInner>` 的廉价句柄；反应器的令牌表只持有弱引用，
///   应用丢弃全部句柄即等价于放弃该连接；
/// - 内部按关注点拆成若干把锁：`status`（生命周期与回调）、`read`（读聚合）、
///   `write`（写队列）、`filter`（TLS 等变换器）、`io`（套接字本体）。
///   锁顺序固定为 `filter → write → io`，`status` 与 `read` 从不与其它锁嵌套持有；
/// - 回调永远在锁外执行。
///
/// ## 契约（What）
/// - 读聚合由空变为非空时调度一次读回调；聚合非空期间到达的字节只追加、不再触发，
///   读回调应通过 [`Endpoint::take_read`] 一次取走全部数据；
/// - 读聚合达到上限后反应器停止从套接字读取，直到应用取走数据；
/// - 写入按提交顺序上线，完成令牌按 FIFO 顺序完成；关闭时尚未写出的写入以 `Closed` 失败；
/// - 关闭恰好发生一次：关闭前已调度的读回调先于关闭回调执行。
///
/// ## 注意事项（Trade-offs）
/// - 写路径不做背压：`write_buffer_len` 供应用自查，反应器不会拒绝写入；
/// - `connect` 之前提交的写入会在连接建立后按序冲刷。
#[derive(Clone)]
pub struct Endpoint {
    pub(crate) inner: Arc<EndpointInner>,
}

pub(crate) struct EndpointInner {
    pub(crate) id: EndpointId,
    protocol: WireProtocol,
    created_at: Instant,
    peer: Option<SocketAddr>,
    local: Mutex<Option<SocketAddr>>,
    pub(crate) io: Mutex<Transport>,
    status: Mutex<Status>,
    read: Mutex<ReadSide>,
    write: Mutex<WriteSide>,
    filter: Mutex<Option<FilterSlot>>,
    stats: ByteStats,
    native_buffers: AtomicBool,
    pub(crate) binding: OnceLock<Binding>,
}

pub(crate) enum Transport {
    /// 尚未发起连接。
    Idle,
    Tcp(mio::net::TcpStream),
    /// UDP 会话经由监听端的套接字收发。
    Udp(Weak<ListenerInner>),
    Released,
}

struct Status {
    lifecycle: Lifecycle,
    reader: Option<ReadCallback>,
    closer: Option<CloseCallback>,
    close_reason: Option<CloseReason>,
    connect: Option<Completion<()>>,
    connect_timeout: Duration,
    options: SocketOptions,
}

struct ReadSide {
    aggregate: ByteSpanAggregate,
    max: usize,
    paused: bool,
}

struct WriteSide {
    queue: VecDeque<PendingWrite>,
    queued_bytes: usize,
    closed: bool,
}

struct PendingWrite {
    data: ByteSpanAggregate,
    token: Option<Completion<()>>,
}

impl WriteSide {
    /// 记账 `n` 个已写出的字节，把写完的请求令牌移入 `completed`。
    fn consume(&mut self, mut n: usize, completed: &mut Vec<Completion<()>>) {
        self.queued_bytes = self.queued_bytes.saturating_sub(n);
        while n > 0 {
            let Some(front) = self.queue.front_mut() else {
                break;
            };
            let take = n.min(front.data.len());
            front.data.advance(take);
            n -= take;
            if front.data.is_empty() {
                self.pop_finished(completed);
            }
        }
    }

    fn pop_finished(&mut self, completed: &mut Vec<Completion<()>>) {
        if let Some(done) = self.queue.pop_front() {
            completed.extend(done.token);
        }
    }

    /// 弹出队首所有零长度请求（例如变换器没有产出字节的写入）。
    fn drop_empty_front(&mut self, completed: &mut Vec<Completion<()>>) {
        while self.queue.front().is_some_and(|front| front.data.is_empty()) {
            self.pop_finished(completed);
        }
    }
}

/// 非阻塞连接的探测结果。
pub(crate) enum ConnectPoll {
    Pending,
    Connected,
    Failed(io::Error),
}

impl Endpoint {
    /// 以默认配置创建指向 `host:port` 的 TCP 客户端，尚未连接也未注册。
    pub fn tcp(host: &str, port: u16) -> Result<Endpoint, FlareError> {
        Self::tcp_with_config(host, port, &EndpointConfig::default())
    }

    pub fn tcp_with_config(
        host: &str,
        port: u16,
        config: &EndpointConfig,
    ) -> Result<Endpoint, FlareError> {
        let addr = resolve(host, port)?;
        Ok(Self::from_parts(
            WireProtocol::Tcp,
            Some(addr),
            None,
            Transport::Idle,
            Lifecycle::Unconnected,
            config,
        ))
    }

    /// 接管一条已建立的标准库 TCP 流，初始状态为 `Connected`。
    pub fn from_std_stream(
        stream: std::net::TcpStream,
        config: &EndpointConfig,
    ) -> Result<Endpoint, FlareError> {
        stream
            .set_nonblocking(true)
            .map_err(|err| map_io_error(CONNECT, err))?;
        let stream = mio::net::TcpStream::from_std(stream);
        Self::from_connected(stream, config)
    }

    pub(crate) fn from_connected(
        stream: mio::net::TcpStream,
        config: &EndpointConfig,
    ) -> Result<Endpoint, FlareError> {
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(ACCEPT, err))?;
        let local = stream
            .local_addr()
            .map_err(|err| map_io_error(ACCEPT, err))?;
        let endpoint = Self::from_parts(
            WireProtocol::Tcp,
            Some(peer),
            Some(local),
            Transport::Tcp(stream),
            Lifecycle::Connected,
            config,
        );
        endpoint.inner.apply_recorded_options();
        Ok(endpoint)
    }

    pub(crate) fn udp(
        listener: Weak<ListenerInner>,
        peer: SocketAddr,
        local: SocketAddr,
        config: &EndpointConfig,
    ) -> Endpoint {
        Self::from_parts(
            WireProtocol::Udp,
            Some(peer),
            Some(local),
            Transport::Udp(listener),
            Lifecycle::Connected,
            config,
        )
    }

    fn from_parts(
        protocol: WireProtocol,
        peer: Option<SocketAddr>,
        local: Option<SocketAddr>,
        transport: Transport,
        lifecycle: Lifecycle,
        config: &EndpointConfig,
    ) -> Endpoint {
        let mut options = SocketOptions::new();
        if config.tcp_nodelay && protocol == WireProtocol::Tcp {
            let _ = options.set(SocketOption::NoDelay, 1);
        }
        Endpoint {
            inner: Arc::new(EndpointInner {
                id: EndpointId::fresh(),
                protocol,
                created_at: Instant::now(),
                peer,
                local: Mutex::new(local),
                io: Mutex::new(transport),
                status: Mutex::new(Status {
                    lifecycle,
                    reader: None,
                    closer: None,
                    close_reason: None,
                    connect: None,
                    connect_timeout: config.connect_timeout(),
                    options,
                }),
                read: Mutex::new(ReadSide {
                    aggregate: ByteSpanAggregate::new(),
                    max: config.max_read_buffer.max(1),
                    paused: false,
                }),
                write: Mutex::new(WriteSide {
                    queue: VecDeque::new(),
                    queued_bytes: 0,
                    closed: false,
                }),
                filter: Mutex::new(None),
                stats: ByteStats::new(),
                native_buffers: AtomicBool::new(config.native_buffers),
                binding: OnceLock::new(),
            }),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    pub fn protocol(&self) -> WireProtocol {
        self.inner.protocol
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().is_closing_or_closed()
    }

    /// 获取对端地址。
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer
    }

    /// 获取本地地址；TCP 客户端在连接建立后才可用。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local.lock()
    }

    pub fn created_at(&self) -> Instant {
        self.inner.created_at
    }

    pub fn stats(&self) -> &ByteStats {
        &self.inner.stats
    }

    /// 该连接的串行回调通道；注册到反应器之前为 `None`。
    pub fn executor(&self) -> Option<LaneExecutor> {
        self.inner.binding.get().map(|binding| binding.lane.clone())
    }

    /// 发起非阻塞连接。
    ///
    /// - 重复调用返回同一个完成令牌；
    /// - 被拒绝等立即可知的失败直接以 `Connection` 错误完成令牌并关闭连接；
    /// - 自创建起超过连接超时仍未建立时，令牌以 `Connection { timed_out: true }` 失败，
    ///   创建后迟迟才调用 `connect` 的端点会立即以超时失败；
    /// - 取消令牌会中止连接并关闭端点。
    pub fn connect(&self) -> Completion<()> {
        let inner = &self.inner;
        let mut status = inner.status.lock();
        match status.lifecycle {
            Lifecycle::Unconnected => {}
            Lifecycle::Connecting | Lifecycle::Connected => {
                return status
                    .connect
                    .clone()
                    .unwrap_or_else(|| Completion::succeeded(()));
            }
            Lifecycle::ClosePending | Lifecycle::Closed => {
                return Completion::failed(FlareError::Closed);
            }
        }

        let token = Completion::new();
        status.connect = Some(token.clone());
        let Some(addr) = inner.peer else {
            drop(status);
            token.fail(FlareError::InvalidArgument {
                name: "peer",
                message: "endpoint has no remote address".to_owned(),
            });
            return token;
        };
        // 连接超时从端点创建时起算，创建后迟迟未发起的连接可能一开始就已超时。
        let timeout = status.connect_timeout;
        if inner.created_at.elapsed() >= timeout {
            drop(status);
            let error = FlareError::Connection {
                addr: addr.to_string(),
                message: format!("connect timeout of {timeout:?} elapsed before connect was issued"),
                timed_out: true,
            };
            debug!(id = %inner.id, %addr, "connect issued after its deadline");
            token.fail(error.clone());
            inner.close_with(CloseReason::Error(error));
            return token;
        }

        match mio::net::TcpStream::connect(addr) {
            Ok(stream) => {
                *inner.io.lock() = Transport::Tcp(stream);
                let _ = status.lifecycle.transition(Lifecycle::Connecting);
                drop(status);
                debug!(id = %inner.id, %addr, "connect started");

                let weak = Arc::downgrade(inner);
                token.on_complete(move |result| {
                    if let Err(FlareError::Cancelled { .. }) = result {
                        if let Some(inner) = weak.upgrade() {
                            inner.close_with(CloseReason::Error(FlareError::Cancelled {
                                op: "connect",
                            }));
                        }
                    }
                });
                inner.sync_with_reactor();
            }
            Err(err) => {
                drop(status);
                let error = connection_error(addr, &err);
                debug!(id = %inner.id, %addr, error = %error, "connect refused immediately");
                token.fail(error.clone());
                inner.close_with(CloseReason::Error(error));
            }
        }
        token
    }

    pub fn connect_timeout(&self) -> Duration {
        self.inner.status.lock().connect_timeout
    }

    /// 修改连接超时；发起连接之后不可修改。
    pub fn set_connect_timeout(&self, timeout: Duration) -> Result<(), FlareError> {
        if timeout.is_zero() {
            return Err(FlareError::InvalidArgument {
                name: "connect_timeout",
                message: "must be positive".to_owned(),
            });
        }
        let mut status = self.inner.status.lock();
        if status.lifecycle != Lifecycle::Unconnected {
            return Err(FlareError::state("set_connect_timeout", status.lifecycle));
        }
        status.connect_timeout = timeout;
        Ok(())
    }

    /// 尚未建立连接，且自创建起已超过连接超时。
    pub fn has_connection_timed_out(&self) -> bool {
        let status = self.inner.status.lock();
        matches!(
            status.lifecycle,
            Lifecycle::Unconnected | Lifecycle::Connecting
        ) && self.inner.created_at.elapsed() > status.connect_timeout
    }

    /// 设置读回调；若已有缓冲数据则立即调度一次。关闭后调用无效。
    pub fn set_reader<F>(&self, reader: F)
    where
        F: Fn(&Endpoint) + Send + Sync + 'static,
    {
        {
            let mut status = self.inner.status.lock();
            if status.lifecycle == Lifecycle::Closed {
                return;
            }
            status.reader = Some(Arc::new(reader));
        }
        if self.inner.read_buffer_len() > 0 {
            self.inner.schedule_reader();
        }
    }

    /// 设置关闭回调；若连接已关闭则立即调度。
    pub fn set_closer<F>(&self, closer: F)
    where
        F: Fn(&Endpoint, &CloseReason) + Send + Sync + 'static,
    {
        let closer: CloseCallback = Arc::new(closer);
        let reason = {
            let mut status = self.inner.status.lock();
            status.closer = Some(Arc::clone(&closer));
            if status.lifecycle != Lifecycle::Closed {
                return;
            }
            status.close_reason.clone().unwrap_or(CloseReason::Local)
        };
        let endpoint = self.clone();
        self.inner.run_on_lane(move || closer(&endpoint, &reason));
    }

    /// 消费并复制：取走读聚合的全部内容。
    pub fn take_read(&self) -> ByteSpanAggregate {
        let (taken, resume) = {
            let mut read = self.inner.read.lock();
            let taken = read.aggregate.take_all();
            (taken, std::mem::take(&mut read.paused))
        };
        if resume {
            self.inner.send(Command::ResumeRead);
        }
        taken
    }

    pub fn read_buffer_len(&self) -> usize {
        self.inner.read_buffer_len()
    }

    /// 读聚合中有未取走的数据。
    pub fn can_read(&self) -> bool {
        self.read_buffer_len() > 0
    }

    pub fn max_read_buffer(&self) -> usize {
        self.inner.read.lock().max
    }

    /// 修改读聚合上限；上限提高到当前长度之上时解除读暂停。
    pub fn set_max_read_buffer(&self, max: usize) -> Result<(), FlareError> {
        if max == 0 {
            return Err(FlareError::InvalidArgument {
                name: "max_read_buffer",
                message: "must be positive".to_owned(),
            });
        }
        let resume = {
            let mut read = self.inner.read.lock();
            read.max = max;
            if read.paused && read.aggregate.len() < max {
                read.paused = false;
                true
            } else {
                false
            }
        };
        if resume {
            self.inner.send(Command::ResumeRead);
        }
        Ok(())
    }

    /// 排队写入。
    ///
    /// - 连接关闭中或已关闭：令牌立即以 `Closed` 失败；
    /// - TLS 握手进行中：写入被暂存，握手完成后按序加密上线；
    /// - 其余情况：追加到写队列尾部，字节全部交给内核后令牌成功。
    pub fn write(&self, data: impl Into<Bytes>) -> Completion<()> {
        let data = data.into();
        let token = Completion::new();
        if self.is_closed() {
            token.fail(FlareError::Closed);
            return token;
        }
        if data.is_empty() {
            token.succeed(());
            return token;
        }

        let mut slot = self.inner.filter.lock();
        let queued = match slot.as_mut() {
            None => self
                .inner
                .enqueue(ByteSpanAggregate::from(data), Some(token.clone())),
            Some(slot) => match slot.state {
                HandshakeState::Handshaking => {
                    slot.held.push_back((data, token.clone()));
                    false
                }
                HandshakeState::Established => {
                    let mut out = FilterOutput::default();
                    match slot.filter.on_outbound(&data, &mut out) {
                        Ok(()) => self
                            .inner
                            .enqueue(out.wire.into_iter().collect(), Some(token.clone())),
                        Err(err) => {
                            token.fail(err);
                            false
                        }
                    }
                }
                HandshakeState::NotStarted | HandshakeState::Failed => {
                    token.fail(FlareError::Closed);
                    false
                }
            },
        };
        drop(slot);

        if queued {
            self.inner.send(Command::Flush);
        }
        token
    }

    /// 写队列中尚未交给内核的字节数。
    pub fn write_buffer_len(&self) -> usize {
        self.inner.write.lock().queued_bytes
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.inner.write.lock().queue.is_empty()
    }

    /// 关闭连接；重复调用无副作用。
    pub fn close(&self) {
        self.inner.close_with(CloseReason::Local);
    }

    /// 以错误原因关闭连接。
    pub fn close_with_error(&self, error: FlareError) {
        self.inner.close_with(CloseReason::Error(error));
    }

    /// 设置套接字选项；非法取值或该连接类型不支持时返回 `false`。
    pub fn set_socket_option(&self, option: SocketOption, value: i64) -> bool {
        if let Err(err) = option.validate(value) {
            debug!(id = %self.inner.id, error = %err, "rejected socket option");
            return false;
        }
        if self.inner.status.lock().options.set(option, value).is_err() {
            return false;
        }
        self.inner.apply_option(option, value)
    }

    /// 已记录的套接字选项取值。
    pub fn socket_option(&self, option: SocketOption) -> Option<i64> {
        self.inner.status.lock().options.get(option)
    }

    /// 在连接上安装字节流变换器并开始握手。
    ///
    /// # 契约（What）
    /// - 调用前已在读聚合中的字节保持明文，应用照常取走；此后从套接字读到的字节全部交给变换器；
    /// - 返回的令牌在握手完成时成功，握手失败、超时或连接关闭时失败；
    /// - 每条连接只能安装一次；UDP 会话与已关闭的连接返回 `State` 错误。
    pub fn install_filter(
        &self,
        mut filter: Box<dyn StreamFilter>,
        timeout: Option<Duration>,
    ) -> Result<Completion<()>, FlareError> {
        if self.inner.protocol != WireProtocol::Tcp {
            return Err(FlareError::state("install_filter", "a datagram session"));
        }
        let lifecycle = self.state();
        if !lifecycle.is_open() {
            return Err(FlareError::state("install_filter", lifecycle));
        }

        let handshake = Completion::new();
        {
            let mut slot = self.inner.filter.lock();
            if slot.is_some() {
                return Err(FlareError::state("install_filter", "a filter is installed"));
            }
            let mut out = FilterOutput::default();
            filter.start(&mut out)?;
            *slot = Some(FilterSlot::new(filter, handshake.clone(), timeout));
            if !out.wire.is_empty() {
                self.inner.enqueue(out.wire.into_iter().collect(), None);
            }
        }
        debug!(id = %self.inner.id, ?timeout, "stream filter installed");
        self.inner.sync_with_reactor();
        self.inner.send(Command::Flush);
        Ok(handshake)
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.inner
            .filter
            .lock()
            .as_ref()
            .map_or(HandshakeState::NotStarted, |slot| slot.state)
    }

    pub fn filter_info(&self) -> Option<FilterInfo> {
        self.inner
            .filter
            .lock()
            .as_ref()
            .map(|slot| slot.filter.info())
    }

    pub(crate) fn from_inner(inner: Arc<EndpointInner>) -> Self {
        Self { inner }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("state", &self.state())
            .field("peer", &self.inner.peer)
            .finish()
    }
}

impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Endpoint {}

impl EndpointInner {
    pub(crate) fn token(&self) -> Token {
        self.id.token()
    }

    pub(crate) fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    pub(crate) fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn state(&self) -> Lifecycle {
        self.status.lock().lifecycle
    }

    /// UDP 会话所属的监听端。
    pub(crate) fn udp_listener(&self) -> Option<Arc<ListenerInner>> {
        match &*self.io.lock() {
            Transport::Udp(listener) => listener.upgrade(),
            _ => None,
        }
    }

    pub(crate) fn native_buffers(&self) -> bool {
        self.native_buffers.load(Ordering::Relaxed)
    }

    fn read_buffer_len(&self) -> usize {
        self.read.lock().aggregate.len()
    }

    pub(crate) fn has_pending_writes(&self) -> bool {
        !self.write.lock().queue.is_empty()
    }

    /// 向所属分片发送命令；未注册时忽略。
    fn send(&self, command: fn(Token) -> Command) {
        if let Some(binding) = self.binding.get() {
            binding.shard.send(command(binding.token));
        }
    }

    /// 让所属分片重新同步该连接的注册状态（套接字、定时器）。
    pub(crate) fn sync_with_reactor(self: &Arc<Self>) {
        if let Some(binding) = self.binding.get() {
            binding
                .shard
                .send(Command::AttachEndpoint(Arc::clone(self)));
        }
    }

    /// 在连接的回调通道上执行；未注册时在当前线程执行。
    fn run_on_lane<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.binding.get() {
            Some(binding) => binding.lane.execute(task),
            None => task(),
        }
    }

    fn schedule_reader(self: &Arc<Self>) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        let inner = Arc::clone(self);
        binding.lane.execute(move || inner.run_reader());
    }

    fn run_reader(self: Arc<Self>) {
        let reader = {
            let status = self.status.lock();
            if status.lifecycle == Lifecycle::Closed {
                return;
            }
            status.reader.clone()
        };
        if let Some(reader) = reader {
            reader(&Endpoint::from_inner(self));
        }
    }

    /// 追加到写队列；返回队列是否由空变为非空。
    fn enqueue(&self, data: ByteSpanAggregate, token: Option<Completion<()>>) -> bool {
        let mut write = self.write.lock();
        if write.closed {
            drop(write);
            if let Some(token) = token {
                token.fail(FlareError::Closed);
            }
            return false;
        }
        let was_empty = write.queue.is_empty();
        write.queued_bytes += data.len();
        write.queue.push_back(PendingWrite { data, token });
        was_empty
    }

    fn append_plaintext(self: &Arc<Self>, spans: impl IntoIterator<Item = Bytes>) {
        // 聚合非空说明读回调已调度或尚未取走数据，只追加不再通知。
        let became_readable = {
            let mut read = self.read.lock();
            let was_empty = read.aggregate.is_empty();
            read.aggregate.extend(spans);
            was_empty && !read.aggregate.is_empty()
        };
        if became_readable {
            self.schedule_reader();
        }
    }

    pub(crate) fn read_at_cap(&self) -> bool {
        let read = self.read.lock();
        read.aggregate.len() >= read.max
    }

    /// 读聚合已达上限时标记暂停并返回 `true`。
    pub(crate) fn should_pause_reads(&self) -> bool {
        let mut read = self.read.lock();
        if read.aggregate.len() >= read.max {
            read.paused = true;
            true
        } else {
            false
        }
    }

    /// 交付一段从套接字读到的字节。
    pub(crate) fn deliver(self: &Arc<Self>, span: Bytes) {
        self.stats.add_read(span.len());
        let mut guard = self.filter.lock();
        let Some(slot) = guard.as_mut() else {
            drop(guard);
            self.append_plaintext([span]);
            return;
        };
        if slot.state == HandshakeState::Failed {
            return;
        }

        let mut out = FilterOutput::default();
        if let Err(err) = slot.filter.on_inbound(&span, &mut out) {
            let (handshake, held) = slot.fail();
            drop(guard);
            warn!(id = %self.id, error = %err, "stream filter rejected inbound bytes");
            handshake.fail(err.clone());
            for token in held {
                token.fail(err.clone());
            }
            self.close_with(CloseReason::Error(err));
            return;
        }

        if !out.wire.is_empty() {
            self.enqueue(out.wire.drain(..).collect(), None);
        }
        let mut established = None;
        let mut failure = None;
        if out.established && slot.state == HandshakeState::Handshaking {
            slot.state = HandshakeState::Established;
            established = Some(slot.handshake.clone());
            while let Some((data, token)) = slot.held.pop_front() {
                let mut sealed = FilterOutput::default();
                match slot.filter.on_outbound(&data, &mut sealed) {
                    Ok(()) => {
                        self.enqueue(sealed.wire.into_iter().collect(), Some(token));
                    }
                    Err(err) => {
                        token.fail(err.clone());
                        failure = Some(err);
                        break;
                    }
                }
            }
        }
        drop(guard);

        if let Some(handshake) = established {
            info!(id = %self.id, peer = ?self.peer, "stream filter handshake established");
            handshake.succeed(());
        }
        self.append_plaintext(out.plaintext);
        if let Some(err) = failure {
            self.close_with(CloseReason::Error(err));
        } else if out.peer_closed {
            self.close_with(CloseReason::Remote);
        }
    }

    /// 尽可能多地把写队列交给内核；遇到 `WouldBlock` 返回 `Ok`。
    pub(crate) fn flush(&self) -> Result<(), FlareError> {
        let mut completed = Vec::new();
        let result = match self.protocol {
            WireProtocol::Tcp => self.flush_stream(&mut completed),
            WireProtocol::Udp => self.flush_datagrams(&mut completed),
        };
        for token in completed {
            token.succeed(());
        }
        result
    }

    fn flush_stream(&self, completed: &mut Vec<Completion<()>>) -> Result<(), FlareError> {
        let mut write = self.write.lock();
        let mut io = self.io.lock();
        let Transport::Tcp(stream) = &mut *io else {
            return Ok(());
        };
        loop {
            write.drop_empty_front(completed);
            if write.queue.is_empty() {
                return Ok(());
            }
            let outcome = {
                let mut slices = [IoSlice::new(&[]); MAX_IOV];
                let mut filled = 0;
                for request in &write.queue {
                    filled += request.data.chunks_vectored(&mut slices[filled..]);
                    if filled == MAX_IOV {
                        break;
                    }
                }
                stream.write_vectored(&slices[..filled])
            };
            match outcome {
                Ok(0) => {
                    return Err(map_io_error(WRITE, io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    self.stats.add_written(n);
                    write.consume(n, completed);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(WRITE, err)),
            }
        }
    }

    fn flush_datagrams(&self, completed: &mut Vec<Completion<()>>) -> Result<(), FlareError> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let listener = match &*self.io.lock() {
            Transport::Udp(listener) => listener.upgrade(),
            _ => None,
        };
        let Some(listener) = listener else {
            return Ok(());
        };
        let mut write = self.write.lock();
        loop {
            write.drop_empty_front(completed);
            let Some(front) = write.queue.front() else {
                return Ok(());
            };
            let sent = if front.data.span_count() == 1 {
                listener.send_to(front.data.chunk(), peer)
            } else {
                listener.send_to(&front.data.copy_to_vec(), peer)
            };
            match sent {
                Ok(n) => {
                    let len = front.data.len();
                    self.stats.add_written(n);
                    write.consume(len, completed);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(map_io_error(WRITE, err)),
            }
        }
    }

    /// 关闭流程的同步部分：迁移到 `ClosePending`、失败所有挂起令牌、释放套接字，
    /// 并在回调通道上排队关闭任务。
    pub(crate) fn close_with(self: &Arc<Self>, reason: CloseReason) {
        let connect = {
            let mut status = self.status.lock();
            if status.lifecycle.transition(Lifecycle::ClosePending).is_err() {
                return;
            }
            status.close_reason = Some(reason.clone());
            status.connect.clone()
        };
        let cause = reason.error().cloned().unwrap_or(FlareError::Closed);
        match &reason {
            CloseReason::Error(err) => {
                debug!(id = %self.id, peer = ?self.peer, error = %err, "endpoint closing with error")
            }
            other => debug!(id = %self.id, peer = ?self.peer, reason = ?other, "endpoint closing"),
        }

        if let Some(connect) = connect {
            connect.fail(cause.clone());
        }

        let handshake = {
            let mut slot = self.filter.lock();
            match slot.as_mut() {
                Some(slot) if slot.state == HandshakeState::Handshaking => Some(slot.fail()),
                _ => None,
            }
        };
        if let Some((handshake, held)) = handshake {
            handshake.fail(cause.clone());
            for token in held {
                token.fail(FlareError::Closed);
            }
        }

        let pending: Vec<Completion<()>> = {
            let mut write = self.write.lock();
            write.closed = true;
            write.queued_bytes = 0;
            write
                .queue
                .drain(..)
                .filter_map(|request| request.token)
                .collect()
        };
        for token in pending {
            token.fail(FlareError::Closed);
        }

        let listener = match &*self.io.lock() {
            Transport::Udp(listener) => listener.upgrade(),
            _ => None,
        };
        if let (Some(listener), Some(peer)) = (listener, self.peer) {
            listener.forget_peer(peer);
        }

        let inner = Arc::clone(self);
        match self.binding.get() {
            Some(binding) => {
                if binding.shard.is_retired() {
                    *self.io.lock() = Transport::Released;
                } else {
                    binding.shard.send(Command::Release(binding.token));
                }
                binding.lane.execute(move || inner.finish_close());
            }
            None => {
                *self.io.lock() = Transport::Released;
                inner.finish_close();
            }
        }
    }

    /// 关闭流程的回调部分：补发最后一次读回调，迁移到 `Closed`，调用关闭回调。
    fn finish_close(self: Arc<Self>) {
        let reader = self.status.lock().reader.clone();
        let endpoint = Endpoint::from_inner(Arc::clone(&self));
        if let Some(reader) = reader {
            if self.read_buffer_len() > 0 {
                reader(&endpoint);
            }
        }
        let (closer, reason) = {
            let mut status = self.status.lock();
            let _ = status.lifecycle.transition(Lifecycle::Closed);
            (
                status.closer.clone(),
                status.close_reason.clone().unwrap_or(CloseReason::Local),
            )
        };
        trace!(id = %self.id, "endpoint closed");
        if let Some(closer) = closer {
            closer(&endpoint, &reason);
        }
    }

    /// 由分片在处理 `Release` 时调用：发送告别字节、注销并丢弃套接字。
    pub(crate) fn release(&self, registry: &Registry) {
        let graceful = !matches!(
            self.status.lock().close_reason,
            Some(CloseReason::Error(_))
        );
        let mut goodbye = FilterOutput::default();
        if graceful {
            if let Some(slot) = self.filter.lock().as_mut() {
                if slot.state == HandshakeState::Established {
                    slot.filter.on_close(&mut goodbye);
                }
            }
        }
        let transport = std::mem::replace(&mut *self.io.lock(), Transport::Released);
        if let Transport::Tcp(mut stream) = transport {
            for bytes in &goodbye.wire {
                if stream.write_all(bytes).is_err() {
                    break;
                }
            }
            if let Err(err) = registry.deregister(&mut stream) {
                trace!(id = %self.id, error = %err, "deregister on release failed");
            }
        }
    }

    /// 把套接字注册到选择器；返回是否存在可注册的套接字。
    pub(crate) fn register_source(&self, registry: &Registry, interest: Interest) -> io::Result<bool> {
        match &mut *self.io.lock() {
            Transport::Tcp(stream) => {
                registry.register(stream, self.token(), interest)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn reregister_source(&self, registry: &Registry, interest: Interest) -> io::Result<()> {
        match &mut *self.io.lock() {
            Transport::Tcp(stream) => registry.reregister(stream, self.token(), interest),
            _ => Ok(()),
        }
    }

    pub(crate) fn deregister_source(&self, registry: &Registry) -> io::Result<()> {
        match &mut *self.io.lock() {
            Transport::Tcp(stream) => registry.deregister(stream),
            _ => Ok(()),
        }
    }

    /// 在分片线程上对 TCP 流执行一次读取。
    pub(crate) fn with_stream<R>(
        &self,
        op: impl FnOnce(&mut mio::net::TcpStream) -> R,
    ) -> Option<R> {
        match &mut *self.io.lock() {
            Transport::Tcp(stream) => Some(op(stream)),
            _ => None,
        }
    }

    /// 探测非阻塞连接是否完成：`peer_addr` 报 `NotConnected` 表示仍在建立中。
    pub(crate) fn poll_connect(&self) -> ConnectPoll {
        let outcome = self.with_stream(|stream| {
            if let Ok(Some(err)) | Err(err) = stream.take_error() {
                return ConnectPoll::Failed(err);
            }
            match stream.peer_addr() {
                Ok(_) => ConnectPoll::Connected,
                Err(err) if err.kind() == io::ErrorKind::NotConnected => ConnectPoll::Pending,
                Err(err) => ConnectPoll::Failed(err),
            }
        });
        outcome.unwrap_or(ConnectPoll::Pending)
    }

    /// 连接建立：记录本地地址、落地已记录的选项、完成连接令牌。
    pub(crate) fn on_connected(&self) {
        let local = self.with_stream(|stream| stream.local_addr().ok()).flatten();
        *self.local.lock() = local;
        self.apply_recorded_options();
        let connect = {
            let mut status = self.status.lock();
            if status.lifecycle.transition(Lifecycle::Connected).is_err() {
                return;
            }
            status.connect.clone()
        };
        info!(id = %self.id, peer = ?self.peer, local = ?local, "endpoint connected");
        if let Some(connect) = connect {
            connect.succeed(());
        }
    }

    pub(crate) fn fail_connect(self: &Arc<Self>, error: FlareError) {
        debug!(id = %self.id, peer = ?self.peer, error = %error, "connect failed");
        self.close_with(CloseReason::Error(error));
    }

    /// 连接截止时间：创建时刻加连接超时；仅在 `Connecting` 状态下有值。
    pub(crate) fn connect_deadline(&self) -> Option<Instant> {
        let status = self.status.lock();
        if status.lifecycle != Lifecycle::Connecting {
            return None;
        }
        Some(self.created_at + status.connect_timeout)
    }

    pub(crate) fn on_connect_timeout(self: &Arc<Self>) {
        let timeout = {
            let status = self.status.lock();
            if status.lifecycle != Lifecycle::Connecting {
                return;
            }
            status.connect_timeout
        };
        let addr = self
            .peer
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        self.fail_connect(FlareError::Connection {
            addr,
            message: format!("no response within {timeout:?}"),
            timed_out: true,
        });
    }

    pub(crate) fn handshake_deadline(&self) -> Option<Instant> {
        self.filter
            .lock()
            .as_ref()
            .filter(|slot| slot.state == HandshakeState::Handshaking)
            .and_then(|slot| slot.deadline)
    }

    pub(crate) fn on_handshake_timeout(self: &Arc<Self>) {
        let failed = {
            let mut slot = self.filter.lock();
            match slot.as_mut() {
                Some(slot) if slot.state == HandshakeState::Handshaking => {
                    let after = slot.timeout.unwrap_or_default();
                    Some((slot.fail(), after))
                }
                _ => None,
            }
        };
        let Some(((handshake, held), after)) = failed else {
            return;
        };
        let error = FlareError::Timeout {
            op: "stream filter handshake",
            after,
        };
        warn!(id = %self.id, peer = ?self.peer, ?after, "stream filter handshake timed out");
        handshake.fail(error.clone());
        for token in held {
            token.fail(error.clone());
        }
        self.close_with(CloseReason::Error(error));
    }

    fn apply_recorded_options(&self) {
        let recorded: Vec<_> = self.status.lock().options.iter().collect();
        for (option, value) in recorded {
            self.apply_option(option, value);
        }
    }

    /// 把一个已校验的选项落地到当前套接字；套接字尚未创建时视为成功，连接建立后统一落地。
    fn apply_option(&self, option: SocketOption, value: i64) -> bool {
        if option == SocketOption::UseNativeBuffers {
            self.native_buffers.store(value == 1, Ordering::Relaxed);
            return true;
        }
        let io = self.io.lock();
        let outcome = match &*io {
            Transport::Idle => Ok(true),
            Transport::Tcp(stream) => match option {
                SocketOption::NoDelay => stream.set_nodelay(value == 1).map(|()| true),
                SocketOption::UdpFrameSize => Ok(false),
                _ => apply_option(SockRef::from(stream), option, value),
            },
            Transport::Udp(listener) => match listener.upgrade() {
                Some(listener) => Ok(listener.apply_option(option, value)),
                None => Ok(false),
            },
            Transport::Released => Ok(false),
        };
        drop(io);
        match outcome {
            Ok(applied) => applied,
            Err(err) => {
                debug!(id = %self.id, ?option, value, error = %err, "socket option not applied");
                false
            }
        }
    }
}

/// 解析 `host:port`，取第一个地址。
pub(crate) fn resolve(host: &str, port: u16) -> Result<SocketAddr, FlareError> {
    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|err| map_io_error(RESOLVE, err))?;
    addrs.next().ok_or_else(|| FlareError::InvalidArgument {
        name: "host",
        message: format!("`{host}` did not resolve to any address"),
    })
}
