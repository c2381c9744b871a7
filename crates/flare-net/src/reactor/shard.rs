use std::collections::HashMap;
use std::io::{self, Read};
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use flare_buffer::{ChunkPool, ReadScratch};
use mio::{Interest, Token, Waker};
use tracing::{debug, trace, warn};

use super::timer::{TimerEvent, TimerQueue};
use super::{Reactor, ReactorInner};
use crate::config::ReactorConfig;
use crate::endpoint::{ConnectPoll, EndpointInner, WireProtocol};
use crate::error::{READ, REGISTER, connection_error, map_io_error};
use crate::lifecycle::{CloseReason, Lifecycle};
use crate::listener::{AcceptPoll, DatagramPoll, Listener, ListenerInner};
use crate::selector::{MioSelector, ReadyEvent, Selector};

/// 保留给跨线程唤醒的令牌；连接 id 从 1 递增，不会与之冲突。
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// 发往分片的命令；任何线程都可以发送，只有分片线程执行。
pub(crate) enum Command {
    /// 登记连接并在套接字就绪后注册到选择器；重复发送用于同步连接状态。
    AttachEndpoint(Arc<EndpointInner>),
    AttachListener(Arc<ListenerInner>),
    /// 写队列由空变为非空。
    Flush(Token),
    /// 应用取走了数据，恢复读取。
    ResumeRead(Token),
    /// 连接关闭：发送告别字节后注销并丢弃套接字。
    Release(Token),
    ReleaseListener(Token),
    /// UDP 监听端解除读暂停后补读积压的数据报。
    ReadDatagrams(Token),
    /// 从选择器中移除连接，但不关闭它。
    Detach(Token),
}

/// 分片的跨线程句柄。
pub(crate) struct ShardHandle {
    pub(crate) index: usize,
    commands: SegQueue<Command>,
    waker: Waker,
    wake_pending: AtomicBool,
    pub(crate) stopping: AtomicBool,
    /// 分片已完成最后一次命令排空，之后发来的命令不再有人执行。
    retired: AtomicBool,
    endpoints: AtomicUsize,
    listeners: AtomicUsize,
}

impl ShardHandle {
    pub(crate) fn send(&self, command: Command) {
        self.commands.push(command);
        self.wake();
    }

    /// 唤醒阻塞在 `select` 中的分片；未被消费的唤醒会被合并。
    pub(crate) fn wake(&self) {
        if !self.wake_pending.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.waker.wake() {
                warn!(shard = self.index, error = %err, "failed to wake shard");
            }
        }
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub(crate) fn endpoint_count(&self) -> usize {
        self.endpoints.load(Ordering::Relaxed)
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.load(Ordering::Relaxed)
    }
}

enum Entry {
    Endpoint(EndpointEntry),
    Listener(Weak<ListenerInner>),
}

struct EndpointEntry {
    endpoint: Weak<EndpointInner>,
    registered: bool,
    reading: bool,
    connect_armed: bool,
    handshake_armed: bool,
    /// 已被 `deregister_endpoint` 摘除：不再分派事件与定时器，只等待释放。
    detached: bool,
}

impl Entry {
    fn is_alive(&self) -> bool {
        match self {
            Entry::Endpoint(entry) => entry.endpoint.strong_count() > 0,
            Entry::Listener(listener) => listener.strong_count() > 0,
        }
    }
}

enum Target {
    Endpoint(Arc<EndpointInner>),
    Listener(Arc<ListenerInner>),
}

/// 单个轮询线程独占的反应器状态。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 套接字的读、写、接受系统调用只在这里发生，令牌表、定时器堆、读暂存区都不跨线程共享；
/// - 其它线程通过 [`Command`] 队列提出请求，分片在每轮 `select` 前后统一执行。
///
/// ## 逻辑（How）
/// 1. 执行积压命令；
/// 2. 以“配置超时与最近截止时间”中较短者阻塞在 `select`；
/// 3. 逐个分派就绪事件：连接中的端点先探测连接结果，可读则循环读到 `WouldBlock`
///    或读聚合达到上限，可写则冲刷写队列；监听端循环接受或接收数据报；
/// 4. 再次执行命令（事件处理中产生的释放请求），触发到期定时器，发布计数。
///
/// ## 契约（What）
/// - 令牌表只持有弱引用，应用丢弃端点后条目在下一轮被清理；
/// - 读暂停通过把兴趣集改为只写实现，恢复时重新注册并主动补读一次（边沿触发不会重报旧数据）。
pub(crate) struct ShardCore {
    handle: Arc<ShardHandle>,
    selector: Box<dyn Selector>,
    ready: Vec<ReadyEvent>,
    entries: HashMap<Token, Entry>,
    timers: TimerQueue,
    scratch: ReadScratch,
    reactor: Weak<ReactorInner>,
}

impl ShardCore {
    pub(crate) fn new(
        index: usize,
        config: &ReactorConfig,
        pool: ChunkPool,
    ) -> io::Result<(ShardCore, Arc<ShardHandle>)> {
        let selector = MioSelector::new(config.events_capacity)?;
        let waker = Waker::new(selector.registry(), WAKE_TOKEN)?;
        let handle = Arc::new(ShardHandle {
            index,
            commands: SegQueue::new(),
            waker,
            wake_pending: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            endpoints: AtomicUsize::new(0),
            listeners: AtomicUsize::new(0),
        });
        let core = ShardCore {
            handle: Arc::clone(&handle),
            selector: Box::new(selector),
            ready: Vec::with_capacity(config.events_capacity),
            entries: HashMap::new(),
            timers: TimerQueue::default(),
            scratch: ReadScratch::new(pool, config.read_chunk_floor),
            reactor: Weak::new(),
        };
        Ok((core, handle))
    }

    pub(crate) fn attach_reactor(&mut self, reactor: Weak<ReactorInner>) {
        self.reactor = reactor;
    }

    pub(crate) fn index(&self) -> usize {
        self.handle.index
    }

    /// 执行一轮：命令、`select`、事件分派、定时器；返回处理的就绪事件数。
    pub(crate) fn step(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        self.drain_commands();
        let timeout = if self.handle.commands.is_empty() {
            self.timers.clamp(timeout, Instant::now())
        } else {
            Some(Duration::ZERO)
        };

        let mut ready = mem::take(&mut self.ready);
        let selected = self.selector.select(&mut ready, timeout);
        self.handle.wake_pending.store(false, Ordering::SeqCst);
        if let Err(err) = selected {
            self.ready = ready;
            return Err(err);
        }

        let mut handled = 0;
        for event in &ready {
            if event.token == WAKE_TOKEN {
                continue;
            }
            handled += 1;
            self.dispatch(*event);
        }
        ready.clear();
        self.ready = ready;

        self.drain_commands();
        self.fire_timers();
        self.publish_counts();
        Ok(handled)
    }

    /// 停机：关闭所有仍存活的监听端与连接，并执行由此产生的释放命令。
    pub(crate) fn shutdown(&mut self) {
        self.drain_commands();
        let mut endpoints = Vec::new();
        let mut listeners = Vec::new();
        for entry in self.entries.values() {
            match entry {
                Entry::Endpoint(entry) if entry.detached => {}
                Entry::Endpoint(entry) => endpoints.extend(entry.endpoint.upgrade()),
                Entry::Listener(listener) => listeners.extend(listener.upgrade()),
            }
        }
        debug!(
            shard = self.handle.index,
            endpoints = endpoints.len(),
            listeners = listeners.len(),
            "shard shutting down"
        );
        for inner in listeners {
            Listener { inner }.close();
        }
        for endpoint in endpoints {
            endpoint.close_with(CloseReason::Local);
        }
        self.drain_commands();
        self.handle.retired.store(true, Ordering::Release);
        // 退役前后交错发送的命令再收一次。
        self.drain_commands();
        self.publish_counts();
    }

    fn drain_commands(&mut self) {
        while let Some(command) = self.handle.commands.pop() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::AttachEndpoint(endpoint) => self.attach_endpoint(&endpoint),
            Command::AttachListener(listener) => self.attach_listener(&listener),
            Command::Flush(token) => {
                if let Some(endpoint) = self.endpoint(token) {
                    self.flush_endpoint(&endpoint);
                }
            }
            Command::ResumeRead(token) => self.resume_reads(token),
            Command::Release(token) => {
                if let Some(Entry::Endpoint(entry)) = self.entries.remove(&token) {
                    if let Some(endpoint) = entry.endpoint.upgrade() {
                        endpoint.release(self.selector.registry());
                        trace!(id = %endpoint.id, detached = entry.detached, "endpoint released");
                    }
                }
            }
            Command::ReleaseListener(token) => {
                if let Some(Entry::Listener(listener)) = self.entries.remove(&token) {
                    if let Some(listener) = listener.upgrade() {
                        listener.release(self.selector.registry());
                    }
                }
            }
            Command::ReadDatagrams(token) => {
                let listener = match self.entries.get(&token) {
                    Some(Entry::Listener(listener)) => listener.upgrade(),
                    _ => None,
                };
                if let Some(listener) = listener {
                    self.read_datagrams(&listener);
                }
            }
            Command::Detach(token) => {
                // 条目保留为墓碑，之后的 `Release` 仍能找到并丢弃套接字。
                let Some(Entry::Endpoint(entry)) = self.entries.get_mut(&token) else {
                    return;
                };
                if entry.detached {
                    return;
                }
                entry.detached = true;
                entry.reading = false;
                let was_registered = std::mem::take(&mut entry.registered);
                if let Some(endpoint) = entry.endpoint.upgrade() {
                    if was_registered {
                        if let Err(err) = endpoint.deregister_source(self.selector.registry()) {
                            trace!(id = %endpoint.id, error = %err, "detach deregister failed");
                        }
                    }
                    debug!(id = %endpoint.id, "endpoint deregistered");
                }
            }
        }
    }

    /// 登记或同步一个连接：注册套接字（若已存在）并补登定时器。
    fn attach_endpoint(&mut self, endpoint: &Arc<EndpointInner>) {
        if endpoint.state().is_closing_or_closed() {
            return;
        }
        let token = endpoint.token();
        let entry = self.entries.entry(token).or_insert_with(|| {
            Entry::Endpoint(EndpointEntry {
                endpoint: Arc::downgrade(endpoint),
                registered: false,
                reading: false,
                connect_armed: false,
                handshake_armed: false,
                detached: false,
            })
        });
        let Entry::Endpoint(entry) = entry else {
            return;
        };
        if entry.detached {
            return;
        }

        if !entry.registered {
            match endpoint.register_source(
                self.selector.registry(),
                Interest::READABLE | Interest::WRITABLE,
            ) {
                Ok(true) => {
                    entry.registered = true;
                    entry.reading = true;
                    debug!(id = %endpoint.id, peer = ?endpoint.peer(), shard = self.handle.index, "endpoint registered");
                }
                Ok(false) => {}
                Err(err) => {
                    self.entries.remove(&token);
                    endpoint.close_with(CloseReason::Error(map_io_error(REGISTER, err)));
                    return;
                }
            }
        }

        let mut arm = Vec::new();
        if !entry.connect_armed {
            if let Some(at) = endpoint.connect_deadline() {
                entry.connect_armed = true;
                arm.push((at, TimerEvent::ConnectTimeout(token)));
            }
        }
        if !entry.handshake_armed {
            if let Some(at) = endpoint.handshake_deadline() {
                entry.handshake_armed = true;
                arm.push((at, TimerEvent::HandshakeTimeout(token)));
            }
        }
        for (at, event) in arm {
            self.timers.schedule(at, event);
        }

        if endpoint.state() == Lifecycle::Connected && endpoint.has_pending_writes() {
            self.flush_endpoint(endpoint);
        }
    }

    fn attach_listener(&mut self, listener: &Arc<ListenerInner>) {
        if !listener.is_open() {
            return;
        }
        let token = listener.token();
        if self.entries.contains_key(&token) {
            return;
        }
        match listener.register_source(self.selector.registry()) {
            Ok(()) => {
                self.entries
                    .insert(token, Entry::Listener(Arc::downgrade(listener)));
                debug!(id = %listener.id, shard = self.handle.index, "listener registered");
            }
            Err(err) => {
                warn!(id = %listener.id, error = %err, "listener registration failed");
                Listener {
                    inner: Arc::clone(listener),
                }
                .close();
            }
        }
    }

    fn endpoint(&self, token: Token) -> Option<Arc<EndpointInner>> {
        match self.entries.get(&token) {
            Some(Entry::Endpoint(entry)) if !entry.detached => entry.endpoint.upgrade(),
            _ => None,
        }
    }

    fn dispatch(&mut self, event: ReadyEvent) {
        let target = match self.entries.get(&event.token) {
            Some(Entry::Endpoint(entry)) if entry.detached => return,
            Some(Entry::Endpoint(entry)) => entry.endpoint.upgrade().map(Target::Endpoint),
            Some(Entry::Listener(listener)) => listener.upgrade().map(Target::Listener),
            None => return,
        };
        match target {
            Some(Target::Endpoint(endpoint)) => self.endpoint_ready(&endpoint, event),
            Some(Target::Listener(listener)) => self.listener_ready(&listener, event),
            None => {
                self.entries.remove(&event.token);
            }
        }
    }

    fn endpoint_ready(&mut self, endpoint: &Arc<EndpointInner>, event: ReadyEvent) {
        match endpoint.state() {
            Lifecycle::Connecting => {
                match endpoint.poll_connect() {
                    ConnectPoll::Pending => return,
                    ConnectPoll::Connected => endpoint.on_connected(),
                    ConnectPoll::Failed(err) => {
                        let addr = endpoint
                            .peer()
                            .map(|addr| addr.to_string())
                            .unwrap_or_default();
                        endpoint.fail_connect(connection_error(addr, &err));
                        return;
                    }
                }
                self.read_endpoint(endpoint);
                self.flush_endpoint(endpoint);
            }
            Lifecycle::Connected => {
                // 挂断同样走读路径，由读到的 EOF 或错误完成关闭。
                if event.readable || event.error || event.hangup {
                    self.read_endpoint(endpoint);
                }
                if event.writable || endpoint.has_pending_writes() {
                    self.flush_endpoint(endpoint);
                }
            }
            _ => {}
        }
    }

    /// 循环读取直到 `WouldBlock`、EOF、错误或读聚合达到上限。
    fn read_endpoint(&mut self, endpoint: &Arc<EndpointInner>) {
        loop {
            if endpoint.state() != Lifecycle::Connected {
                return;
            }
            if endpoint.should_pause_reads() {
                self.pause_reads(endpoint);
                return;
            }
            let copy_out = !endpoint.native_buffers();
            let scratch = &mut self.scratch;
            let outcome = endpoint.with_stream(|stream| {
                scratch.fill(0, copy_out, |buf| stream.read(buf).map(|n| (n, ())))
            });
            let Some(outcome) = outcome else {
                return;
            };
            match outcome {
                Ok((span, ())) if span.is_empty() => {
                    debug!(id = %endpoint.id, peer = ?endpoint.peer(), "peer closed the connection");
                    endpoint.close_with(CloseReason::Remote);
                    return;
                }
                Ok((span, ())) => {
                    trace!(id = %endpoint.id, len = span.len(), "read");
                    endpoint.deliver(span);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    endpoint.close_with(CloseReason::Error(map_io_error(READ, err)));
                    return;
                }
            }
        }
    }

    fn pause_reads(&mut self, endpoint: &Arc<EndpointInner>) {
        let Some(Entry::Endpoint(entry)) = self.entries.get_mut(&endpoint.token()) else {
            return;
        };
        if !(entry.registered && entry.reading) {
            return;
        }
        match endpoint.reregister_source(self.selector.registry(), Interest::WRITABLE) {
            Ok(()) => {
                entry.reading = false;
                debug!(id = %endpoint.id, "read buffer full, reads paused");
            }
            Err(err) => warn!(id = %endpoint.id, error = %err, "failed to pause reads"),
        }
    }

    fn resume_reads(&mut self, token: Token) {
        let Some(endpoint) = self.endpoint(token) else {
            return;
        };
        match endpoint.protocol() {
            WireProtocol::Tcp => {
                if let Some(Entry::Endpoint(entry)) = self.entries.get_mut(&token) {
                    if entry.registered && !entry.reading {
                        match endpoint.reregister_source(
                            self.selector.registry(),
                            Interest::READABLE | Interest::WRITABLE,
                        ) {
                            Ok(()) => {
                                entry.reading = true;
                                debug!(id = %endpoint.id, "reads resumed");
                            }
                            Err(err) => {
                                warn!(id = %endpoint.id, error = %err, "failed to resume reads");
                            }
                        }
                    }
                }
                self.read_endpoint(&endpoint);
            }
            WireProtocol::Udp => {
                if let Some(listener) = endpoint.udp_listener() {
                    if listener.unblock() {
                        debug!(id = %listener.id, "udp listener reads resumed");
                        self.read_datagrams(&listener);
                    }
                }
            }
        }
    }

    fn flush_endpoint(&mut self, endpoint: &Arc<EndpointInner>) {
        if endpoint.state() != Lifecycle::Connected {
            return;
        }
        if let Err(err) = endpoint.flush() {
            debug!(id = %endpoint.id, error = %err, "write failed");
            endpoint.close_with(CloseReason::Error(err));
        }
    }

    fn listener_ready(&mut self, listener: &Arc<ListenerInner>, event: ReadyEvent) {
        match listener.protocol() {
            WireProtocol::Tcp => self.accept_all(listener),
            WireProtocol::Udp => {
                if event.readable {
                    self.read_datagrams(listener);
                }
                if event.writable {
                    for session in listener.sessions() {
                        self.flush_endpoint(&session);
                    }
                }
            }
        }
    }

    fn accept_all(&mut self, listener: &Arc<ListenerInner>) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        let reactor = Reactor::from_inner(reactor);
        loop {
            match listener.accept_once() {
                Ok(AcceptPoll::Accepted(stream, peer)) => {
                    trace!(listener = %listener.id, %peer, "accepted");
                    listener.dispatch_accept(stream, peer, reactor.clone());
                }
                Ok(AcceptPoll::Drained) => return,
                Err(err) => {
                    warn!(id = %listener.id, error = %err, "accept failed");
                    return;
                }
            }
        }
    }

    fn read_datagrams(&mut self, listener: &Arc<ListenerInner>) {
        if !listener.is_open() {
            return;
        }
        loop {
            match listener.recv_once(&mut self.scratch) {
                Ok(DatagramPoll::Received(session, created)) => {
                    if created {
                        self.adopt_session(listener, session);
                    }
                }
                Ok(DatagramPoll::Blocked | DatagramPoll::Drained) => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(id = %listener.id, error = %err, "udp receive failed");
                    return;
                }
            }
        }
    }

    /// 把新 UDP 会话绑定到本分片，并把它交给接受回调。
    fn adopt_session(&mut self, listener: &Arc<ListenerInner>, session: Arc<EndpointInner>) {
        let Some(reactor) = self.reactor.upgrade() else {
            return;
        };
        if let Err(err) = reactor.bind(&session.binding, "endpoint", session.id, self.handle.index) {
            debug!(id = %session.id, error = %err, "udp session not bound");
            return;
        }
        self.entries.insert(
            session.token(),
            Entry::Endpoint(EndpointEntry {
                endpoint: Arc::downgrade(&session),
                registered: false,
                reading: false,
                connect_armed: false,
                handshake_armed: false,
                detached: false,
            }),
        );
        listener.dispatch_session(session);
    }

    fn fire_timers(&mut self) {
        for event in self.timers.expired(Instant::now()) {
            match event {
                TimerEvent::ConnectTimeout(token) => {
                    if let Some(endpoint) = self.endpoint(token) {
                        endpoint.on_connect_timeout();
                    }
                }
                TimerEvent::HandshakeTimeout(token) => {
                    if let Some(endpoint) = self.endpoint(token) {
                        endpoint.on_handshake_timeout();
                    }
                }
            }
        }
        self.drain_commands();
    }

    fn publish_counts(&mut self) {
        self.entries.retain(|_, entry| entry.is_alive());
        let listeners = self
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Listener(_)))
            .count();
        let detached = self
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Endpoint(entry) if entry.detached))
            .count();
        self.handle
            .endpoints
            .store(self.entries.len() - listeners - detached, Ordering::Relaxed);
        self.handle.listeners.store(listeners, Ordering::Relaxed);
    }
}

/// 轮询线程主体：循环执行 `step` 直到收到停止信号，然后关闭本分片上的一切。
pub(crate) fn run(mut core: ShardCore, timeout: Duration) {
    let shard = core.index();
    debug!(shard, "poll thread started");
    while !core.handle.stopping.load(Ordering::Acquire) {
        if let Err(err) = core.step(Some(timeout)) {
            warn!(shard, error = %err, "poll step failed");
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    core.shutdown();
    debug!(shard, "poll thread stopped");
}
