use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info, trace};

use crate::config::EndpointConfig;
use crate::endpoint::{Endpoint, EndpointId, EndpointInner, WireProtocol, resolve};
use crate::error::{BIND, FlareError, map_io_error};
use crate::lifecycle::{CloseReason, ListenerState};
use crate::options::{SocketOption, apply_option};
use crate::reactor::{Binding, Command, Reactor};

/// 接受回调：新连接（或 UDP 新远端）建立后调用。
pub type AcceptCallback = Arc<dyn Fn(Endpoint) + Send + Sync + 'static>;
/// 监听端关闭回调。
pub type ListenerCloseCallback = Arc<dyn Fn(&Listener) + Send + Sync + 'static>;

const DEFAULT_BACKLOG: i32 = 128;

/// 绑定在本地地址上的监听端：TCP 接受连接，UDP 按远端地址分出数据报会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 接受动作在轮询线程上完成，但构造连接与调用接受回调在监听端的回调通道上执行，
///   避免用户代码阻塞就绪循环；
/// - UDP 没有连接概念，监听端为每个远端地址维护一个 `Endpoint`，应用以同一套读写接口处理数据报。
///
/// ## 逻辑（How）
/// - 接受回调先于注册执行：应用可以在回调里安装 TLS 变换器，保证第一字节就经过变换器；
/// - UDP 会话由监听端强引用持有，直到会话关闭或监听端关闭；
/// - 任一 UDP 会话的读聚合达到上限时，监听端整体停止从套接字读取，直到该会话被取走数据。
///
/// ## 契约（What）
/// - `close` 幂等，关闭回调恰好触发一次；底层注销失败被吞掉；
/// - 关闭监听端会关闭其所有 UDP 会话，但不影响已接受的 TCP 连接；
/// - 接受阶段构造连接失败（对端已重置等）只记录日志，不调用接受回调。
#[derive(Clone)]
pub struct Listener {
    pub(crate) inner: Arc<ListenerInner>,
}

pub(crate) struct ListenerInner {
    pub(crate) id: EndpointId,
    protocol: WireProtocol,
    local_addr: SocketAddr,
    socket: Mutex<ListenerSocket>,
    status: Mutex<ListenerStatus>,
    pub(crate) binding: OnceLock<Binding>,
    endpoint_config: EndpointConfig,
    udp: Mutex<UdpPeers>,
    frame_size: AtomicUsize,
    native_buffers: AtomicBool,
}

enum ListenerSocket {
    Tcp(mio::net::TcpListener),
    Udp(mio::net::UdpSocket),
    Released,
}

struct ListenerStatus {
    state: ListenerState,
    acceptor: Option<AcceptCallback>,
    closer: Option<ListenerCloseCallback>,
}

#[derive(Default)]
struct UdpPeers {
    peers: HashMap<SocketAddr, Arc<EndpointInner>>,
    blocked: bool,
}

/// 一次非阻塞接受的结果。
pub(crate) enum AcceptPoll {
    Accepted(mio::net::TcpStream, SocketAddr),
    Drained,
}

/// 一次非阻塞数据报接收的结果。
pub(crate) enum DatagramPoll {
    Received(Arc<EndpointInner>, bool),
    Blocked,
    Drained,
}

impl Listener {
    /// 以默认参数绑定 TCP 监听端。
    pub fn bind_tcp(host: &str, port: u16) -> Result<Listener, FlareError> {
        Self::bind_tcp_with(host, port, DEFAULT_BACKLOG, &EndpointConfig::default())
    }

    pub fn bind_tcp_with(
        host: &str,
        port: u16,
        backlog: i32,
        config: &EndpointConfig,
    ) -> Result<Listener, FlareError> {
        let addr = resolve(host, port)?;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .set_reuse_address(true)
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .bind(&addr.into())
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .listen(backlog)
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(BIND, err))?;
        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        let listener = mio::net::TcpListener::from_std(std_listener);
        info!(%local_addr, "tcp listener bound");
        Ok(Self::from_socket(
            WireProtocol::Tcp,
            local_addr,
            ListenerSocket::Tcp(listener),
            config,
        ))
    }

    /// 以默认参数绑定 UDP 监听端。
    pub fn bind_udp(host: &str, port: u16) -> Result<Listener, FlareError> {
        Self::bind_udp_with(host, port, &EndpointConfig::default())
    }

    pub fn bind_udp_with(
        host: &str,
        port: u16,
        config: &EndpointConfig,
    ) -> Result<Listener, FlareError> {
        let addr = resolve(host, port)?;
        let socket =
            mio::net::UdpSocket::bind(addr).map_err(|err| map_io_error(BIND, err))?;
        let local_addr = socket
            .local_addr()
            .map_err(|err| map_io_error(BIND, err))?;
        info!(%local_addr, "udp listener bound");
        Ok(Self::from_socket(
            WireProtocol::Udp,
            local_addr,
            ListenerSocket::Udp(socket),
            config,
        ))
    }

    fn from_socket(
        protocol: WireProtocol,
        local_addr: SocketAddr,
        socket: ListenerSocket,
        config: &EndpointConfig,
    ) -> Listener {
        Listener {
            inner: Arc::new(ListenerInner {
                id: EndpointId::fresh(),
                protocol,
                local_addr,
                socket: Mutex::new(socket),
                status: Mutex::new(ListenerStatus {
                    state: ListenerState::Open,
                    acceptor: None,
                    closer: None,
                }),
                binding: OnceLock::new(),
                endpoint_config: config.clone(),
                udp: Mutex::new(UdpPeers::default()),
                frame_size: AtomicUsize::new(config.udp_frame_size),
                native_buffers: AtomicBool::new(config.native_buffers),
            }),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.inner.id
    }

    pub fn protocol(&self) -> WireProtocol {
        self.inner.protocol
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn state(&self) -> ListenerState {
        self.inner.status.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ListenerState::Closed
    }

    pub fn set_acceptor<F>(&self, acceptor: F)
    where
        F: Fn(Endpoint) + Send + Sync + 'static,
    {
        self.inner.status.lock().acceptor = Some(Arc::new(acceptor));
    }

    /// 设置关闭回调；监听端已关闭时立即调度。
    pub fn set_closer<F>(&self, closer: F)
    where
        F: Fn(&Listener) + Send + Sync + 'static,
    {
        let closer: ListenerCloseCallback = Arc::new(closer);
        {
            let mut status = self.inner.status.lock();
            status.closer = Some(Arc::clone(&closer));
            if status.state == ListenerState::Open {
                return;
            }
        }
        let listener = self.clone();
        self.inner.run_on_lane(move || closer(&listener));
    }

    /// 注册到反应器并开始接受。
    pub fn start(&self, reactor: &Reactor) -> Result<(), FlareError> {
        reactor.register_listener(self)
    }

    /// 关闭监听端：释放套接字、关闭所有 UDP 会话、调度关闭回调。
    pub fn close(&self) {
        let closer = {
            let mut status = self.inner.status.lock();
            if status.state == ListenerState::Closed {
                return;
            }
            status.state = ListenerState::Closed;
            status.closer.clone()
        };
        info!(id = %self.inner.id, local_addr = %self.inner.local_addr, "listener closing");

        let sessions: Vec<Arc<EndpointInner>> = {
            let mut udp = self.inner.udp.lock();
            udp.blocked = false;
            udp.peers.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close_with(CloseReason::Local);
        }

        match self.inner.binding.get() {
            Some(binding) => binding.shard.send(Command::ReleaseListener(binding.token)),
            None => *self.inner.socket.lock() = ListenerSocket::Released,
        }

        if let Some(closer) = closer {
            let listener = self.clone();
            self.inner.run_on_lane(move || closer(&listener));
        }
    }

    /// 设置监听端选项：`UdpFrameSize`、`UseNativeBuffers` 以及收发缓冲区大小。
    pub fn set_socket_option(&self, option: SocketOption, value: i64) -> bool {
        if let Err(err) = option.validate(value) {
            debug!(id = %self.inner.id, error = %err, "rejected listener option");
            return false;
        }
        self.inner.apply_option(option, value)
    }

    pub fn udp_frame_size(&self) -> usize {
        self.inner.frame_size.load(Ordering::Relaxed)
    }

    /// 当前存活的 UDP 会话数量。
    pub fn udp_session_count(&self) -> usize {
        self.inner.udp.lock().peers.len()
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.inner.id)
            .field("protocol", &self.inner.protocol)
            .field("local_addr", &self.inner.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl ListenerInner {
    pub(crate) fn token(&self) -> Token {
        self.id.token()
    }

    pub(crate) fn protocol(&self) -> WireProtocol {
        self.protocol
    }

    pub(crate) fn is_open(&self) -> bool {
        self.status.lock().state == ListenerState::Open
    }

    pub(crate) fn frame_size(&self) -> usize {
        self.frame_size.load(Ordering::Relaxed)
    }

    pub(crate) fn native_buffers(&self) -> bool {
        self.native_buffers.load(Ordering::Relaxed)
    }

    fn run_on_lane<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.binding.get() {
            Some(binding) => binding.lane.execute(task),
            None => task(),
        }
    }

    pub(crate) fn register_source(&self, registry: &Registry) -> io::Result<()> {
        let token = self.token();
        match &mut *self.socket.lock() {
            ListenerSocket::Tcp(listener) => {
                registry.register(listener, token, Interest::READABLE)
            }
            ListenerSocket::Udp(socket) => {
                registry.register(socket, token, Interest::READABLE | Interest::WRITABLE)
            }
            ListenerSocket::Released => Ok(()),
        }
    }

    /// 注销并丢弃套接字；失败被吞掉。
    pub(crate) fn release(&self, registry: &Registry) {
        let socket = std::mem::replace(&mut *self.socket.lock(), ListenerSocket::Released);
        let outcome = match socket {
            ListenerSocket::Tcp(mut listener) => registry.deregister(&mut listener),
            ListenerSocket::Udp(mut socket) => registry.deregister(&mut socket),
            ListenerSocket::Released => Ok(()),
        };
        if let Err(err) = outcome {
            trace!(id = %self.id, error = %err, "listener deregister failed");
        }
        debug!(id = %self.id, local_addr = %self.local_addr, "listener released");
    }

    /// 接受一条连接；`WouldBlock` 与瞬时错误映射为 `Drained` 或重试。
    pub(crate) fn accept_once(&self) -> io::Result<AcceptPoll> {
        loop {
            let outcome = match &*self.socket.lock() {
                ListenerSocket::Tcp(listener) => listener.accept(),
                _ => return Ok(AcceptPoll::Drained),
            };
            match outcome {
                Ok((stream, peer)) => return Ok(AcceptPoll::Accepted(stream, peer)),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(AcceptPoll::Drained);
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// 在监听端的回调通道上构造连接、调用接受回调并注册。
    pub(crate) fn dispatch_accept(
        self: &Arc<Self>,
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        reactor: Reactor,
    ) {
        let inner = Arc::clone(self);
        self.run_on_lane(move || {
            let endpoint = match Endpoint::from_connected(stream, &inner.endpoint_config) {
                Ok(endpoint) => endpoint,
                Err(err) => {
                    debug!(id = %inner.id, %peer, error = %err, "dropping accepted connection");
                    return;
                }
            };
            let acceptor = inner.status.lock().acceptor.clone();
            let Some(acceptor) = acceptor else {
                debug!(id = %inner.id, %peer, "no acceptor set, closing accepted connection");
                endpoint.close();
                return;
            };
            info!(listener = %inner.id, id = %endpoint.id(), %peer, "connection accepted");
            acceptor(endpoint.clone());
            match reactor.register_endpoint(&endpoint) {
                Ok(()) | Err(FlareError::AlreadyRegistered { .. }) => {}
                Err(err) => {
                    debug!(id = %endpoint.id(), error = %err, "accepted connection not registered");
                    endpoint.close_with_error(err);
                }
            }
        });
    }

    /// 接收一个数据报并交付给对应的会话；返回交付的会话及其是否为新会话。
    pub(crate) fn recv_once(
        self: &Arc<Self>,
        scratch: &mut flare_buffer::ReadScratch,
    ) -> io::Result<DatagramPoll> {
        if self.udp.lock().blocked {
            return Ok(DatagramPoll::Blocked);
        }
        let frame = self.frame_size();
        let copy_out = !self.native_buffers();
        let received = {
            let socket = self.socket.lock();
            let ListenerSocket::Udp(socket) = &*socket else {
                return Ok(DatagramPoll::Drained);
            };
            scratch.fill(frame, copy_out, |buf| {
                let limit = buf.len().min(frame);
                socket.recv_from(&mut buf[..limit])
            })
        };
        let (datagram, peer) = match received {
            Ok(pair) => pair,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                return Ok(DatagramPoll::Drained);
            }
            Err(err) => return Err(err),
        };

        let (session, created) = {
            let mut udp = self.udp.lock();
            match udp.peers.get(&peer) {
                Some(session) => (Arc::clone(session), false),
                None => {
                    let endpoint = Endpoint::udp(
                        Arc::downgrade(self),
                        peer,
                        self.local_addr,
                        &self.endpoint_config,
                    );
                    udp.peers.insert(peer, Arc::clone(&endpoint.inner));
                    (endpoint.inner, true)
                }
            }
        };
        if !datagram.is_empty() {
            session.deliver(datagram);
        }
        if session.should_pause_reads() {
            debug!(listener = %self.id, id = %session.id, %peer, "udp session at read cap, pausing listener");
            self.udp.lock().blocked = true;
        }
        Ok(DatagramPoll::Received(session, created))
    }

    /// 在回调通道上把新 UDP 会话交给接受回调；未设置回调时关闭会话。
    pub(crate) fn dispatch_session(self: &Arc<Self>, session: Arc<EndpointInner>) {
        let inner = Arc::clone(self);
        self.run_on_lane(move || {
            let endpoint = Endpoint::from_inner(session);
            let acceptor = inner.status.lock().acceptor.clone();
            match acceptor {
                Some(acceptor) => {
                    info!(listener = %inner.id, id = %endpoint.id(), peer = ?endpoint.peer_addr(), "udp session opened");
                    acceptor(endpoint);
                }
                None => endpoint.close(),
            }
        });
    }

    /// 解除读暂停；返回之前是否处于暂停。
    pub(crate) fn unblock(&self) -> bool {
        std::mem::take(&mut self.udp.lock().blocked)
    }

    /// 所有 UDP 会话的快照，用于冲刷。
    pub(crate) fn sessions(&self) -> Vec<Arc<EndpointInner>> {
        self.udp.lock().peers.values().cloned().collect()
    }

    /// 移除关闭的会话；若监听端因读上限暂停且剩余会话都未到上限，则恢复读取。
    pub(crate) fn forget_peer(&self, peer: SocketAddr) {
        let resumed = {
            let mut udp = self.udp.lock();
            udp.peers.remove(&peer);
            let resumed = udp.blocked && !udp.peers.values().any(|session| session.read_at_cap());
            if resumed {
                udp.blocked = false;
            }
            resumed
        };
        if resumed {
            debug!(id = %self.id, %peer, "capped udp session closed, listener reads resumed");
            if let Some(binding) = self.binding.get() {
                binding.shard.send(Command::ReadDatagrams(binding.token));
            }
        }
    }

    pub(crate) fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> io::Result<usize> {
        match &*self.socket.lock() {
            ListenerSocket::Udp(socket) => socket.send_to(datagram, peer),
            _ => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// 落地一个已校验的选项。
    pub(crate) fn apply_option(&self, option: SocketOption, value: i64) -> bool {
        match option {
            SocketOption::UdpFrameSize => {
                if self.protocol != WireProtocol::Udp {
                    return false;
                }
                self.frame_size.store(value as usize, Ordering::Relaxed);
                true
            }
            SocketOption::UseNativeBuffers => {
                self.native_buffers.store(value == 1, Ordering::Relaxed);
                true
            }
            SocketOption::NoDelay => false,
            SocketOption::SendBufferSize | SocketOption::RecvBufferSize => {
                let outcome = match &*self.socket.lock() {
                    ListenerSocket::Tcp(listener) => {
                        apply_option(SockRef::from(listener), option, value)
                    }
                    ListenerSocket::Udp(socket) => apply_option(SockRef::from(socket), option, value),
                    ListenerSocket::Released => Ok(false),
                };
                outcome.unwrap_or_else(|err| {
                    debug!(id = %self.id, ?option, error = %err, "listener option not applied");
                    false
                })
            }
        }
    }
}
