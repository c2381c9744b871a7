use std::io;
use std::time::Duration;

use mio::{Events, Poll, Registry, Token};

/// 一次就绪通知，已从后端事件类型中剥离。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadyEvent {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

/// 就绪选择器的最小抽象。
///
/// # 意图（Why）
/// - 分片只关心“哪些令牌就绪了什么”，不依赖具体的多路复用实现；
/// - 测试可以用这一接缝观察分片的调度，而默认实现基于 `mio`（epoll/kqueue/IOCP）。
///
/// # 契约（What）
/// - `select` 清空并填充 `ready`，最多阻塞 `timeout`；被信号打断时返回 `Ok(())` 与空结果；
/// - `registry` 返回的句柄可跨线程注册、改注册、注销事件源。
pub trait Selector: Send {
    fn select(&mut self, ready: &mut Vec<ReadyEvent>, timeout: Option<Duration>)
    -> io::Result<()>;

    fn registry(&self) -> &Registry;
}

/// 基于 `mio::Poll` 的默认选择器。
pub struct MioSelector {
    poll: Poll,
    events: Events,
}

impl MioSelector {
    pub fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(capacity.max(1)),
        })
    }
}

impl Selector for MioSelector {
    fn select(
        &mut self,
        ready: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }
        ready.extend(self.events.iter().map(|event| ReadyEvent {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            hangup: event.is_read_closed() && event.is_write_closed(),
            error: event.is_error(),
        }));
        Ok(())
    }

    fn registry(&self) -> &Registry {
        self.poll.registry()
    }
}
