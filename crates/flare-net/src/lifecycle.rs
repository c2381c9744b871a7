use std::fmt;

use crate::error::FlareError;

/// 连接生命周期。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接的建立、关闭由反应器线程与应用线程并发推进，必须有唯一的合法迁移表；
/// - 关闭拆成 `ClosePending` 与 `Closed` 两步：前者在发起关闭的线程上原子地完成，
///   后者在回调通道上完成，保证关闭回调一定排在已调度的读回调之后。
///
/// ## 契约（What）
/// - 合法迁移：`Unconnected → Connecting → Connected`、`Unconnected → Connected`（接受或接管的流）、
///   任一开放状态 `→ ClosePending`、`ClosePending → Closed`；
/// - 其余迁移返回 [`FlareError::State`]，状态保持不变；
/// - `Closed` 为终态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Unconnected,
    Connecting,
    Connected,
    ClosePending,
    Closed,
}

impl Lifecycle {
    pub fn can_transition(self, next: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, next),
            (Unconnected, Connecting)
                | (Unconnected, Connected)
                | (Connecting, Connected)
                | (Unconnected | Connecting | Connected, ClosePending)
                | (ClosePending, Closed)
        )
    }

    /// 执行一次迁移，返回迁移前的状态。
    pub fn transition(&mut self, next: Lifecycle) -> Result<Lifecycle, FlareError> {
        if !self.can_transition(next) {
            return Err(FlareError::state("lifecycle transition", *self));
        }
        let previous = *self;
        *self = next;
        Ok(previous)
    }

    /// 仍可收发数据或正在建立连接。
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Lifecycle::Unconnected | Lifecycle::Connecting | Lifecycle::Connected
        )
    }

    pub fn is_closing_or_closed(self) -> bool {
        !self.is_open()
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Unconnected => "unconnected",
            Lifecycle::Connecting => "connecting",
            Lifecycle::Connected => "connected",
            Lifecycle::ClosePending => "close pending",
            Lifecycle::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// 监听端生命周期：只有开放与关闭两态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ListenerState {
    Open,
    Closed,
}

/// 连接关闭的原因，随关闭回调一起交付。
#[derive(Clone, Debug)]
pub enum CloseReason {
    /// 本端调用了 `close`。
    Local,
    /// 对端关闭了连接（读到 EOF）。
    Remote,
    /// IO、协议或超时错误导致的关闭。
    Error(FlareError),
}

impl CloseReason {
    pub fn error(&self) -> Option<&FlareError> {
        match self {
            CloseReason::Error(err) => Some(err),
            _ => None,
        }
    }
}
