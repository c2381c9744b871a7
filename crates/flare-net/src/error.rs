use std::io;
use std::sync::Arc;
use std::time::Duration;

use flare_buffer::BufferError;
use thiserror::Error;

use crate::options::SocketOption;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "flare.net.bind_failed",
    message: "socket bind",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "flare.net.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "flare.net.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "flare.net.read_failed",
    message: "socket read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "flare.net.write_failed",
    message: "socket write",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "flare.net.register_failed",
    message: "selector register",
};
pub(crate) const POLL: OperationKind = OperationKind {
    code: "flare.net.poll_failed",
    message: "selector poll",
};
pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "flare.net.resolve_failed",
    message: "address resolve",
};
pub(crate) const SPAWN: OperationKind = OperationKind {
    code: "flare.net.spawn_failed",
    message: "thread spawn",
};

/// 反应器与连接层的统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 连接失败、超时、协议违规都需要通过完成令牌异步交付给应用，错误值因此必须可克隆；
/// - 编程错误（重复注册、非法状态、非法参数）与运行时错误共用一个类型，
///   调用方可借助 [`FlareError::category`] 统一决定是否重试。
///
/// ## 契约（What）
/// - `Io` 中的 `op` 给出稳定错误码，`source` 以 `Arc` 共享原始 `io::Error`；
/// - `Connection::timed_out` 区分“拒绝/不可达”与“连接超时”；
/// - `Closed` 表示操作因连接已关闭而失败，例如关闭时仍在排队的写入。
#[derive(Debug, Clone, Error)]
pub enum FlareError {
    #[error("connection to {addr} failed: {message}")]
    Connection {
        addr: String,
        message: String,
        timed_out: bool,
    },
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("protocol violation: {message}")]
    Protocol { message: String },
    #[error("{op} is not permitted while {state}")]
    State { op: &'static str, state: String },
    #[error("{kind} {id} is already registered")]
    AlreadyRegistered { kind: &'static str, id: u64 },
    #[error("invalid value {value} for socket option {option:?}")]
    InvalidOption { option: SocketOption, value: i64 },
    #[error("invalid argument `{name}`: {message}")]
    InvalidArgument { name: &'static str, message: String },
    #[error("{op} was cancelled")]
    Cancelled { op: &'static str },
    #[error("endpoint is closed")]
    Closed,
    #[error("invalid configuration: {message}")]
    Config { message: String },
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// 错误的处理建议分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Retryable,
    NonRetryable,
    Timeout,
    Protocol,
    Programming,
}

impl FlareError {
    /// 稳定的机器可读错误码。
    pub fn code(&self) -> &'static str {
        match self {
            FlareError::Connection { timed_out: true, .. } => "flare.net.connect_timeout",
            FlareError::Connection { .. } => CONNECT.code,
            FlareError::Timeout { .. } => "flare.net.timeout",
            FlareError::Io { op, .. } => op.code,
            FlareError::Protocol { .. } => "flare.net.protocol_violation",
            FlareError::State { .. } => "flare.net.invalid_state",
            FlareError::AlreadyRegistered { .. } => "flare.net.already_registered",
            FlareError::InvalidOption { .. } => "flare.net.invalid_option",
            FlareError::InvalidArgument { .. } => "flare.net.invalid_argument",
            FlareError::Cancelled { .. } => "flare.net.cancelled",
            FlareError::Closed => "flare.net.closed",
            FlareError::Config { .. } => "flare.net.invalid_config",
            FlareError::Buffer(_) => "flare.net.buffer",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            FlareError::Connection { timed_out: true, .. } | FlareError::Timeout { .. } => {
                ErrorCategory::Timeout
            }
            FlareError::Connection { .. } => ErrorCategory::Retryable,
            FlareError::Io { source, .. } => categorize_io_error(source),
            FlareError::Protocol { .. } | FlareError::Buffer(_) => ErrorCategory::Protocol,
            FlareError::State { .. }
            | FlareError::AlreadyRegistered { .. }
            | FlareError::InvalidOption { .. }
            | FlareError::InvalidArgument { .. }
            | FlareError::Config { .. } => ErrorCategory::Programming,
            FlareError::Cancelled { .. } | FlareError::Closed => ErrorCategory::NonRetryable,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    pub(crate) fn state(op: &'static str, state: impl ToString) -> Self {
        FlareError::State {
            op,
            state: state.to_string(),
        }
    }
}

/// 将 IO 错误映射为 [`FlareError::Io`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> FlareError {
    FlareError::Io {
        op: kind,
        source: Arc::new(error),
    }
}

/// 将连接阶段的 IO 错误映射为 [`FlareError::Connection`]。
pub(crate) fn connection_error(addr: impl ToString, error: &io::Error) -> FlareError {
    FlareError::Connection {
        addr: addr.to_string(),
        message: error.to_string(),
        timed_out: error.kind() == io::ErrorKind::TimedOut,
    }
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock
        | ErrorKind::Interrupted
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe
        | ErrorKind::WriteZero => ErrorCategory::Retryable,
        ErrorKind::InvalidInput | ErrorKind::InvalidData => ErrorCategory::Programming,
        _ => ErrorCategory::NonRetryable,
    }
}
