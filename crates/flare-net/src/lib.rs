#![doc = r#"
# flare-net

## 设计动机（Why）
- 用少量轮询线程承载大量 TCP/UDP 连接：读写、接受等系统调用集中在反应器上完成，
  应用只面对“读聚合 + 写队列 + 完成令牌”；
- 同一连接的回调严格串行、不同连接之间并行，应用无需为单连接状态加锁；
- 读路径自带背压：读聚合达到上限即停止读取，直到应用取走数据；写路径不做背压，
  由调用方通过 `write_buffer_len` 自行控制。

## 核心构成（How）
- [`Reactor`]：分片式反应器，支持线程驱动与手动驱动两种模式；
- [`Endpoint`]：一条 TCP 连接或一个 UDP 远端会话，承载生命周期、读写缓冲、套接字选项与统计；
- [`Listener`]：TCP 接受端或 UDP 多路会话端；
- [`Completion`]：连接、写入、握手的完成令牌，可阻塞等待、注册回调或作为 `Future` 使用；
- [`StreamFilter`]：插在连接与套接字之间的字节流变换接缝，`flare-tls` 在其上实现 TLS；
- [`Selector`]：就绪选择器抽象，默认由 `mio` 实现。

## 契约（What）
- 连接生命周期单调推进：`Unconnected → Connecting → Connected → ClosePending → Closed`；
- 关闭回调恰好触发一次，且在关闭前已缓冲数据的读回调之后触发；
- 写入按提交顺序上线，完成令牌按 FIFO 顺序完成；
- 所有错误以 [`FlareError`] 表达，IO 错误总是关闭连接并经由关闭回调报告。
"#]

mod completion;
mod config;
mod endpoint;
mod error;
mod filter;
mod lanes;
mod lifecycle;
mod listener;
mod options;
mod reactor;
mod selector;
mod stats;

pub use completion::Completion;
pub use config::{EndpointConfig, FlareConfig, ReactorConfig};
pub use endpoint::{CloseCallback, Endpoint, EndpointId, ReadCallback, WireProtocol};
pub use error::{ErrorCategory, FlareError, OperationKind};
pub use filter::{FilterInfo, FilterOutput, HandshakeState, StreamFilter};
pub use lanes::LaneExecutor;
pub use lifecycle::{CloseReason, Lifecycle, ListenerState};
pub use listener::{AcceptCallback, Listener, ListenerCloseCallback};
pub use options::{SocketOption, SocketOptions};
pub use reactor::{ExecutionMode, Reactor};
pub use selector::{MioSelector, ReadyEvent, Selector};
pub use stats::ByteStats;

pub use flare_buffer::{BufferError, ByteSpanAggregate};
