#![doc = r#"
# flare-tls

## 设计动机（Why）
- 让 `flare-net` 的连接在任意时刻升级为 TLS：连接刚建立时立即升级，或在明文协商
  （如 STARTTLS 风格的 `"DO_SSL"` 标记）之后中途升级；
- 升级前后应用面对的仍是同一套读回调、写令牌与关闭回调。

## 核心构成（How）
- [`TlsContext`]：预先装配好的 rustls 客户端或服务端配置，作为不透明凭据传入；
- [`TlsSession`]：基于 rustls 非阻塞 API 的握手与记录层状态机，实现
  [`flare_net::StreamFilter`]；
- [`StartTls`]：`Endpoint` 上的扩展方法，[`connect_tls`] 与 [`secure_acceptor`]
  提供“连上即加密”的客户端与服务端入口；
- [`ReloadableServerConfig`]：基于 `arc-swap` 的服务端证书热更新容器。

## 契约（What）
- 握手状态单调推进：`NotStarted → Handshaking → Established | Failed`；
- 升级之前已缓冲的明文先于任何解密后的明文交付；
- 握手失败（协议违规、超时、对端发送明文）时连接以该错误关闭，区别于对端有序关闭；
- 本 crate 不解析证书或私钥文件，也不选择加密后端：调用方构造 rustls 配置时自行指定。
"#]

mod context;
mod error;
mod reload;
mod session;
mod start;
#[cfg(test)]
mod test_support;

pub use context::TlsContext;
pub use error::TlsError;
pub use reload::ReloadableServerConfig;
pub use session::TlsSession;
pub use start::{StartTls, TlsSessionInfo, connect_tls, secure_acceptor};

pub use flare_net::HandshakeState;
