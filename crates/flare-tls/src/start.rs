use std::time::Duration;

use flare_net::{Completion, Endpoint, FilterInfo, FlareError, HandshakeState};
use tracing::{debug, warn};

use crate::context::TlsContext;

/// 握手协商出的会话元数据。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsSessionInfo {
    negotiated_version: Option<String>,
    alpn_protocol: Option<Vec<u8>>,
    server_name: Option<String>,
}

impl TlsSessionInfo {
    /// 协商出的协议版本，如 `TLSv1_3`；握手完成前为 `None`。
    pub fn negotiated_version(&self) -> Option<&str> {
        self.negotiated_version.as_deref()
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.alpn_protocol.as_deref()
    }

    /// 服务端为客户端发来的 SNI，客户端为自己配置的服务器名。
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }
}

impl From<FilterInfo> for TlsSessionInfo {
    fn from(info: FilterInfo) -> Self {
        Self {
            negotiated_version: info.protocol_version,
            alpn_protocol: info.alpn_protocol,
            server_name: info.server_name,
        }
    }
}

/// 在已有连接上开启 TLS。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 同一套连接 API 同时覆盖“连上即加密”和“先明文协商、再中途升级”两种协议形态。
///
/// ## 逻辑（How）
/// - 从上下文派生会话，作为字节流变换器安装到连接上；
/// - 客户端会话在安装时即产出 ClientHello，排在写队列尾部；
/// - 握手失败或超时的日志在完成令牌上登记，由反应器在失败时触发。
///
/// ## 契约（What）
/// - 调用之前已缓冲的字节保持明文，照常交给读回调；此后读到的字节一律视为密文；
/// - 握手期间的写入被暂存，握手完成后按提交顺序加密；握手失败时以同一错误失败；
/// - `timeout` 从本次调用开始计时，超时后令牌以 `Timeout` 失败并以该错误关闭连接；
/// - 每条连接只能升级一次，UDP 会话或已关闭的连接返回 `State` 错误。
pub trait StartTls {
    fn start_tls(
        &self,
        context: &TlsContext,
        timeout: Option<Duration>,
    ) -> Result<Completion<()>, FlareError>;

    fn tls_state(&self) -> HandshakeState;

    /// 会话元数据；尚未升级时为 `None`。
    fn tls_info(&self) -> Option<TlsSessionInfo>;
}

impl StartTls for Endpoint {
    fn start_tls(
        &self,
        context: &TlsContext,
        timeout: Option<Duration>,
    ) -> Result<Completion<()>, FlareError> {
        let session = context.new_session()?;
        let buffered = self.read_buffer_len();
        let handshake = self.install_filter(Box::new(session), timeout)?;
        debug!(
            id = %self.id(),
            client = context.is_client(),
            buffered,
            ?timeout,
            "tls upgrade requested"
        );

        let id = self.id();
        handshake.on_complete(move |result| {
            if let Err(err) = result {
                warn!(%id, error = %err, "tls handshake failed");
            }
        });
        Ok(handshake)
    }

    fn tls_state(&self) -> HandshakeState {
        self.handshake_state()
    }

    fn tls_info(&self) -> Option<TlsSessionInfo> {
        self.filter_info().map(TlsSessionInfo::from)
    }
}

/// 客户端“连上即加密”：先安装会话再发起连接，返回握手完成令牌。
///
/// 连接失败时握手令牌随连接关闭以同一错误失败。
pub fn connect_tls(
    endpoint: &Endpoint,
    context: &TlsContext,
    timeout: Option<Duration>,
) -> Result<Completion<()>, FlareError> {
    let handshake = endpoint.start_tls(context, timeout)?;
    let connect = endpoint.connect();
    if let Some(Err(err)) = connect.peek() {
        debug!(id = %endpoint.id(), error = %err, "tls connect failed before handshake");
    }
    Ok(handshake)
}

/// 包装接受回调：每条新连接在交给应用之前先开启服务端 TLS。
///
/// 升级失败的连接直接以错误关闭，不会交给 `acceptor`。
pub fn secure_acceptor<F>(
    context: TlsContext,
    timeout: Option<Duration>,
    acceptor: F,
) -> impl Fn(Endpoint) + Send + Sync + 'static
where
    F: Fn(Endpoint) + Send + Sync + 'static,
{
    move |endpoint: Endpoint| match endpoint.start_tls(&context, timeout) {
        Ok(_) => acceptor(endpoint),
        Err(err) => {
            warn!(id = %endpoint.id(), error = %err, "rejecting connection: tls upgrade failed");
            endpoint.close_with_error(err);
        }
    }
}
