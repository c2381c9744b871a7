use std::fmt;
use std::sync::Arc;

use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;

use crate::error::TlsError;
use crate::reload::ReloadableServerConfig;
use crate::session::TlsSession;

/// 预先构建好的 TLS 凭据，作为不透明能力交给连接层。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 证书与私钥的解析属于外部协作方，本类型只接收已经装配好的 rustls 配置；
/// - 同一个上下文可以被任意多条连接共享，每次升级从中派生一个独立会话。
///
/// ## 契约（What）
/// - 客户端上下文在构造时校验服务器名，之后派生会话不会因名称失败；
/// - 服务端上下文可以是固定配置，也可以是 [`ReloadableServerConfig`]。
#[derive(Clone)]
pub struct TlsContext {
    role: Role,
}

#[derive(Clone)]
enum Role {
    Client {
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    },
    Server(Arc<ServerConfig>),
    Reloadable(ReloadableServerConfig),
}

impl TlsContext {
    /// 客户端上下文；`server_name` 同时用于 SNI 与证书校验。
    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_owned()))?;
        Ok(Self {
            role: Role::Client {
                config,
                server_name,
            },
        })
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            role: Role::Server(config),
        }
    }

    /// 证书可热更新的服务端上下文。
    pub fn reloadable_server(config: ReloadableServerConfig) -> Self {
        Self {
            role: Role::Reloadable(config),
        }
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    /// 派生一个尚未开始握手的会话。
    pub fn new_session(&self) -> Result<TlsSession, TlsError> {
        match &self.role {
            Role::Client {
                config,
                server_name,
            } => TlsSession::client(Arc::clone(config), server_name.clone()),
            Role::Server(config) => TlsSession::server(Arc::clone(config)),
            Role::Reloadable(reloadable) => TlsSession::server(reloadable.snapshot()),
        }
    }
}

impl fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            Role::Client { server_name, .. } => f
                .debug_struct("TlsContext")
                .field("role", &"client")
                .field("server_name", server_name)
                .finish_non_exhaustive(),
            Role::Server(_) => f
                .debug_struct("TlsContext")
                .field("role", &"server")
                .finish_non_exhaustive(),
            Role::Reloadable(_) => f
                .debug_struct("TlsContext")
                .field("role", &"reloadable server")
                .finish_non_exhaustive(),
        }
    }
}
