//! TLS 集成测试共用的凭据、等待与启动帮助函数。

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use flare_net::{FlareConfig, Reactor};
use flare_tls::TlsContext;
use rustls::crypto::ring;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

pub const PATIENCE: Duration = Duration::from_secs(10);

/// 一组互相信任的 `localhost` 凭据。
pub struct Credentials {
    pub client: Arc<ClientConfig>,
    pub server: Arc<ServerConfig>,
}

impl Credentials {
    pub fn generate() -> Self {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()])
            .expect("生成自签名证书");
        let cert = certified.cert.der().clone();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            certified.key_pair.serialize_der(),
        ));
        let provider = Arc::new(ring::default_provider());
        let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .expect("协议版本")
            .with_no_client_auth()
            .with_single_cert(vec![cert.clone()], key)
            .expect("服务端证书");
        let mut roots = RootCertStore::empty();
        roots.add(cert).expect("信任根");
        let client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("协议版本")
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            client: Arc::new(client),
            server: Arc::new(server),
        }
    }

    pub fn client_context(&self) -> TlsContext {
        TlsContext::client(Arc::clone(&self.client), "localhost").expect("客户端上下文")
    }

    pub fn server_context(&self) -> TlsContext {
        TlsContext::server(Arc::clone(&self.server))
    }
}

/// 轮询 `condition` 直到为真或超时；返回最后一次求值结果。
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return condition();
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

pub fn threaded_reactor() -> Reactor {
    let reactor = Reactor::threaded(FlareConfig::default()).expect("创建反应器");
    reactor.start().expect("启动反应器");
    reactor
}
