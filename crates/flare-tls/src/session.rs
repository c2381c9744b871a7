use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flare_net::{FilterInfo, FilterOutput, FlareError, StreamFilter};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use rustls_pki_types::ServerName;
use tracing::{debug, trace};

use crate::error::{TlsError, protocol_violation};

/// rustls 的两种连接角色。
enum Engine {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Engine::Client(conn) => conn.read_tls(rd),
            Engine::Server(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            Engine::Client(conn) => conn.write_tls(wr),
            Engine::Server(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Engine::Client(conn) => conn.process_new_packets(),
            Engine::Server(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Engine::Client(conn) => conn.wants_write(),
            Engine::Server(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Engine::Client(conn) => conn.is_handshaking(),
            Engine::Server(conn) => conn.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Client(conn) => conn.reader(),
            Engine::Server(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Client(conn) => conn.writer(),
            Engine::Server(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Engine::Client(conn) => conn.send_close_notify(),
            Engine::Server(conn) => conn.send_close_notify(),
        }
    }

    fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        match self {
            Engine::Client(conn) => conn.protocol_version(),
            Engine::Server(conn) => conn.protocol_version(),
        }
    }

    fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Engine::Client(conn) => conn.alpn_protocol(),
            Engine::Server(conn) => conn.alpn_protocol(),
        }
    }
}

/// 一条连接上的 TLS 会话，以 [`StreamFilter`] 的形式插入连接。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 让已经建立的明文连接随时升级为加密连接，读写回调与完成令牌的语义不变；
/// - 握手、加解密全部在反应器已经持有的字节上完成，不额外占用线程或套接字。
///
/// ## 逻辑（How）
/// - 入站：密文分段喂给 `read_tls`，每段之后 `process_new_packets` 并取走解出的明文，
///   再把引擎想发送的记录（握手回应、告警、会话票据）收集到 `wire`；
/// - 出站：明文写入引擎，立即收集加密记录；
/// - 引擎第一次报告握手结束时置位 `established`，之后不再重复报告。
///
/// ## 契约（What）
/// - 任一 rustls 错误都以 [`FlareError::Protocol`] 返回，连接随后以该错误关闭；
/// - 对端发送 `close_notify` 时置位 `peer_closed`，连接按对端有序关闭处理；
/// - 引擎缓冲上限被关闭，写入量只受连接写队列约束。
pub struct TlsSession {
    engine: Engine,
    server_name: Option<String>,
    reported: bool,
}

impl TlsSession {
    pub(crate) fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<Self, TlsError> {
        let label = server_name.to_str().into_owned();
        let mut conn = ClientConnection::new(config, server_name)?;
        conn.set_buffer_limit(None);
        Ok(Self {
            engine: Engine::Client(conn),
            server_name: Some(label),
            reported: false,
        })
    }

    pub(crate) fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        let mut conn = ServerConnection::new(config)?;
        conn.set_buffer_limit(None);
        Ok(Self {
            engine: Engine::Server(conn),
            server_name: None,
            reported: false,
        })
    }

    pub fn is_client(&self) -> bool {
        matches!(self.engine, Engine::Client(_))
    }

    pub fn is_handshaking(&self) -> bool {
        self.engine.is_handshaking()
    }

    /// 把引擎待发送的记录收集成一段连续字节。
    fn drain_wire(&mut self, out: &mut FilterOutput) -> Result<(), FlareError> {
        let mut sealed = Vec::new();
        while self.engine.wants_write() {
            self.engine
                .write_tls(&mut sealed)
                .map_err(|err| FlareError::Protocol {
                    message: format!("tls: {err}"),
                })?;
        }
        if !sealed.is_empty() {
            trace!(len = sealed.len(), "tls records sealed");
            out.wire.push(Bytes::from(sealed));
        }
        Ok(())
    }

    fn report_established(&mut self, out: &mut FilterOutput) {
        if !self.reported && !self.engine.is_handshaking() {
            self.reported = true;
            out.established = true;
            debug!(
                version = ?self.engine.protocol_version(),
                client = self.is_client(),
                "tls handshake finished"
            );
        }
    }
}

impl StreamFilter for TlsSession {
    fn start(&mut self, out: &mut FilterOutput) -> Result<(), FlareError> {
        debug!(client = self.is_client(), "tls handshake started");
        self.drain_wire(out)
    }

    fn on_inbound(&mut self, wire: &[u8], out: &mut FilterOutput) -> Result<(), FlareError> {
        let mut remaining = wire;
        while !remaining.is_empty() {
            let consumed = self
                .engine
                .read_tls(&mut remaining)
                .map_err(|err| FlareError::Protocol {
                    message: format!("tls: {err}"),
                })?;
            if consumed == 0 {
                break;
            }
            let state = self
                .engine
                .process_new_packets()
                .map_err(protocol_violation)?;

            let pending = state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut plaintext = vec![0; pending];
                self.engine
                    .reader()
                    .read_exact(&mut plaintext)
                    .map_err(|err| FlareError::Protocol {
                        message: format!("tls: {err}"),
                    })?;
                out.plaintext.push(Bytes::from(plaintext));
            }
            if state.peer_has_closed() {
                out.peer_closed = true;
            }
        }
        self.drain_wire(out)?;
        self.report_established(out);
        Ok(())
    }

    fn on_outbound(&mut self, plaintext: &[u8], out: &mut FilterOutput) -> Result<(), FlareError> {
        self.engine
            .writer()
            .write_all(plaintext)
            .map_err(|err| FlareError::Protocol {
                message: format!("tls: {err}"),
            })?;
        self.drain_wire(out)
    }

    fn on_close(&mut self, out: &mut FilterOutput) {
        self.engine.send_close_notify();
        // 告别字节尽力而为，收集失败时直接放弃。
        let _ = self.drain_wire(out);
    }

    fn info(&self) -> FilterInfo {
        let server_name = match &self.engine {
            Engine::Server(conn) => conn.server_name().map(str::to_owned),
            Engine::Client(_) => self.server_name.clone(),
        };
        FilterInfo {
            protocol_version: self.engine.protocol_version().map(|v| format!("{v:?}")),
            alpn_protocol: self.engine.alpn_protocol().map(<[u8]>::to_vec),
            server_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_support::configs;

    fn pair() -> (TlsSession, TlsSession) {
        let (client, server) = configs();
        let name = ServerName::try_from("localhost".to_owned()).expect("合法名称");
        (
            TlsSession::client(client, name).expect("客户端会话"),
            TlsSession::server(server).expect("服务端会话"),
        )
    }

    /// 把一方产出的记录交给另一方。
    fn relay(bytes: &[Bytes], to: &mut TlsSession) -> FilterOutput {
        let mut out = FilterOutput::default();
        for chunk in bytes {
            to.on_inbound(chunk, &mut out).expect("对端应接受记录");
        }
        out
    }

    #[test]
    fn sessions_handshake_and_exchange_plaintext() {
        let (mut client, mut server) = pair();
        let mut hello = FilterOutput::default();
        client.start(&mut hello).expect("客户端启动");
        assert!(!hello.wire.is_empty(), "客户端应立即产出 ClientHello");
        let mut idle = FilterOutput::default();
        server.start(&mut idle).expect("服务端启动");
        assert!(idle.wire.is_empty());

        let mut to_server = hello.wire;
        let mut client_done = false;
        let mut server_done = false;
        for _ in 0..4 {
            let from_server = relay(&to_server, &mut server);
            server_done |= from_server.established;
            let from_client = relay(&from_server.wire, &mut client);
            client_done |= from_client.established;
            to_server = from_client.wire;
            if client_done && server_done && to_server.is_empty() {
                break;
            }
        }
        assert!(client_done && server_done);
        assert!(!client.is_handshaking());

        let mut sealed = FilterOutput::default();
        client
            .on_outbound(b"hello over tls", &mut sealed)
            .expect("加密");
        assert_ne!(sealed.wire.concat(), b"hello over tls".to_vec());
        let opened = relay(&sealed.wire, &mut server);
        assert_eq!(opened.plaintext.concat(), b"hello over tls".to_vec());
        assert!(!opened.established, "握手完成只报告一次");

        let info = server.info();
        assert_eq!(info.server_name.as_deref(), Some("localhost"));
        assert!(info.protocol_version.is_some());
        assert_eq!(client.info().server_name.as_deref(), Some("localhost"));

        let mut goodbye = FilterOutput::default();
        client.on_close(&mut goodbye);
        let closed = relay(&goodbye.wire, &mut server);
        assert!(closed.peer_closed);
    }

    #[test]
    fn plaintext_where_ciphertext_expected_is_a_protocol_violation() {
        let (_, mut server) = pair();
        let mut out = FilterOutput::default();
        let err = server
            .on_inbound(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", &mut out)
            .expect_err("明文应被拒绝");
        assert!(matches!(err, FlareError::Protocol { .. }), "{err:?}");
    }
}
