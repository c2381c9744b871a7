//! `tls_contract` 集成测试：在真实回环连接上验证 TLS 升级的握手、加解密与失败契约。
//!
//! # 测试目标（Why）
//! - 连上即加密与明文协商后中途升级两种形态都能到达 `Established` 并原样传输数据；
//! - 升级前已缓冲的明文先于解密后的明文交付；
//! - 握手期间的写入被暂存，握手完成后按序加密上线；
//! - 握手超时与对端发送明文都以错误关闭连接，区别于对端有序关闭。
//!
//! # 结构安排（How）
//! - 两端都运行在线程反应器上，或一端使用标准库阻塞套接字（必要时叠加 rustls 阻塞流）作为对照；
//! - 凭据由 `rcgen` 现场生成，所有等待都有上限。

mod support;

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use flare_net::{ByteSpanAggregate, CloseReason, Endpoint, FlareError, HandshakeState};
use flare_tls::{ReloadableServerConfig, StartTls, TlsContext, connect_tls, secure_acceptor};
use parking_lot::Mutex;
use rustls::{ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;
use support::{Credentials, PATIENCE, threaded_reactor, wait_until};

const MARKER: &[u8] = b"DO_SSL";
const PAYLOAD: &[u8] = b"hello over late tls";

fn collect_into(endpoint: &Endpoint, sink: Arc<Mutex<Vec<u8>>>) {
    endpoint.set_reader(move |endpoint| {
        let taken = endpoint.take_read();
        sink.lock().extend_from_slice(&taken.copy_to_vec());
    });
}

fn record_close(endpoint: &Endpoint) -> Arc<Mutex<Vec<CloseReason>>> {
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&reasons);
    endpoint.set_closer(move |_endpoint, reason| sink.lock().push(reason.clone()));
    reasons
}

/// 服务端接受即升级，客户端连上即升级；回显数据与会话元数据在两端一致。
#[test]
fn eager_tls_echo_round_trip() {
    let credentials = Credentials::generate();
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let accepted = Arc::new(Mutex::new(None::<Endpoint>));
    let slot = Arc::clone(&accepted);
    let server_context =
        TlsContext::reloadable_server(ReloadableServerConfig::new(Arc::clone(&credentials.server)));
    listener.set_acceptor(secure_acceptor(
        server_context,
        Some(PATIENCE),
        move |endpoint| {
            endpoint.set_reader(|endpoint| {
                let taken = endpoint.take_read().copy_to_vec();
                endpoint.write(taken);
            });
            *slot.lock() = Some(endpoint);
        },
    ));
    listener.start(&reactor).expect("启动监听");

    let client = reactor
        .create_tcp_client("127.0.0.1", listener.local_addr().port())
        .expect("创建客户端");
    let echoed = Arc::new(Mutex::new(Vec::new()));
    collect_into(&client, Arc::clone(&echoed));

    let handshake =
        connect_tls(&client, &credentials.client_context(), Some(PATIENCE)).expect("开始握手");
    let result = handshake.wait_timeout(PATIENCE);
    assert!(matches!(result, Some(Ok(()))), "握手应成功: {result:?}");
    assert_eq!(client.tls_state(), HandshakeState::Established);
    let client_info = client.tls_info().expect("客户端会话信息");
    assert!(client_info.negotiated_version().is_some());
    assert_eq!(client_info.alpn_protocol(), None);

    let written = client.write(&b"TEST\n"[..]);
    assert!(matches!(written.wait_timeout(PATIENCE), Some(Ok(()))));
    assert!(wait_until(PATIENCE, || echoed.lock().as_slice() == b"TEST\n"));

    let server = accepted.lock().clone().expect("服务端连接");
    assert_eq!(server.tls_state(), HandshakeState::Established);
    let server_info = server.tls_info().expect("服务端会话信息");
    assert_eq!(server_info.server_name(), Some("localhost"));
    assert_eq!(
        server_info.negotiated_version(),
        client_info.negotiated_version()
    );
    assert!(client.stats().total_written() > 5, "线上字节包含握手与记录开销");

    let server_closes = record_close(&server);
    client.close();
    assert!(wait_until(PATIENCE, || !server_closes.lock().is_empty()));
    assert!(matches!(server_closes.lock()[0], CloseReason::Remote));

    reactor.stop();
}

/// 先交换 6 字节明文标记 `"DO_SSL"` 再升级；19 字节负载在两端原样可见。
#[test]
fn late_upgrade_after_plaintext_marker() {
    let credentials = Credentials::generate();
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let server_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&server_seen);
    let server_context = credentials.server_context();
    listener.set_acceptor(move |endpoint| {
        let seen = Arc::clone(&seen);
        let context = server_context.clone();
        let marker = Mutex::new(Vec::new());
        endpoint.set_reader(move |endpoint| {
            if endpoint.tls_state() == HandshakeState::NotStarted {
                let mut marker = marker.lock();
                marker.extend_from_slice(&endpoint.take_read().copy_to_vec());
                if marker.len() < MARKER.len() {
                    return;
                }
                assert_eq!(marker.as_slice(), MARKER);
                endpoint.write(MARKER);
                endpoint
                    .start_tls(&context, Some(PATIENCE))
                    .expect("服务端升级");
                return;
            }
            let taken = endpoint.take_read().copy_to_vec();
            seen.lock().extend_from_slice(&taken);
            endpoint.write(taken);
        });
    });
    listener.start(&reactor).expect("启动监听");

    let client = reactor
        .create_tcp_client("127.0.0.1", listener.local_addr().port())
        .expect("创建客户端");
    let echoed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&echoed);
    let client_context = credentials.client_context();
    // 读回调只在读聚合由空变非空时触发，标记可能分批到达，需要自行攒齐。
    let marker = Mutex::new(Vec::new());
    client.set_reader(move |endpoint| {
        if endpoint.tls_state() == HandshakeState::NotStarted {
            let mut marker = marker.lock();
            marker.extend_from_slice(&endpoint.take_read().copy_to_vec());
            if marker.len() < MARKER.len() {
                return;
            }
            assert_eq!(marker.as_slice(), MARKER);
            endpoint
                .start_tls(&client_context, Some(PATIENCE))
                .expect("客户端升级");
            return;
        }
        sink.lock()
            .extend_from_slice(&endpoint.take_read().copy_to_vec());
    });

    assert!(matches!(client.connect().wait_timeout(PATIENCE), Some(Ok(()))));
    client.write(MARKER);
    assert!(wait_until(PATIENCE, || {
        client.tls_state() == HandshakeState::Established
    }));

    assert_eq!(PAYLOAD.len(), 19);
    let written = client.write(PAYLOAD);
    assert!(matches!(written.wait_timeout(PATIENCE), Some(Ok(()))));
    assert!(wait_until(PATIENCE, || echoed.lock().as_slice() == PAYLOAD));
    assert_eq!(server_seen.lock().as_slice(), PAYLOAD);

    reactor.stop();
}

/// 握手完成前提交的大块写入被暂存，随后按提交顺序加密，对端逐块还原。
#[test]
fn writes_held_during_handshake_arrive_in_order() {
    let credentials = Credentials::generate();
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let received = Arc::new(Mutex::new(ByteSpanAggregate::new()));
    let sink = Arc::clone(&received);
    listener.set_acceptor(secure_acceptor(
        credentials.server_context(),
        Some(PATIENCE),
        move |endpoint| {
            let sink = Arc::clone(&sink);
            endpoint.set_reader(move |endpoint| {
                let mut taken = endpoint.take_read();
                sink.lock().append(&mut taken);
            });
        },
    ));
    listener.start(&reactor).expect("启动监听");

    const CHUNK: usize = 120_000;
    let payloads: Vec<Vec<u8>> = [b'1', b'2', b'3']
        .into_iter()
        .map(|tag| {
            (0..CHUNK)
                .map(|i| if i % 1000 == 0 { tag } else { b'a' + (i % 26) as u8 })
                .collect()
        })
        .collect();

    let client = reactor
        .create_tcp_client("127.0.0.1", listener.local_addr().port())
        .expect("创建客户端");
    let handshake =
        connect_tls(&client, &credentials.client_context(), Some(PATIENCE)).expect("开始握手");
    let writes: Vec<_> = payloads
        .iter()
        .map(|payload| client.write(payload.clone()))
        .collect();

    assert!(matches!(handshake.wait_timeout(PATIENCE), Some(Ok(()))));
    for write in &writes {
        assert!(matches!(write.wait_timeout(PATIENCE), Some(Ok(()))));
    }
    assert!(wait_until(PATIENCE, || received.lock().len() == CHUNK * 3));

    let mut received = received.lock();
    for payload in &payloads {
        let expected = String::from_utf8(payload.clone()).expect("ASCII 负载");
        assert_eq!(received.get_as_string(CHUNK).expect("完整负载"), expected);
    }
    assert!(received.is_empty());
    drop(received);

    reactor.stop();
}

/// 握手完成后连续三次写入同一份大负载，对端收到三份首尾相接的副本，且每份都能独立还原为原文。
#[test]
fn identical_large_writes_arrive_as_three_copies() {
    let credentials = Credentials::generate();
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let received = Arc::new(Mutex::new(ByteSpanAggregate::new()));
    let sink = Arc::clone(&received);
    listener.set_acceptor(secure_acceptor(
        credentials.server_context(),
        Some(PATIENCE),
        move |endpoint| {
            let sink = Arc::clone(&sink);
            endpoint.set_reader(move |endpoint| {
                let mut taken = endpoint.take_read();
                sink.lock().append(&mut taken);
            });
        },
    ));
    listener.start(&reactor).expect("启动监听");

    let text: String = (0..4000)
        .map(|line| format!("line {line:05} of the repeated payload\n"))
        .collect();
    let len = text.len();
    assert!(len > 100_000);

    let client = reactor
        .create_tcp_client("127.0.0.1", listener.local_addr().port())
        .expect("创建客户端");
    let handshake =
        connect_tls(&client, &credentials.client_context(), Some(PATIENCE)).expect("开始握手");
    assert!(matches!(handshake.wait_timeout(PATIENCE), Some(Ok(()))));

    let writes: Vec<_> = (0..3).map(|_| client.write(text.clone().into_bytes())).collect();
    for write in &writes {
        assert!(matches!(write.wait_timeout(PATIENCE), Some(Ok(()))));
    }
    assert!(wait_until(PATIENCE, || received.lock().len() == len * 3));

    let mut received = received.lock();
    for _ in 0..3 {
        assert_eq!(received.get_as_string(len).expect("完整副本"), text);
    }
    assert!(received.is_empty());
    drop(received);

    reactor.stop();
}

/// 对端接受连接却从不应答：握手在超时后失败，暂存的写入一并失败，连接以错误关闭。
#[test]
fn handshake_times_out_against_silent_peer() {
    let credentials = Credentials::generate();
    let silent = TcpListener::bind("127.0.0.1:0").expect("绑定静默监听");
    let port = silent.local_addr().expect("本地地址").port();
    let reactor = threaded_reactor();

    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    let reasons = record_close(&client);
    let started = Instant::now();
    let timeout = Duration::from_millis(300);
    let handshake =
        connect_tls(&client, &credentials.client_context(), Some(timeout)).expect("开始握手");
    let early = client.write(&b"never sent"[..]);

    let result = handshake.wait_timeout(PATIENCE);
    assert!(
        matches!(result, Some(Err(FlareError::Timeout { .. }))),
        "握手应超时: {result:?}"
    );
    assert!(started.elapsed() >= timeout - Duration::from_millis(20));
    assert!(matches!(early.wait_timeout(PATIENCE), Some(Err(_))));
    assert!(wait_until(PATIENCE, || !reasons.lock().is_empty()));
    assert!(matches!(
        reasons.lock()[0],
        CloseReason::Error(FlareError::Timeout { .. })
    ));
    assert_eq!(client.tls_state(), HandshakeState::Failed);

    drop(silent);
    reactor.stop();
}

/// 对端在应当发送密文的位置发来明文：握手以协议错误失败并关闭连接。
#[test]
fn plaintext_reply_fails_handshake() {
    let credentials = Credentials::generate();
    let plain = TcpListener::bind("127.0.0.1:0").expect("绑定明文监听");
    let port = plain.local_addr().expect("本地地址").port();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let peer = thread::spawn(move || {
        let (mut stream, _) = plain.accept().expect("接受连接");
        let mut hello = [0u8; 64];
        let _ = stream.read(&mut hello).expect("读取 ClientHello");
        stream
            .write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n")
            .expect("写回明文");
        let _ = done_rx.recv_timeout(PATIENCE);
    });

    let reactor = threaded_reactor();
    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    let reasons = record_close(&client);
    let handshake =
        connect_tls(&client, &credentials.client_context(), Some(PATIENCE)).expect("开始握手");

    let result = handshake.wait_timeout(PATIENCE);
    assert!(
        matches!(result, Some(Err(FlareError::Protocol { .. }))),
        "握手应因协议违规失败: {result:?}"
    );
    assert!(wait_until(PATIENCE, || !reasons.lock().is_empty()));
    assert!(matches!(
        reasons.lock()[0],
        CloseReason::Error(FlareError::Protocol { .. })
    ));
    assert_eq!(client.tls_state(), HandshakeState::Failed);

    let _ = done_tx.send(());
    peer.join().expect("对端线程");
    reactor.stop();
}

/// 升级前已缓冲的明文先交付，随后才是解密出的明文。
#[test]
fn plaintext_buffered_before_upgrade_is_delivered_first() {
    let credentials = Credentials::generate();
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let (accepted_tx, accepted_rx) = mpsc::channel::<Endpoint>();
    let accepted_tx = Mutex::new(accepted_tx);
    listener.set_acceptor(move |endpoint| {
        let _ = accepted_tx.lock().send(endpoint);
    });
    listener.start(&reactor).expect("启动监听");

    let mut socket =
        TcpStream::connect(("127.0.0.1", listener.local_addr().port())).expect("阻塞连接");
    socket.set_read_timeout(Some(PATIENCE)).expect("读超时");
    socket.write_all(b"PLAIN").expect("写明文");

    let server = accepted_rx.recv_timeout(PATIENCE).expect("服务端连接");
    assert!(wait_until(PATIENCE, || server.read_buffer_len() == 5));
    server.write(&b"GO"[..]);
    let handshake = server
        .start_tls(&credentials.server_context(), Some(PATIENCE))
        .expect("服务端升级");
    let seen = Arc::new(Mutex::new(Vec::new()));
    collect_into(&server, Arc::clone(&seen));

    let mut go = [0u8; 2];
    socket.read_exact(&mut go).expect("读取升级信号");
    assert_eq!(&go, b"GO");
    let name = ServerName::try_from("localhost".to_owned()).expect("服务器名");
    let session = ClientConnection::new(Arc::clone(&credentials.client), name).expect("客户端会话");
    let mut tls = StreamOwned::new(session, socket);
    tls.write_all(b"SECRET").expect("加密写入");
    tls.flush().expect("刷新");

    assert!(matches!(handshake.wait_timeout(PATIENCE), Some(Ok(()))));
    assert!(wait_until(PATIENCE, || seen.lock().as_slice() == b"PLAINSECRET"));
    assert_eq!(server.tls_state(), HandshakeState::Established);

    reactor.stop();
}
