//! `tcp_contract` 集成测试：在真实回环套接字上验证 TCP 连接的读写、背压、关闭与连接超时契约。
//!
//! # 测试目标（Why）
//! - 对端观察到的字节序列必须等于本端按提交顺序拼接的写入；
//! - 读聚合达到上限后停止读取，应用取走数据后恢复，且不丢字节；
//! - 关闭回调恰好触发一次，并晚于关闭前已缓冲数据的读回调；
//! - 连接被拒绝立即失败，无人应答时在超时后失败。
//!
//! # 结构安排（How）
//! - 服务端与客户端都运行在同一个线程反应器上，或一端使用标准库阻塞套接字作为对照；
//! - 所有等待都通过 `support::wait_until` 设定上限，避免测试挂死。

mod support;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use flare_net::{
    CloseReason, Endpoint, EndpointConfig, FlareConfig, FlareError, Lifecycle, WireProtocol,
};
use parking_lot::Mutex;
use support::{PATIENCE, threaded_reactor, threaded_reactor_with, wait_until};

/// 帮助函数：读回调把取走的字节追加到共享缓冲。
fn collect_into(endpoint: &Endpoint, sink: Arc<Mutex<Vec<u8>>>) {
    endpoint.set_reader(move |endpoint| {
        let taken = endpoint.take_read();
        sink.lock().extend_from_slice(&taken.copy_to_vec());
    });
}

/// 客户端写 `"TEST\n"`，回显服务端原样写回，客户端逐字节观察到相同内容。
#[test]
fn echo_round_trip_preserves_bytes() {
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let server_seen = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&server_seen);
    listener.set_acceptor(move |endpoint| {
        let seen = Arc::clone(&seen);
        endpoint.set_reader(move |endpoint| {
            let taken = endpoint.take_read().copy_to_vec();
            seen.lock().extend_from_slice(&taken);
            endpoint.write(taken);
        });
    });
    listener.start(&reactor).expect("启动监听");

    let port = listener.local_addr().port();
    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    let echoed = Arc::new(Mutex::new(Vec::new()));
    collect_into(&client, Arc::clone(&echoed));

    let connected = client.connect().wait_timeout(PATIENCE);
    assert!(matches!(connected, Some(Ok(()))), "连接应成功: {connected:?}");
    assert_eq!(client.state(), Lifecycle::Connected);
    assert_eq!(client.protocol(), WireProtocol::Tcp);
    assert!(client.local_addr().is_some());

    let written = client.write(Bytes::from_static(b"TEST\n"));
    assert!(matches!(written.wait_timeout(PATIENCE), Some(Ok(()))));
    assert!(wait_until(PATIENCE, || echoed.lock().as_slice() == b"TEST\n"));
    assert_eq!(server_seen.lock().as_slice(), b"TEST\n");
    assert_eq!(client.stats().total_written(), 5);
    assert!(wait_until(PATIENCE, || client.stats().total_read() == 5));
    assert!(wait_until(PATIENCE, || reactor.endpoint_count() == 2));
    assert_eq!(reactor.listener_count(), 1);

    reactor.stop();
    assert!(client.is_closed());
    assert!(listener.is_closed());
}

/// 多次写入在对端按提交顺序拼接，写完成令牌按 FIFO 顺序完成。
#[test]
fn writes_arrive_in_submission_order() {
    let reactor = threaded_reactor();
    let server = TcpListener::bind("127.0.0.1:0").expect("绑定对照服务端");
    let port = server.local_addr().expect("本地地址").port();

    let mut expected = Vec::new();
    for index in 0..200u32 {
        expected.extend_from_slice(format!("line-{index:04}\n").as_bytes());
    }
    let total = expected.len();
    let reader = thread::spawn(move || {
        let (mut stream, _) = server.accept().expect("接受连接");
        let mut received = vec![0u8; total];
        stream.read_exact(&mut received).expect("读满全部字节");
        received
    });

    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    let completed = Arc::new(Mutex::new(Vec::new()));
    let track = |index: u32| {
        let completed = Arc::clone(&completed);
        client
            .write(format!("line-{index:04}\n").into_bytes())
            .on_complete(move |result| {
                if result.is_ok() {
                    completed.lock().push(index);
                }
            });
    };
    // 连接之前提交的写入同样按序冲刷。
    track(0);
    client.connect();
    for index in 1..200u32 {
        track(index);
    }

    let received = reader.join().expect("读取线程");
    assert_eq!(received, expected);
    assert!(wait_until(PATIENCE, || completed.lock().len() == 200));
    let order = completed.lock().clone();
    assert!(order.windows(2).all(|pair| pair[0] < pair[1]), "完成顺序: {order:?}");
    assert_eq!(client.write_buffer_len(), 0);
    assert!(!client.has_pending_writes());
    reactor.stop();
}

/// 读聚合达到上限后停止读取，取走数据后恢复，全部字节最终到达且不超过上限一个块。
#[test]
fn read_cap_throttles_without_dropping() {
    let mut config = FlareConfig::default();
    config.endpoint.max_read_buffer = 8 * 1024;
    let reactor = threaded_reactor_with(config);
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let (accepted_tx, accepted_rx) = mpsc::channel();
    listener.set_acceptor(move |endpoint| {
        let _ = accepted_tx.send(endpoint);
    });
    listener.start(&reactor).expect("启动监听");

    const TOTAL: usize = 1024 * 1024;
    let port = listener.local_addr().port();
    let writer = thread::spawn(move || {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).expect("连接服务端");
        let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
        stream.write_all(&payload).expect("写入全部负载");
        stream.shutdown(Shutdown::Write).expect("半关闭");
    });

    let server = accepted_rx.recv_timeout(PATIENCE).expect("接受连接");
    assert_eq!(server.max_read_buffer(), 8 * 1024);
    assert!(wait_until(PATIENCE, || server.read_buffer_len() >= 8 * 1024));
    thread::sleep(Duration::from_millis(100));
    let chunk = reactor.config().reactor.read_chunk_size;
    assert!(
        server.read_buffer_len() <= 8 * 1024 + chunk,
        "读聚合超出上限过多: {}",
        server.read_buffer_len()
    );

    let mut received = Vec::with_capacity(TOTAL);
    assert!(wait_until(PATIENCE, || {
        received.extend_from_slice(&server.take_read().copy_to_vec());
        received.len() == TOTAL
    }));
    assert!(received.iter().enumerate().all(|(i, byte)| *byte == (i % 251) as u8));
    writer.join().expect("写入线程");
    reactor.stop();
}

/// 对端发完数据后关闭：读回调先拿到全部数据，关闭回调随后恰好触发一次。
#[test]
fn close_callback_follows_pending_reads_exactly_once() {
    let reactor = threaded_reactor();
    let listener = reactor
        .create_tcp_listener("127.0.0.1", 0)
        .expect("绑定监听端");
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let (accepted_tx, accepted_rx) = mpsc::channel();
    let log = Arc::clone(&events);
    listener.set_acceptor(move |endpoint| {
        let reads = Arc::clone(&log);
        endpoint.set_reader(move |endpoint| {
            let taken = endpoint.take_read().copy_to_vec();
            reads
                .lock()
                .push(format!("read:{}", String::from_utf8_lossy(&taken)));
        });
        let closes = Arc::clone(&log);
        endpoint.set_closer(move |_, reason| {
            closes.lock().push(format!("close:{}", matches!(reason, CloseReason::Remote)));
        });
        let _ = accepted_tx.send(endpoint);
    });
    listener.start(&reactor).expect("启动监听");

    let mut peer = TcpStream::connect(listener.local_addr()).expect("连接服务端");
    peer.write_all(b"bye").expect("写入");
    drop(peer);

    let server = accepted_rx.recv_timeout(PATIENCE).expect("接受连接");
    assert!(wait_until(PATIENCE, || server.state() == Lifecycle::Closed));
    server.close();
    server.close();
    thread::sleep(Duration::from_millis(50));

    let events = events.lock().clone();
    let closes = events.iter().filter(|event| event.starts_with("close")).count();
    assert_eq!(closes, 1, "事件序列: {events:?}");
    assert_eq!(events.last().map(String::as_str), Some("close:true"));
    let read: String = events
        .iter()
        .filter_map(|event| event.strip_prefix("read:"))
        .collect();
    assert_eq!(read, "bye");
    assert!(matches!(
        server.write(Bytes::from_static(b"late")).peek(),
        Some(Err(FlareError::Closed))
    ));
    reactor.stop();
}

/// 连接一个没有监听者的端口：令牌以 `Connection` 错误失败，关闭原因携带同一错误。
#[test]
fn refused_connect_fails_and_closes() {
    let port = {
        let probe = TcpListener::bind("127.0.0.1:0").expect("占用临时端口");
        probe.local_addr().expect("本地地址").port()
    };
    let reactor = threaded_reactor();
    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    let reason = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&reason);
    client.set_closer(move |_, reason| {
        *slot.lock() = Some(reason.clone());
    });

    let outcome = client.connect().wait_timeout(PATIENCE);
    assert!(
        matches!(outcome, Some(Err(FlareError::Connection { timed_out: false, .. }))),
        "应被拒绝: {outcome:?}"
    );
    assert!(wait_until(PATIENCE, || reason.lock().is_some()));
    assert!(matches!(
        reason.lock().as_ref(),
        Some(CloseReason::Error(FlareError::Connection { .. }))
    ));
    assert!(client.is_closed());
    reactor.stop();
}

/// 连接不可达地址并设置 200ms 超时：要么立即失败（无路由），要么不早于 200ms 超时失败。
#[test]
fn unanswered_connect_times_out() {
    let reactor = threaded_reactor();
    let config = EndpointConfig {
        connect_timeout_ms: 200,
        ..EndpointConfig::default()
    };
    let client = Endpoint::tcp_with_config("10.255.255.1", 80, &config).expect("解析地址");
    reactor.register_endpoint(&client).expect("注册");

    let outcome = client.connect().wait_timeout(PATIENCE);
    let elapsed = client.created_at().elapsed();
    match outcome {
        Some(Err(FlareError::Connection { timed_out: true, .. })) => {
            assert!(elapsed >= Duration::from_millis(200), "过早超时: {elapsed:?}");
            assert!(elapsed < Duration::from_secs(3), "超时过晚: {elapsed:?}");
            assert!(client.has_connection_timed_out() || client.is_closed());
        }
        Some(Err(FlareError::Connection { .. } | FlareError::Io { .. })) => {}
        other => panic!("连接不应成功: {other:?}"),
    }
    assert!(wait_until(PATIENCE, || client.is_closed()));
    reactor.stop();
}

/// 连接超时从端点创建时起算：创建后等待超过超时再连接，即使对端在监听也立即以超时失败。
#[test]
fn connect_after_deadline_fails_without_dialing() {
    let server = TcpListener::bind("127.0.0.1:0").expect("绑定对照服务端");
    let port = server.local_addr().expect("本地地址").port();
    let reactor = threaded_reactor();
    let config = EndpointConfig {
        connect_timeout_ms: 200,
        ..EndpointConfig::default()
    };
    let client = Endpoint::tcp_with_config("127.0.0.1", port, &config).expect("解析地址");
    reactor.register_endpoint(&client).expect("注册");
    thread::sleep(Duration::from_millis(300));
    assert!(client.has_connection_timed_out());

    let issued = Instant::now();
    let outcome = client.connect().wait_timeout(PATIENCE);
    assert!(
        matches!(outcome, Some(Err(FlareError::Connection { timed_out: true, .. }))),
        "应按创建时刻判定超时: {outcome:?}"
    );
    assert!(issued.elapsed() < Duration::from_millis(100));
    assert!(wait_until(PATIENCE, || client.is_closed()));
    server
        .set_nonblocking(true)
        .expect("设置非阻塞");
    assert!(server.accept().is_err(), "不应发起连接");
    reactor.stop();
}

/// 取消连接令牌会中止连接并关闭端点。
#[test]
fn cancelling_connect_closes_endpoint() {
    let reactor = threaded_reactor();
    let client = Endpoint::tcp("10.255.255.1", 80).expect("解析地址");
    reactor.register_endpoint(&client).expect("注册");
    let token = client.connect();
    if token.cancel() {
        assert!(token.is_cancelled());
        assert!(wait_until(PATIENCE, || client.state() == Lifecycle::Closed));
    }
    reactor.stop();
}

/// 先移出就绪集合再关闭：套接字仍被释放，对端读到 EOF。
#[test]
fn close_after_deregister_still_releases_socket() {
    let reactor = threaded_reactor();
    let server = TcpListener::bind("127.0.0.1:0").expect("绑定对照服务端");
    let port = server.local_addr().expect("本地地址").port();
    let client = reactor
        .create_tcp_client("127.0.0.1", port)
        .expect("创建客户端");
    assert!(matches!(client.connect().wait_timeout(PATIENCE), Some(Ok(()))));
    let (mut peer, _) = server.accept().expect("接受连接");

    reactor.deregister_endpoint(&client);
    assert!(wait_until(PATIENCE, || reactor.endpoint_count() == 0));
    client.close();
    assert!(wait_until(PATIENCE, || client.is_closed()));

    peer.set_read_timeout(Some(PATIENCE)).expect("设置读超时");
    let mut buf = [0u8; 8];
    let n = peer.read(&mut buf).expect("对端应读到 EOF 而非超时");
    assert_eq!(n, 0);
    reactor.stop();
}

/// 接管已建立的标准库连接，初始即为 `Connected`。
#[test]
fn adopted_stream_starts_connected() {
    let reactor = threaded_reactor();
    let server = TcpListener::bind("127.0.0.1:0").expect("绑定对照服务端");
    let stream = TcpStream::connect(server.local_addr().expect("本地地址")).expect("连接");
    let (mut peer, _) = server.accept().expect("接受");

    let endpoint = reactor.adopt_tcp_stream(stream).expect("接管连接");
    assert_eq!(endpoint.state(), Lifecycle::Connected);
    assert!(endpoint.peer_addr().is_some());
    assert!(matches!(
        endpoint
            .write(Bytes::from_static(b"adopted"))
            .wait_timeout(PATIENCE),
        Some(Ok(()))
    ));
    let mut buf = [0u8; 7];
    peer.read_exact(&mut buf).expect("读取");
    assert_eq!(&buf, b"adopted");
    reactor.stop();
}
