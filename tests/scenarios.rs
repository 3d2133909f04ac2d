//! End-to-end scenario tests covering the documented connection behaviors:
//! alive timeout, idle/busy transitions, a non-responding file receiver,
//! a codec disabled on the receive side, and the shared-delivery-pool
//! blocking fallback.

mod common;

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_for, Collector};
use linkwire::config::{ConnectionParameters, MIN_ALIVE_PERIOD_MS};
use linkwire::events::{CloseInfo, ConnectionEvent, ConnectionListener, FileAbortReason, ObjectAbortReason};
use linkwire::send_pump::SendPump;
use linkwire::wire::parcel::{Priority, HANDSHAKE_MARKER};
use linkwire::{active_connect, Connection, ConnectionState, PassiveListener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Scenario 1: one side requests the other become the alive-sender; once
/// that side stops sending ALIVE, the monitoring side closes with
/// `AliveTimeout` (code 9).
#[tokio::test]
async fn alive_timeout_closes_the_monitoring_side() {
    let (client_conn, _client_rx, server_conn, mut server_rx) =
        common::connect_pair(ConnectionParameters::default(), ConnectionParameters::default()).await;

    // Server asks its peer (the client) to become the alive-sender.
    Connection::set_alive_period_ms(&server_conn, MIN_ALIVE_PERIOD_MS);

    // Let at least one alive cycle complete normally before breaking it.
    tokio::time::sleep(Duration::from_millis(6_000)).await;
    assert_eq!(server_conn.state(), ConnectionState::Connected);

    // Client stops sending ALIVE outright (period 0 aborts the send timer
    // directly rather than renegotiating with the peer).
    Connection::set_alive_period_ms(&client_conn, 0);

    let closed = wait_for(&mut server_rx, Duration::from_secs(15), |e| {
        matches!(e, ConnectionEvent::Closed { .. })
    })
    .await;
    match closed {
        ConnectionEvent::Closed { info, .. } => assert_eq!(info, CloseInfo::AliveTimeout),
        _ => unreachable!(),
    }
}

/// Scenario 2: a burst of traffic keeps the exchange rate above threshold,
/// then silence drops it below threshold (IDLE), then traffic resumes
/// (BUSY).
#[tokio::test]
async fn idle_then_busy_transitions_fire() {
    linkwire::codec::register_global::<Vec<u8>>("scenario2.bytes");

    let client_params = ConnectionParameters::builder()
        .idle_check_period_ms(5_000)
        .idle_threshold_bytes_per_min(10_000)
        .build();

    let (client_conn, mut client_rx, _server_conn, _server_rx) =
        common::connect_pair(client_params, ConnectionParameters::default()).await;

    client_conn
        .send_object(
            "scenario2.bytes",
            linkwire::codec::METHOD_COMPACT,
            Priority::Normal,
            Arc::new(vec![7u8; 10_000]),
        )
        .unwrap();

    let idle = wait_for(&mut client_rx, Duration::from_secs(12), |e| {
        matches!(e, ConnectionEvent::Idle { idle: true, .. })
    })
    .await;
    assert!(matches!(idle, ConnectionEvent::Idle { idle: true, .. }));

    client_conn
        .send_object(
            "scenario2.bytes",
            linkwire::codec::METHOD_COMPACT,
            Priority::Normal,
            Arc::new(vec![7u8; 10_000]),
        )
        .unwrap();

    let busy = wait_for(&mut client_rx, Duration::from_secs(12), |e| {
        matches!(e, ConnectionEvent::Idle { idle: false, .. })
    })
    .await;
    assert!(matches!(busy, ConnectionEvent::Idle { idle: false, .. }));
}

/// Mirrors the server side of the handshake (spec.md §6) without running any
/// of the rest of the engine, so it can accept a connection and then simply
/// never answer anything sent afterward — including never CONFIRMing a file.
async fn accept_and_go_silent(listener: TcpListener) {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut marker = [0u8; HANDSHAKE_MARKER.len()];
    socket.read_exact(&mut marker).await.unwrap();
    assert_eq!(marker, HANDSHAKE_MARKER);
    socket.write_all(&HANDSHAKE_MARKER).await.unwrap();
    socket.flush().await.unwrap();

    let mut sink = vec![0u8; 64 * 1024];
    loop {
        match socket.read(&mut sink).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

/// Scenario 4: the receiver never sends CONFIRM, so the sender's
/// `AbortFileTimeout` fires and it aborts with `SenderConfirmTimeout` (103).
/// The matching receiver-side `ReceiverConfirmTimeout` (104) requires a
/// receiving engine that deliberately withholds CONFIRM, which the public
/// API has no way to drive (the real receiver always auto-confirms), so only
/// the sender side is exercised here.
#[tokio::test]
async fn file_confirm_timeout_aborts_the_sender() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let fake_peer = tokio::spawn(accept_and_go_silent(listener));

    let client_params = ConnectionParameters::builder().confirm_timeout_ms(1_000).build();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client_conn = active_connect(
        addr,
        client_params,
        SendPump::new(),
        vec![Arc::new(Collector(client_tx))],
    )
    .await
    .unwrap();
    wait_for(&mut client_rx, Duration::from_secs(2), |e| {
        matches!(e, ConnectionEvent::Connected)
    })
    .await;

    let mut src = tempfile::NamedTempFile::new().unwrap();
    src.write_all(b"this file will never be confirmed").unwrap();
    src.flush().unwrap();
    let file_id = client_conn
        .send_file(src.path().to_path_buf(), "never.bin", Priority::Normal, 0)
        .await
        .unwrap();

    let aborted = wait_for(&mut client_rx, Duration::from_secs(10), |e| {
        matches!(e, ConnectionEvent::FileAborted { event, .. } if event.object_id == file_id)
    })
    .await;
    match aborted {
        ConnectionEvent::FileAborted { reason, .. } => {
            assert_eq!(reason, FileAbortReason::SenderConfirmTimeout)
        }
        _ => unreachable!(),
    }

    fake_peer.abort();
}

/// Scenario 5: the receiver disables the codec method the sender used, so it
/// cannot decode the object, reports `FAIL(6)`, and the sender fires
/// `Aborted(RemoteCodecUnavailable)`.
#[tokio::test]
async fn codec_disabled_on_receiver_aborts_the_object() {
    linkwire::codec::register_global::<String>("scenario5.string");

    let (client_conn, mut client_rx, server_conn, _server_rx) =
        common::connect_pair(ConnectionParameters::default(), ConnectionParameters::default()).await;

    server_conn.set_receive_codec_enabled(linkwire::codec::METHOD_COMPACT, false);

    let object_id = client_conn
        .send_object(
            "scenario5.string",
            linkwire::codec::METHOD_COMPACT,
            Priority::Normal,
            Arc::new("hello".to_string()),
        )
        .unwrap();

    let aborted = wait_for(&mut client_rx, Duration::from_secs(5), |e| {
        matches!(e, ConnectionEvent::Aborted { object_id: id, .. } if *id == object_id)
    })
    .await;
    match aborted {
        ConnectionEvent::Aborted { info, .. } => assert_eq!(info, ObjectAbortReason::RemoteCodecUnavailable),
        _ => unreachable!(),
    }
}

struct SlowCollector {
    tx: mpsc::UnboundedSender<ConnectionEvent>,
    sleep: Duration,
}

impl ConnectionListener for SlowCollector {
    fn dispatch(&self, event: &ConnectionEvent) {
        std::thread::sleep(self.sleep);
        let _ = self.tx.send(event.clone());
    }
}

/// Scenario 6: a listener slow enough to exceed its connection's
/// `deliverTolerance` marks the shared global pool blocking; the blocked
/// connection migrates itself to an individual pool on its next delivery, so
/// a second connection sharing the same role-wide pool is not held hostage by
/// the first connection's slow listener going forward.
#[tokio::test]
async fn slow_listener_migrates_off_the_shared_delivery_pool() {
    let mut a_peer_listener =
        PassiveListener::bind("127.0.0.1:0".parse().unwrap(), ConnectionParameters::default())
            .await
            .unwrap();
    let a_peer_addr = a_peer_listener.local_addr().unwrap();
    let a_peer_task = tokio::spawn(async move { a_peer_listener.accept().await.unwrap() });

    let a_params = ConnectionParameters::builder().deliver_tolerance_ms(1_000).build();
    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let a_conn = active_connect(
        a_peer_addr,
        a_params,
        SendPump::new(),
        vec![Arc::new(SlowCollector { tx: a_tx, sleep: Duration::from_millis(1_500) })],
    )
    .await
    .unwrap();
    let _a_peer = a_peer_task.await.unwrap();

    let mut b_peer_listener =
        PassiveListener::bind("127.0.0.1:0".parse().unwrap(), ConnectionParameters::default())
            .await
            .unwrap();
    let b_peer_addr = b_peer_listener.local_addr().unwrap();
    let b_peer_task = tokio::spawn(async move { b_peer_listener.accept().await.unwrap() });

    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    let b_conn = active_connect(
        b_peer_addr,
        ConnectionParameters::default(),
        SendPump::new(),
        vec![Arc::new(Collector(b_tx))],
    )
    .await
    .unwrap();
    let _b_peer = b_peer_task.await.unwrap();

    // Both `Connected` deliveries land on the shared global client pool; `a`'s
    // slow dispatch (1.5s, above its 1s tolerance) stalls the single worker
    // thread, so `b`'s may queue behind it too. Generous timeouts absorb that.
    wait_for(&mut a_rx, Duration::from_secs(5), |e| matches!(e, ConnectionEvent::Connected)).await;
    wait_for(&mut b_rx, Duration::from_secs(5), |e| matches!(e, ConnectionEvent::Connected)).await;

    assert!(
        linkwire::delivery::GLOBAL_CLIENT_POOL.is_blocking(),
        "shared pool should be marked blocking once a dispatch exceeded deliverTolerance"
    );

    let a_ping = Connection::ping(&a_conn);
    let b_ping = Connection::ping(&b_conn);

    let started = tokio::time::Instant::now();
    wait_for(&mut b_rx, Duration::from_secs(3), |e| {
        matches!(e, ConnectionEvent::PingEcho(echo) if echo.ping_id == b_ping)
    })
    .await;
    let elapsed = started.elapsed();
    assert!(
        elapsed < Duration::from_millis(1_000),
        "b's delivery should not be held hostage by a's slow listener after migration, took {elapsed:?}"
    );

    wait_for(&mut a_rx, Duration::from_secs(5), |e| {
        matches!(e, ConnectionEvent::PingEcho(echo) if echo.ping_id == a_ping)
    })
    .await;
}
