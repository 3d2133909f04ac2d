//! Shared scaffolding for the integration tests: a loopback connection pair
//! plus an event collector that funnels `ConnectionEvent`s onto a channel so
//! assertions can poll for the event they care about instead of racing the
//! background tasks directly.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use linkwire::config::ConnectionParameters;
use linkwire::events::{ConnectionEvent, ConnectionListener};
use linkwire::send_pump::SendPump;
use linkwire::{active_connect, Connection, PassiveListener};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

pub struct Collector(pub UnboundedSender<ConnectionEvent>);

impl ConnectionListener for Collector {
    fn dispatch(&self, event: &ConnectionEvent) {
        let _ = self.0.send(event.clone());
    }
}

/// Binds a passive listener, dials it from the active side, and returns both
/// ends together with their event streams once each has observed `Connected`.
pub async fn connect_pair(
    client_params: ConnectionParameters,
    server_params: ConnectionParameters,
) -> (
    Arc<Connection>,
    UnboundedReceiver<ConnectionEvent>,
    Arc<Connection>,
    UnboundedReceiver<ConnectionEvent>,
) {
    let mut listener = PassiveListener::bind("127.0.0.1:0".parse().unwrap(), server_params)
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel();
    listener.add_listener(Arc::new(Collector(server_tx)));
    let accept_task = tokio::spawn(async move { listener.accept().await.unwrap() });

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    let client_conn = active_connect(
        addr,
        client_params,
        SendPump::new(),
        vec![Arc::new(Collector(client_tx))],
    )
    .await
    .unwrap();
    let server_conn = accept_task.await.unwrap();

    wait_for(&mut client_rx, Duration::from_secs(2), |e| {
        matches!(e, ConnectionEvent::Connected)
    })
    .await;
    wait_for(&mut server_rx, Duration::from_secs(2), |e| {
        matches!(e, ConnectionEvent::Connected)
    })
    .await;

    (client_conn, client_rx, server_conn, server_rx)
}

/// Drains `rx` until an event matching `pred` arrives, panicking if `timeout`
/// elapses first. Non-matching events are discarded.
pub async fn wait_for<F>(
    rx: &mut UnboundedReceiver<ConnectionEvent>,
    timeout: Duration,
    mut pred: F,
) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            panic!("timed out waiting for expected event");
        }
        let event = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for expected event")
            .expect("event channel closed before the expected event arrived");
        if pred(&event) {
            return event;
        }
    }
}
