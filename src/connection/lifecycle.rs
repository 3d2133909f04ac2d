//! Four-state lifecycle machine: UNCONNECTED → CONNECTED → SHUTDOWN → CLOSED
//! (spec.md §4.10). Ranking is strict; no backsteps.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::events::{CloseInfo, ConnectionEvent, Direction, FileAbortReason, FileEvent, ObjectAbortReason};
use crate::wire::parcel::Priority;

use super::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Unconnected = 0,
    Connected = 1,
    Shutdown = 2,
    Closed = 3,
}

impl ConnectionState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Unconnected,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Shutdown,
            _ => ConnectionState::Closed,
        }
    }
}

pub(crate) fn mark_connected(conn: &Arc<Connection>) {
    conn.state
        .store(ConnectionState::Connected as u8, Ordering::SeqCst);
    conn.monitor.mark_connected();
}

/// Local `close(reason)`: C→S. Stops accepting new send orders but allows
/// in-flight ones to drain; sends SHUTDOWN to the peer unless `from_remote`
/// (the transition was itself triggered by a received SHUTDOWN signal).
pub(crate) async fn begin_shutdown(conn: &Arc<Connection>, reason: CloseInfo, from_remote: bool) {
    let current = conn.state();
    if current >= ConnectionState::Shutdown {
        return;
    }
    conn.state
        .store(ConnectionState::Shutdown as u8, Ordering::SeqCst);

    conn.deliver(
        Priority::Top,
        ConnectionEvent::Shutdown {
            info: reason,
            message: format!("{reason:?}"),
        },
        conn.clone(),
    )
    .await;

    if !from_remote {
        let info = reason as i32;
        let signal = crate::signal::Signal::Shutdown { info };
        let payload = signal.encode_payload();
        let parcel = crate::wire::parcel::Parcel::signal(0, signal.sequence_nr(), payload);
        Connection::queue_parcel_for_send(conn, parcel, None);
    }

    maybe_finish_shutdown(conn).await;
}

/// The end-of-shutdown predicate: `objectsAllSent ∧ filesAllSent ∧
/// remoteAllSent` (spec.md §4.10).
pub(crate) async fn maybe_finish_shutdown(conn: &Arc<Connection>) {
    if conn.state() != ConnectionState::Shutdown {
        return;
    }
    let ready = conn.objects_all_sent.load(Ordering::SeqCst)
        && conn.files_all_sent.load(Ordering::SeqCst)
        && conn.remote_all_sent.load(Ordering::SeqCst);
    if ready {
        close_terminal(conn, None).await;
    }
}

/// Direct C→CLOSED (`closeHard`): cancel timers, abort in-flight transfers
/// with error, close the socket immediately, best-effort CLOSED signal.
pub(crate) async fn close_hard(conn: &Arc<Connection>, reason: CloseInfo) {
    if conn.state() == ConnectionState::Closed {
        return;
    }
    close_terminal(conn, Some(reason)).await;
}

async fn close_terminal(conn: &Arc<Connection>, hard_reason: Option<CloseInfo>) {
    conn.state
        .store(ConnectionState::Closed as u8, Ordering::SeqCst);

    if let Some(task) = conn.alive_send_task.lock().unwrap().take() {
        task.abort();
    }
    if let Some(task) = conn.alive_receive_task.lock().unwrap().take() {
        task.abort();
    }
    if let Some(task) = conn.idle_check_task.lock().unwrap().take() {
        task.abort();
    }

    abort_pending_transfers(conn).await;
    conn.outgoing_file_ids.clear();

    let reason = hard_reason.unwrap_or(CloseInfo::HardClose);
    let info = reason as i32;
    let signal = crate::signal::Signal::Closed { info };
    let payload = signal.encode_payload();
    let parcel = crate::wire::parcel::Parcel::signal(0, signal.sequence_nr(), payload);
    Connection::queue_parcel_for_send(conn, parcel, None);

    conn.deliver(
        Priority::Top,
        ConnectionEvent::Closed {
            info: reason,
            message: format!("{reason:?}"),
        },
        conn.clone(),
    )
    .await;
    conn.closed_notify.notify_waiters();
}

/// Drains every pending send/receive on the CLOSED sweep (spec.md §4.10):
/// queued and in-flight outgoing files/objects, and partially-reassembled
/// incoming files/objects, each get one `FileAborted`/`Aborted` event with a
/// `ConnectionClosed*` reason rather than being silently dropped.
async fn abort_pending_transfers(conn: &Arc<Connection>) {
    let pending_sends: Vec<_> = conn.file_send_queue.lock().unwrap().drain().collect();
    for order in pending_sends {
        let file_id = order.file_id();
        let priority = order.priority();
        let path = order.local_path().to_path_buf();
        let expected = order.file_length();
        let transmitted = order.transmitted_length();
        let duration = (Utc::now() - order.start_time()).to_std().unwrap_or(Duration::ZERO);
        conn.pending_file_send_meta.remove(&file_id);
        conn.pending_file_confirms.remove(&file_id);
        order.break_transfer();
        conn.deliver(
            priority,
            ConnectionEvent::FileAborted {
                event: FileEvent {
                    object_id: file_id,
                    direction: Direction::Outgoing,
                    priority,
                    expected_length: expected,
                    transmission_length: transmitted,
                    duration,
                    path,
                    cause: Some("connection closed".into()),
                },
                reason: FileAbortReason::ConnectionClosedOutgoing,
            },
            conn.clone(),
        )
        .await;
    }

    let pending_receives: Vec<_> = conn
        .file_receptors
        .iter()
        .map(|e| *e.key())
        .collect();
    for file_id in pending_receives {
        let Some((_, agg)) = conn.file_receptors.remove(&file_id) else { continue };
        let priority = agg.priority();
        let expected = agg.expected_size();
        let received = agg.received_len();
        let path = agg.dest_relative().to_path_buf();
        let duration = (Utc::now() - agg.created_at()).to_std().unwrap_or(Duration::ZERO);
        agg.abort().await;
        conn.deliver(
            priority,
            ConnectionEvent::FileAborted {
                event: FileEvent {
                    object_id: file_id,
                    direction: Direction::Incoming,
                    priority,
                    expected_length: expected,
                    transmission_length: received,
                    duration,
                    path,
                    cause: Some("connection closed".into()),
                },
                reason: FileAbortReason::ConnectionClosedIncoming,
            },
            conn.clone(),
        )
        .await;
    }

    let pending_object_sends: Vec<_> = conn.object_send_queue.lock().unwrap().drain().collect();
    for entry in pending_object_sends {
        let object_id = entry.sep.object_id();
        conn.deliver(
            entry.sep.priority(),
            ConnectionEvent::Aborted {
                object_id,
                info: ObjectAbortReason::ConnectionClosedSending,
                message: "connection closed".into(),
            },
            conn.clone(),
        )
        .await;
    }

    let pending_object_receives: Vec<_> = conn
        .object_receptors
        .iter()
        .map(|e| *e.key())
        .collect();
    for object_id in pending_object_receives {
        let Some((_, agg)) = conn.object_receptors.remove(&object_id) else { continue };
        conn.deliver(
            agg.priority(),
            ConnectionEvent::Aborted {
                object_id,
                info: ObjectAbortReason::ConnectionClosedReceiving,
                message: "connection closed".into(),
            },
            conn.clone(),
        )
        .await;
    }
}

/// Await the connection reaching CLOSED (spec.md §4.11 "waitForClosed").
pub async fn wait_for_closed(conn: &Arc<Connection>) {
    while conn.state() != ConnectionState::Closed {
        conn.closed_notify.notified().await;
    }
}
