//! Send-File Processor (spec.md §4.7): per-connection task draining the
//! priority-ordered file-send queue, emitting parcels into the core-send
//! pump and attaching `AbortFileTimeout` to the final parcel of each file.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::events::{ConnectionEvent, Direction, FileAbortReason, FileEvent};
use crate::separate::file::SendFileOrder;
use crate::wire::parcel::Priority;

use super::{Connection, ConnectionState};

const PARCELS_PER_ITERATION: usize = 3;

/// Snapshot of an outgoing [`SendFileOrder`]'s metadata, kept in
/// `Connection::pending_file_send_meta` once the order has finished
/// streaming and been dropped so that a later `CONFIRM`/`FAIL`/`BREAK` or
/// `AbortFileTimeout` can still report real lengths/duration/path
/// (spec.md §6).
pub(super) struct FileSendMeta {
    pub priority: Priority,
    pub path: PathBuf,
    pub expected_length: u64,
    pub transmission_length: u64,
    pub start_time: DateTime<Utc>,
}

pub(super) fn spawn_file_send_processor(conn: Arc<Connection>) {
    tokio::spawn(async move { run(conn).await });
}

async fn run(conn: Arc<Connection>) {
    'outer: loop {
        if conn.state() == ConnectionState::Closed {
            return;
        }

        let popped = conn.file_send_queue.lock().unwrap().pop();
        let Some(mut current) = popped else {
            if conn.state() == ConnectionState::Shutdown {
                conn.files_all_sent.store(true, Ordering::SeqCst);
                super::lifecycle::maybe_finish_shutdown(&conn).await;
            }
            if conn.state() == ConnectionState::Closed {
                return;
            }
            conn.file_send_notify.notified().await;
            continue;
        };

        let file_id = current.file_id();
        let priority = current.priority();
        conn.deliver(
            priority,
            ConnectionEvent::FileSending(FileEvent {
                object_id: file_id,
                direction: Direction::Outgoing,
                priority,
                expected_length: current.file_length(),
                transmission_length: 0,
                duration: Duration::ZERO,
                path: current.local_path().to_path_buf(),
                cause: None,
            }),
            conn.clone(),
        )
        .await;

        for _ in 0..PARCELS_PER_ITERATION {
            match current.next_parcel().await {
                Ok(Some(parcel)) => {
                    let is_last = current.is_exhausted();
                    let attached: Option<crate::send_pump::AttachedTimerTask> = if is_last {
                        let conn_for_timer = conn.clone();
                        let confirm_timeout = conn.params.confirm_timeout_ms as u64;
                        let transmitted = current.transmitted_length();
                        Some(Box::new(move || {
                            let extra = 15_000 * (transmitted / 1_000_000_000);
                            let deadline = Duration::from_millis(confirm_timeout + extra);
                            super::timers::start_abort_file_timeout(conn_for_timer, file_id, deadline);
                        }))
                    } else {
                        None
                    };
                    Connection::queue_parcel_for_send(&conn, parcel, attached);
                    if is_last {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(connection_id = %conn.id, file_id, error = %e, "file read error; breaking transfer");
                    break_transfer(
                        &conn,
                        current,
                        FileAbortReason::LocalIoErrorDuringRead,
                        Some(2),
                    )
                    .await;
                    continue 'outer;
                }
            }
        }

        if current.is_exhausted() {
            conn.pending_file_send_meta.insert(
                file_id,
                FileSendMeta {
                    priority: current.priority(),
                    path: current.local_path().to_path_buf(),
                    expected_length: current.file_length(),
                    transmission_length: current.transmitted_length(),
                    start_time: current.start_time(),
                },
            );
            conn.pending_file_confirms
                .insert(file_id, Arc::new(tokio::sync::Notify::new()));
            if conn.state() == ConnectionState::Shutdown {
                // Wait for the remote CONFIRM/FAIL before letting this
                // connection proceed toward CLOSED (spec.md §4.7).
                wait_for_confirm(&conn, file_id).await;
            }
        } else {
            conn.file_send_queue.lock().unwrap().push(current);
        }
    }
}

async fn wait_for_confirm(conn: &Arc<Connection>, file_id: i64) {
    let notify = conn
        .pending_file_confirms
        .get(&file_id)
        .map(|n| n.clone());
    if let Some(notify) = notify {
        notify.notified().await;
    }
}

/// spec.md §4.4 `breakTransfer(eventInfo, signalInfo, cause)`: closes the
/// file (dropping `order` releases its `IoGuard`), removes it from the
/// sender map, optionally sends a BREAK signal, and fires FILE_ABORTED.
pub(super) async fn break_transfer(
    conn: &Arc<Connection>,
    order: SendFileOrder,
    event_info: FileAbortReason,
    signal_info: Option<i32>,
) {
    let file_id = order.file_id();
    let priority = order.priority();
    let path = order.local_path().to_path_buf();
    let transmitted = order.transmitted_length();
    let expected = order.file_length();
    let duration = (Utc::now() - order.start_time()).to_std().unwrap_or(Duration::ZERO);

    conn.outgoing_file_ids.remove(&file_id);
    conn.pending_file_confirms.remove(&file_id);
    conn.pending_file_send_meta.remove(&file_id);
    order.break_transfer();

    if let Some(subtype) = signal_info {
        let signal = crate::signal::Signal::Break { subtype };
        let payload = signal.encode_payload();
        let parcel = crate::wire::parcel::Parcel::signal(file_id, signal.sequence_nr(), payload);
        Connection::queue_parcel_for_send(conn, parcel, None);
    }

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
                cause: Some(format!("{event_info:?}")),
            },
            reason: event_info,
        },
        conn.clone(),
    )
    .await;
}
