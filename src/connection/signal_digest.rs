//! Signal Digester (spec.md §4.9): reactions to every control signal carried
//! on the SIGNAL channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::{MAX_ALIVE_PERIOD_MS, MIN_ALIVE_PERIOD_MS};
use crate::events::{
    CloseInfo, ConnectionEvent, Direction, FileAbortReason, FileEvent, ObjectAbortReason, PingEcho,
};
use crate::signal::Signal;
use crate::wire::parcel::{Parcel, Priority};

use super::Connection;

pub(super) async fn digest(conn: &Arc<Connection>, signal: Signal, object_id: i64) {
    match signal {
        Signal::AliveRequest { period_ms } => {
            let clamped = clamp_alive_period(period_ms);
            super::timers::start_alive_send(conn.clone(), clamped as u32);
            let reply = Signal::AliveConfirm { period_ms: clamped };
            send_signal(conn, 0, reply);
        }
        Signal::AliveConfirm { period_ms } => {
            let tolerance = ((period_ms as i64 * 3 / 2) - (period_ms as i64 / 2)).min(120_000);
            conn.last_alive_confirmed_ms
                .store(Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
            super::timers::start_alive_receive_control(
                conn.clone(),
                (period_ms / 2).max(1) as u32,
                tolerance.max(0) as u32,
            );
        }
        Signal::Alive => {
            conn.last_alive_confirmed_ms
                .store(Utc::now().timestamp_millis() as u64, Ordering::SeqCst);
        }
        Signal::Ping => {
            send_signal(conn, object_id, Signal::Echo);
        }
        Signal::Echo => {
            if let Some((_, send_time)) = conn.ping_times.remove(&object_id) {
                let now = Utc::now();
                let duration = (now - send_time).to_std().unwrap_or(Duration::ZERO);
                conn.deliver(
                    Priority::Normal,
                    ConnectionEvent::PingEcho(PingEcho {
                        connection_id: conn.id,
                        ping_id: object_id,
                        send_time,
                        duration,
                    }),
                    conn.clone(),
                )
                .await;
            }
        }
        Signal::Break { subtype } => handle_break(conn, object_id, subtype).await,
        Signal::Confirm => {
            if let Some((_, notify)) = conn.pending_file_confirms.remove(&object_id) {
                notify.notify_waiters();
            }
            conn.outgoing_file_ids.remove(&object_id);
            let meta = conn.pending_file_send_meta.remove(&object_id).map(|(_, m)| m);
            let (priority, expected_length, transmission_length, duration, path) = match meta {
                Some(meta) => (
                    meta.priority,
                    meta.expected_length,
                    meta.transmission_length,
                    (Utc::now() - meta.start_time).to_std().unwrap_or(Duration::ZERO),
                    meta.path,
                ),
                None => (Priority::Normal, 0, 0, Duration::ZERO, std::path::PathBuf::new()),
            };
            conn.deliver(
                priority,
                ConnectionEvent::FileConfirmed(FileEvent {
                    object_id,
                    direction: Direction::Outgoing,
                    priority,
                    expected_length,
                    transmission_length,
                    duration,
                    path,
                    cause: None,
                }),
                conn.clone(),
            )
            .await;
        }
        Signal::Fail { info } => handle_fail(conn, object_id, info).await,
        Signal::Shutdown { .. } => {
            super::lifecycle::begin_shutdown(conn, CloseInfo::RemoteGracefulClose, true).await;
        }
        Signal::Closed { info } => {
            let reason = if info == 3 { CloseInfo::RemoteServerShutdown } else { CloseInfo::RemoteGracefulClose };
            super::lifecycle::close_hard(conn, reason).await;
        }
        Signal::Tempo { bytes_per_sec } => {
            if conn.fixed_speed.load(Ordering::SeqCst) {
                let mine = conn.monitor.transmission_speed();
                send_signal(conn, 0, Signal::Tempo { bytes_per_sec: mine });
            } else {
                conn.monitor.set_transmission_speed(bytes_per_sec);
                if bytes_per_sec != 0 {
                    conn.send_lock.notify_waiters();
                }
            }
        }
    }
}

fn clamp_alive_period(ms: i32) -> i32 {
    if ms == 0 {
        0
    } else {
        ms.clamp(MIN_ALIVE_PERIOD_MS as i32, MAX_ALIVE_PERIOD_MS as i32)
    }
}

async fn handle_break(conn: &Arc<Connection>, file_id: i64, subtype: i32) {
    if matches!(subtype, 2 | 4 | 6) {
        let Some((_, agg)) = conn.file_receptors.remove(&file_id) else { return };
        let priority = agg.priority();
        let expected = agg.expected_size();
        let received = agg.received_len();
        let path = agg.dest_relative().to_path_buf();
        let duration = (Utc::now() - agg.created_at()).to_std().unwrap_or(Duration::ZERO);
        let reason = match subtype {
            2 => FileAbortReason::RemoteBrokeReceive,
            4 => FileAbortReason::RemoteDiscardedReceive,
            _ => FileAbortReason::RemoteAbortedReceiveViaBreak,
        };
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
                    cause: Some(format!("peer BREAK({subtype})")),
                },
                reason,
            },
            conn.clone(),
        )
        .await;
    } else {
        let found = {
            let mut queue = conn.file_send_queue.lock().unwrap();
            let mut found = false;
            queue.retain(|o| {
                if o.file_id() == file_id {
                    found = true;
                    false
                } else {
                    true
                }
            });
            found
        };
        conn.outgoing_file_ids.remove(&file_id);
        conn.pending_file_confirms.remove(&file_id);
        let meta = conn.pending_file_send_meta.remove(&file_id).map(|(_, m)| m);
        if !found && meta.is_none() {
            return;
        }
        let (priority, expected_length, transmission_length, duration, path) = match meta {
            Some(meta) => (
                meta.priority,
                meta.expected_length,
                meta.transmission_length,
                (Utc::now() - meta.start_time).to_std().unwrap_or(Duration::ZERO),
                meta.path,
            ),
            None => (Priority::Normal, 0, 0, Duration::ZERO, std::path::PathBuf::new()),
        };
        let reason = match subtype {
            1 => FileAbortReason::RemoteBrokeOutgoingGeneric,
            3 => FileAbortReason::RemoteBrokeSend,
            _ => FileAbortReason::LocalBreakOnSend,
        };
        conn.deliver(
            priority,
            ConnectionEvent::FileAborted {
                event: FileEvent {
                    object_id: file_id,
                    direction: Direction::Outgoing,
                    priority,
                    expected_length,
                    transmission_length,
                    duration,
                    path,
                    cause: Some(format!("peer BREAK({subtype})")),
                },
                reason,
            },
            conn.clone(),
        )
        .await;
    }
}

async fn handle_fail(conn: &Arc<Connection>, object_id: i64, info: i32) {
    match info {
        1 | 3 => {
            let had_confirm = conn.pending_file_confirms.remove(&object_id).is_some();
            let had_outgoing = conn.outgoing_file_ids.remove(&object_id).is_some();
            let meta = conn.pending_file_send_meta.remove(&object_id).map(|(_, m)| m);
            if had_confirm || had_outgoing || meta.is_some() {
                let (priority, expected_length, transmission_length, duration, path) = match meta {
                    Some(meta) => (
                        meta.priority,
                        meta.expected_length,
                        meta.transmission_length,
                        (Utc::now() - meta.start_time).to_std().unwrap_or(Duration::ZERO),
                        meta.path,
                    ),
                    None => (Priority::Normal, 0, 0, Duration::ZERO, std::path::PathBuf::new()),
                };
                let reason = if info == 1 {
                    FileAbortReason::RemoteBrokeOutgoingGeneric
                } else {
                    FileAbortReason::RemoteReportedFailure
                };
                conn.deliver(
                    priority,
                    ConnectionEvent::FileAborted {
                        event: FileEvent {
                            object_id,
                            direction: Direction::Outgoing,
                            priority,
                            expected_length,
                            transmission_length,
                            duration,
                            path,
                            cause: Some(format!("remote FAIL({info})")),
                        },
                        reason,
                    },
                    conn.clone(),
                )
                .await;
            }
        }
        2 => {
            if let Some((_, agg)) = conn.file_receptors.remove(&object_id) {
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
                            object_id,
                            direction: Direction::Incoming,
                            priority,
                            expected_length: expected,
                            transmission_length: received,
                            duration,
                            path,
                            cause: Some("remote FAIL(2)".into()),
                        },
                        reason: FileAbortReason::ReceiverConfirmTimeout,
                    },
                    conn.clone(),
                )
                .await;
            }
        }
        4 => {
            // Remote discarded an object reception; we keep no outstanding
            // outgoing-object bookkeeping to clean up beyond this no-op.
            tracing::debug!(connection_id = %conn.id, object_id, "remote discarded object reception");
        }
        5 | 6 => {
            let reason = if info == 5 {
                ObjectAbortReason::RemoteDecodeError
            } else {
                ObjectAbortReason::RemoteCodecUnavailable
            };
            conn.deliver(
                Priority::Normal,
                ConnectionEvent::Aborted { object_id, info: reason, message: format!("remote FAIL({info})") },
                conn.clone(),
            )
            .await;
        }
        other => {
            tracing::warn!(connection_id = %conn.id, info = other, "unrecognized FAIL info code");
        }
    }
}

pub(super) fn send_signal(conn: &Arc<Connection>, object_id: i64, signal: Signal) {
    let seq = signal.sequence_nr();
    let payload = signal.encode_payload();
    let parcel = Parcel::signal(object_id, seq, payload);
    Connection::queue_parcel_for_send(conn, parcel, None);
}

pub(super) fn send_fail(conn: &Arc<Connection>, object_id: i64, info: i32) {
    send_signal(conn, object_id, Signal::Fail { info });
}

pub(super) fn send_break(conn: &Arc<Connection>, file_id: i64, subtype: i32) {
    send_signal(conn, file_id, Signal::Break { subtype });
}
