//! Per-connection timers (spec.md §4.12): alive keepalive, idle detection,
//! outgoing-file confirm timeout, and the server-side accept-stall guard.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::events::{CloseInfo, ConnectionEvent, Direction, FileAbortReason, FileEvent};
use crate::wire::parcel::Priority;

use super::{Connection, ConnectionState};

/// periodic IdleCheck (spec.md §4.12): every `idleCheckPeriod`, computes the
/// exchange rate since the previous sample and fires an IDLE/BUSY transition
/// event when it crosses `idleThreshold`.
pub(super) fn start_idle_check(conn: &Arc<Connection>) {
    let conn = conn.clone();
    let handle = tokio::spawn(async move {
        let mut last_volume = conn.exchanged_volume.load(Ordering::SeqCst);
        let mut last_instant = tokio::time::Instant::now();
        let mut idle = false;
        loop {
            let period = conn.monitor.idle_check_period_ms();
            tokio::time::sleep(Duration::from_millis(period as u64)).await;
            if conn.state() == ConnectionState::Closed {
                return;
            }

            let now_volume = conn.exchanged_volume.load(Ordering::SeqCst);
            let now_instant = tokio::time::Instant::now();
            let delta_volume = now_volume.saturating_sub(last_volume);
            let delta_secs = now_instant.duration_since(last_instant).as_secs().max(1);
            let rate_per_min = delta_volume.saturating_mul(60) / delta_secs;
            last_volume = now_volume;
            last_instant = now_instant;

            let threshold = conn.monitor.idle_threshold_bytes_per_min();
            let now_idle = threshold > 0 && rate_per_min < threshold;
            if now_idle != idle {
                idle = now_idle;
                conn.deliver(
                    Priority::Normal,
                    ConnectionEvent::Idle { idle, exchange_bytes_per_min: rate_per_min },
                    conn.clone(),
                )
                .await;
            }
        }
    });
    *conn.idle_check_task.lock().unwrap() = Some(handle);
}

/// AliveSendTimer (spec.md §4.12): periodically emits an ALIVE signal;
/// self-cancels once the connection leaves CONNECTED.
pub(super) fn start_alive_send(conn: Arc<Connection>, period_ms: u32) {
    if let Some(old) = conn.alive_send_task.lock().unwrap().take() {
        old.abort();
    }
    if period_ms == 0 {
        return;
    }
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(period_ms as u64)).await;
            if conn.state() != ConnectionState::Connected {
                return;
            }
            let signal = crate::signal::Signal::Alive;
            let payload = signal.encode_payload();
            let parcel = crate::wire::parcel::Parcel::signal(0, signal.sequence_nr(), payload);
            Connection::queue_parcel_for_send(&conn, parcel, None);
        }
    });
    *conn.alive_send_task.lock().unwrap() = Some(handle);
}

/// AliveReceiveControl (spec.md §4.12): installed after receiving
/// ALIVE_CONFIRM(period); closes the connection with error 9 if no ALIVE has
/// refreshed `last_confirmed` within `tolerance - 200ms`.
pub(super) fn start_alive_receive_control(conn: Arc<Connection>, period_ms: u32, tolerance_ms: u32) {
    if let Some(old) = conn.alive_receive_task.lock().unwrap().take() {
        old.abort();
    }
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(period_ms.max(1) as u64)).await;
            if conn.state() != ConnectionState::Connected {
                return;
            }
            let last = conn.last_alive_confirmed_ms.load(Ordering::SeqCst);
            let now = Utc::now().timestamp_millis() as u64;
            let elapsed = now.saturating_sub(last);
            let guard_ms = tolerance_ms.saturating_sub(200) as u64;
            if elapsed >= guard_ms {
                tracing::warn!(connection_id = %conn.id, elapsed, "alive tolerance exceeded; closing");
                super::lifecycle::close_hard(&conn, CloseInfo::AliveTimeout).await;
                return;
            }
        }
    });
    *conn.alive_receive_task.lock().unwrap() = Some(handle);
}

/// AbortFileTimeout (spec.md §4.12): one-shot, attached to the final parcel
/// of an outgoing file. Fails the transfer if the peer's CONFIRM/FAIL never
/// arrives before `deadline`.
pub(super) fn start_abort_file_timeout(conn: Arc<Connection>, file_id: i64, deadline: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        if conn.state() == ConnectionState::Closed {
            return;
        }
        let Some((_, notify)) = conn.pending_file_confirms.remove(&file_id) else {
            // Already confirmed/failed by the signal digester.
            return;
        };
        tracing::warn!(connection_id = %conn.id, file_id, "abort file timeout: no CONFIRM/FAIL received");
        let meta = conn.pending_file_send_meta.remove(&file_id).map(|(_, m)| m);
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
            ConnectionEvent::FileAborted {
                event: FileEvent {
                    object_id: file_id,
                    direction: Direction::Outgoing,
                    priority,
                    expected_length,
                    transmission_length,
                    duration,
                    path,
                    cause: Some("confirm timeout".into()),
                },
                reason: FileAbortReason::SenderConfirmTimeout,
            },
            conn.clone(),
        )
        .await;
        notify.notify_waiters();
    });
}
