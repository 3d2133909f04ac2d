//! Input Processor (spec.md §4.6): per-connection task draining the
//! priority-ordered object-send queue into the core-send pump.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Connection, ConnectionState};

pub(super) fn spawn_input_processor(conn: Arc<Connection>) {
    tokio::spawn(async move { run(conn).await });
}

async fn run(conn: Arc<Connection>) {
    let mut last_schedule = Instant::now();
    loop {
        if conn.state() == ConnectionState::Closed {
            return;
        }

        let head_priority = conn
            .object_send_queue
            .lock()
            .unwrap()
            .peek()
            .map(|e| e.sep.priority());

        let Some(_priority) = head_priority else {
            if conn.state() == ConnectionState::Shutdown {
                conn.objects_all_sent.store(true, Ordering::SeqCst);
                super::lifecycle::maybe_finish_shutdown(&conn).await;
            }
            if conn.state() == ConnectionState::Closed {
                return;
            }
            conn.object_send_notify.notified().await;
            continue;
        };

        // Bandwidth shaping (spec.md §5): if a fixed positive speed is set,
        // pace scheduling so serialized bytes/sec stays near the target.
        let speed = conn.monitor.transmission_speed();
        if speed == 0 {
            conn.send_lock.notified().await;
            continue;
        }

        let next_parcel = {
            let mut queue = conn.object_send_queue.lock().unwrap();
            let mut top = match queue.peek_mut() {
                Some(top) => top,
                None => continue,
            };
            let max_size = conn.params.max_serialisation_size;
            let parcel_size = conn.params.transmission_parcel_size;
            match top.sep.next_parcel(&conn.codec_send, parcel_size, max_size) {
                Ok(Some(parcel)) => Some(parcel),
                Ok(None) => {
                    std::collections::binary_heap::PeekMut::pop(top);
                    None
                }
                Err(e) => {
                    tracing::error!(connection_id = %conn.id, error = %e, "object serialization failed");
                    std::collections::binary_heap::PeekMut::pop(top);
                    None
                }
            }
        };

        let Some(parcel) = next_parcel else {
            conn.outgoing_object_count.fetch_add(1, Ordering::SeqCst);
            if conn
                .object_send_queue
                .lock()
                .unwrap()
                .peek()
                .is_none()
            {
                last_schedule = Instant::now();
            }
            continue;
        };

        if speed > 0 {
            let should_last_ms = (parcel.serialized_len() as u64 * 1000) / speed as u64;
            let has_taken = last_schedule.elapsed();
            if Duration::from_millis(should_last_ms) > has_taken {
                tokio::time::sleep(Duration::from_millis(should_last_ms) - has_taken).await;
            }
        }

        Connection::queue_parcel_for_send(&conn, parcel, None);
        last_schedule = Instant::now();

        if conn.current_send_load.load(Ordering::SeqCst) >= conn.params.send_load_limit() {
            conn.send_lock.notified().await;
        }
    }
}
