//! Receive Processor (spec.md §4.8): per-connection task reading parcels off
//! the socket and routing them by channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::ReadHalf;
use tokio::net::TcpStream;

use chrono::Utc;

use crate::agglomerate::file::{FileAgglomerator, FileAgglomerateOutcome};
use crate::agglomerate::object::ObjectAgglomerator;
use crate::error::TransportError;
use crate::events::{CloseInfo, ConnectionEvent, Direction, FileEvent, ObjectAbortReason};
use crate::signal::Signal;
use crate::wire::parcel::{Channel, Parcel};

use super::{Connection, ConnectionState};

pub(super) fn spawn_receive_processor(conn: Arc<Connection>, read_half: ReadHalf<TcpStream>) {
    tokio::spawn(async move { run(conn, read_half).await });
}

async fn run(conn: Arc<Connection>, mut read_half: ReadHalf<TcpStream>) {
    loop {
        match Parcel::read(&mut read_half).await {
            Ok(parcel) => {
                if parcel.channel != Channel::Signal {
                    let len = parcel.serialized_len() as u64;
                    conn.transmitted_volume.fetch_add(len, Ordering::SeqCst);
                    conn.exchanged_volume.fetch_add(len, Ordering::SeqCst);
                }
                handle_parcel(&conn, parcel).await;
                if conn.state() == ConnectionState::Closed {
                    return;
                }
            }
            Err(e) => {
                handle_socket_error(&conn, e).await;
                return;
            }
        }
    }
}

async fn handle_parcel(conn: &Arc<Connection>, parcel: Parcel) {
    match parcel.channel {
        Channel::Signal => {
            match Signal::decode(parcel.sequence_nr, &parcel.payload) {
                Ok(signal) => super::signal_digest::digest(conn, signal, parcel.object_id).await,
                Err(e) => tracing::warn!(connection_id = %conn.id, error = %e, "malformed signal parcel"),
            }
        }
        Channel::Object => handle_object_parcel(conn, parcel).await,
        Channel::File => handle_file_parcel(conn, parcel).await,
        Channel::Final => {
            if parcel.sequence_nr == 1 {
                conn.remote_all_sent.store(true, Ordering::SeqCst);
                super::lifecycle::maybe_finish_shutdown(conn).await;
            }
        }
    }
}

async fn handle_object_parcel(conn: &Arc<Connection>, parcel: Parcel) {
    let object_id = parcel.object_id;
    let priority = parcel.priority;

    if !conn.object_receptors.contains_key(&object_id) && parcel.sequence_nr != 0 {
        return; // orphan parcel for an object we never saw parcel 0 of
    }

    let max_size = conn.params.max_serialisation_size;
    let digested = {
        let mut entry = conn
            .object_receptors
            .entry(object_id)
            .or_insert_with(|| ObjectAgglomerator::new(object_id));
        entry.digest_parcel(&parcel, max_size)
    };

    match digested {
        Ok(Some(bytes)) => {
            let codec_method = conn
                .object_receptors
                .get(&object_id)
                .and_then(|a| a.codec_method())
                .unwrap_or(0);
            conn.object_receptors.remove(&object_id);

            match conn.codec_recv.deserialize(codec_method, &bytes) {
                Ok(object) => {
                    conn.incoming_object_count.fetch_add(1, Ordering::SeqCst);
                    conn.deliver(
                        priority,
                        ConnectionEvent::Object { priority, object_id, object: object.into() },
                        conn.clone(),
                    )
                    .await;
                }
                Err(e) => fail_undecodable_object(conn, object_id, priority, &e).await,
            }
        }
        Ok(None) => {}
        Err(e) => {
            conn.object_receptors.remove(&object_id);
            fail_undecodable_object(conn, object_id, priority, &e).await;
        }
    }
}

async fn fail_undecodable_object(
    conn: &Arc<Connection>,
    object_id: i64,
    priority: crate::wire::parcel::Priority,
    e: &TransportError,
) {
    let (signal_info, reason) = match e {
        TransportError::Unregistered(_) => (6, ObjectAbortReason::RemoteCodecUnavailable),
        _ => (5, ObjectAbortReason::RemoteDecodeError),
    };
    super::signal_digest::send_fail(conn, object_id, signal_info);
    conn.deliver(
        priority,
        ConnectionEvent::Aborted { object_id, info: reason, message: e.to_string() },
        conn.clone(),
    )
    .await;
}

async fn handle_file_parcel(conn: &Arc<Connection>, parcel: Parcel) {
    let file_id = parcel.object_id;

    if parcel.sequence_nr == 0 {
        if conn.file_receptors.contains_key(&file_id) {
            return; // duplicate/unexpected restart of parcel 0
        }
        match FileAgglomerator::create(&conn.io_table, file_id, conn.params.file_root_dir.as_deref(), &parcel).await {
            Ok((agg, outcome)) => handle_file_outcome(conn, file_id, agg, outcome).await,
            Err(e) => {
                tracing::warn!(connection_id = %conn.id, file_id, error = %e, "cannot start incoming file");
                super::signal_digest::send_break(conn, file_id, 1);
            }
        }
        return;
    }

    if !conn.file_receptors.contains_key(&file_id) {
        return; // orphan
    }

    let Some((_, mut agg)) = conn.file_receptors.remove(&file_id) else {
        return;
    };
    match agg.digest_parcel(&parcel).await {
        Ok(outcome) => handle_file_outcome(conn, file_id, agg, outcome).await,
        Err(e) => {
            tracing::warn!(connection_id = %conn.id, file_id, error = %e, "file reassembly failed");
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
                        cause: Some(e.to_string()),
                    },
                    reason: crate::events::FileAbortReason::RemoteDecodeOrCrcError,
                },
                conn.clone(),
            )
            .await;
        }
    }
}

async fn handle_file_outcome(
    conn: &Arc<Connection>,
    file_id: i64,
    agg: FileAgglomerator,
    outcome: FileAgglomerateOutcome,
) {
    match outcome {
        FileAgglomerateOutcome::InProgress => {
            conn.file_receptors.insert(file_id, agg);
        }
        FileAgglomerateOutcome::Complete { final_path, length } => {
            let priority = agg.priority();
            let expected = agg.expected_size();
            let duration = (Utc::now() - agg.created_at()).to_std().unwrap_or(Duration::ZERO);
            conn.deliver(
                priority,
                ConnectionEvent::FileReceived(FileEvent {
                    object_id: file_id,
                    direction: Direction::Incoming,
                    priority,
                    expected_length: expected,
                    transmission_length: length,
                    duration,
                    path: final_path,
                    cause: None,
                }),
                conn.clone(),
            )
            .await;

            let signal = Signal::Confirm;
            let parcel = Parcel::signal(file_id, signal.sequence_nr(), signal.encode_payload());
            Connection::queue_parcel_for_send(conn, parcel, None);
        }
    }
}

/// spec.md §4.8 last paragraph: EOF/error reaction depends on how far the
/// lifecycle had progressed.
async fn handle_socket_error(conn: &Arc<Connection>, _err: TransportError) {
    match conn.state() {
        ConnectionState::Connected => {
            super::lifecycle::close_hard(conn, CloseInfo::SocketError).await;
        }
        ConnectionState::Shutdown if !conn.remote_all_sent.load(Ordering::SeqCst) => {
            super::lifecycle::close_hard(conn, CloseInfo::SocketEofDuringShutdown).await;
        }
        _ => {}
    }
}
