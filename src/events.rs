//! Application-facing events and the listener capability set (spec.md §6, §9).

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::wire::parcel::Priority;

/// Abridged error codes from spec.md §6, used on `SHUTDOWN`/`CLOSED` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseInfo {
    /// Local `close()` call; not triggered by anything the peer did.
    LocalClose = 1,
    RemoteGracefulClose = 2,
    RemoteServerShutdown = 3,
    SocketEofDuringShutdown = 4,
    InternalException = 5,
    SocketError = 6,
    ShutdownTimeout = 8,
    AliveTimeout = 9,
    HardClose = 10,
    SerializationInducedClose = 11,
}

/// Object delivery / receive-side abort reasons (spec.md §6, 203/205/207/209).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectAbortReason {
    /// Local connection closed while the object was still queued/sending.
    ConnectionClosedSending = 203,
    /// Local connection closed before full delivery could complete.
    ConnectionClosedReceiving = 205,
    /// Remote reported it could not decode the object.
    RemoteDecodeError = 207,
    /// Remote reported the codec method is unavailable.
    RemoteCodecUnavailable = 209,
}

/// File transfer abort reasons (spec.md §6, abridged table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAbortReason {
    /// Peer sent `BREAK(1)`: our outgoing `SendFileOrder` for that file is dropped.
    RemoteBrokeOutgoingGeneric = 101,
    SenderConfirmTimeout = 103,
    ReceiverConfirmTimeout = 104,
    RemoteDiscardedReceive = 106,
    RemoteBrokeSend = 107,
    LocalReadError = 108,
    RemoteReportedFailure = 109,
    RemoteDecodeOrCrcError = 110,
    LocalIoErrorDuringRead = 111,
    ConnectionClosedOutgoing = 113,
    ConnectionClosedIncoming = 114,
    RemoteBrokeReceive = 112,
    RemoteAbortedReceiveViaBreak = 116,
    LocalBreakOnSend = 115,
}

/// Direction of a file/object transfer relative to this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Detail payload for `TRANS_EVT`; free-form diagnostic information about an
/// in-flight transmission (used by timers/signal digestion for tracing).
#[derive(Debug, Clone)]
pub struct TransmissionEventDetails {
    pub connection_id: uuid::Uuid,
    pub description: String,
}

/// File transmission event payload, shared by sender- and receiver-side
/// events (spec.md §6 "File transmission events").
#[derive(Debug, Clone)]
pub struct FileEvent {
    pub object_id: i64,
    pub direction: Direction,
    pub priority: Priority,
    pub expected_length: u64,
    pub transmission_length: u64,
    pub duration: Duration,
    pub path: PathBuf,
    pub cause: Option<String>,
}

/// One completed ping/echo round trip (spec.md §3 "PingEcho").
#[derive(Debug, Clone)]
pub struct PingEcho {
    pub connection_id: uuid::Uuid,
    pub ping_id: i64,
    pub send_time: DateTime<Utc>,
    pub duration: Duration,
}

/// All events a `ConnectionListener` may observe.
#[derive(Clone)]
pub enum ConnectionEvent {
    Connected,
    Shutdown { info: CloseInfo, message: String },
    Closed { info: CloseInfo, message: String },
    Idle { idle: bool, exchange_bytes_per_min: u64 },
    Object { priority: Priority, object_id: i64, object: std::sync::Arc<dyn std::any::Any + Send + Sync> },
    Aborted { object_id: i64, info: ObjectAbortReason, message: String },
    PingEcho(PingEcho),
    TransmissionEvent(TransmissionEventDetails),
    FileSending(FileEvent),
    FileIncoming(FileEvent),
    FileAborted { event: FileEvent, reason: FileAbortReason },
    FileReceived(FileEvent),
    FileConfirmed(FileEvent),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::Connected => write!(f, "Connected"),
            ConnectionEvent::Shutdown { info, message } => {
                f.debug_struct("Shutdown").field("info", info).field("message", message).finish()
            }
            ConnectionEvent::Closed { info, message } => {
                f.debug_struct("Closed").field("info", info).field("message", message).finish()
            }
            ConnectionEvent::Idle { idle, exchange_bytes_per_min } => f
                .debug_struct("Idle")
                .field("idle", idle)
                .field("exchange_bytes_per_min", exchange_bytes_per_min)
                .finish(),
            ConnectionEvent::Object { priority, object_id, .. } => f
                .debug_struct("Object")
                .field("priority", priority)
                .field("object_id", object_id)
                .finish(),
            ConnectionEvent::Aborted { object_id, info, message } => f
                .debug_struct("Aborted")
                .field("object_id", object_id)
                .field("info", info)
                .field("message", message)
                .finish(),
            ConnectionEvent::PingEcho(echo) => f.debug_tuple("PingEcho").field(echo).finish(),
            ConnectionEvent::TransmissionEvent(d) => {
                f.debug_tuple("TransmissionEvent").field(d).finish()
            }
            ConnectionEvent::FileSending(e) => f.debug_tuple("FileSending").field(e).finish(),
            ConnectionEvent::FileIncoming(e) => f.debug_tuple("FileIncoming").field(e).finish(),
            ConnectionEvent::FileAborted { event, reason } => f
                .debug_struct("FileAborted")
                .field("event", event)
                .field("reason", reason)
                .finish(),
            ConnectionEvent::FileReceived(e) => f.debug_tuple("FileReceived").field(e).finish(),
            ConnectionEvent::FileConfirmed(e) => f.debug_tuple("FileConfirmed").field(e).finish(),
        }
    }
}

/// Capability-set listener (spec.md §9: "Express ConnectionListener as a
/// capability set... provide a default no-op implementation").
///
/// A single `on_event` dispatch is provided for convenience; implementors
/// typically only override the handful of variants they care about by
/// matching inside it.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self) {}
    fn on_shutdown(&self, _info: CloseInfo, _message: &str) {}
    fn on_closed(&self, _info: CloseInfo, _message: &str) {}
    fn on_idle(&self, _idle: bool, _exchange_bytes_per_min: u64) {}
    fn on_object(&self, _priority: Priority, _object_id: i64, _object: &(dyn std::any::Any + Send + Sync)) {}
    fn on_aborted(&self, _object_id: i64, _info: ObjectAbortReason, _message: &str) {}
    fn on_ping_echo(&self, _echo: &PingEcho) {}
    fn on_transmission_event(&self, _details: &TransmissionEventDetails) {}
    fn on_file_event(&self, _event: &ConnectionEvent) {}

    /// Single entry point the delivery pool actually calls; routes to the
    /// specific callbacks above. Overriding this instead of the individual
    /// callbacks is also supported.
    fn dispatch(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => self.on_connected(),
            ConnectionEvent::Shutdown { info, message } => self.on_shutdown(*info, message),
            ConnectionEvent::Closed { info, message } => self.on_closed(*info, message),
            ConnectionEvent::Idle { idle, exchange_bytes_per_min } => {
                self.on_idle(*idle, *exchange_bytes_per_min)
            }
            ConnectionEvent::Object { priority, object_id, object } => {
                self.on_object(*priority, *object_id, object.as_ref())
            }
            ConnectionEvent::Aborted { object_id, info, message } => {
                self.on_aborted(*object_id, *info, message)
            }
            ConnectionEvent::PingEcho(echo) => self.on_ping_echo(echo),
            ConnectionEvent::TransmissionEvent(details) => self.on_transmission_event(details),
            ConnectionEvent::FileSending(_)
            | ConnectionEvent::FileIncoming(_)
            | ConnectionEvent::FileAborted { .. }
            | ConnectionEvent::FileReceived(_)
            | ConnectionEvent::FileConfirmed(_) => self.on_file_event(event),
        }
    }
}

/// Signal to the connection's lifecycle machinery that shutdown should begin;
/// constructed by the default listener's reaction to a fatal object abort.
pub struct ShutdownRequest {
    pub code: CloseInfo,
}

/// The one mandated reaction from spec.md §7: "`DefaultConnectionListener`
/// reacts to codes 207/209 by initiating shutdown with code 11." Everything
/// else no-ops. Holds a channel back to the owning connection so it can
/// actually request the shutdown.
pub struct DefaultConnectionListener {
    shutdown_tx: tokio::sync::mpsc::UnboundedSender<ShutdownRequest>,
}

impl DefaultConnectionListener {
    pub fn new(shutdown_tx: tokio::sync::mpsc::UnboundedSender<ShutdownRequest>) -> Self {
        Self { shutdown_tx }
    }
}

impl ConnectionListener for DefaultConnectionListener {
    fn on_aborted(&self, _object_id: i64, info: ObjectAbortReason, _message: &str) {
        if matches!(
            info,
            ObjectAbortReason::RemoteDecodeError | ObjectAbortReason::RemoteCodecUnavailable
        ) {
            let _ = self
                .shutdown_tx
                .send(ShutdownRequest { code: CloseInfo::SerializationInducedClose });
        }
    }
}

/// Logs every event at `debug!`; useful during development the way the
/// teacher crate's demo binaries wire up a minimal observer.
#[derive(Default)]
pub struct LoggingConnectionListener;

impl ConnectionListener for LoggingConnectionListener {
    fn dispatch(&self, event: &ConnectionEvent) {
        tracing::debug!(?event, "connection event");
    }
}
