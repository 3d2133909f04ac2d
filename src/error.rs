//! Unified error handling for the transport engine.
//!
//! Mirrors the failure taxonomy of spec.md §7: transport-fatal, object-fatal,
//! file-recoverable, signal-level-recoverable and backpressure errors each get
//! their own variant family so callers can match on remedy rather than origin.

use thiserror::Error;

/// Top level error type for all transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    // Wire framing errors (transport-fatal)
    #[error("malformed parcel: {0}")]
    BadParcel(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    // Object codec errors (object-fatal)
    #[error("codec method {0} is not registered")]
    Unregistered(u8),

    #[error("serialization failed: {0}")]
    Corrupt(String),

    #[error("unknown class: {0}")]
    UnknownClass(String),

    #[error("serialized object size {size} exceeds maxSerialisationSize {max}")]
    OversizedSerialization { size: u64, max: u64 },

    // File transfer errors (file-recoverable, carried alongside an abort reason code)
    #[error("file already in transmission: {0}")]
    FileInTransmission(std::path::PathBuf),

    #[error("file transfer aborted: {0:?}")]
    FileAborted(crate::events::FileAbortReason),

    // Backpressure (synchronous, caller retries)
    #[error("queue is full")]
    ListOverflow,

    // Parameter validation
    #[error("invalid parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("parameter {0} cannot be changed after the connection is established")]
    StructuralParameterLocked(&'static str),

    // Connection lifecycle
    #[error("connection is not in a state that allows this operation")]
    InvalidState,

    #[error("connection closed: {0:?}")]
    Closed(crate::events::CloseInfo),
}

pub type Result<T> = std::result::Result<T, TransportError>;
