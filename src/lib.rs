//! Linkwire: a multiplexed, bidirectional, connection-oriented transport
//! over TCP (spec.md §1 OVERVIEW).
//!
//! A `Connection` multiplexes objects, files, and control signals across one
//! TCP socket, each on its own priority-ordered lane, while keeping a single
//! writer and a single delivery worker per role so ordering guarantees hold
//! end to end (spec.md §3-§5). Establish one with [`server::PassiveListener`]
//! (accept side) or [`client::active_connect`] (dial side); both hand off to
//! [`connection::spawn`] once the handshake marker has been exchanged.
//!
//! # Quick start
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use linkwire::client::active_connect;
//! use linkwire::config::ConnectionParameters;
//! use linkwire::events::LoggingConnectionListener;
//! use linkwire::send_pump::SendPump;
//! use linkwire::Connection;
//!
//! #[tokio::main]
//! async fn main() -> linkwire::error::Result<()> {
//!     let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
//!     let conn = active_connect(
//!         addr,
//!         ConnectionParameters::default(),
//!         SendPump::new(),
//!         vec![Arc::new(LoggingConnectionListener)],
//!     )
//!     .await?;
//!     Connection::close(&conn).await;
//!     Ok(())
//! }
//! ```

pub mod agglomerate;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod events;
pub mod io_guard;
pub mod logging;
pub mod send_pump;
pub mod separate;
pub mod server;
pub mod signal;
pub mod wire;

pub use client::active_connect;
pub use config::{ConnectionParameters, ConnectionParametersBuilder, DeliveryThreadUsage};
pub use connection::{Connection, ConnectionState, Role};
pub use error::{Result, TransportError};
pub use events::{
    CloseInfo, ConnectionEvent, ConnectionListener, DefaultConnectionListener, Direction,
    FileAbortReason, FileEvent, LoggingConnectionListener, ObjectAbortReason, PingEcho,
    ShutdownRequest,
};
pub use send_pump::SendPump;
pub use server::PassiveListener;
pub use wire::parcel::{Channel, Priority};
