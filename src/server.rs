//! Passive side: accept loop plus the handshake exchange (spec.md §6, §10).
//!
//! Out of scope per spec.md: negotiation, authentication, reconnection. This
//! module supplies exactly the handshake bytes and hands the accepted socket
//! to [`crate::connection::spawn`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::ConnectionParameters;
use crate::connection::{Connection, Role};
use crate::delivery::{DeliveryPool, GLOBAL_SERVER_POOL};
use crate::error::{Result, TransportError};
use crate::events::ConnectionListener;
use crate::send_pump::SendPump;
use crate::wire::parcel::HANDSHAKE_MARKER;

/// Listens on a bound address and spawns a [`Connection`] per accepted socket
/// once the handshake marker has been exchanged.
///
/// Holds the role-wide [`SendPump`] writer task and chooses between the
/// shared [`GLOBAL_SERVER_POOL`] and a per-connection delivery pool according
/// to `params.delivery_thread_usage` (spec.md §5, §9).
pub struct PassiveListener {
    listener: TcpListener,
    params: ConnectionParameters,
    send_pump: Arc<SendPump>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
    accept_timeout: Duration,
}

impl PassiveListener {
    pub async fn bind(addr: SocketAddr, params: ConnectionParameters) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(TransportError::Socket)?;
        Ok(Self {
            listener,
            params,
            send_pump: SendPump::new(),
            listeners: Vec::new(),
            accept_timeout: Duration::from_millis(30_000),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(TransportError::Socket)
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.push(listener);
    }

    /// Accepts one socket, performs the handshake, and spawns the resulting
    /// connection. A `SocketShutdownTask` (spec.md §4.12) races the handshake
    /// itself: a peer that connects but never completes it is dropped after
    /// `confirmTimeoutMs` instead of leaking an unaccepted socket forever.
    pub async fn accept(&self) -> Result<Arc<Connection>> {
        let (socket, peer_addr) = self.listener.accept().await.map_err(TransportError::Socket)?;
        let deadline = self.accept_timeout.max(Duration::from_millis(
            self.params.confirm_timeout_ms as u64,
        ));
        let mut socket = tokio::time::timeout(deadline, handshake_passive(socket))
            .await
            .map_err(|_| TransportError::Handshake("peer did not complete handshake in time".into()))??;
        socket.set_nodelay(true).ok();

        let global_delivery = match self.params.delivery_thread_usage {
            crate::config::DeliveryThreadUsage::Global => GLOBAL_SERVER_POOL.clone(),
            crate::config::DeliveryThreadUsage::Individual => DeliveryPool::individual(),
        };

        let conn = crate::connection::spawn(
            socket,
            Some(peer_addr),
            Role::Passive,
            self.params.clone(),
            self.send_pump.clone(),
            global_delivery,
            crate::io_guard::GLOBAL_IO_TABLE.clone(),
            self.listeners.clone(),
        )
        .await;
        Ok(conn)
    }
}

/// Server side of the marker exchange: read the peer's marker, then write ours.
async fn handshake_passive(mut socket: TcpStream) -> Result<TcpStream> {
    let mut buf = [0u8; HANDSHAKE_MARKER.len()];
    socket.read_exact(&mut buf).await.map_err(TransportError::Socket)?;
    if buf != HANDSHAKE_MARKER {
        return Err(TransportError::Handshake(format!(
            "unexpected handshake marker: {buf:?}"
        )));
    }
    socket.write_all(&HANDSHAKE_MARKER).await.map_err(TransportError::Socket)?;
    socket.flush().await.map_err(TransportError::Socket)?;
    Ok(socket)
}
