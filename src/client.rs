//! Active side: connect plus the handshake exchange (spec.md §6, §10).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::ConnectionParameters;
use crate::connection::{Connection, Role};
use crate::delivery::{DeliveryPool, GLOBAL_CLIENT_POOL};
use crate::error::{Result, TransportError};
use crate::events::ConnectionListener;
use crate::send_pump::SendPump;
use crate::wire::parcel::HANDSHAKE_MARKER;

/// Dials `addr`, exchanges the handshake marker, and spawns the resulting
/// [`Connection`]. `send_pump` is the process-wide writer task for the
/// client role; callers connecting many peers should share one instance
/// (spec.md §9 "per-role singletons") rather than call [`SendPump::new`] per
/// connection.
pub async fn active_connect(
    addr: SocketAddr,
    params: ConnectionParameters,
    send_pump: Arc<SendPump>,
    listeners: Vec<Arc<dyn ConnectionListener>>,
) -> Result<Arc<Connection>> {
    let socket = tokio::time::timeout(
        Duration::from_millis(params.confirm_timeout_ms as u64),
        TcpStream::connect(addr),
    )
    .await
    .map_err(|_| TransportError::Handshake("connect timed out".into()))?
    .map_err(TransportError::Socket)?;

    let mut socket = tokio::time::timeout(
        Duration::from_millis(params.confirm_timeout_ms as u64),
        handshake_active(socket),
    )
    .await
    .map_err(|_| TransportError::Handshake("peer did not complete handshake in time".into()))??;
    socket.set_nodelay(true).ok();

    let global_delivery = match params.delivery_thread_usage {
        crate::config::DeliveryThreadUsage::Global => GLOBAL_CLIENT_POOL.clone(),
        crate::config::DeliveryThreadUsage::Individual => DeliveryPool::individual(),
    };

    let conn = crate::connection::spawn(
        socket,
        Some(addr),
        Role::Active,
        params,
        send_pump,
        global_delivery,
        crate::io_guard::GLOBAL_IO_TABLE.clone(),
        listeners,
    )
    .await;
    Ok(conn)
}

/// Client side of the marker exchange: write our marker first, then read theirs.
async fn handshake_active(mut socket: TcpStream) -> Result<TcpStream> {
    socket.write_all(&HANDSHAKE_MARKER).await.map_err(TransportError::Socket)?;
    socket.flush().await.map_err(TransportError::Socket)?;
    let mut buf = [0u8; HANDSHAKE_MARKER.len()];
    socket.read_exact(&mut buf).await.map_err(TransportError::Socket)?;
    if buf != HANDSHAKE_MARKER {
        return Err(TransportError::Handshake(format!(
            "unexpected handshake marker: {buf:?}"
        )));
    }
    Ok(socket)
}
