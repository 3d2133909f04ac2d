//! The per-connection transport engine (spec.md §3 "Connection", §4.6-§4.12).
//!
//! `Connection` is the shared state every per-connection task (input
//! processor, send-file processor, receive processor, timers) holds a
//! back-reference to (`Arc<Connection>`), never owns (spec.md §9).

mod file_send;
mod input;
mod lifecycle;
mod receive;
mod signal_digest;
mod timers;

use std::collections::BinaryHeap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock as AsyncRwLock};
use uuid::Uuid;

use crate::agglomerate::file::FileAgglomerator;
use crate::agglomerate::object::ObjectAgglomerator;
use crate::codec::CodecRegistry;
use crate::config::{ConnectionParameters, ParametersMonitor};
use crate::delivery::{DeliveryPool, DeliveryTarget};
use crate::error::{Result, TransportError};
use crate::events::{CloseInfo, ConnectionEvent, ConnectionListener};
use crate::io_guard::IoExclusionTable;
use crate::send_pump::{AttachedTimerTask, SendPump, SendTarget};
use crate::separate::file::SendFileOrder;
use crate::separate::object::ObjectSendSeparation;
use crate::wire::parcel::{Channel, Parcel, Priority};

pub use lifecycle::ConnectionState;

/// Which side of the handshake this connection is on (spec.md §1, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Active,
    Passive,
}

struct ObjectSendEntry {
    sep: ObjectSendSeparation,
    insertion_seq: u64,
}

impl PartialEq for ObjectSendEntry {
    fn eq(&self, other: &Self) -> bool {
        self.sep.priority() == other.sep.priority() && self.insertion_seq == other.insertion_seq
    }
}
impl Eq for ObjectSendEntry {}
impl PartialOrd for ObjectSendEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for ObjectSendEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sep
            .priority()
            .cmp(&other.sep.priority())
            .then_with(|| other.insertion_seq.cmp(&self.insertion_seq))
    }
}

/// Per-connection transport engine state (spec.md §3 "Connection").
pub struct Connection {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) params: ConnectionParameters,
    pub(crate) monitor: Arc<ParametersMonitor>,

    pub(crate) state: AtomicU8,

    pub(crate) write_half: AsyncMutex<WriteHalf<TcpStream>>,
    pub(crate) send_pump: Arc<SendPump>,
    pub(crate) delivery: AsyncRwLock<Arc<DeliveryPool>>,
    pub(crate) global_delivery: Arc<DeliveryPool>,

    pub(crate) codec_send: CodecRegistry,
    pub(crate) codec_recv: CodecRegistry,
    pub(crate) io_table: IoExclusionTable,

    pub(crate) next_object_id: AtomicI64,
    pub(crate) next_file_id: AtomicI64,
    pub(crate) next_ping_id: AtomicI64,
    pub(crate) outgoing_object_count: AtomicI64,
    pub(crate) incoming_object_count: AtomicI64,

    pub(crate) current_send_load: AtomicU64,
    pub(crate) transmitted_volume: AtomicU64,
    pub(crate) exchanged_volume: AtomicU64,

    pub(crate) object_send_queue: std::sync::Mutex<BinaryHeap<ObjectSendEntry>>,
    pub(crate) object_send_seq: AtomicU64,
    pub(crate) object_send_notify: Notify,

    pub(crate) file_send_queue: std::sync::Mutex<BinaryHeap<SendFileOrder>>,
    pub(crate) outgoing_file_ids: DashMap<i64, ()>,
    pub(crate) file_send_notify: Notify,
    /// Per-file `Notify` released by the signal digester when a `CONFIRM`
    /// or `FAIL` for that outgoing file arrives (spec.md §4.7, §4.9).
    pub(crate) pending_file_confirms: DashMap<i64, Arc<Notify>>,
    /// Metadata of an outgoing `SendFileOrder` that has finished streaming
    /// and is waiting on `CONFIRM`/`FAIL`/`BREAK`, kept around so the signal
    /// digester and `AbortFileTimeout` can still report real
    /// lengths/duration/path once the order itself is gone (spec.md §6).
    pub(crate) pending_file_send_meta: DashMap<i64, file_send::FileSendMeta>,

    pub(crate) object_receptors: DashMap<i64, ObjectAgglomerator>,
    pub(crate) file_receptors: DashMap<i64, FileAgglomerator>,
    pub(crate) ping_times: DashMap<i64, chrono::DateTime<chrono::Utc>>,

    pub(crate) listeners: std::sync::RwLock<Vec<Arc<dyn ConnectionListener>>>,

    pub(crate) objects_all_sent: AtomicBool,
    pub(crate) files_all_sent: AtomicBool,
    pub(crate) remote_all_sent: AtomicBool,
    pub(crate) send_lock: Notify,
    pub(crate) fixed_speed: AtomicBool,

    pub(crate) closed_notify: Notify,

    pub(crate) alive_send_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub(crate) alive_receive_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    pub(crate) idle_check_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,

    /// Unix-epoch milliseconds of the last ALIVE_CONFIRM/ALIVE refresh seen
    /// by `AliveReceiveControl` (spec.md §4.12).
    pub(crate) last_alive_confirmed_ms: AtomicU64,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn parameters_monitor(&self) -> Arc<ParametersMonitor> {
        self.monitor.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    /// Live knob (spec.md §5 "Parameters: mutation"): sets the local
    /// transmission speed. `fixed` locks it against a remote `TEMPO` signal
    /// overriding it (the digester re-advertises this value to the peer
    /// instead of adopting theirs).
    pub fn set_transmission_speed(&self, speed: i64, fixed: bool) {
        self.fixed_speed.store(fixed, Ordering::SeqCst);
        self.monitor.set_transmission_speed(speed);
        if speed != 0 {
            self.send_lock.notify_waiters();
        }
    }

    pub fn set_idle_threshold_bytes_per_min(&self, threshold: u64) {
        self.monitor.set_idle_threshold_bytes_per_min(threshold);
    }

    /// Enables/disables one codec method on this connection's receive slot
    /// (spec.md §4.2, scenario "codec unavailable on receiver"). A disabled
    /// method makes every further incoming object encoded with it fail with
    /// `FAIL(6)`/`ObjectAbortReason::RemoteCodecUnavailable` on the sender.
    pub fn set_receive_codec_enabled(&self, method: u8, enabled: bool) {
        self.codec_recv.set_method_enabled(method, enabled);
    }

    /// Installs an `AliveSendTimer`/requests the peer mirror it via
    /// `ALIVE_REQUEST` (spec.md §4.9/§4.12). `period_ms == 0` disables alive.
    pub fn set_alive_period_ms(self_arc: &Arc<Connection>, period_ms: u32) {
        self_arc.monitor.set_alive_period_ms(period_ms);
        if period_ms == 0 {
            if let Some(task) = self_arc.alive_send_task.lock().unwrap().take() {
                task.abort();
            }
            return;
        }
        let signal = crate::signal::Signal::AliveRequest { period_ms: period_ms as i32 };
        let payload = signal.encode_payload();
        let parcel = Parcel::signal(0, signal.sequence_nr(), payload);
        Self::queue_parcel_for_send(self_arc, parcel, None);
    }

    /// Assign the next object-id for an outgoing object and enqueue its
    /// separator onto the priority-ordered input queue (spec.md §4.3, §4.6).
    pub fn send_object(
        &self,
        class_id: &str,
        codec_method: u8,
        priority: Priority,
        object: Arc<dyn std::any::Any + Send + Sync>,
    ) -> Result<i64> {
        {
            let queue_len = self.object_send_queue.lock().unwrap().len();
            if queue_len as u32 >= self.params.object_queue_capacity {
                return Err(TransportError::ListOverflow);
            }
        }
        let object_id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        let sep = ObjectSendSeparation::new(object_id, priority, codec_method, class_id, object);
        let seq = self.object_send_seq.fetch_add(1, Ordering::SeqCst);
        self.object_send_queue
            .lock()
            .unwrap()
            .push(ObjectSendEntry { sep, insertion_seq: seq });
        self.object_send_notify.notify_one();
        Ok(object_id)
    }

    /// Assign the next file-id and enqueue a `SendFileOrder` (spec.md §4.4,
    /// §4.7). `local_path` must be locally readable and not already reserved
    /// for outgoing/incoming IO elsewhere.
    pub async fn send_file(
        &self,
        local_path: impl Into<std::path::PathBuf>,
        remote_path: impl Into<String>,
        priority: Priority,
        transaction: i64,
    ) -> Result<i64> {
        {
            let queue_len = self.file_send_queue.lock().unwrap().len();
            if queue_len as u32 >= self.params.object_queue_capacity {
                return Err(TransportError::ListOverflow);
            }
        }
        let file_id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
        let order = SendFileOrder::start_sending(
            &self.io_table,
            file_id,
            local_path,
            remote_path,
            priority,
            transaction,
            self.params.transmission_parcel_size,
        )
        .await?;
        self.outgoing_file_ids.insert(file_id, ());
        self.file_send_queue.lock().unwrap().push(order);
        self.file_send_notify.notify_one();
        Ok(file_id)
    }

    /// Send a PING and record its send-time so the matching ECHO can compute
    /// a round-trip duration (spec.md GLOSSARY "PingEcho").
    pub fn ping(self_arc: &Arc<Connection>) -> i64 {
        let ping_id = self_arc.next_ping_id.fetch_add(1, Ordering::SeqCst);
        self_arc.ping_times.insert(ping_id, chrono::Utc::now());
        let signal = crate::signal::Signal::Ping;
        let payload = signal.encode_payload();
        let parcel = Parcel::signal(ping_id, signal.sequence_nr(), payload);
        Self::queue_parcel_for_send(self_arc, parcel, None);
        ping_id
    }

    /// Local graceful close (spec.md §4.10 C→S): stop accepting new send
    /// orders, drain what's queued, exchange SHUTDOWN/ALL-SENT with the peer.
    pub async fn close(self_arc: &Arc<Connection>) {
        lifecycle::begin_shutdown(self_arc, CloseInfo::LocalClose, false).await;
    }

    /// Immediate hard close (spec.md §4.10 direct C→CLOSED): abort in-flight
    /// transfers, skip the graceful exchange, close the socket now.
    pub async fn close_hard(self_arc: &Arc<Connection>) {
        lifecycle::close_hard(self_arc, CloseInfo::HardClose).await;
    }

    /// Block until the connection reaches CLOSED (spec.md §4.11).
    pub async fn wait_for_closed(self_arc: &Arc<Connection>) {
        lifecycle::wait_for_closed(self_arc).await;
    }

    pub(crate) async fn deliver(
        &self,
        priority: Priority,
        event: ConnectionEvent,
        self_arc: Arc<Connection>,
    ) {
        if self.delivery_is_blocking().await {
            self.migrate_to_individual_pool().await;
        }
        let pool = self.delivery.read().await.clone();
        pool.enqueue(self_arc, priority, event, self.monitor.deliver_tolerance_ms());
    }

    async fn delivery_is_blocking(&self) -> bool {
        self.delivery.read().await.is_blocking()
    }

    async fn migrate_to_individual_pool(&self) {
        let mut guard = self.delivery.write().await;
        if Arc::ptr_eq(&*guard, &self.global_delivery) {
            tracing::warn!(connection_id = %self.id, "migrating off blocking global delivery pool");
            *guard = DeliveryPool::individual();
        }
    }

    pub(crate) fn queue_parcel_for_send(
        self_arc: &Arc<Connection>,
        parcel: Parcel,
        attached: Option<AttachedTimerTask>,
    ) {
        let is_signal = parcel.channel == Channel::Signal;
        if !is_signal {
            self_arc
                .current_send_load
                .fetch_add(parcel.serialized_len() as u64, Ordering::SeqCst);
        }
        self_arc
            .send_pump
            .enqueue(parcel, self_arc.clone(), attached);
    }
}

#[async_trait::async_trait]
impl SendTarget for Connection {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn is_write_open(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    fn is_file_cancelled(&self, file_id: i64) -> bool {
        !self.outgoing_file_ids.contains_key(&file_id)
    }

    async fn write_parcel(&self, parcel: &Parcel) -> std::io::Result<()> {
        let mut w = self.write_half.lock().await;
        parcel.write(&mut *w).await.map_err(|e| match e {
            TransportError::Socket(io_err) => io_err,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        })
    }

    fn note_sent(&self, serialized_len: u64, channel: Channel) {
        self.transmitted_volume
            .fetch_add(serialized_len, Ordering::SeqCst);
        if channel != Channel::Signal {
            self.exchanged_volume
                .fetch_add(serialized_len, Ordering::SeqCst);
            self.current_send_load
                .fetch_sub(serialized_len, Ordering::SeqCst);
            self.send_lock.notify_waiters();
        }
    }

    fn note_dropped(&self, serialized_len: u64, channel: Channel) {
        if channel != Channel::Signal {
            self.current_send_load
                .fetch_sub(serialized_len, Ordering::SeqCst);
            self.send_lock.notify_waiters();
        }
    }

    fn on_socket_error(&self, err: std::io::Error) {
        tracing::error!(connection_id = %self.id, error = %err, "socket write error; closing hard");
        self.state.store(ConnectionState::Closed as u8, Ordering::SeqCst);
        self.closed_notify.notify_waiters();
    }
}

impl DeliveryTarget for Connection {
    fn connection_id(&self) -> Uuid {
        self.id
    }

    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners.read().unwrap().clone()
    }

    fn on_delivered(&self, event: &ConnectionEvent) {
        if matches!(event, ConnectionEvent::Closed { .. }) {
            self.closed_notify.notify_waiters();
        }
    }
}

/// Spawn every background task for a freshly handshaken socket and return
/// the shared handle (spec.md §4.10 transition U→C).
pub async fn spawn(
    socket: TcpStream,
    peer_addr: Option<SocketAddr>,
    role: Role,
    params: ConnectionParameters,
    send_pump: Arc<SendPump>,
    global_delivery: Arc<DeliveryPool>,
    io_table: IoExclusionTable,
    listeners: Vec<Arc<dyn ConnectionListener>>,
) -> Arc<Connection> {
    let monitor = ParametersMonitor::new(&params);
    let (_read_half, write_half) = tokio::io::split(socket);

    let conn = Arc::new(Connection {
        id: Uuid::new_v4(),
        role,
        peer_addr,
        params,
        monitor,
        state: AtomicU8::new(ConnectionState::Unconnected as u8),
        write_half: AsyncMutex::new(write_half),
        send_pump,
        delivery: AsyncRwLock::new(global_delivery.clone()),
        global_delivery,
        codec_send: crate::codec::GLOBAL_REGISTRY.deep_clone(),
        codec_recv: crate::codec::GLOBAL_REGISTRY.deep_clone(),
        io_table,
        next_object_id: AtomicI64::new(1),
        next_file_id: AtomicI64::new(1),
        next_ping_id: AtomicI64::new(1),
        outgoing_object_count: AtomicI64::new(0),
        incoming_object_count: AtomicI64::new(0),
        current_send_load: AtomicU64::new(0),
        transmitted_volume: AtomicU64::new(0),
        exchanged_volume: AtomicU64::new(0),
        object_send_queue: std::sync::Mutex::new(BinaryHeap::new()),
        object_send_seq: AtomicU64::new(0),
        object_send_notify: Notify::new(),
        file_send_queue: std::sync::Mutex::new(BinaryHeap::new()),
        outgoing_file_ids: DashMap::new(),
        file_send_notify: Notify::new(),
        pending_file_confirms: DashMap::new(),
        pending_file_send_meta: DashMap::new(),
        object_receptors: DashMap::new(),
        file_receptors: DashMap::new(),
        ping_times: DashMap::new(),
        listeners: std::sync::RwLock::new(listeners),
        objects_all_sent: AtomicBool::new(false),
        files_all_sent: AtomicBool::new(false),
        remote_all_sent: AtomicBool::new(false),
        send_lock: Notify::new(),
        fixed_speed: AtomicBool::new(false),
        closed_notify: Notify::new(),
        alive_send_task: std::sync::Mutex::new(None),
        alive_receive_task: std::sync::Mutex::new(None),
        idle_check_task: std::sync::Mutex::new(None),
        last_alive_confirmed_ms: AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64),
    });

    lifecycle::mark_connected(&conn);
    input::spawn_input_processor(conn.clone());
    file_send::spawn_file_send_processor(conn.clone());
    receive::spawn_receive_processor(conn.clone(), _read_half);
    timers::start_idle_check(&conn);
    conn.deliver(Priority::Top, ConnectionEvent::Connected, conn.clone()).await;

    conn
}
