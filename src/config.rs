//! Connection parameters: validated knobs with min/max ranges and the live
//! monitor used to inspect/mutate them after a connection is established.
//!
//! Structural parameters (queue capacities, thread priorities, the file root
//! directory) may only be set before `CONNECTED`; live parameters (priorities
//! baked into send orders, transmission speed, alive period, idle settings)
//! may be changed at any time and propagate to running components. See
//! spec.md §5 ("Parameters: mutation...").

use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{Result, TransportError};

pub const MIN_ALIVE_PERIOD_MS: u32 = 5000;
pub const MAX_ALIVE_PERIOD_MS: u32 = 300_000;

pub const MIN_TRANSMISSION_PARCEL_SIZE: u32 = 1024;
pub const MAX_TRANSMISSION_PARCEL_SIZE: u32 = 262_144;

pub const MIN_PARCEL_QUEUE_CAPACITY: u32 = 10;
pub const MAX_PARCEL_QUEUE_CAPACITY: u32 = 10_000;

pub const MIN_OBJECT_QUEUE_CAPACITY: u32 = 1;
pub const MAX_OBJECT_QUEUE_CAPACITY: u32 = 10_000;

pub const MIN_CONFIRM_TIMEOUT_MS: u32 = 1000;
pub const MIN_IDLE_CHECK_PERIOD_MS: u32 = 5000;
pub const MIN_MAX_SERIALISATION_SIZE: u64 = 10_000;
pub const MIN_DELIVER_TOLERANCE_MS: u32 = 1000;

/// Lower/upper bound applied to the computed `sendLoadLimit` (spec.md §5).
/// The spec leaves the exact bound unspecified beyond "MIN_SENDLOAD" /
/// "MAX_SENDLOAD"; these values keep a single in-flight parcel's worth of
/// slack at the low end and a generous ceiling at the high end.
pub const MIN_SENDLOAD: u64 = 64 * 1024;
pub const MAX_SENDLOAD: u64 = 256 * 1024 * 1024;

pub const THREAD_PRIORITY_MIN: i32 = 1;
pub const THREAD_PRIORITY_NORMAL: i32 = 5;
pub const THREAD_PRIORITY_MAX: i32 = 10;

fn clamp_i32(v: i32, lo: i32, hi: i32) -> i32 {
    v.clamp(lo, hi)
}

/// Where the delivery pool for a connection's completed objects/events lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryThreadUsage {
    /// One pool shared by every connection of a role.
    Global,
    /// A dedicated pool for this connection only.
    Individual,
}

/// Validated, immutable-once-built connection parameters.
///
/// Cloning produces an independent snapshot; live fields are additionally
/// exposed as atomics on [`ParametersMonitor`] so running components observe
/// updates without re-snapshotting.
#[derive(Debug, Clone)]
pub struct ConnectionParameters {
    pub file_root_dir: Option<PathBuf>,
    pub base_thread_priority: i32,
    pub transmit_thread_priority: i32,
    pub transmission_parcel_size: u32,
    pub parcel_queue_capacity: u32,
    pub object_queue_capacity: u32,
    pub alive_period_ms: u32,
    pub confirm_timeout_ms: u32,
    pub serialisation_method: u8,
    pub idle_threshold_bytes_per_min: u64,
    pub idle_check_period_ms: u32,
    pub transmission_speed: i64,
    pub max_serialisation_size: u64,
    pub deliver_tolerance_ms: u32,
    pub delivery_thread_usage: DeliveryThreadUsage,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            file_root_dir: None,
            base_thread_priority: THREAD_PRIORITY_NORMAL,
            transmit_thread_priority: THREAD_PRIORITY_MAX - 2,
            transmission_parcel_size: 65536,
            parcel_queue_capacity: 600,
            object_queue_capacity: 200,
            alive_period_ms: 0,
            confirm_timeout_ms: 30_000,
            serialisation_method: 0,
            idle_threshold_bytes_per_min: 0,
            idle_check_period_ms: 60_000,
            transmission_speed: -1,
            max_serialisation_size: 100 * 1024 * 1024,
            deliver_tolerance_ms: 10_000,
            delivery_thread_usage: DeliveryThreadUsage::Global,
        }
    }
}

impl ConnectionParameters {
    pub fn builder() -> ConnectionParametersBuilder {
        ConnectionParametersBuilder::default()
    }

    /// `sendLoadLimit = clamp((parcelQueueCapacity * transmissionParcelSize) / 2, MIN, MAX)`.
    pub fn send_load_limit(&self) -> u64 {
        let raw = (self.parcel_queue_capacity as u64 * self.transmission_parcel_size as u64) / 2;
        raw.clamp(MIN_SENDLOAD, MAX_SENDLOAD)
    }
}

/// Builder with the clamp/reject rules from spec.md §6 and §8 ("Boundaries").
#[derive(Debug, Default)]
pub struct ConnectionParametersBuilder {
    params: ConnectionParametersOverrides,
}

#[derive(Debug, Default)]
struct ConnectionParametersOverrides {
    file_root_dir: Option<PathBuf>,
    base_thread_priority: Option<i32>,
    transmit_thread_priority: Option<i32>,
    transmission_parcel_size: Option<u32>,
    parcel_queue_capacity: Option<u32>,
    object_queue_capacity: Option<u32>,
    alive_period_ms: Option<u32>,
    confirm_timeout_ms: Option<u32>,
    serialisation_method: Option<u8>,
    idle_threshold_bytes_per_min: Option<u64>,
    idle_check_period_ms: Option<u32>,
    transmission_speed: Option<i64>,
    max_serialisation_size: Option<u64>,
    deliver_tolerance_ms: Option<u32>,
    delivery_thread_usage: Option<DeliveryThreadUsage>,
}

impl ConnectionParametersBuilder {
    pub fn file_root_dir(mut self, dir: PathBuf) -> Self {
        self.params.file_root_dir = Some(dir);
        self
    }

    pub fn base_thread_priority(mut self, p: i32) -> Self {
        self.params.base_thread_priority =
            Some(clamp_i32(p, THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX));
        self
    }

    pub fn transmit_thread_priority(mut self, p: i32) -> Self {
        self.params.transmit_thread_priority =
            Some(clamp_i32(p, THREAD_PRIORITY_MIN, THREAD_PRIORITY_MAX));
        self
    }

    /// Clamps below `MIN_TRANSMISSION_PARCEL_SIZE` per spec.md §8 boundary rule.
    pub fn transmission_parcel_size(mut self, size: u32) -> Self {
        self.params.transmission_parcel_size = Some(size.clamp(
            MIN_TRANSMISSION_PARCEL_SIZE,
            MAX_TRANSMISSION_PARCEL_SIZE,
        ));
        self
    }

    pub fn parcel_queue_capacity(mut self, cap: u32) -> Self {
        self.params.parcel_queue_capacity =
            Some(cap.clamp(MIN_PARCEL_QUEUE_CAPACITY, MAX_PARCEL_QUEUE_CAPACITY));
        self
    }

    pub fn object_queue_capacity(mut self, cap: u32) -> Self {
        self.params.object_queue_capacity =
            Some(cap.clamp(MIN_OBJECT_QUEUE_CAPACITY, MAX_OBJECT_QUEUE_CAPACITY));
        self
    }

    /// Zero disables alive; any other value clamps into
    /// `[MIN_ALIVE_PERIOD_MS, MAX_ALIVE_PERIOD_MS]` per spec.md §4.9/§8.
    pub fn alive_period_ms(mut self, ms: u32) -> Self {
        self.params.alive_period_ms = Some(if ms == 0 {
            0
        } else {
            ms.clamp(MIN_ALIVE_PERIOD_MS, MAX_ALIVE_PERIOD_MS)
        });
        self
    }

    pub fn confirm_timeout_ms(mut self, ms: u32) -> Self {
        self.params.confirm_timeout_ms = Some(ms.max(MIN_CONFIRM_TIMEOUT_MS));
        self
    }

    pub fn serialisation_method(mut self, method: u8) -> Self {
        self.params.serialisation_method = Some(method);
        self
    }

    pub fn idle_threshold_bytes_per_min(mut self, t: u64) -> Self {
        self.params.idle_threshold_bytes_per_min = Some(t);
        self
    }

    pub fn idle_check_period_ms(mut self, ms: u32) -> Self {
        self.params.idle_check_period_ms = Some(ms.max(MIN_IDLE_CHECK_PERIOD_MS));
        self
    }

    /// `-1` unlimited, `0` paused, positive bytes/sec.
    pub fn transmission_speed(mut self, speed: i64) -> Self {
        self.params.transmission_speed = Some(speed.max(-1));
        self
    }

    pub fn max_serialisation_size(mut self, size: u64) -> Self {
        self.params.max_serialisation_size = Some(size.max(MIN_MAX_SERIALISATION_SIZE));
        self
    }

    pub fn deliver_tolerance_ms(mut self, ms: u32) -> Self {
        self.params.deliver_tolerance_ms = Some(ms.max(MIN_DELIVER_TOLERANCE_MS));
        self
    }

    pub fn delivery_thread_usage(mut self, usage: DeliveryThreadUsage) -> Self {
        self.params.delivery_thread_usage = Some(usage);
        self
    }

    pub fn build(self) -> ConnectionParameters {
        let d = ConnectionParameters::default();
        let o = self.params;
        ConnectionParameters {
            file_root_dir: o.file_root_dir.or(d.file_root_dir),
            base_thread_priority: o.base_thread_priority.unwrap_or(d.base_thread_priority),
            transmit_thread_priority: o
                .transmit_thread_priority
                .unwrap_or(d.transmit_thread_priority),
            transmission_parcel_size: o
                .transmission_parcel_size
                .unwrap_or(d.transmission_parcel_size),
            parcel_queue_capacity: o.parcel_queue_capacity.unwrap_or(d.parcel_queue_capacity),
            object_queue_capacity: o.object_queue_capacity.unwrap_or(d.object_queue_capacity),
            alive_period_ms: o.alive_period_ms.unwrap_or(d.alive_period_ms),
            confirm_timeout_ms: o.confirm_timeout_ms.unwrap_or(d.confirm_timeout_ms),
            serialisation_method: o.serialisation_method.unwrap_or(d.serialisation_method),
            idle_threshold_bytes_per_min: o
                .idle_threshold_bytes_per_min
                .unwrap_or(d.idle_threshold_bytes_per_min),
            idle_check_period_ms: o.idle_check_period_ms.unwrap_or(d.idle_check_period_ms),
            transmission_speed: o.transmission_speed.unwrap_or(d.transmission_speed),
            max_serialisation_size: o
                .max_serialisation_size
                .unwrap_or(d.max_serialisation_size),
            deliver_tolerance_ms: o.deliver_tolerance_ms.unwrap_or(d.deliver_tolerance_ms),
            delivery_thread_usage: o.delivery_thread_usage.unwrap_or(d.delivery_thread_usage),
        }
    }
}

/// Live, post-connect view over the subset of parameters that may change
/// while a connection is running. Structural parameters are not exposed here
/// — they are frozen into the `Connection` at construction time.
#[derive(Debug)]
pub struct ParametersMonitor {
    alive_period_ms: AtomicU32,
    idle_threshold_bytes_per_min: AtomicU64,
    idle_check_period_ms: AtomicU32,
    transmission_speed: AtomicI64,
    deliver_tolerance_ms: AtomicU32,
    connected: std::sync::atomic::AtomicBool,
}

impl ParametersMonitor {
    pub fn new(params: &ConnectionParameters) -> Arc<Self> {
        Arc::new(Self {
            alive_period_ms: AtomicU32::new(params.alive_period_ms),
            idle_threshold_bytes_per_min: AtomicU64::new(params.idle_threshold_bytes_per_min),
            idle_check_period_ms: AtomicU32::new(params.idle_check_period_ms),
            transmission_speed: AtomicI64::new(params.transmission_speed),
            deliver_tolerance_ms: AtomicU32::new(params.deliver_tolerance_ms),
            connected: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn alive_period_ms(&self) -> u32 {
        self.alive_period_ms.load(Ordering::SeqCst)
    }

    pub fn set_alive_period_ms(&self, ms: u32) {
        let clamped = if ms == 0 {
            0
        } else {
            ms.clamp(MIN_ALIVE_PERIOD_MS, MAX_ALIVE_PERIOD_MS)
        };
        self.alive_period_ms.store(clamped, Ordering::SeqCst);
    }

    pub fn idle_threshold_bytes_per_min(&self) -> u64 {
        self.idle_threshold_bytes_per_min.load(Ordering::SeqCst)
    }

    pub fn set_idle_threshold_bytes_per_min(&self, t: u64) {
        self.idle_threshold_bytes_per_min.store(t, Ordering::SeqCst);
    }

    pub fn idle_check_period_ms(&self) -> u32 {
        self.idle_check_period_ms.load(Ordering::SeqCst)
    }

    pub fn transmission_speed(&self) -> i64 {
        self.transmission_speed.load(Ordering::SeqCst)
    }

    pub fn set_transmission_speed(&self, speed: i64) {
        self.transmission_speed.store(speed.max(-1), Ordering::SeqCst);
    }

    pub fn deliver_tolerance_ms(&self) -> u32 {
        self.deliver_tolerance_ms.load(Ordering::SeqCst)
    }

    /// Returns `Err` for structural parameters once the connection has
    /// entered `CONNECTED` (spec.md §5, §8 "Attempting `setParameters()`
    /// after CONNECTED fails for structural parameters").
    pub fn guard_structural(&self, field: &'static str) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Err(TransportError::StructuralParameterLocked(field))
        } else {
            Ok(())
        }
    }
}
