//! Delivery Pool / `OutputProcessor` (spec.md §4.11): one priority-ordered
//! queue of completed objects and administrative events, drained by a
//! single worker and dispatched to a connection's listeners strictly
//! sequentially.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::Lazy;
use tokio::sync::Notify;

use crate::events::{ConnectionEvent, ConnectionListener};
use crate::wire::parcel::Priority;

/// What the delivery pool needs from a connection to dispatch one event,
/// without owning it (spec.md §9 back-reference pattern).
pub trait DeliveryTarget: Send + Sync {
    fn connection_id(&self) -> uuid::Uuid;
    /// Copy-on-iterate snapshot of the currently registered listeners
    /// (spec.md §5 "Listener set: copy-on-iterate to tolerate listeners
    /// mutating the set during dispatch").
    fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>>;
    /// Called once the event has been handed to every listener; the default
    /// implementation used by `Connection` releases `waitForClosed` on a
    /// `Closed` event.
    fn on_delivered(&self, _event: &ConnectionEvent) {}
}

struct QueuedDelivery {
    target: Arc<dyn DeliveryTarget>,
    event: ConnectionEvent,
    priority: Priority,
    seq: u64,
    deliver_tolerance_ms: u32,
}

impl PartialEq for QueuedDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for QueuedDelivery {}

impl PartialOrd for QueuedDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Higher priority first; ties broken by ascending delivery sequence number
/// (FIFO within one priority).
impl Ord for QueuedDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One delivery worker plus its queue. May be the process-wide shared pool
/// for a role, or a dedicated pool for a single connection (spec.md §4.11).
pub struct DeliveryPool {
    queue: std::sync::Mutex<BinaryHeap<QueuedDelivery>>,
    notify: Notify,
    next_seq: AtomicU64,
    blocking: AtomicBool,
}

impl DeliveryPool {
    fn spawn(self: Arc<Self>) -> Arc<Self> {
        let worker = self.clone();
        tokio::spawn(async move { worker.run().await });
        self
    }

    /// A fresh individual pool for one connection.
    pub fn individual() -> Arc<Self> {
        Arc::new(Self {
            queue: std::sync::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            blocking: AtomicBool::new(false),
        })
        .spawn()
    }

    /// Whether the pool has observed a delivery exceeding that connection's
    /// `deliverTolerance`. A connection on a blocking *global* pool should
    /// migrate itself to [`DeliveryPool::individual`] on its next enqueue.
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(AtomicOrdering::SeqCst)
    }

    pub fn enqueue(
        &self,
        target: Arc<dyn DeliveryTarget>,
        priority: Priority,
        event: ConnectionEvent,
        deliver_tolerance_ms: u32,
    ) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        self.queue.lock().unwrap().push(QueuedDelivery {
            target,
            event,
            priority,
            seq,
            deliver_tolerance_ms,
        });
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedDelivery> {
        self.queue.lock().unwrap().pop()
    }

    async fn run(self: Arc<Self>) {
        loop {
            let item = loop {
                if let Some(item) = self.pop() {
                    break item;
                }
                self.notify.notified().await;
            };

            let listeners = item.target.listeners();
            let started = Instant::now();
            for listener in &listeners {
                // A listener panicking is caught so one bad listener never
                // stalls delivery for the rest of the set or later events.
                let listener = listener.clone();
                let event = item.event.clone();
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    listener.dispatch(&event);
                }));
                if let Err(_panic) = outcome {
                    tracing::error!(
                        connection_id = %item.target.connection_id(),
                        "connection listener panicked during dispatch"
                    );
                }
            }
            item.target.on_delivered(&item.event);

            let elapsed_ms = started.elapsed().as_millis() as u64;
            if elapsed_ms > item.deliver_tolerance_ms as u64 {
                tracing::warn!(
                    connection_id = %item.target.connection_id(),
                    elapsed_ms,
                    tolerance_ms = item.deliver_tolerance_ms,
                    "delivery pool exceeded deliverTolerance; marking blocking"
                );
                self.blocking.store(true, AtomicOrdering::SeqCst);
            }
        }
    }
}

/// Lazily created, process-wide shared pools, one per role (spec.md §9
/// "per-role singletons... created lazily... kept alive as daemons").
pub static GLOBAL_CLIENT_POOL: Lazy<Arc<DeliveryPool>> = Lazy::new(|| {
    Arc::new(DeliveryPool {
        queue: std::sync::Mutex::new(BinaryHeap::new()),
        notify: Notify::new(),
        next_seq: AtomicU64::new(0),
        blocking: AtomicBool::new(false),
    })
    .spawn()
});

pub static GLOBAL_SERVER_POOL: Lazy<Arc<DeliveryPool>> = Lazy::new(|| {
    Arc::new(DeliveryPool {
        queue: std::sync::Mutex::new(BinaryHeap::new()),
        notify: Notify::new(),
        next_seq: AtomicU64::new(0),
        blocking: AtomicBool::new(false),
    })
    .spawn()
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct Listener(Arc<StdMutex<Vec<String>>>);
    impl ConnectionListener for Listener {
        fn dispatch(&self, event: &ConnectionEvent) {
            self.0.lock().unwrap().push(format!("{event:?}"));
        }
    }

    struct Target {
        id: uuid::Uuid,
        listener: Arc<Listener>,
        delivered_count: AtomicUsize,
    }
    impl DeliveryTarget for Target {
        fn connection_id(&self) -> uuid::Uuid {
            self.id
        }
        fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
            vec![self.listener.clone()]
        }
        fn on_delivered(&self, _event: &ConnectionEvent) {
            self.delivered_count.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[tokio::test]
    async fn delivers_strictly_in_priority_then_fifo_order() {
        let pool = DeliveryPool::individual();
        let log = Arc::new(StdMutex::new(Vec::new()));
        let target = Arc::new(Target {
            id: uuid::Uuid::nil(),
            listener: Arc::new(Listener(log.clone())),
            delivered_count: AtomicUsize::new(0),
        });

        pool.enqueue(target.clone(), Priority::Low, ConnectionEvent::Connected, 10_000);
        pool.enqueue(
            target.clone(),
            Priority::Top,
            ConnectionEvent::Idle { idle: true, exchange_bytes_per_min: 0 },
            10_000,
        );
        pool.enqueue(target.clone(), Priority::Low, ConnectionEvent::Connected, 10_000);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(target.delivered_count.load(AtomicOrdering::SeqCst), 3);
        let log = log.lock().unwrap();
        assert!(log[0].starts_with("Idle"));
        assert_eq!(log[1], log[2]);
    }

    #[tokio::test]
    async fn marks_pool_blocking_when_tolerance_exceeded() {
        let pool = DeliveryPool::individual();
        struct SlowListener;
        impl ConnectionListener for SlowListener {
            fn dispatch(&self, _event: &ConnectionEvent) {
                std::thread::sleep(std::time::Duration::from_millis(30));
            }
        }
        struct SlowTarget;
        impl DeliveryTarget for SlowTarget {
            fn connection_id(&self) -> uuid::Uuid {
                uuid::Uuid::nil()
            }
            fn listeners(&self) -> Vec<Arc<dyn ConnectionListener>> {
                vec![Arc::new(SlowListener)]
            }
        }
        pool.enqueue(Arc::new(SlowTarget), Priority::Normal, ConnectionEvent::Connected, 5);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(pool.is_blocking());
    }
}
