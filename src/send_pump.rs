//! Core Send Pump (spec.md §4.5): one shared, priority-ordered outbound
//! queue per role, drained by a single writer task that owns every
//! connection's socket write path for that role.
//!
//! Ordering: channel asc (SIGNAL<OBJECT<FILE<FINAL), then priority desc,
//! then objectId asc, then sequenceNr asc.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::wire::parcel::{Channel, Parcel, Priority};

/// What the send pump needs from a connection to write one parcel and
/// account for it, without owning the connection (spec.md §9: processors
/// hold a back-reference, never ownership).
#[async_trait::async_trait]
pub trait SendTarget: Send + Sync {
    fn connection_id(&self) -> uuid::Uuid;
    /// False once the connection has reached CLOSED; the pump drops queued
    /// parcels for a dead connection instead of writing them.
    fn is_write_open(&self) -> bool;
    /// For FILE-channel parcels: true if the originating `SendFileOrder` was
    /// removed from the sender map (transfer aborted) before this parcel
    /// reached the front of the queue.
    fn is_file_cancelled(&self, file_id: i64) -> bool;
    async fn write_parcel(&self, parcel: &Parcel) -> std::io::Result<()>;
    /// Invoked after a successful write: updates `lastSendTime`,
    /// `transmittedVolume`, `currentSendLoad` (non-signal only), and
    /// `exchangedVolume`.
    fn note_sent(&self, serialized_len: u64, channel: Channel);
    /// Invoked when a queued parcel is dropped instead of written (dead
    /// target, cancelled file transfer): undoes only the `currentSendLoad`
    /// accounting `enqueue` performed, without reporting bytes as
    /// transmitted.
    fn note_dropped(&self, serialized_len: u64, channel: Channel);
    /// Invoked when `write_parcel` returns an error: hard-closes the
    /// connection with error info=6.
    fn on_socket_error(&self, err: std::io::Error);
}

/// One-shot callback attached to the ALL-SENT/last-file parcel
/// (`ControlEndOfShutdown`, `AbortFileTimeout`); runs once the frame has
/// actually been written to the wire (spec.md §4.10, §4.12).
pub type AttachedTimerTask = Box<dyn FnOnce() + Send>;

struct QueuedItem {
    parcel: Parcel,
    target: Arc<dyn SendTarget>,
    attached: Option<AttachedTimerTask>,
}

impl QueuedItem {
    fn rank_key(&self) -> (u8, Priority, i64, i32) {
        (
            self.parcel.channel as u8,
            self.parcel.priority,
            self.parcel.object_id,
            self.parcel.sequence_nr,
        )
    }
}

impl PartialEq for QueuedItem {
    fn eq(&self, other: &Self) -> bool {
        self.rank_key() == other.rank_key()
    }
}
impl Eq for QueuedItem {}

impl PartialOrd for QueuedItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedItem {
    fn cmp(&self, other: &Self) -> Ordering {
        let (chan, prio, oid, seq) = self.rank_key();
        let (ochan, oprio, ooid, oseq) = other.rank_key();
        // channel asc -> lower channel must pop first -> reverse compare
        ochan
            .cmp(&chan)
            // priority desc -> higher priority pops first -> natural compare
            .then_with(|| prio.cmp(&oprio))
            // objectId asc, sequenceNr asc -> lower pops first -> reverse compare
            .then_with(|| ooid.cmp(&oid))
            .then_with(|| oseq.cmp(&seq))
    }
}

/// Process-wide, per-role shared send queue plus its single writer task.
/// Created lazily per role and kept alive as a daemon (spec.md §9 "global
/// mutable state... per-role singletons").
pub struct SendPump {
    queue: std::sync::Mutex<BinaryHeap<QueuedItem>>,
    notify: Notify,
    queued_bytes: AtomicU64,
}

impl SendPump {
    pub fn new() -> Arc<Self> {
        let pump = Arc::new(Self {
            queue: std::sync::Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            queued_bytes: AtomicU64::new(0),
        });
        let writer = pump.clone();
        tokio::spawn(async move { writer.run_writer().await });
        pump
    }

    /// Enqueue `parcel` for `target`'s socket. `attached`, if present, fires
    /// once this exact parcel has been written.
    pub fn enqueue(
        &self,
        parcel: Parcel,
        target: Arc<dyn SendTarget>,
        attached: Option<AttachedTimerTask>,
    ) {
        self.queued_bytes
            .fetch_add(parcel.serialized_len() as u64, AtomicOrdering::SeqCst);
        self.queue.lock().unwrap().push(QueuedItem {
            parcel,
            target,
            attached,
        });
        self.notify.notify_one();
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(AtomicOrdering::SeqCst)
    }

    fn pop(&self) -> Option<QueuedItem> {
        self.queue.lock().unwrap().pop()
    }

    async fn run_writer(self: Arc<Self>) {
        loop {
            let item = loop {
                if let Some(item) = self.pop() {
                    break item;
                }
                self.notify.notified().await;
            };
            self.queued_bytes.fetch_sub(
                item.parcel.serialized_len() as u64,
                AtomicOrdering::SeqCst,
            );

            let len = item.parcel.serialized_len() as u64;
            let channel = item.parcel.channel;

            if !item.target.is_write_open() {
                item.target.note_dropped(len, channel);
                continue;
            }
            if channel == Channel::File && item.target.is_file_cancelled(item.parcel.object_id) {
                item.target.note_dropped(len, channel);
                continue;
            }

            match item.target.write_parcel(&item.parcel).await {
                Ok(()) => {
                    item.target.note_sent(len, channel);
                    if let Some(cb) = item.attached {
                        cb();
                    }
                }
                Err(e) => item.target.on_socket_error(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64 as StdAtomicU64};
    use std::sync::Mutex as StdMutex;

    struct RecordingTarget {
        open: AtomicBool,
        written: StdMutex<Vec<(Channel, Priority, i64, i32)>>,
        sent_bytes: StdAtomicU64,
        dropped_bytes: StdAtomicU64,
    }

    #[async_trait::async_trait]
    impl SendTarget for RecordingTarget {
        fn connection_id(&self) -> uuid::Uuid {
            uuid::Uuid::nil()
        }
        fn is_write_open(&self) -> bool {
            self.open.load(AtomicOrdering::SeqCst)
        }
        fn is_file_cancelled(&self, _file_id: i64) -> bool {
            false
        }
        async fn write_parcel(&self, parcel: &Parcel) -> std::io::Result<()> {
            self.written.lock().unwrap().push((
                parcel.channel,
                parcel.priority,
                parcel.object_id,
                parcel.sequence_nr,
            ));
            Ok(())
        }
        fn note_sent(&self, serialized_len: u64, _channel: Channel) {
            self.sent_bytes
                .fetch_add(serialized_len, AtomicOrdering::SeqCst);
        }
        fn note_dropped(&self, serialized_len: u64, _channel: Channel) {
            self.dropped_bytes
                .fetch_add(serialized_len, AtomicOrdering::SeqCst);
        }
        fn on_socket_error(&self, _err: std::io::Error) {}
    }

    fn parcel(channel: Channel, priority: Priority, object_id: i64, seq: i32) -> Parcel {
        Parcel {
            channel,
            priority,
            object_id,
            sequence_nr: seq,
            payload: Vec::new(),
            extended: None,
        }
    }

    #[tokio::test]
    async fn drains_in_priority_and_channel_order() {
        let pump = SendPump::new();
        let target: Arc<RecordingTarget> = Arc::new(RecordingTarget {
            open: AtomicBool::new(true),
            written: StdMutex::new(Vec::new()),
            sent_bytes: StdAtomicU64::new(0),
            dropped_bytes: StdAtomicU64::new(0),
        });

        pump.enqueue(
            parcel(Channel::Object, Priority::Low, 2, 0),
            target.clone(),
            None,
        );
        pump.enqueue(
            parcel(Channel::Signal, Priority::Top, 9, 0),
            target.clone(),
            None,
        );
        pump.enqueue(
            parcel(Channel::Object, Priority::High, 1, 0),
            target.clone(),
            None,
        );

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let written = target.written.lock().unwrap().clone();
        assert_eq!(written.len(), 3);
        assert_eq!(written[0].0, Channel::Signal);
        assert_eq!(written[1], (Channel::Object, Priority::High, 1, 0));
        assert_eq!(written[2], (Channel::Object, Priority::Low, 2, 0));
    }

    #[tokio::test]
    async fn drops_parcels_for_closed_targets() {
        let pump = SendPump::new();
        let target: Arc<RecordingTarget> = Arc::new(RecordingTarget {
            open: AtomicBool::new(false),
            written: StdMutex::new(Vec::new()),
            sent_bytes: StdAtomicU64::new(0),
            dropped_bytes: StdAtomicU64::new(0),
        });
        let p = parcel(Channel::Object, Priority::Normal, 1, 0);
        let expected_len = p.serialized_len() as u64;
        pump.enqueue(p, target.clone(), None);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(target.written.lock().unwrap().is_empty());
        assert_eq!(target.dropped_bytes.load(AtomicOrdering::SeqCst), expected_len);
    }
}
