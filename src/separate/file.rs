//! Lazy send-side splitter for a single outgoing file (spec.md §4.4
//! "SendFileOrder").
//!
//! Reserves the source path in the [`IoExclusionTable`] for the lifetime of
//! the transfer, computes the whole-file CRC32 up front (the wire format
//! commits to `contentCrc32` in parcel 0's extended header, so it must be
//! known before the first byte goes out), then streams the file out in
//! `transmissionParcelSize`-sized chunks.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;

use crate::error::{Result, TransportError};
use crate::io_guard::{IoExclusionTable, IoGuard, IoMode};
use crate::wire::parcel::{Channel, ExtendedHeader, Parcel, Priority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Ongoing,
    Closed,
}

pub struct SendFileOrder {
    file_id: i64,
    local_path: PathBuf,
    remote_path: String,
    priority: Priority,
    transaction: i64,
    file_length: u64,
    content_crc32: u32,
    parcel_count: i64,
    transmission_parcel_size: u32,
    transmitted_length: u64,
    parcels_sent: i64,
    state: State,
    reader: Option<tokio::fs::File>,
    start_time: DateTime<Utc>,
    _io_guard: IoGuard,
}

impl SendFileOrder {
    /// Reserve `local_path` for outgoing IO, pre-scan it for length and CRC,
    /// and prepare to stream it as `file_id` to `remote_path`.
    pub async fn start_sending(
        io_table: &IoExclusionTable,
        file_id: i64,
        local_path: impl Into<PathBuf>,
        remote_path: impl Into<String>,
        priority: Priority,
        transaction: i64,
        transmission_parcel_size: u32,
    ) -> Result<Self> {
        let local_path = local_path.into();
        let remote_path = remote_path.into();
        if remote_path.is_empty() {
            return Err(TransportError::InvalidParameter {
                field: "remotePath",
                reason: "must not be empty".into(),
            });
        }
        if transaction < 0 {
            return Err(TransportError::InvalidParameter {
                field: "transaction",
                reason: "must not be negative".into(),
            });
        }

        let io_guard = io_table
            .acquire(&local_path, IoMode::Outgoing)
            .ok_or_else(|| TransportError::FileInTransmission(local_path.clone()))?;

        let metadata = tokio::fs::metadata(&local_path).await?;
        let file_length = metadata.len();
        let content_crc32 = Self::scan_crc32(&local_path).await?;

        let reader = tokio::fs::File::open(&local_path).await?;
        let parcel_size = transmission_parcel_size.max(1) as u64;
        let parcel_count = ((file_length + parcel_size - 1) / parcel_size).max(1) as i64;

        Ok(Self {
            file_id,
            local_path,
            remote_path,
            priority,
            transaction,
            file_length,
            content_crc32,
            parcel_count,
            transmission_parcel_size,
            transmitted_length: 0,
            parcels_sent: 0,
            state: State::Ongoing,
            reader: Some(reader),
            start_time: Utc::now(),
            _io_guard: io_guard,
        })
    }

    async fn scan_crc32(path: &Path) -> Result<u32> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize())
    }

    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn transaction(&self) -> i64 {
        self.transaction
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn file_length(&self) -> u64 {
        self.file_length
    }

    pub fn transmitted_length(&self) -> u64 {
        self.transmitted_length
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == State::Closed
    }

    /// Produce the next parcel. Returns `Ok(None)` once every parcel has
    /// already been sent (the source file is closed at that point and the
    /// caller is expected to await the peer's `CONFIRM`).
    pub async fn next_parcel(&mut self) -> Result<Option<Parcel>> {
        if self.state == State::Closed {
            return Ok(None);
        }
        let reader = self
            .reader
            .as_mut()
            .expect("reader present while state is Ongoing");

        let mut buf = vec![0u8; self.transmission_parcel_size.max(1) as usize];
        let n = reader.read(&mut buf).await?;
        buf.truncate(n);
        let seq = self.parcels_sent as i32;
        self.parcels_sent += 1;
        self.transmitted_length += n as u64;

        let extended = if seq == 0 {
            Some(ExtendedHeader {
                codec_method: 0,
                priority: self.priority,
                transmission_size: self.file_length as i64,
                parcel_count: self.parcel_count,
                content_crc32: self.content_crc32,
                path: Some(self.remote_path.clone()),
            })
        } else {
            None
        };

        if self.parcels_sent >= self.parcel_count {
            self.reader = None;
            self.state = State::Closed;
        }

        Ok(Some(Parcel {
            channel: Channel::File,
            priority: self.priority,
            object_id: self.file_id,
            sequence_nr: seq,
            payload: buf,
            extended,
        }))
    }

    /// Release the IO reservation without finishing the transfer (peer
    /// aborted, connection tore down, `AbortFileTimeout` fired).
    pub fn break_transfer(self) {
        // Dropping `self` drops `_io_guard`, releasing the reservation.
    }
}

/// Ordered by priority descending, then `fileId` ascending within a
/// priority, matching the order `SendFileOrder`s are drained from a pending
/// queue (spec.md §4.4).
impl PartialEq for SendFileOrder {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.file_id == other.file_id
    }
}
impl Eq for SendFileOrder {}

impl PartialOrd for SendFileOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SendFileOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.file_id.cmp(&self.file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parcel::Priority;
    use tokio::io::AsyncWriteExt;

    async fn write_temp(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = tokio::fs::File::create(&path).await.unwrap();
        f.write_all(contents).await.unwrap();
        f.flush().await.unwrap();
        path
    }

    #[tokio::test]
    async fn streams_all_parcels_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "src.bin", &vec![7u8; 25]).await;
        let table = IoExclusionTable::new();
        let mut order = SendFileOrder::start_sending(
            &table, 1, path, "remote/dest.bin", Priority::Normal, 0, 10,
        )
        .await
        .unwrap();

        let mut total = 0usize;
        let mut first = true;
        loop {
            match order.next_parcel().await.unwrap() {
                Some(p) => {
                    if first {
                        assert!(p.extended.is_some());
                        first = false;
                    }
                    total += p.payload.len();
                }
                None => break,
            }
        }
        assert_eq!(total, 25);
        assert!(order.is_exhausted());
    }

    #[tokio::test]
    async fn concurrent_send_of_same_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_temp(&dir, "shared.bin", b"abc").await;
        let table = IoExclusionTable::new();
        let _first =
            SendFileOrder::start_sending(&table, 1, path.clone(), "r1", Priority::Normal, 0, 10)
                .await
                .unwrap();
        let second =
            SendFileOrder::start_sending(&table, 2, path, "r2", Priority::Normal, 0, 10).await;
        assert!(matches!(second, Err(TransportError::FileInTransmission(_))));
    }

    #[test]
    fn orders_by_priority_desc_then_file_id_asc() {
        let mk = |priority, file_id| SendFileOrder {
            file_id,
            local_path: PathBuf::new(),
            remote_path: String::new(),
            priority,
            transaction: 0,
            file_length: 0,
            content_crc32: 0,
            parcel_count: 1,
            transmission_parcel_size: 10,
            transmitted_length: 0,
            parcels_sent: 0,
            state: State::Closed,
            reader: None,
            start_time: Utc::now(),
            _io_guard: IoExclusionTable::new()
                .acquire(Path::new("/tmp/linkwire-order-test"), IoMode::Outgoing)
                .unwrap(),
        };
        let mut orders = vec![
            mk(Priority::Low, 1),
            mk(Priority::Top, 5),
            mk(Priority::Top, 2),
            mk(Priority::Normal, 9),
        ];
        orders.sort_by(|a, b| b.cmp(a));
        let order_ids: Vec<i64> = orders.iter().map(|o| o.file_id).collect();
        assert_eq!(order_ids, vec![2, 5, 9, 1]);
    }
}
