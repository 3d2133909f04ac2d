//! Receive-side file reassembly (spec.md §3 "FileAgglomerator", §4.8).
//!
//! Streams parcel payloads into a temp file under the configured root
//! directory; on completion verifies the CRC and renames to the destination
//! path (relative to root); on abort the temp file is deleted.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::error::{Result, TransportError};
use crate::io_guard::{IoExclusionTable, IoGuard, IoMode};
use crate::wire::parcel::{Parcel, Priority};

/// Rejects absolute paths and `..` segments so a malicious/buggy peer cannot
/// write outside the configured root.
fn sanitize_relative_path(raw: &str) -> Result<PathBuf> {
    let path = Path::new(raw);
    if path.is_absolute() {
        return Err(TransportError::BadParcel("absolute destination path".into()));
    }
    let mut clean = PathBuf::new();
    for component in path.components() {
        use std::path::Component;
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(TransportError::BadParcel(
                    "destination path escapes root".into(),
                ))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(TransportError::BadParcel("empty destination path".into()));
    }
    Ok(clean)
}

#[derive(Debug)]
pub enum FileAgglomerateOutcome {
    InProgress,
    Complete { final_path: PathBuf, length: u64 },
}

pub struct FileAgglomerator {
    file_id: i64,
    priority: Priority,
    expected_size: u64,
    parcel_count: i64,
    content_crc32: u32,
    dest_relative: PathBuf,
    root: PathBuf,
    temp_path: PathBuf,
    next_seq: i32,
    received_len: u64,
    created_at: DateTime<Utc>,
    file: tokio::fs::File,
    hasher: crc32fast::Hasher,
    _io_guard: IoGuard,
}

impl FileAgglomerator {
    /// Construct from the first (sequenceNr==0) parcel of an incoming file,
    /// and fold that parcel's payload in immediately (a single-parcel file
    /// may already be complete after this call). Reserves the destination
    /// path in `io_table` for incoming IO before the first byte is written
    /// (spec.md §5), mirroring what `SendFileOrder::start_sending` does for
    /// the outgoing side.
    pub async fn create(
        io_table: &IoExclusionTable,
        file_id: i64,
        root: Option<&Path>,
        parcel: &Parcel,
    ) -> Result<(Self, FileAgglomerateOutcome)> {
        let root = root
            .ok_or_else(|| TransportError::BadParcel("no fileRootDir configured".into()))?
            .to_path_buf();
        let ext = parcel.extended.as_ref().ok_or_else(|| {
            TransportError::BadParcel("file parcel 0 missing extended header".into())
        })?;
        let path_str = ext.path.as_deref().ok_or_else(|| {
            TransportError::BadParcel("file parcel 0 missing destination path".into())
        })?;
        let dest_relative = sanitize_relative_path(path_str)?;
        let final_path = root.join(&dest_relative);

        let io_guard = io_table
            .acquire(&final_path, IoMode::Incoming)
            .ok_or_else(|| TransportError::FileInTransmission(final_path.clone()))?;

        tokio::fs::create_dir_all(&root).await?;
        let temp_path = root.join(format!(".incoming-{file_id}.part"));
        let file = tokio::fs::File::create(&temp_path).await?;

        let mut agg = Self {
            file_id,
            priority: ext.priority,
            expected_size: ext.transmission_size as u64,
            parcel_count: ext.parcel_count,
            content_crc32: ext.content_crc32,
            dest_relative,
            root,
            temp_path,
            next_seq: 0,
            received_len: 0,
            created_at: Utc::now(),
            file,
            hasher: crc32fast::Hasher::new(),
            _io_guard: io_guard,
        };
        let outcome = agg.fold_in(0, &parcel.payload).await?;
        Ok((agg, outcome))
    }

    pub fn file_id(&self) -> i64 {
        self.file_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn expected_size(&self) -> u64 {
        self.expected_size
    }

    pub fn received_len(&self) -> u64 {
        self.received_len
    }

    pub fn dest_relative(&self) -> &Path {
        &self.dest_relative
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn digest_parcel(&mut self, parcel: &Parcel) -> Result<FileAgglomerateOutcome> {
        self.fold_in(parcel.sequence_nr, &parcel.payload).await
    }

    async fn fold_in(&mut self, sequence_nr: i32, payload: &[u8]) -> Result<FileAgglomerateOutcome> {
        if sequence_nr != self.next_seq {
            return Err(TransportError::BadParcel(format!(
                "file {} expected sequence {} got {}",
                self.file_id, self.next_seq, sequence_nr
            )));
        }
        self.file.write_all(payload).await?;
        self.hasher.update(payload);
        self.received_len += payload.len() as u64;
        self.next_seq += 1;

        if self.next_seq as i64 == self.parcel_count {
            self.file.flush().await?;
            if self.hasher.clone().finalize() != self.content_crc32 {
                return Err(TransportError::BadParcel(format!(
                    "file {} CRC mismatch",
                    self.file_id
                )));
            }
            if self.received_len != self.expected_size {
                return Err(TransportError::BadParcel(format!(
                    "file {} length mismatch: got {} expected {}",
                    self.file_id, self.received_len, self.expected_size
                )));
            }
            let final_path = self.root.join(&self.dest_relative);
            if let Some(parent) = final_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::rename(&self.temp_path, &final_path).await?;
            Ok(FileAgglomerateOutcome::Complete {
                final_path,
                length: self.received_len,
            })
        } else {
            Ok(FileAgglomerateOutcome::InProgress)
        }
    }

    pub async fn abort(self) {
        let _ = tokio::fs::remove_file(&self.temp_path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parcel::{Channel, ExtendedHeader};

    fn header(parcel_count: i64, size: i64, crc: u32, path: &str) -> ExtendedHeader {
        ExtendedHeader {
            codec_method: 0,
            priority: Priority::Normal,
            transmission_size: size,
            parcel_count,
            content_crc32: crc,
            path: Some(path.to_string()),
        }
    }

    fn parcel(seq: i32, payload: &[u8], ext: Option<ExtendedHeader>) -> Parcel {
        Parcel {
            channel: Channel::File,
            priority: Priority::Normal,
            object_id: 5,
            sequence_nr: seq,
            payload: payload.to_vec(),
            extended: ext,
        }
    }

    #[tokio::test]
    async fn rejects_traversal_paths() {
        let dir = tempfile::tempdir().unwrap();
        let table = IoExclusionTable::new();
        let p0 = parcel(0, b"xy", Some(header(1, 2, crc32fast::hash(b"xy"), "../escape.bin")));
        let res = FileAgglomerator::create(&table, 9, Some(dir.path()), &p0).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn reassembles_and_renames_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let table = IoExclusionTable::new();
        let data = b"hello file contents".to_vec();
        let crc = crc32fast::hash(&data);
        let (part0, part1) = data.split_at(10);

        let p0 = parcel(0, part0, Some(header(2, data.len() as i64, crc, "out/report.bin")));
        let (mut agg, outcome0) =
            FileAgglomerator::create(&table, 3, Some(dir.path()), &p0).await.unwrap();
        assert!(matches!(outcome0, FileAgglomerateOutcome::InProgress));
        let p1 = parcel(1, part1, None);
        match agg.digest_parcel(&p1).await.unwrap() {
            FileAgglomerateOutcome::Complete { final_path, length } => {
                assert_eq!(length, data.len() as u64);
                let written = tokio::fs::read(&final_path).await.unwrap();
                assert_eq!(written, data);
            }
            FileAgglomerateOutcome::InProgress => panic!("expected completion"),
        }
    }

    #[tokio::test]
    async fn single_parcel_file_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let table = IoExclusionTable::new();
        let data = b"tiny".to_vec();
        let crc = crc32fast::hash(&data);
        let p0 = parcel(0, &data, Some(header(1, data.len() as i64, crc, "tiny.bin")));
        let (_agg, outcome) =
            FileAgglomerator::create(&table, 7, Some(dir.path()), &p0).await.unwrap();
        assert!(matches!(outcome, FileAgglomerateOutcome::Complete { .. }));
    }

    #[tokio::test]
    async fn crc_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = IoExclusionTable::new();
        let data = b"abcdefgh".to_vec();
        let p0 = parcel(0, &data, Some(header(1, data.len() as i64, 0xFFFF_FFFF, "x.bin")));
        let res = FileAgglomerator::create(&table, 4, Some(dir.path()), &p0).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn concurrent_incoming_files_to_the_same_destination_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let table = IoExclusionTable::new();
        let data = b"abcdefgh".to_vec();
        let crc = crc32fast::hash(&data);
        let p0 = parcel(0, &data[..4], Some(header(2, data.len() as i64, crc, "shared.bin")));
        let (_agg, outcome) =
            FileAgglomerator::create(&table, 1, Some(dir.path()), &p0).await.unwrap();
        assert!(matches!(outcome, FileAgglomerateOutcome::InProgress));
        let p0_again = parcel(0, &data[..4], Some(header(2, data.len() as i64, crc, "shared.bin")));
        let res = FileAgglomerator::create(&table, 2, Some(dir.path()), &p0_again).await;
        assert!(matches!(res, Err(TransportError::FileInTransmission(_))));
    }
}
