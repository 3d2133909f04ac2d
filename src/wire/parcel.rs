//! The parcel frame: the single atomic unit ever written to or read from a
//! connection's socket (spec.md §4.1).
//!
//! ```text
//!  uint32  magic
//!  uint8   channel
//!  uint8   priority
//!  int64   objectId
//!  int32   sequenceNr
//!  int32   payloadLength
//!  int32   headerCrc32        (CRC32 of channel-ordinal + objectId + sequenceNr + payload)
//!  // if sequenceNr==0 && channel in {OBJECT,FILE}:
//!  uint8   codecMethod
//!  uint8   priorityInHeader
//!  int64   transmissionSize
//!  int64   parcelCount
//!  int32   objectCrc32
//!  uint16  pathLen
//!  bytes[] pathBytes
//!  // always:
//!  bytes[payloadLength] payload
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Fixed value compared on every parcel read. Corruption or desync on the
/// socket is detected the moment this stops matching.
pub const PARCEL_MAGIC: u32 = 0x4C57_5031; // "LWP1"

/// The handshake marker exchanged once at connection setup (spec.md §6), an
/// example value fixed by this implementation.
pub const HANDSHAKE_MARKER: [u8; 6] = [0x83, 0x59, 0x4A, 0x4E, 0x00, 0x01];

const FIXED_HEADER_LEN: usize = 4 + 1 + 1 + 8 + 4 + 4 + 4; // 26
const MAX_PATH_LEN: usize = 65535;

/// Transport categories a parcel can ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Signal = 0,
    Object = 1,
    File = 2,
    Final = 3,
}

impl Channel {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Channel::Signal),
            1 => Ok(Channel::Object),
            2 => Ok(Channel::File),
            3 => Ok(Channel::Final),
            other => Err(TransportError::BadParcel(format!("unknown channel {other}"))),
        }
    }
}

/// Outbound ordering class; orders only within one channel of one connection
/// (spec.md GLOSSARY). Variant order doubles as `priority desc` ordering via
/// derived `Ord` on the discriminant (`Top` > `High` > ... > `Bottom`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Bottom = 0,
    Low = 1,
    Normal = 2,
    High = 3,
    Top = 4,
}

impl Priority {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Priority::Bottom),
            1 => Ok(Priority::Low),
            2 => Ok(Priority::Normal),
            3 => Ok(Priority::High),
            4 => Ok(Priority::Top),
            other => Err(TransportError::BadParcel(format!("unknown priority {other}"))),
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Present only on parcel 0 of an OBJECT or FILE transmission.
#[derive(Debug, Clone)]
pub struct ExtendedHeader {
    pub codec_method: u8,
    pub priority: Priority,
    pub transmission_size: i64,
    pub parcel_count: i64,
    pub content_crc32: u32,
    /// Destination path, OBJECT transmissions never set this.
    pub path: Option<String>,
}

/// One atomic wire unit.
#[derive(Debug, Clone)]
pub struct Parcel {
    pub channel: Channel,
    pub priority: Priority,
    pub object_id: i64,
    pub sequence_nr: i32,
    pub payload: Vec<u8>,
    pub extended: Option<ExtendedHeader>,
}

impl Parcel {
    pub fn signal(object_id: i64, sequence_nr: i32, payload: Vec<u8>) -> Self {
        Parcel {
            channel: Channel::Signal,
            priority: Priority::Top,
            object_id,
            sequence_nr,
            payload,
            extended: None,
        }
    }

    fn carries_extended_header(&self) -> bool {
        self.sequence_nr == 0 && matches!(self.channel, Channel::Object | Channel::File)
    }

    /// Total number of bytes this parcel occupies on the wire.
    pub fn serialized_len(&self) -> usize {
        let ext_len = match &self.extended {
            Some(h) if self.carries_extended_header() => {
                1 + 1 + 8 + 8 + 4 + 2 + h.path.as_deref().map(str::len).unwrap_or(0)
            }
            _ => 0,
        };
        FIXED_HEADER_LEN + ext_len + self.payload.len()
    }

    fn header_crc(channel: Channel, object_id: i64, sequence_nr: i32, payload: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&[channel as u8]);
        hasher.update(&object_id.to_be_bytes());
        hasher.update(&sequence_nr.to_be_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        if self.payload.len() > i32::MAX as usize {
            return Err(TransportError::BadParcel("payload too large".into()));
        }
        let crc = Self::header_crc(self.channel, self.object_id, self.sequence_nr, &self.payload);

        w.write_u32(PARCEL_MAGIC).await?;
        w.write_u8(self.channel as u8).await?;
        w.write_u8(self.priority as u8).await?;
        w.write_i64(self.object_id).await?;
        w.write_i32(self.sequence_nr).await?;
        w.write_i32(self.payload.len() as i32).await?;
        w.write_u32(crc).await?;

        if self.carries_extended_header() {
            let h = self
                .extended
                .as_ref()
                .ok_or_else(|| TransportError::BadParcel("missing extended header".into()))?;
            w.write_u8(h.codec_method).await?;
            w.write_u8(h.priority as u8).await?;
            w.write_i64(h.transmission_size).await?;
            w.write_i64(h.parcel_count).await?;
            w.write_u32(h.content_crc32).await?;
            let path_bytes = h.path.as_deref().unwrap_or("").as_bytes();
            if path_bytes.len() > MAX_PATH_LEN {
                return Err(TransportError::BadParcel("path too long".into()));
            }
            w.write_u16(path_bytes.len() as u16).await?;
            w.write_all(path_bytes).await?;
        }

        w.write_all(&self.payload).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let magic = r.read_u32().await?;
        if magic != PARCEL_MAGIC {
            return Err(TransportError::BadParcel(format!(
                "bad magic: {magic:#x}"
            )));
        }
        let channel = Channel::from_u8(r.read_u8().await?)?;
        let priority = Priority::from_u8(r.read_u8().await?)?;
        let object_id = r.read_i64().await?;
        let sequence_nr = r.read_i32().await?;
        let payload_len = r.read_i32().await?;
        if payload_len < 0 {
            return Err(TransportError::BadParcel("negative payload length".into()));
        }
        let header_crc = r.read_u32().await?;

        let extended = if sequence_nr == 0 && matches!(channel, Channel::Object | Channel::File) {
            let codec_method = r.read_u8().await?;
            let ext_priority = Priority::from_u8(r.read_u8().await?)?;
            let transmission_size = r.read_i64().await?;
            let parcel_count = r.read_i64().await?;
            let content_crc32 = r.read_u32().await?;
            let path_len = r.read_u16().await? as usize;
            if path_len > MAX_PATH_LEN {
                return Err(TransportError::BadParcel("path too long".into()));
            }
            let mut path_bytes = vec![0u8; path_len];
            r.read_exact(&mut path_bytes).await?;
            let path = if path_bytes.is_empty() {
                None
            } else {
                Some(String::from_utf8(path_bytes).map_err(|e| {
                    TransportError::BadParcel(format!("invalid utf8 path: {e}"))
                })?)
            };

            if object_id <= 0 || transmission_size < 0 || parcel_count < 1 {
                return Err(TransportError::BadParcel(
                    "extended header failed soundness check".into(),
                ));
            }

            Some(ExtendedHeader {
                codec_method,
                priority: ext_priority,
                transmission_size,
                parcel_count,
                content_crc32,
                path,
            })
        } else {
            None
        };

        let mut payload = vec![0u8; payload_len as usize];
        r.read_exact(&mut payload).await?;

        let expected_crc = Self::header_crc(channel, object_id, sequence_nr, &payload);
        if expected_crc != header_crc {
            return Err(TransportError::BadParcel("header CRC mismatch".into()));
        }

        Ok(Parcel {
            channel,
            priority,
            object_id,
            sequence_nr,
            payload,
            extended,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Runtime::new().unwrap()
    }

    #[test]
    fn round_trips_plain_parcel() {
        rt().block_on(async {
            let p = Parcel {
                channel: Channel::Object,
                priority: Priority::High,
                object_id: 7,
                sequence_nr: 3,
                payload: b"hello world".to_vec(),
                extended: None,
            };
            let mut buf = Vec::new();
            p.write(&mut buf).await.unwrap();
            assert_eq!(buf.len(), p.serialized_len());
            let mut cursor = std::io::Cursor::new(buf);
            let parsed = Parcel::read(&mut cursor).await.unwrap();
            assert_eq!(parsed.object_id, 7);
            assert_eq!(parsed.sequence_nr, 3);
            assert_eq!(parsed.payload, b"hello world");
        });
    }

    #[test]
    fn round_trips_extended_header_with_path() {
        rt().block_on(async {
            let p = Parcel {
                channel: Channel::File,
                priority: Priority::Normal,
                object_id: 42,
                sequence_nr: 0,
                payload: b"chunk".to_vec(),
                extended: Some(ExtendedHeader {
                    codec_method: 1,
                    priority: Priority::Normal,
                    transmission_size: 72000,
                    parcel_count: 5,
                    content_crc32: 0xDEADBEEF,
                    path: Some("incoming/report.bin".to_string()),
                }),
            };
            let mut buf = Vec::new();
            p.write(&mut buf).await.unwrap();
            let mut cursor = std::io::Cursor::new(buf);
            let parsed = Parcel::read(&mut cursor).await.unwrap();
            let ext = parsed.extended.unwrap();
            assert_eq!(ext.parcel_count, 5);
            assert_eq!(ext.path.as_deref(), Some("incoming/report.bin"));
        });
    }

    #[test]
    fn rejects_bad_magic() {
        rt().block_on(async {
            let mut buf = vec![0u8; 4];
            buf[0] = 0xFF;
            let mut cursor = std::io::Cursor::new(buf);
            let err = Parcel::read(&mut cursor).await;
            assert!(matches!(err, Err(TransportError::BadParcel(_))) || err.is_err());
        });
    }

    #[test]
    fn rejects_tampered_payload() {
        rt().block_on(async {
            let p = Parcel::signal(1, 0, b"ping".to_vec());
            let mut buf = Vec::new();
            p.write(&mut buf).await.unwrap();
            let last = buf.len() - 1;
            buf[last] ^= 0xFF;
            let mut cursor = std::io::Cursor::new(buf);
            let err = Parcel::read(&mut cursor).await;
            assert!(matches!(err, Err(TransportError::BadParcel(_))));
        });
    }
}
