//! Receive-side object reassembly (spec.md §3 "ObjectAgglomerator", §4.8).

use crate::error::{Result, TransportError};
use crate::wire::parcel::{Parcel, Priority};

/// Reassembles one object's parcels, keyed by objectId in the caller's map.
pub struct ObjectAgglomerator {
    object_id: i64,
    codec_method: Option<u8>,
    priority: Priority,
    expected_size: u64,
    parcel_count: i64,
    next_seq: i32,
    buffer: Vec<u8>,
}

impl ObjectAgglomerator {
    pub fn new(object_id: i64) -> Self {
        Self {
            object_id,
            codec_method: None,
            priority: Priority::Normal,
            expected_size: 0,
            parcel_count: 0,
            next_seq: 0,
            buffer: Vec::new(),
        }
    }

    pub fn object_id(&self) -> i64 {
        self.object_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn codec_method(&self) -> Option<u8> {
        self.codec_method
    }

    /// Feed the next parcel. `max_size` is `maxSerialisationSize`. Returns
    /// the fully reassembled payload once the last parcel has arrived.
    pub fn digest_parcel(&mut self, parcel: &Parcel, max_size: u64) -> Result<Option<Vec<u8>>> {
        if parcel.sequence_nr != self.next_seq {
            return Err(TransportError::BadParcel(format!(
                "object {} expected sequence {} got {}",
                self.object_id, self.next_seq, parcel.sequence_nr
            )));
        }

        if parcel.sequence_nr == 0 {
            let ext = parcel.extended.as_ref().ok_or_else(|| {
                TransportError::BadParcel("object parcel 0 missing extended header".into())
            })?;
            if ext.transmission_size as u64 > max_size {
                return Err(TransportError::OversizedSerialization {
                    size: ext.transmission_size as u64,
                    max: max_size,
                });
            }
            self.codec_method = Some(ext.codec_method);
            self.priority = ext.priority;
            self.expected_size = ext.transmission_size as u64;
            self.parcel_count = ext.parcel_count;
        }

        self.buffer.extend_from_slice(&parcel.payload);
        self.next_seq += 1;

        if self.next_seq as i64 == self.parcel_count {
            if self.buffer.len() as u64 != self.expected_size {
                return Err(TransportError::BadParcel(format!(
                    "object {} reassembled to {} bytes, expected {}",
                    self.object_id,
                    self.buffer.len(),
                    self.expected_size
                )));
            }
            Ok(Some(std::mem::take(&mut self.buffer)))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::parcel::{Channel, ExtendedHeader};

    fn parcel(seq: i32, payload: &[u8], ext: Option<ExtendedHeader>) -> Parcel {
        Parcel {
            channel: Channel::Object,
            priority: Priority::Normal,
            object_id: 1,
            sequence_nr: seq,
            payload: payload.to_vec(),
            extended: ext,
        }
    }

    #[test]
    fn reassembles_in_order() {
        let mut agg = ObjectAgglomerator::new(1);
        let p0 = parcel(
            0,
            b"ab",
            Some(ExtendedHeader {
                codec_method: 0,
                priority: Priority::Normal,
                transmission_size: 4,
                parcel_count: 2,
                content_crc32: 0,
                path: None,
            }),
        );
        assert!(agg.digest_parcel(&p0, 1_000_000).unwrap().is_none());
        let p1 = parcel(1, b"cd", None);
        let done = agg.digest_parcel(&p1, 1_000_000).unwrap();
        assert_eq!(done, Some(b"abcd".to_vec()));
    }

    #[test]
    fn rejects_out_of_order() {
        let mut agg = ObjectAgglomerator::new(1);
        let p1 = parcel(1, b"cd", None);
        assert!(agg.digest_parcel(&p1, 1_000_000).is_err());
    }

    #[test]
    fn rejects_oversized_declaration() {
        let mut agg = ObjectAgglomerator::new(1);
        let p0 = parcel(
            0,
            b"ab",
            Some(ExtendedHeader {
                codec_method: 0,
                priority: Priority::Normal,
                transmission_size: 999,
                parcel_count: 1,
                content_crc32: 0,
                path: None,
            }),
        );
        assert!(matches!(
            agg.digest_parcel(&p0, 100),
            Err(TransportError::OversizedSerialization { .. })
        ));
    }
}
