//! Lazy send-side splitter for a single application object (spec.md §4.3
//! "ObjectSendSeparation").
//!
//! The object is handed over once; nothing is serialized until the first
//! call to [`ObjectSendSeparation::next_parcel`], at which point it is
//! encoded through the connection's send-side [`CodecRegistry`] slot and
//! sliced into `transmissionParcelSize`-sized chunks.

use std::any::Any;
use std::sync::Arc;

use crate::codec::CodecRegistry;
use crate::error::{Result, TransportError};
use crate::wire::parcel::{Channel, ExtendedHeader, Parcel, Priority};

pub struct ObjectSendSeparation {
    object_id: i64,
    priority: Priority,
    codec_method: u8,
    class_id: String,
    object: Arc<dyn Any + Send + Sync>,
    encoded: Option<Vec<u8>>,
    content_crc32: u32,
    parcel_count: i64,
    next_seq: i32,
}

impl ObjectSendSeparation {
    pub fn new(
        object_id: i64,
        priority: Priority,
        codec_method: u8,
        class_id: impl Into<String>,
        object: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            object_id,
            priority,
            codec_method,
            class_id: class_id.into(),
            object,
            encoded: None,
            content_crc32: 0,
            parcel_count: 0,
            next_seq: 0,
        }
    }

    pub fn object_id(&self) -> i64 {
        self.object_id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// True once every parcel has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.encoded.is_some() && self.next_seq as i64 >= self.parcel_count
    }

    fn ensure_encoded(
        &mut self,
        registry: &CodecRegistry,
        max_serialisation_size: u64,
    ) -> Result<()> {
        if self.encoded.is_some() {
            return Ok(());
        }
        let bytes = registry.serialize(&self.class_id, self.codec_method, self.object.as_ref())?;
        if bytes.len() as u64 > max_serialisation_size {
            return Err(TransportError::OversizedSerialization {
                size: bytes.len() as u64,
                max: max_serialisation_size,
            });
        }
        self.content_crc32 = crc32fast::hash(&bytes);
        self.encoded = Some(bytes);
        Ok(())
    }

    /// Produce the next parcel, encoding the object on first call. Returns
    /// `Ok(None)` once every parcel has already been returned.
    pub fn next_parcel(
        &mut self,
        registry: &CodecRegistry,
        transmission_parcel_size: u32,
        max_serialisation_size: u64,
    ) -> Result<Option<Parcel>> {
        self.ensure_encoded(registry, max_serialisation_size)?;
        let bytes = self.encoded.as_ref().expect("encoded on ensure_encoded");

        if self.parcel_count == 0 {
            let parcel_size = transmission_parcel_size.max(1) as u64;
            self.parcel_count =
                ((bytes.len() as u64 + parcel_size - 1) / parcel_size).max(1) as i64;
        }

        if self.next_seq as i64 >= self.parcel_count {
            return Ok(None);
        }

        let start = self.next_seq as usize * transmission_parcel_size as usize;
        let end = (start + transmission_parcel_size as usize).min(bytes.len());
        let payload = bytes[start..end].to_vec();
        let seq = self.next_seq;
        self.next_seq += 1;

        let extended = if seq == 0 {
            Some(ExtendedHeader {
                codec_method: self.codec_method,
                priority: self.priority,
                transmission_size: bytes.len() as i64,
                parcel_count: self.parcel_count,
                content_crc32: self.content_crc32,
                path: None,
            })
        } else {
            None
        };

        Ok(Some(Parcel {
            channel: Channel::Object,
            priority: self.priority,
            object_id: self.object_id,
            sequence_nr: seq,
            payload,
            extended,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        text: String,
    }

    #[test]
    fn splits_into_expected_parcel_count() {
        let registry = crate::codec::GLOBAL_REGISTRY.deep_clone();
        registry.register::<Sample>("sample");
        let obj = Arc::new(Sample { text: "x".repeat(25) });
        let mut sep = ObjectSendSeparation::new(1, Priority::Normal, 0, "sample", obj);

        let mut parcels = Vec::new();
        while let Some(p) = sep.next_parcel(&registry, 10, 1_000_000).unwrap() {
            parcels.push(p);
        }
        assert!(parcels.len() >= 3);
        assert_eq!(parcels[0].sequence_nr, 0);
        assert!(parcels[0].extended.is_some());
        assert!(parcels[1].extended.is_none());
        assert!(sep.is_exhausted());
    }

    #[test]
    fn rejects_oversized_object() {
        let registry = crate::codec::GLOBAL_REGISTRY.deep_clone();
        registry.register::<Sample>("sample");
        let obj = Arc::new(Sample { text: "y".repeat(100) });
        let mut sep = ObjectSendSeparation::new(2, Priority::Normal, 0, "sample", obj);
        let err = sep.next_parcel(&registry, 10, 16);
        assert!(matches!(err, Err(TransportError::OversizedSerialization { .. })));
    }

    #[test]
    fn reencodes_only_once() {
        let registry = crate::codec::GLOBAL_REGISTRY.deep_clone();
        registry.register::<Sample>("sample");
        let obj = Arc::new(Sample { text: "z".repeat(5) });
        let mut sep = ObjectSendSeparation::new(3, Priority::Normal, 0, "sample", obj);
        sep.next_parcel(&registry, 1024, 1_000_000).unwrap();
        let count_before = sep.parcel_count;
        sep.next_parcel(&registry, 1024, 1_000_000).unwrap();
        assert_eq!(sep.parcel_count, count_before);
    }
}
