//! Codec registry (spec.md §4.2).
//!
//! Two object codecs are mandatory: method `0` is "reflective" (JSON via
//! `serde_json`, grounded in the teacher's `ProtocolHandler::serialize_message`)
//! and method `1` is "compact binary" (`postcard`, which the teacher's own
//! `Cargo.toml` tags `# Compact binary format`). A third slot, method `2`, is
//! reserved for a user-supplied codec and is never populated by default.
//!
//! The wire frame (spec.md §4.1) carries only a `codecMethod` byte, no class
//! identifier, so each codec wraps its payload in a small self-describing
//! envelope (`class_id` + inner bytes) to let the receive side route to the
//! right registered adapter.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TransportError};

pub const METHOD_REFLECTIVE: u8 = 0;
pub const METHOD_COMPACT: u8 = 1;
pub const METHOD_RESERVED: u8 = 2;

type EncodeFn = fn(&(dyn Any + Send + Sync), u8) -> Result<Vec<u8>>;
type DecodeFn = fn(&[u8], u8) -> Result<Box<dyn Any + Send + Sync>>;

#[derive(Clone, Copy)]
struct ClassAdapter {
    encode: EncodeFn,
    decode: DecodeFn,
}

fn encode_with<T>(obj: &(dyn Any + Send + Sync), method: u8) -> Result<Vec<u8>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let value = obj
        .downcast_ref::<T>()
        .ok_or_else(|| TransportError::Corrupt("registered type mismatch on encode".into()))?;
    match method {
        METHOD_REFLECTIVE => {
            serde_json::to_vec(value).map_err(|e| TransportError::Corrupt(e.to_string()))
        }
        METHOD_COMPACT => {
            postcard::to_allocvec(value).map_err(|e| TransportError::Corrupt(e.to_string()))
        }
        other => Err(TransportError::Unregistered(other)),
    }
}

fn decode_with<T>(bytes: &[u8], method: u8) -> Result<Box<dyn Any + Send + Sync>>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    let value: T = match method {
        METHOD_REFLECTIVE => {
            serde_json::from_slice(bytes).map_err(|e| TransportError::Corrupt(e.to_string()))?
        }
        METHOD_COMPACT => {
            postcard::from_bytes(bytes).map_err(|e| TransportError::Corrupt(e.to_string()))?
        }
        other => return Err(TransportError::Unregistered(other)),
    };
    Ok(Box::new(value))
}

fn write_envelope(class_id: &str, inner: &[u8]) -> Vec<u8> {
    let id_bytes = class_id.as_bytes();
    let mut out = Vec::with_capacity(2 + id_bytes.len() + inner.len());
    out.extend_from_slice(&(id_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(id_bytes);
    out.extend_from_slice(inner);
    out
}

fn read_envelope(bytes: &[u8]) -> Result<(&str, &[u8])> {
    if bytes.len() < 2 {
        return Err(TransportError::Corrupt("envelope truncated".into()));
    }
    let id_len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let rest = &bytes[2..];
    if rest.len() < id_len {
        return Err(TransportError::Corrupt("envelope class id truncated".into()));
    }
    let class_id = std::str::from_utf8(&rest[..id_len])
        .map_err(|e| TransportError::Corrupt(format!("invalid class id utf8: {e}")))?;
    Ok((class_id, &rest[id_len..]))
}

/// One direction's (send or receive) view of the registry: independent
/// registrations and independent per-method enable flags, per spec.md §4.2
/// ("slots are deep-copied from global prototypes on first use and carry
/// independent registrations").
#[derive(Clone)]
pub struct CodecRegistry {
    classes: Arc<RwLock<HashMap<String, ClassAdapter>>>,
    method_enabled: Arc<[AtomicBool; 3]>,
}

impl CodecRegistry {
    fn new() -> Self {
        Self {
            classes: Arc::new(RwLock::new(HashMap::new())),
            method_enabled: Arc::new([
                AtomicBool::new(true),
                AtomicBool::new(true),
                AtomicBool::new(false),
            ]),
        }
    }

    /// Deep-copy this registry into an independent instance (used to create
    /// the per-connection send/receive slots from the global prototype).
    pub fn deep_clone(&self) -> Self {
        let classes = self.classes.read().unwrap().clone();
        let enabled = [
            AtomicBool::new(self.method_enabled[0].load(Ordering::SeqCst)),
            AtomicBool::new(self.method_enabled[1].load(Ordering::SeqCst)),
            AtomicBool::new(self.method_enabled[2].load(Ordering::SeqCst)),
        ];
        Self {
            classes: Arc::new(RwLock::new(classes)),
            method_enabled: Arc::new(enabled),
        }
    }

    pub fn register<T>(&self, class_id: &str) -> bool
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let mut classes = self.classes.write().unwrap();
        if classes.contains_key(class_id) {
            return false;
        }
        classes.insert(
            class_id.to_string(),
            ClassAdapter {
                encode: encode_with::<T>,
                decode: decode_with::<T>,
            },
        );
        true
    }

    pub fn is_registered(&self, class_id: &str) -> bool {
        self.classes.read().unwrap().contains_key(class_id)
    }

    pub fn set_method_enabled(&self, method: u8, enabled: bool) {
        if let Some(flag) = self.method_enabled.get(method as usize) {
            flag.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn is_method_enabled(&self, method: u8) -> bool {
        self.method_enabled
            .get(method as usize)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Serialize `object` (registered under `class_id`) using `method`,
    /// producing the full envelope bytes that become the parcel payload.
    pub fn serialize(
        &self,
        class_id: &str,
        method: u8,
        object: &(dyn Any + Send + Sync),
    ) -> Result<Vec<u8>> {
        if !self.is_method_enabled(method) {
            return Err(TransportError::Unregistered(method));
        }
        let adapter = {
            let classes = self.classes.read().unwrap();
            *classes
                .get(class_id)
                .ok_or_else(|| TransportError::UnknownClass(class_id.to_string()))?
        };
        let inner = (adapter.encode)(object, method)?;
        Ok(write_envelope(class_id, &inner))
    }

    /// Deserialize a full envelope payload using `method`.
    pub fn deserialize(&self, method: u8, bytes: &[u8]) -> Result<Box<dyn Any + Send + Sync>> {
        if !self.is_method_enabled(method) {
            return Err(TransportError::Unregistered(method));
        }
        let (class_id, inner) = read_envelope(bytes)?;
        let adapter = {
            let classes = self.classes.read().unwrap();
            *classes
                .get(class_id)
                .ok_or_else(|| TransportError::UnknownClass(class_id.to_string()))?
        };
        (adapter.decode)(inner, method)
    }
}

/// Process-wide prototype registry; new connections deep-copy this for their
/// send and receive slots (spec.md §9 "two per-role singletons").
pub static GLOBAL_REGISTRY: Lazy<CodecRegistry> = Lazy::new(CodecRegistry::new);

/// Register a type globally so every future connection's slots inherit it.
pub fn register_global<T>(class_id: &str) -> bool
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    GLOBAL_REGISTRY.register::<T>(class_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn round_trips_both_methods() {
        let reg = CodecRegistry::new();
        reg.register::<Sample>("sample");
        let value = Sample { a: 9, b: "hi".into() };

        for method in [METHOD_REFLECTIVE, METHOD_COMPACT] {
            let bytes = reg
                .serialize("sample", method, &value as &(dyn Any + Send + Sync))
                .unwrap();
            let decoded = reg.deserialize(method, &bytes).unwrap();
            let decoded: &Sample = decoded.downcast_ref().unwrap();
            assert_eq!(decoded, &value);
        }
    }

    #[test]
    fn unknown_class_fails() {
        let reg = CodecRegistry::new();
        let err = reg.deserialize(METHOD_REFLECTIVE, &write_envelope("nope", b"{}"));
        assert!(matches!(err, Err(TransportError::UnknownClass(_))));
    }

    #[test]
    fn disabled_method_fails() {
        let reg = CodecRegistry::new();
        reg.register::<Sample>("sample");
        reg.set_method_enabled(METHOD_COMPACT, false);
        let value = Sample { a: 1, b: "x".into() };
        let err = reg.serialize("sample", METHOD_COMPACT, &value as &(dyn Any + Send + Sync));
        assert!(matches!(err, Err(TransportError::Unregistered(_))));
    }

    #[test]
    fn deep_clone_is_independent() {
        let reg = CodecRegistry::new();
        reg.register::<Sample>("sample");
        let clone = reg.deep_clone();
        clone.set_method_enabled(METHOD_COMPACT, false);
        assert!(reg.is_method_enabled(METHOD_COMPACT));
        assert!(!clone.is_method_enabled(METHOD_COMPACT));
        assert!(clone.is_registered("sample"));
    }
}
