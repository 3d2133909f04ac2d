//! Control signals carried on the SIGNAL channel (spec.md §4.9).
//!
//! `sequenceNr` encodes the signal type; the payload (when present) is an
//! `int32 info` optionally followed by UTF-8 text.

use crate::error::{Result, TransportError};

pub const SEQ_ALIVE_REQUEST: i32 = 0;
pub const SEQ_ALIVE_CONFIRM: i32 = 1;
pub const SEQ_ALIVE: i32 = 2;
pub const SEQ_PING: i32 = 3;
pub const SEQ_ECHO: i32 = 4;
pub const SEQ_BREAK: i32 = 5;
pub const SEQ_CONFIRM: i32 = 6;
pub const SEQ_FAIL: i32 = 7;
pub const SEQ_SHUTDOWN: i32 = 8;
pub const SEQ_CLOSED: i32 = 9;
pub const SEQ_TEMPO: i32 = 10;

#[derive(Debug, Clone)]
pub enum Signal {
    AliveRequest { period_ms: i32 },
    AliveConfirm { period_ms: i32 },
    Alive,
    Ping,
    Echo,
    Break { subtype: i32 },
    Confirm,
    Fail { info: i32 },
    Shutdown { info: i32 },
    Closed { info: i32 },
    Tempo { bytes_per_sec: i64 },
}

impl Signal {
    pub fn sequence_nr(&self) -> i32 {
        match self {
            Signal::AliveRequest { .. } => SEQ_ALIVE_REQUEST,
            Signal::AliveConfirm { .. } => SEQ_ALIVE_CONFIRM,
            Signal::Alive => SEQ_ALIVE,
            Signal::Ping => SEQ_PING,
            Signal::Echo => SEQ_ECHO,
            Signal::Break { .. } => SEQ_BREAK,
            Signal::Confirm => SEQ_CONFIRM,
            Signal::Fail { .. } => SEQ_FAIL,
            Signal::Shutdown { .. } => SEQ_SHUTDOWN,
            Signal::Closed { .. } => SEQ_CLOSED,
            Signal::Tempo { .. } => SEQ_TEMPO,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Signal::AliveRequest { period_ms } => period_ms.to_be_bytes().to_vec(),
            Signal::AliveConfirm { period_ms } => period_ms.to_be_bytes().to_vec(),
            Signal::Alive | Signal::Ping | Signal::Echo | Signal::Confirm => Vec::new(),
            Signal::Break { subtype } => subtype.to_be_bytes().to_vec(),
            Signal::Fail { info } => info.to_be_bytes().to_vec(),
            Signal::Shutdown { info } => info.to_be_bytes().to_vec(),
            Signal::Closed { info } => info.to_be_bytes().to_vec(),
            Signal::Tempo { bytes_per_sec } => bytes_per_sec.to_be_bytes().to_vec(),
        }
    }

    fn read_i32(payload: &[u8]) -> Result<i32> {
        if payload.len() < 4 {
            return Err(TransportError::BadParcel("signal payload too short".into()));
        }
        Ok(i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]))
    }

    pub fn decode(sequence_nr: i32, payload: &[u8]) -> Result<Self> {
        Ok(match sequence_nr {
            SEQ_ALIVE_REQUEST => Signal::AliveRequest { period_ms: Self::read_i32(payload)? },
            SEQ_ALIVE_CONFIRM => Signal::AliveConfirm { period_ms: Self::read_i32(payload)? },
            SEQ_ALIVE => Signal::Alive,
            SEQ_PING => Signal::Ping,
            SEQ_ECHO => Signal::Echo,
            SEQ_BREAK => Signal::Break { subtype: Self::read_i32(payload)? },
            SEQ_CONFIRM => Signal::Confirm,
            SEQ_FAIL => Signal::Fail { info: Self::read_i32(payload)? },
            SEQ_SHUTDOWN => Signal::Shutdown { info: Self::read_i32(payload)? },
            SEQ_CLOSED => Signal::Closed { info: Self::read_i32(payload)? },
            SEQ_TEMPO => Signal::Tempo {
                bytes_per_sec: {
                    if payload.len() < 8 {
                        return Err(TransportError::BadParcel("tempo payload too short".into()));
                    }
                    i64::from_be_bytes(payload[0..8].try_into().unwrap())
                },
            },
            other => return Err(TransportError::BadParcel(format!("unknown signal seq {other}"))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_variant() {
        let signals = vec![
            Signal::AliveRequest { period_ms: 5000 },
            Signal::AliveConfirm { period_ms: 2500 },
            Signal::Alive,
            Signal::Ping,
            Signal::Echo,
            Signal::Break { subtype: 2 },
            Signal::Confirm,
            Signal::Fail { info: 6 },
            Signal::Shutdown { info: 1 },
            Signal::Closed { info: 2 },
            Signal::Tempo { bytes_per_sec: -1 },
        ];
        for s in signals {
            let seq = s.sequence_nr();
            let payload = s.encode_payload();
            let decoded = Signal::decode(seq, &payload).unwrap();
            assert_eq!(decoded.sequence_nr(), seq);
        }
    }
}
