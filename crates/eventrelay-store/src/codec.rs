// ABOUTME: Payload serialization (JSON, optionally LZ4-compressed) and big-endian serial keys.
// ABOUTME: Also recovers the monotonic record counter from the highest key found on disk.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Width of an encoded serial key.
pub const SERIAL_LEN: usize = 8;

/// Errors that can occur while encoding or decoding stored payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("decompression error: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),

    #[error("serial key must be {SERIAL_LEN} bytes, got {0}")]
    SerialLength(usize),
}

/// Turns values into stored bytes and back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    compression: bool,
}

impl Codec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }

    pub fn compressed() -> Self {
        Self::new(true)
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        let json = serde_json::to_vec(value)?;
        if self.compression {
            Ok(lz4_flex::compress_prepend_size(&json))
        } else {
            Ok(json)
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        if self.compression {
            let json = lz4_flex::decompress_size_prepended(bytes)?;
            Ok(serde_json::from_slice(&json)?)
        } else {
            Ok(serde_json::from_slice(bytes)?)
        }
    }
}

pub fn encode_serial(serial: u64) -> [u8; SERIAL_LEN] {
    serial.to_be_bytes()
}

pub fn decode_serial(bytes: &[u8]) -> Result<u64, CodecError> {
    let raw: [u8; SERIAL_LEN] = bytes
        .try_into()
        .map_err(|_| CodecError::SerialLength(bytes.len()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Monotonic serial generator for one ordered table.
///
/// Only ever advanced while the owning store holds its writer lock, so the
/// atomic is for interior mutability rather than contention.
#[derive(Debug)]
pub struct Sequence {
    next: AtomicU64,
}

impl Sequence {
    /// Continue after the highest key already stored, or start at 1.
    pub fn starting_after(last_key: Option<&[u8]>) -> Result<Self, CodecError> {
        let next = match last_key {
            Some(key) => decode_serial(key)?.saturating_add(1),
            None => 1,
        };
        Ok(Self {
            next: AtomicU64::new(next),
        })
    }

    /// Hand out the next serial.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Serial that the next call to `next` will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn compressed_payload_decodes() {
        let codec = Codec::compressed();
        let doc = json!({"status": "New", "comment": ["a", "b"]});
        let bytes = codec.encode(&doc).unwrap();
        assert_ne!(bytes, serde_json::to_vec(&doc).unwrap());
        let back: Value = codec.decode(&bytes).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn plain_payload_is_json() {
        let codec = Codec::default();
        let bytes = codec.encode(&json!({"a": 1})).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#);
    }

    #[test]
    fn garbage_fails_to_decode() {
        let codec = Codec::compressed();
        let result: Result<Value, _> = codec.decode(b"\x05\x00\x00\x00zz");
        assert!(result.is_err());
    }

    #[test]
    fn serial_keys_sort_numerically() {
        let mut keys: Vec<_> = [300u64, 2, 70_000, 1].iter().map(|s| encode_serial(*s)).collect();
        keys.sort();
        let serials: Vec<u64> = keys.iter().map(|k| decode_serial(k).unwrap()).collect();
        assert_eq!(serials, vec![1, 2, 300, 70_000]);
    }

    #[test]
    fn sequence_recovers_from_last_key() {
        let seq = Sequence::starting_after(None).unwrap();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);

        let last = encode_serial(41);
        let seq = Sequence::starting_after(Some(&last[..])).unwrap();
        assert_eq!(seq.peek(), 42);
        assert_eq!(seq.next(), 42);

        assert!(Sequence::starting_after(Some(&b"short"[..])).is_err());
    }
}
