// ABOUTME: Content-addressed hashes used to deduplicate and address queued work items.
// ABOUTME: Wraps a 32-byte BLAKE3 digest with hex formatting and parsing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors that can occur when reconstructing a hash from external input.
#[derive(Debug, Error)]
pub enum HashError {
    #[error("content hash must be {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },

    #[error("invalid hex content hash: {0}")]
    Hex(String),
}

/// A 32-byte BLAKE3 digest identifying a logical work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub const LEN: usize = 32;

    /// Hash arbitrary bytes.
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// Rebuild a hash from its raw stored bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, HashError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| HashError::Length {
            expected: Self::LEN,
            got: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, as used in URLs.
    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(|h| Self(*h.as_bytes()))
            .map_err(|e| HashError::Hex(e.to_string()))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Items that can be placed on a deduplicating queue. Two items with the same
/// hash are the same logical unit of work; the later payload replaces the
/// earlier one in place.
pub trait Hashed {
    fn content_hash(&self) -> ContentHash;
}
