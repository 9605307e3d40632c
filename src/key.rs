//! Composite keys: a length-prefixed tenant prefix followed by the unprefixed key.
//!
//! ```text
//! +----------------+---------+----------------+
//! |prefix_len:u32  | prefix  | key            |
//! +----------------+---------+----------------+
//! ```
//!
//! Keys compare as raw bytes, so every key of one prefix is contiguous and a
//! prefix can be scanned with a single bounded range.

use crate::error::Result;
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

const LEN_SIZE: usize = 4;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompositeKey(Vec<u8>);

impl CompositeKey {
    pub fn new(prefix: &[u8], key: &[u8]) -> Self {
        let mut buf = Vec::with_capacity(LEN_SIZE + prefix.len() + key.len());
        buf.extend_from_slice(&(prefix.len() as u32).to_be_bytes());
        buf.extend_from_slice(prefix);
        buf.extend_from_slice(key);
        Self(buf)
    }

    /// Wraps raw composite bytes, validating the prefix length.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        if bytes.len() < LEN_SIZE {
            return Err(Error::Decode("composite key", "shorter than length".into()));
        }
        let prefix_len = BigEndian::read_u32(&bytes[..LEN_SIZE]) as usize;
        if bytes.len() < LEN_SIZE + prefix_len {
            return Err(Error::Decode(
                "composite key",
                format!("prefix length {} exceeds key size {}", prefix_len, bytes.len()),
            ));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    fn prefix_len(&self) -> usize {
        BigEndian::read_u32(&self.0[..LEN_SIZE]) as usize
    }

    pub fn prefix(&self) -> &[u8] {
        &self.0[LEN_SIZE..LEN_SIZE + self.prefix_len()]
    }

    pub fn key(&self) -> &[u8] {
        &self.0[LEN_SIZE + self.prefix_len()..]
    }

    /// The smallest key under `prefix`.
    pub fn prefix_start(prefix: &[u8]) -> Self {
        Self::new(prefix, &[])
    }

    /// Keys under one prefix are contiguous, starting at
    /// [`CompositeKey::prefix_start`]. No composite key bounds them from
    /// above exactly, so prefix scans stop at the first key failing this.
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.prefix() == prefix
    }
}

impl Borrow<[u8]> for CompositeKey {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            String::from_utf8_lossy(self.prefix()),
            String::from_utf8_lossy(self.key())
        )
    }
}
