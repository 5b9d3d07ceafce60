//! Key/value encoding strategies and key ordering.

use crate::error::{StoreError, StoreResult};
use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use std::cmp::Ordering;

/// Total order over encoded keys, supplied to the store at construction.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Plain byte-wise ordering.
pub fn lexicographic(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Encode/decode pair for one key or value type.
pub struct Codec<T> {
    pub encode: fn(&T) -> StoreResult<Bytes>,
    pub decode: fn(&[u8]) -> StoreResult<T>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Codec<T> {}

impl<T> Codec<T> {
    pub fn new(encode: fn(&T) -> StoreResult<Bytes>, decode: fn(&[u8]) -> StoreResult<T>) -> Self {
        Self { encode, decode }
    }

    pub fn encode(&self, value: &T) -> StoreResult<Bytes> {
        (self.encode)(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> StoreResult<T> {
        (self.decode)(bytes)
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> {
    /// bincode encoding. Byte order of the output does not follow the
    /// natural order of `T`, so do not use it for keys that are scanned.
    pub fn bincode() -> Self {
        Self {
            encode: |v| Ok(Bytes::from(bincode::serialize(v)?)),
            decode: |b| Ok(bincode::deserialize(b)?),
        }
    }
}

impl Codec<String> {
    pub fn utf8() -> Self {
        Self {
            encode: |s| Ok(Bytes::copy_from_slice(s.as_bytes())),
            decode: |b| {
                String::from_utf8(b.to_vec())
                    .map_err(|e| StoreError::Serialization(format!("invalid utf-8: {e}")))
            },
        }
    }
}

impl Codec<Bytes> {
    pub fn raw() -> Self {
        Self {
            encode: |b| Ok(b.clone()),
            decode: |b| Ok(Bytes::copy_from_slice(b)),
        }
    }
}

impl Codec<u64> {
    /// Big-endian, so byte order matches numeric order.
    pub fn ordered() -> Self {
        Self {
            encode: |v| Ok(Bytes::copy_from_slice(&v.to_be_bytes())),
            decode: |b| Ok(u64::from_be_bytes(fixed::<8>(b)?)),
        }
    }
}

impl Codec<i64> {
    /// Big-endian with the sign bit flipped, so byte order matches numeric order.
    pub fn ordered() -> Self {
        Self {
            encode: |v| Ok(Bytes::copy_from_slice(&((*v as u64) ^ (1 << 63)).to_be_bytes())),
            decode: |b| Ok((u64::from_be_bytes(fixed::<8>(b)?) ^ (1 << 63)) as i64),
        }
    }
}

fn fixed<const N: usize>(b: &[u8]) -> StoreResult<[u8; N]> {
    b.try_into().map_err(|_| {
        StoreError::Serialization(format!("expected {N} bytes, found {}", b.len()))
    })
}
