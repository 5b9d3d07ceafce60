//! Redo/undo payload framing.
//!
//! A payload is `crc32 (4 bytes LE) | bincode(StoreOp)`.

use super::{MutationKind, StoreOperation};
use crate::error::{StoreError, StoreResult};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Physical operation carried in a redo or undo payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreOp {
    Insert { key: Bytes, value: Bytes },
    Update { key: Bytes, value: Bytes },
    Delete { key: Bytes },
    Erase,
    Restore { records: Vec<(Bytes, Bytes)> },
}

impl StoreOp {
    pub fn kind(&self) -> MutationKind {
        match self {
            StoreOp::Insert { .. } => MutationKind::Insert,
            StoreOp::Update { .. } => MutationKind::Update,
            StoreOp::Delete { .. } => MutationKind::Delete,
            StoreOp::Erase => MutationKind::Erase,
            StoreOp::Restore { .. } => MutationKind::Restore,
        }
    }

    pub(crate) fn describe(&self) -> StoreOperation {
        let (key, value) = match self {
            StoreOp::Insert { key, value } | StoreOp::Update { key, value } => {
                (Some(key.clone()), Some(value.clone()))
            }
            StoreOp::Delete { key } => (Some(key.clone()), None),
            StoreOp::Erase | StoreOp::Restore { .. } => (None, None),
        };
        StoreOperation {
            kind: self.kind(),
            key,
            value,
            prior: None,
        }
    }
}

pub fn encode_op(op: &StoreOp) -> StoreResult<Bytes> {
    let body = bincode::serialize(op)?;
    let mut buf = BytesMut::with_capacity(body.len() + 4);
    buf.put_u32_le(crc32fast::hash(&body));
    buf.put_slice(&body);
    Ok(buf.freeze())
}

pub fn decode_op(payload: &[u8]) -> StoreResult<StoreOp> {
    if payload.len() < 4 {
        return Err(StoreError::Serialization(format!(
            "payload too short: {} bytes",
            payload.len()
        )));
    }
    let (crc, body) = payload.split_at(4);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(StoreError::Serialization(format!(
            "payload checksum mismatch: expected {expected:08x}, found {actual:08x}"
        )));
    }
    Ok(bincode::deserialize(body)?)
}
