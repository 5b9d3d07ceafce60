//! Ordered storage contract consumed by the provider.
//!
//! The provider never touches records directly. Every mutation goes through
//! [`OrderedStore`], which applies it under a sequence number and hands back
//! the prior value plus the redo/undo payloads that get replicated.

mod memory;
mod payload;

pub use memory::MemoryStore;
pub use payload::{StoreOp, decode_op, encode_op};

use crate::error::StoreResult;
use crate::types::{OpenMode, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Redo and undo payloads of one applied mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedoUndo {
    pub redo: Bytes,
    pub undo: Bytes,
}

/// Result of a storage primitive.
///
/// `redo_undo` is `None` when nothing changed (conditional mismatch, delete
/// of an absent key). Redo and undo are therefore present together or not at all.
#[derive(Debug, Clone, Default)]
pub struct Mutation {
    pub prior: Option<Bytes>,
    pub redo_undo: Option<RedoUndo>,
}

impl Mutation {
    pub fn unchanged(prior: Option<Bytes>) -> Self {
        Self {
            prior,
            redo_undo: None,
        }
    }

    pub fn applied(&self) -> bool {
        self.redo_undo.is_some()
    }
}

/// How a replicated payload is handed to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Decode the payload without touching records.
    DecodeOnly,
    Apply,
}

/// Logical shape of a storage payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
    Erase,
    /// Reinstates every record removed by an erase.
    Restore,
}

/// A payload decoded, and possibly applied, by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOperation {
    pub kind: MutationKind,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    /// Value replaced or removed; only known in [`ApplyMode::Apply`].
    pub prior: Option<Bytes>,
}

/// Bounds of a scan. `end` is exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Option<Bytes>,
    pub end: Option<Bytes>,
    pub prefix: Option<Bytes>,
}

/// Store statistics used for load reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStatistics {
    pub record_count: u64,
    pub page_count: u64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
}

/// Live cursor over a key range.
///
/// Each step observes the store as it is at that moment; consistency is the
/// caller's business.
#[async_trait]
pub trait StoreScan: Send {
    async fn next(&mut self) -> StoreResult<Option<(Bytes, Bytes)>>;

    /// Restart from the beginning of the range.
    fn reset(&mut self);
}

/// Ordered key-value storage with redo/undo generation.
#[async_trait]
pub trait OrderedStore: Send + Sync {
    async fn open(&self, mode: OpenMode) -> StoreResult<()>;

    async fn close(&self, erase: bool) -> StoreResult<()>;

    fn abort(&self);

    /// Fails with `DuplicateKey` if the key exists.
    async fn insert(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation>;

    /// Insert or overwrite; `prior` holds the overwritten value.
    async fn upsert(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation>;

    /// Fails with `KeyNotFound` if the key is absent.
    async fn update(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation>;

    /// Overwrites only when the current value equals `expected`.
    async fn conditional_update(
        &self,
        key: &Bytes,
        value: &Bytes,
        expected: &Bytes,
        seq: SequenceNumber,
    ) -> StoreResult<Mutation>;

    async fn delete(&self, key: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation>;

    /// Deletes only when the current value equals `expected`.
    async fn conditional_delete(&self, key: &Bytes, expected: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation>;

    async fn seek(&self, key: &Bytes) -> StoreResult<Option<Bytes>>;

    /// Removes every record as one mutation.
    async fn erase(&self, seq: SequenceNumber) -> StoreResult<Mutation>;

    /// Decode a redo or undo payload and, in [`ApplyMode::Apply`], apply it.
    async fn apply(&self, seq: SequenceNumber, payload: &Bytes, mode: ApplyMode) -> StoreResult<StoreOperation>;

    fn scan(&self, range: ScanRange) -> Box<dyn StoreScan>;

    async fn checkpoint(&self, seq: SequenceNumber) -> StoreResult<()>;

    /// Returns the new stable watermark.
    async fn on_operation_stable(&self, seq: SequenceNumber) -> StoreResult<SequenceNumber>;

    /// Chunks that rebuild the store's records on another replica.
    fn copy_state(&self, up_to: SequenceNumber) -> StoreResult<Vec<Bytes>>;

    async fn apply_copy_data(&self, chunk: &Bytes) -> StoreResult<()>;

    fn statistics(&self) -> StoreStatistics;

    fn last_committed_sequence_number(&self) -> SequenceNumber;
}
