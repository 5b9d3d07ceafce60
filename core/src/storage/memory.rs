//! Ordered in-memory store.

use super::payload::{StoreOp, decode_op, encode_op};
use super::{
    ApplyMode, Mutation, OrderedStore, RedoUndo, ScanRange, StoreOperation, StoreScan,
    StoreStatistics,
};
use crate::codec::{KeyComparator, lexicographic};
use crate::error::{StoreError, StoreResult};
use crate::types::{OpenMode, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Records per copy chunk.
const COPY_CHUNK_RECORDS: usize = 256;

/// Records per reported page.
const RECORDS_PER_PAGE: u64 = 64;

/// Key ordered by the store's comparator.
#[derive(Clone)]
struct OrdKey {
    bytes: Bytes,
    cmp: KeyComparator,
}

impl PartialEq for OrdKey {
    fn eq(&self, other: &Self) -> bool {
        Ord::cmp(self, other) == Ordering::Equal
    }
}

impl Eq for OrdKey {}

impl PartialOrd for OrdKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.bytes, &other.bytes)
    }
}

struct MemoryState {
    open: bool,
    records: BTreeMap<OrdKey, Bytes>,
    bytes_used: u64,
    last_committed: SequenceNumber,
    stable: SequenceNumber,
    checkpointed: SequenceNumber,
}

impl MemoryState {
    fn ensure_open(&self) -> StoreResult<()> {
        if self.open { Ok(()) } else { Err(StoreError::Closed) }
    }

    fn put(&mut self, key: OrdKey, value: Bytes) -> Option<Bytes> {
        let key_len = key.bytes.len() as u64;
        let value_len = value.len() as u64;
        let prior = self.records.insert(key, value);
        match &prior {
            Some(old) => self.bytes_used = self.bytes_used - old.len() as u64 + value_len,
            None => self.bytes_used += key_len + value_len,
        }
        prior
    }

    fn take(&mut self, key: &OrdKey) -> Option<Bytes> {
        let prior = self.records.remove(key);
        if let Some(old) = &prior {
            self.bytes_used -= (key.bytes.len() + old.len()) as u64;
        }
        prior
    }

    fn clear(&mut self) -> Vec<(Bytes, Bytes)> {
        self.bytes_used = 0;
        std::mem::take(&mut self.records)
            .into_iter()
            .map(|(k, v)| (k.bytes, v))
            .collect()
    }

    fn observe(&mut self, seq: SequenceNumber) {
        if seq > self.last_committed {
            self.last_committed = seq;
        }
    }
}

/// Ordered store kept entirely in memory.
///
/// Keys are ordered by the comparator given at construction. With a record
/// budget configured, growing past it fails with `ResourceExhausted`.
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    cmp: KeyComparator,
    max_records: Option<usize>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(lexicographic)
    }
}

impl MemoryStore {
    pub fn new(cmp: KeyComparator) -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                open: false,
                records: BTreeMap::new(),
                bytes_used: 0,
                last_committed: SequenceNumber::ZERO,
                stable: SequenceNumber::ZERO,
                checkpointed: SequenceNumber::ZERO,
            })),
            cmp,
            max_records: None,
        }
    }

    pub fn with_max_records(mut self, max_records: Option<usize>) -> Self {
        self.max_records = max_records;
        self
    }

    fn key(&self, bytes: &Bytes) -> OrdKey {
        OrdKey {
            bytes: bytes.clone(),
            cmp: self.cmp,
        }
    }

    fn ensure_room(&self, state: &MemoryState, key: &OrdKey) -> StoreResult<()> {
        match self.max_records {
            Some(max) if state.records.len() >= max && !state.records.contains_key(key) => {
                Err(StoreError::ResourceExhausted(format!(
                    "record budget of {max} reached"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Stable watermark last reported through `on_operation_stable`.
    pub fn stable_sequence_number(&self) -> SequenceNumber {
        self.state.read().stable
    }

    pub fn checkpointed_sequence_number(&self) -> SequenceNumber {
        self.state.read().checkpointed
    }

    /// Snapshot of every record in key order.
    pub fn records(&self) -> Vec<(Bytes, Bytes)> {
        self.state
            .read()
            .records
            .iter()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
            .collect()
    }

    fn redo_undo(redo: StoreOp, undo: StoreOp) -> StoreResult<Option<RedoUndo>> {
        Ok(Some(RedoUndo {
            redo: encode_op(&redo)?,
            undo: encode_op(&undo)?,
        }))
    }

    /// Undo that puts `key` back to `prior`.
    fn restore_op(key: &Bytes, prior: &Option<Bytes>) -> StoreOp {
        match prior {
            Some(old) => StoreOp::Update {
                key: key.clone(),
                value: old.clone(),
            },
            None => StoreOp::Delete { key: key.clone() },
        }
    }

    fn write(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let k = self.key(key);
        self.ensure_room(&state, &k)?;
        let prior = state.put(k, value.clone());
        state.observe(seq);
        let redo = match prior {
            Some(_) => StoreOp::Update {
                key: key.clone(),
                value: value.clone(),
            },
            None => StoreOp::Insert {
                key: key.clone(),
                value: value.clone(),
            },
        };
        let undo = Self::restore_op(key, &prior);
        Ok(Mutation {
            redo_undo: Self::redo_undo(redo, undo)?,
            prior,
        })
    }

    fn remove(&self, key: &Bytes, expected: Option<&Bytes>, seq: SequenceNumber) -> StoreResult<Mutation> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let k = self.key(key);
        let current = state.records.get(&k).cloned();
        let matches = match (&current, expected) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(cur), Some(exp)) => cur == exp,
        };
        if !matches {
            return Ok(Mutation::unchanged(current));
        }
        let prior = state.take(&k);
        state.observe(seq);
        let undo = match &prior {
            Some(old) => StoreOp::Insert {
                key: key.clone(),
                value: old.clone(),
            },
            None => StoreOp::Delete { key: key.clone() },
        };
        Ok(Mutation {
            redo_undo: Self::redo_undo(StoreOp::Delete { key: key.clone() }, undo)?,
            prior,
        })
    }
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn open(&self, mode: OpenMode) -> StoreResult<()> {
        let mut state = self.state.write();
        if mode == OpenMode::New {
            state.clear();
            state.last_committed = SequenceNumber::ZERO;
            state.stable = SequenceNumber::ZERO;
            state.checkpointed = SequenceNumber::ZERO;
        }
        state.open = true;
        tracing::debug!(?mode, records = state.records.len(), "memory store opened");
        Ok(())
    }

    async fn close(&self, erase: bool) -> StoreResult<()> {
        let mut state = self.state.write();
        if erase {
            state.clear();
        }
        state.open = false;
        Ok(())
    }

    fn abort(&self) {
        self.state.write().open = false;
    }

    async fn insert(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        {
            let state = self.state.read();
            state.ensure_open()?;
            if state.records.contains_key(&self.key(key)) {
                return Err(StoreError::DuplicateKey);
            }
        }
        self.write(key, value, seq)
    }

    async fn upsert(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        self.write(key, value, seq)
    }

    async fn update(&self, key: &Bytes, value: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        {
            let state = self.state.read();
            state.ensure_open()?;
            if !state.records.contains_key(&self.key(key)) {
                return Err(StoreError::KeyNotFound);
            }
        }
        self.write(key, value, seq)
    }

    async fn conditional_update(
        &self,
        key: &Bytes,
        value: &Bytes,
        expected: &Bytes,
        seq: SequenceNumber,
    ) -> StoreResult<Mutation> {
        {
            let state = self.state.read();
            state.ensure_open()?;
            match state.records.get(&self.key(key)) {
                Some(current) if current == expected => {}
                other => return Ok(Mutation::unchanged(other.cloned())),
            }
        }
        self.write(key, value, seq)
    }

    async fn delete(&self, key: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        self.remove(key, None, seq)
    }

    async fn conditional_delete(&self, key: &Bytes, expected: &Bytes, seq: SequenceNumber) -> StoreResult<Mutation> {
        self.remove(key, Some(expected), seq)
    }

    async fn seek(&self, key: &Bytes) -> StoreResult<Option<Bytes>> {
        let state = self.state.read();
        state.ensure_open()?;
        Ok(state.records.get(&self.key(key)).cloned())
    }

    async fn erase(&self, seq: SequenceNumber) -> StoreResult<Mutation> {
        let mut state = self.state.write();
        state.ensure_open()?;
        let records = state.clear();
        state.observe(seq);
        Ok(Mutation {
            prior: None,
            redo_undo: Self::redo_undo(StoreOp::Erase, StoreOp::Restore { records })?,
        })
    }

    async fn apply(&self, seq: SequenceNumber, payload: &Bytes, mode: ApplyMode) -> StoreResult<StoreOperation> {
        let op = decode_op(payload)?;
        let mut described = op.describe();
        if mode == ApplyMode::DecodeOnly {
            return Ok(described);
        }

        let mut state = self.state.write();
        state.ensure_open()?;
        described.prior = match op {
            StoreOp::Insert { key, value } | StoreOp::Update { key, value } => {
                let k = self.key(&key);
                self.ensure_room(&state, &k)?;
                state.put(k, value)
            }
            StoreOp::Delete { key } => state.take(&self.key(&key)),
            StoreOp::Erase => {
                state.clear();
                None
            }
            StoreOp::Restore { records } => {
                for (key, value) in records {
                    let k = self.key(&key);
                    state.put(k, value);
                }
                None
            }
        };
        state.observe(seq);
        Ok(described)
    }

    fn scan(&self, range: ScanRange) -> Box<dyn StoreScan> {
        Box::new(MemoryScan {
            state: Arc::clone(&self.state),
            cmp: self.cmp,
            range,
            last: None,
            done: false,
        })
    }

    async fn checkpoint(&self, seq: SequenceNumber) -> StoreResult<()> {
        let mut state = self.state.write();
        state.ensure_open()?;
        if seq > state.checkpointed {
            state.checkpointed = seq;
        }
        Ok(())
    }

    async fn on_operation_stable(&self, seq: SequenceNumber) -> StoreResult<SequenceNumber> {
        let mut state = self.state.write();
        if seq > state.stable {
            state.stable = seq;
        }
        Ok(state.stable)
    }

    fn copy_state(&self, up_to: SequenceNumber) -> StoreResult<Vec<Bytes>> {
        let state = self.state.read();
        state.ensure_open()?;
        tracing::debug!(%up_to, records = state.records.len(), "building copy state");
        let records: Vec<(Bytes, Bytes)> = state
            .records
            .iter()
            .map(|(k, v)| (k.bytes.clone(), v.clone()))
            .collect();
        records
            .chunks(COPY_CHUNK_RECORDS)
            .map(|chunk| {
                encode_op(&StoreOp::Restore {
                    records: chunk.to_vec(),
                })
            })
            .collect()
    }

    async fn apply_copy_data(&self, chunk: &Bytes) -> StoreResult<()> {
        let StoreOp::Restore { records } = decode_op(chunk)? else {
            return Err(StoreError::Serialization(
                "copy chunk does not carry records".into(),
            ));
        };
        let mut state = self.state.write();
        state.ensure_open()?;
        for (key, value) in records {
            let k = self.key(&key);
            self.ensure_room(&state, &k)?;
            state.put(k, value);
        }
        Ok(())
    }

    fn statistics(&self) -> StoreStatistics {
        let state = self.state.read();
        let record_count = state.records.len() as u64;
        StoreStatistics {
            record_count,
            page_count: record_count.div_ceil(RECORDS_PER_PAGE),
            memory_bytes: state.bytes_used,
            storage_bytes: 0,
        }
    }

    fn last_committed_sequence_number(&self) -> SequenceNumber {
        self.state.read().last_committed
    }
}

struct MemoryScan {
    state: Arc<RwLock<MemoryState>>,
    cmp: KeyComparator,
    range: ScanRange,
    last: Option<Bytes>,
    done: bool,
}

impl MemoryScan {
    fn lower_bound(&self) -> Bound<OrdKey> {
        let wrap = |bytes: &Bytes| OrdKey {
            bytes: bytes.clone(),
            cmp: self.cmp,
        };
        if let Some(last) = &self.last {
            return Bound::Excluded(wrap(last));
        }
        let from = match (&self.range.start, &self.range.prefix) {
            (Some(start), Some(prefix)) => {
                if (self.cmp)(start, prefix) == Ordering::Less {
                    Some(prefix)
                } else {
                    Some(start)
                }
            }
            (Some(start), None) => Some(start),
            (None, Some(prefix)) => Some(prefix),
            (None, None) => None,
        };
        match from {
            Some(b) => Bound::Included(wrap(b)),
            None => Bound::Unbounded,
        }
    }
}

#[async_trait]
impl StoreScan for MemoryScan {
    async fn next(&mut self) -> StoreResult<Option<(Bytes, Bytes)>> {
        if self.done {
            return Ok(None);
        }
        let found = {
            let state = self.state.read();
            state.ensure_open()?;
            let mut found = None;
            for (key, value) in state.records.range((self.lower_bound(), Bound::Unbounded)) {
                if let Some(end) = &self.range.end {
                    if (self.cmp)(&key.bytes, end) != Ordering::Less {
                        break;
                    }
                }
                if let Some(prefix) = &self.range.prefix {
                    if !key.bytes.starts_with(prefix) {
                        if (self.cmp)(&key.bytes, prefix) == Ordering::Greater {
                            break;
                        }
                        continue;
                    }
                }
                found = Some((key.bytes.clone(), value.clone()));
                break;
            }
            found
        };
        match &found {
            Some((key, _)) => self.last = Some(key.clone()),
            None => self.done = true,
        }
        Ok(found)
    }

    fn reset(&mut self) {
        self.last = None;
        self.done = false;
    }
}
