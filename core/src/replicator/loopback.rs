//! In-process replicator.
//!
//! Assigns sequence numbers and group ids, appends every replicated entry to a
//! [`ReplicationLog`], and serves that log back as replication and recovery
//! streams for other replicas.

use super::{AtomicGroupReplicator, EntryStream, ReplicationLog, entry_stream};
use crate::error::{ReplicationError, StoreResult};
use crate::record::{LogEntry, ReplicationRecord};
use crate::types::{GroupId, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Call site a test fault is injected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPoint {
    Reserve,
    Replicate,
    CreateGroup,
    CommitGroup,
    RollbackGroup,
}

struct LoopbackState {
    log: ReplicationLog,
    next_seq: u64,
    next_group: i64,
    reserved: BTreeSet<SequenceNumber>,
    /// Undo payloads of groups still open, in replication order.
    open_groups: HashMap<GroupId, Vec<(SequenceNumber, Bytes)>>,
}

impl LoopbackState {
    fn assign(&mut self) -> SequenceNumber {
        let seq = SequenceNumber(self.next_seq);
        self.next_seq += 1;
        seq
    }

    fn append(&mut self, entry: LogEntry) -> Result<(), ReplicationError> {
        self.log.append(entry).map_err(|e| {
            tracing::error!(error = %e, "replication log append failed");
            ReplicationError::Closed
        })
    }
}

/// Groups created in `entries` but never committed, rolled back, or aborted.
fn open_groups(entries: &[LogEntry]) -> HashMap<GroupId, Vec<(SequenceNumber, Bytes)>> {
    let mut open = HashMap::new();
    for entry in entries {
        match entry {
            LogEntry::CreateAtomicGroup { group, .. } => {
                open.insert(*group, Vec::new());
            }
            LogEntry::Redo {
                group,
                sequence_number,
                undo,
                ..
            } => {
                if let Some(undos) = open.get_mut(group) {
                    undos.push((*sequence_number, undo.clone()));
                }
            }
            LogEntry::CommitAtomicGroup { group, .. }
            | LogEntry::RollbackAtomicGroup { group, .. }
            | LogEntry::AbortAtomicGroup { group, .. } => {
                open.remove(group);
            }
            _ => {}
        }
    }
    open
}

pub struct LoopbackReplicator {
    state: Mutex<LoopbackState>,
    primary: AtomicBool,
    faults: Mutex<VecDeque<(FaultPoint, ReplicationError)>>,
    delay: Mutex<Duration>,
}

impl Default for LoopbackReplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackReplicator {
    pub fn new() -> Self {
        Self::with_log(ReplicationLog::in_memory())
    }

    /// Continue numbering after whatever `log` already holds.
    pub fn with_log(log: ReplicationLog) -> Self {
        let next_seq = log
            .entries()
            .iter()
            .filter_map(LogEntry::sequence_number)
            .max()
            .map_or(1, |s| s.0 + 1);
        let next_group = log
            .entries()
            .iter()
            .filter_map(|e| match e {
                LogEntry::CreateAtomicGroup { group, .. } => Some(group.0),
                _ => None,
            })
            .max()
            .map_or(1, |g| g + 1);
        let open_groups = open_groups(log.entries());
        Self {
            state: Mutex::new(LoopbackState {
                log,
                next_seq,
                next_group,
                reserved: BTreeSet::new(),
                open_groups,
            }),
            primary: AtomicBool::new(true),
            faults: Mutex::new(VecDeque::new()),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    pub fn open<P: AsRef<std::path::Path>>(path: P) -> StoreResult<Self> {
        Ok(Self::with_log(ReplicationLog::open(path)?))
    }

    pub fn set_primary(&self, primary: bool) {
        self.primary.store(primary, Ordering::SeqCst);
    }

    /// Fail the next call at `point` with `error`. Faults queue up in order.
    pub fn inject_fault(&self, point: FaultPoint, error: ReplicationError) {
        self.faults.lock().push_back((point, error));
    }

    /// Hold every `replicate` call for `delay` before it lands in the log.
    pub fn set_replication_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    fn check(&self, point: FaultPoint, cancel: &CancellationToken) -> Result<(), ReplicationError> {
        if cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }
        {
            let mut faults = self.faults.lock();
            if let Some(pos) = faults.iter().position(|(p, _)| *p == point) {
                if let Some((_, error)) = faults.remove(pos) {
                    return Err(error);
                }
            }
        }
        if !self.primary.load(Ordering::SeqCst) {
            return Err(ReplicationError::NotPrimary);
        }
        Ok(())
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.entries().to_vec()
    }

    /// Highest sequence number below every outstanding reservation.
    pub fn stable_watermark(&self) -> SequenceNumber {
        let state = self.state.lock();
        let bound = state
            .reserved
            .iter()
            .next()
            .map_or(state.next_seq, |s| s.0);
        SequenceNumber(bound.saturating_sub(1))
    }

    pub fn outstanding_reservations(&self) -> usize {
        self.state.lock().reserved.len()
    }

    /// Everything replicated so far, as a secondary would receive it.
    pub fn replication_stream(&self) -> EntryStream {
        let mut entries = self.entries();
        entries.push(LogEntry::EndOfStream);
        entry_stream(entries)
    }

    /// The log as a restarting replica replays it: a redo pass over every
    /// entry, then an undo pass that aborts groups left open.
    pub fn recovery_stream(&self) -> EntryStream {
        let state = self.state.lock();
        let mut entries = state.log.entries().to_vec();
        entries.push(LogEntry::RedoPassComplete);

        let mut open: Vec<_> = state.open_groups.iter().collect();
        open.sort_by_key(|(group, _)| **group);
        for (group, undos) in open {
            for (seq, payload) in undos.iter().rev() {
                entries.push(LogEntry::Undo {
                    group: *group,
                    sequence_number: *seq,
                    payload: payload.clone(),
                });
            }
            let last = undos
                .last()
                .map_or(SequenceNumber(state.next_seq.saturating_sub(1)), |(s, _)| *s);
            entries.push(LogEntry::AbortAtomicGroup {
                group: *group,
                sequence_number: last,
            });
        }
        entries.push(LogEntry::UndoPassComplete);
        entries.push(LogEntry::EndOfStream);
        entry_stream(entries)
    }

    /// Log the undo pass of [`recovery_stream`](Self::recovery_stream) once a
    /// replica has applied it. The groups it aborted stay closed on every
    /// later restart. Returns how many groups were closed.
    pub fn complete_recovery(&self) -> Result<usize, ReplicationError> {
        let mut state = self.state.lock();
        let mut open: Vec<_> = std::mem::take(&mut state.open_groups).into_iter().collect();
        open.sort_by_key(|(group, _)| *group);
        for (group, undos) in &open {
            for (_, payload) in undos.iter().rev() {
                let seq = state.assign();
                state.append(LogEntry::Undo {
                    group: *group,
                    sequence_number: seq,
                    payload: payload.clone(),
                })?;
            }
            let seq = state.assign();
            state.append(LogEntry::AbortAtomicGroup {
                group: *group,
                sequence_number: seq,
            })?;
            tracing::debug!(%group, undone = undos.len(), "recovered group aborted");
        }
        Ok(open.len())
    }
}

#[async_trait]
impl AtomicGroupReplicator for LoopbackReplicator {
    fn reserve_sequence_number(&self) -> Result<SequenceNumber, ReplicationError> {
        self.check(FaultPoint::Reserve, &CancellationToken::new())?;
        let mut state = self.state.lock();
        let seq = state.assign();
        state.reserved.insert(seq);
        Ok(seq)
    }

    fn cancel_sequence_number(&self, seq: SequenceNumber) {
        self.state.lock().reserved.remove(&seq);
    }

    async fn replicate(
        &self,
        record: &ReplicationRecord,
        cancel: &CancellationToken,
    ) -> Result<SequenceNumber, ReplicationError> {
        self.check(FaultPoint::Replicate, cancel)?;
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        let seq = record.sequence_number;
        let entry = if record.group.is_ad_hoc() {
            LogEntry::SingleOperation {
                sequence_number: seq,
                payload: record.redo.clone(),
            }
        } else {
            let Some(undos) = state.open_groups.get_mut(&record.group) else {
                return Err(ReplicationError::InvalidAtomicGroup(record.group));
            };
            undos.push((seq, record.undo.clone()));
            LogEntry::Redo {
                group: record.group,
                sequence_number: seq,
                payload: record.redo.clone(),
                undo: record.undo.clone(),
            }
        };
        state.append(entry)?;
        state.reserved.remove(&seq);
        Ok(seq)
    }

    async fn create_atomic_group(&self, cancel: &CancellationToken) -> Result<GroupId, ReplicationError> {
        self.check(FaultPoint::CreateGroup, cancel)?;
        let mut state = self.state.lock();
        let group = GroupId(state.next_group);
        state.next_group += 1;
        let seq = state.assign();
        state.append(LogEntry::CreateAtomicGroup {
            group,
            sequence_number: seq,
        })?;
        state.open_groups.insert(group, Vec::new());
        Ok(group)
    }

    async fn commit_atomic_group(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<SequenceNumber, ReplicationError> {
        self.check(FaultPoint::CommitGroup, cancel)?;
        let mut state = self.state.lock();
        if state.open_groups.remove(&group).is_none() {
            return Err(ReplicationError::InvalidAtomicGroup(group));
        }
        let seq = state.assign();
        state.append(LogEntry::CommitAtomicGroup {
            group,
            sequence_number: seq,
        })?;
        Ok(seq)
    }

    async fn rollback_atomic_group(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<EntryStream, ReplicationError> {
        self.check(FaultPoint::RollbackGroup, cancel)?;
        let mut state = self.state.lock();
        let Some(undos) = state.open_groups.remove(&group) else {
            return Err(ReplicationError::InvalidAtomicGroup(group));
        };

        let mut entries = Vec::with_capacity(undos.len() + 2);
        for (_, payload) in undos.into_iter().rev() {
            let seq = state.assign();
            let entry = LogEntry::Undo {
                group,
                sequence_number: seq,
                payload,
            };
            state.append(entry.clone())?;
            entries.push(entry);
        }
        let seq = state.assign();
        let rollback = LogEntry::RollbackAtomicGroup {
            group,
            sequence_number: seq,
        };
        state.append(rollback.clone())?;
        entries.push(rollback);
        entries.push(LogEntry::EndOfStream);
        Ok(entry_stream(entries))
    }
}
