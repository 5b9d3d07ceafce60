//! Stream application for recovery, replication, copy, and undo.
//!
//! Entries arrive in log order. When concurrent reads are enabled, payloads
//! are applied under the same locks a primary would take so that readers on
//! this replica never see a half-applied group.

use super::SortedMapProvider;
use crate::error::{StoreError, StoreResult, invariant_violation};
use crate::lock::{Deadline, LockMode};
use crate::record::{LogEntry, OperationKind, OperationRecord};
use crate::replicator::{self, EntryStream};
use crate::storage::ApplyMode;
use crate::types::{GroupId, SequenceNumber};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

/// Which stream is being applied. Each accepts a fixed set of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainMode {
    Recovery,
    Replication,
    Copy,
    Undo,
}

impl DrainMode {
    fn accepts(self, entry: &LogEntry) -> bool {
        match self {
            DrainMode::Recovery => !matches!(entry, LogEntry::Copy { .. }),
            DrainMode::Replication => matches!(
                entry,
                LogEntry::CreateAtomicGroup { .. }
                    | LogEntry::CommitAtomicGroup { .. }
                    | LogEntry::RollbackAtomicGroup { .. }
                    | LogEntry::AbortAtomicGroup { .. }
                    | LogEntry::Redo { .. }
                    | LogEntry::Undo { .. }
                    | LogEntry::SingleOperation { .. }
                    | LogEntry::EndOfStream
            ),
            DrainMode::Copy => matches!(entry, LogEntry::Copy { .. } | LogEntry::EndOfStream),
            DrainMode::Undo => matches!(
                entry,
                LogEntry::Undo { .. } | LogEntry::RollbackAtomicGroup { .. } | LogEntry::EndOfStream
            ),
        }
    }
}

impl SortedMapProvider {
    /// Whether payloads in `mode` are applied under locks.
    fn applies_locked(&self, mode: DrainMode) -> bool {
        if !self.config.concurrent_reads {
            return false;
        }
        match mode {
            DrainMode::Replication | DrainMode::Undo => true,
            DrainMode::Recovery => self.redo_pass_complete.load(Ordering::SeqCst),
            DrainMode::Copy => false,
        }
    }

    pub async fn recovery_operation(&self, entry: LogEntry) -> StoreResult<()> {
        self.apply_one(DrainMode::Recovery, entry).await
    }

    pub async fn replication_operation(&self, entry: LogEntry) -> StoreResult<()> {
        self.apply_one(DrainMode::Replication, entry).await
    }

    pub async fn copy_operation(&self, entry: LogEntry) -> StoreResult<()> {
        self.apply_one(DrainMode::Copy, entry).await
    }

    pub async fn drain_recovery(&self, stream: EntryStream, cancel: &CancellationToken) -> StoreResult<bool> {
        self.drain(DrainMode::Recovery, stream, cancel).await
    }

    pub async fn drain_replication(&self, stream: EntryStream, cancel: &CancellationToken) -> StoreResult<bool> {
        self.drain(DrainMode::Replication, stream, cancel).await
    }

    pub async fn drain_copy(&self, stream: EntryStream, cancel: &CancellationToken) -> StoreResult<bool> {
        self.drain(DrainMode::Copy, stream, cancel).await
    }

    /// Copy stream that rebuilds this replica's records elsewhere.
    pub fn get_copy_state(&self, up_to: SequenceNumber) -> StoreResult<EntryStream> {
        self.check_not_faulted()?;
        let chunks = self.store.copy_state(up_to)?;
        tracing::debug!(%up_to, chunks = chunks.len(), "copy state prepared");
        Ok(replicator::copy_stream(chunks))
    }

    async fn apply_one(&self, mode: DrainMode, entry: LogEntry) -> StoreResult<()> {
        self.check_not_faulted()?;
        let never = CancellationToken::new();
        if let Err(e) = self.apply_entry(mode, entry, &never).await {
            self.fault_for(&e);
            return Err(e);
        }
        Ok(())
    }

    /// Apply entries until end-of-stream. Returns false if the stream ended
    /// without one.
    pub(crate) async fn drain(
        &self,
        mode: DrainMode,
        mut stream: EntryStream,
        cancel: &CancellationToken,
    ) -> StoreResult<bool> {
        let mut applied = 0usize;
        loop {
            self.check_not_faulted()?;
            let entry = tokio::select! {
                entry = stream.next() => entry,
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            };
            let Some(entry) = entry else {
                tracing::debug!(?mode, applied, "stream ended");
                return Ok(false);
            };
            if entry == LogEntry::EndOfStream {
                tracing::debug!(?mode, applied, "stream drained");
                return Ok(true);
            }
            if let Err(e) = self.apply_entry(mode, entry, cancel).await {
                tracing::error!(?mode, error = %e, "stream application failed");
                if !matches!(e, StoreError::Cancelled) {
                    self.fault_for(&e);
                }
                return Err(e);
            }
            applied += 1;
        }
    }

    async fn apply_entry(&self, mode: DrainMode, entry: LogEntry, cancel: &CancellationToken) -> StoreResult<()> {
        if !mode.accepts(&entry) {
            invariant_violation(&format!("{} entry in {mode:?} stream", entry.name()));
        }
        tracing::trace!(?mode, entry = entry.name(), seq = ?entry.sequence_number(), "applying entry");
        let locked = self.applies_locked(mode);
        match entry {
            LogEntry::CreateAtomicGroup { group, .. } => {
                if locked {
                    self.txns.create_transaction(group)?;
                }
                Ok(())
            }
            LogEntry::CommitAtomicGroup { group, sequence_number } => {
                self.atomic_group_commit(group, sequence_number).await
            }
            LogEntry::RollbackAtomicGroup { group, sequence_number } => {
                self.finish_rollback(group, sequence_number).await;
                Ok(())
            }
            LogEntry::AbortAtomicGroup { group, .. } => self.atomic_group_abort(group),
            LogEntry::Redo {
                group,
                sequence_number,
                payload,
                ..
            } => {
                self.apply_payload(group, sequence_number, &payload, false, locked, cancel)
                    .await
            }
            LogEntry::Undo {
                group,
                sequence_number,
                payload,
            } => {
                self.apply_payload(group, sequence_number, &payload, true, locked, cancel)
                    .await
            }
            LogEntry::SingleOperation {
                sequence_number,
                payload,
            } => {
                self.apply_payload(GroupId::AD_HOC, sequence_number, &payload, false, locked, cancel)
                    .await
            }
            LogEntry::Copy { payload } => self.store.apply_copy_data(&payload).await,
            LogEntry::RedoPassComplete => {
                self.redo_pass_complete.store(true, Ordering::SeqCst);
                tracing::info!(provider = %self.config.name, "redo pass complete");
                Ok(())
            }
            LogEntry::UndoPassComplete => {
                tracing::info!(provider = %self.config.name, "undo pass complete");
                Ok(())
            }
            LogEntry::EndOfStream => Ok(()),
        }
    }

    async fn apply_payload(
        &self,
        group: GroupId,
        seq: SequenceNumber,
        payload: &Bytes,
        compensating: bool,
        locked: bool,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        if !locked {
            self.store.apply(seq, payload, ApplyMode::Apply).await?;
            if group.is_ad_hoc() {
                self.mark_stable(seq).await;
            }
            return Ok(());
        }

        let shape = self.store.apply(seq, payload, ApplyMode::DecodeOnly).await?;
        let (tx, _) = self.txns.create_transaction(group)?;
        let deadline = Deadline::never();
        let locking = async {
            match shape.key.as_ref() {
                Some(key) => {
                    self.txns
                        .lock_table(&tx, LockMode::IntentExclusive, deadline, cancel)
                        .await?;
                    self.txns
                        .lock_key(&tx, key, LockMode::Exclusive, deadline, cancel)
                        .await?;
                }
                None => {
                    self.txns
                        .lock_table(&tx, LockMode::Exclusive, deadline, cancel)
                        .await?;
                }
            }
            self.store.apply(seq, payload, ApplyMode::Apply).await
        };
        let applied = match locking.await {
            Ok(op) => op,
            Err(e) => {
                if tx.is_ad_hoc() {
                    self.txns.remove_transaction(&tx);
                }
                return Err(e);
            }
        };

        let record = OperationRecord {
            kind: OperationKind::from(applied.kind),
            key: applied.key,
            old_value: applied.prior,
            new_value: applied.value,
            sequence_number: seq,
            group,
            redo_undo: None,
            compensating,
        };
        if tx.is_ad_hoc() {
            self.txns.remove_transaction(&tx);
            self.mark_stable(seq).await;
            self.observers.publish([record.change_event()]);
        } else {
            tx.add_record(record);
        }
        Ok(())
    }
}
