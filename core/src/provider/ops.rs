//! Point reads and mutations.
//!
//! Every mutation follows one template: validate, check the gates, get a
//! transaction, lock table then key, reserve a sequence number, call the
//! storage primitive, record, replicate. Failing before replication cancels
//! the reservation and, for ad hoc calls, discards the transaction.

use super::{CallOptions, SortedMapProvider};
use crate::error::{StoreError, StoreResult, invariant_violation};
use crate::lock::{Deadline, LockMode};
use crate::record::{OperationKind, OperationMetadata, OperationRecord, ReplicationRecord};
use crate::storage::Mutation;
use crate::txn::Transaction;
use crate::types::{FaultType, GroupId, SequenceNumber};
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Storage primitive a mutation maps to.
#[derive(Debug, Clone)]
pub(crate) enum Write {
    Add(Bytes),
    Upsert(Bytes),
    Update(Bytes),
    ConditionalUpdate { value: Bytes, expected: Bytes },
    Remove,
    ConditionalRemove(Bytes),
    GetOrAdd(Bytes),
    Clear,
}

impl Write {
    fn name(&self) -> &'static str {
        match self {
            Write::Add(_) => "add",
            Write::Upsert(_) => "add-or-update",
            Write::Update(_) => "update",
            Write::ConditionalUpdate { .. } => "try-update",
            Write::Remove => "remove",
            Write::ConditionalRemove(_) => "remove-if",
            Write::GetOrAdd(_) => "get-or-add",
            Write::Clear => "clear",
        }
    }

    fn value(&self) -> Option<&Bytes> {
        match self {
            Write::Add(v) | Write::Upsert(v) | Write::Update(v) | Write::GetOrAdd(v) => Some(v),
            Write::ConditionalUpdate { value, .. } => Some(value),
            Write::Remove | Write::ConditionalRemove(_) | Write::Clear => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct WriteOutcome {
    pub applied: bool,
    pub prior: Option<Bytes>,
}

/// Try-variants report recoverable failures as `false`.
fn to_bool(result: StoreResult<bool>) -> StoreResult<bool> {
    match result {
        Err(e) if e.is_recoverable() => {
            tracing::debug!(error = %e, "try operation reported false");
            Ok(false)
        }
        other => other,
    }
}

impl SortedMapProvider {
    // Reads

    pub async fn get(&self, key: &Bytes, opts: &CallOptions) -> StoreResult<Option<Bytes>> {
        Self::validate_group(opts.group)?;
        self.check_readable()?;

        let deadline = Deadline::after(self.timeout(opts));
        if opts.group.is_ad_hoc() {
            let tx = self.txns.begin_read_only()?;
            let result = self.read_locked(&tx, key, deadline, &opts.cancel).await;
            self.txns.remove_transaction(&tx);
            result
        } else {
            // locks stay with the group until it ends
            let tx = self.transaction_for(opts.group)?;
            self.read_locked(&tx, key, deadline, &opts.cancel).await
        }
    }

    async fn read_locked(
        &self,
        tx: &Transaction,
        key: &Bytes,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> StoreResult<Option<Bytes>> {
        self.txns
            .lock_table(tx, LockMode::IntentShared, deadline, cancel)
            .await?;
        self.txns
            .lock_key(tx, key, LockMode::Shared, deadline, cancel)
            .await?;
        self.store.seek(key).await
    }

    pub async fn contains_key(&self, key: &Bytes, opts: &CallOptions) -> StoreResult<bool> {
        Ok(self.get(key, opts).await?.is_some())
    }

    pub async fn count(&self) -> StoreResult<u64> {
        self.check_readable()?;
        Ok(self.store.statistics().record_count)
    }

    // Mutations

    /// Fails with `DuplicateKey` if the key exists.
    pub async fn add(&self, key: &Bytes, value: &Bytes, opts: &CallOptions) -> StoreResult<()> {
        self.execute(Some(key), Write::Add(value.clone()), opts)
            .await
            .map(|_| ())
    }

    pub async fn try_add(&self, key: &Bytes, value: &Bytes, opts: &CallOptions) -> StoreResult<bool> {
        to_bool(self.add(key, value, opts).await.map(|_| true))
    }

    /// Returns the removed value, or `None` if the key was absent.
    pub async fn remove(&self, key: &Bytes, opts: &CallOptions) -> StoreResult<Option<Bytes>> {
        let outcome = self.execute(Some(key), Write::Remove, opts).await?;
        Ok(if outcome.applied { outcome.prior } else { None })
    }

    /// Removes the key only if its value equals `expected`.
    pub async fn remove_if(&self, key: &Bytes, expected: &Bytes, opts: &CallOptions) -> StoreResult<bool> {
        let result = self
            .execute(Some(key), Write::ConditionalRemove(expected.clone()), opts)
            .await
            .map(|o| o.applied);
        to_bool(result)
    }

    /// Replace an existing value. Fails with `KeyNotFound` if absent and
    /// returns the previous value otherwise.
    pub async fn update(&self, key: &Bytes, value: &Bytes, opts: &CallOptions) -> StoreResult<Bytes> {
        let outcome = self.execute(Some(key), Write::Update(value.clone()), opts).await?;
        outcome.prior.ok_or(StoreError::KeyNotFound)
    }

    /// Replace the value only if it currently equals `expected`.
    pub async fn try_update(
        &self,
        key: &Bytes,
        value: &Bytes,
        expected: &Bytes,
        opts: &CallOptions,
    ) -> StoreResult<bool> {
        let write = Write::ConditionalUpdate {
            value: value.clone(),
            expected: expected.clone(),
        };
        to_bool(self.execute(Some(key), write, opts).await.map(|o| o.applied))
    }

    /// Insert or overwrite. Returns the overwritten value.
    pub async fn add_or_update(&self, key: &Bytes, value: &Bytes, opts: &CallOptions) -> StoreResult<Option<Bytes>> {
        let outcome = self.execute(Some(key), Write::Upsert(value.clone()), opts).await?;
        Ok(outcome.prior)
    }

    /// Returns the existing value, inserting `value` first if the key is absent.
    pub async fn get_or_add(&self, key: &Bytes, value: &Bytes, opts: &CallOptions) -> StoreResult<Bytes> {
        let outcome = self.execute(Some(key), Write::GetOrAdd(value.clone()), opts).await?;
        Ok(match outcome.prior {
            Some(existing) if !outcome.applied => existing,
            _ => value.clone(),
        })
    }

    /// Remove every record as one replicated operation.
    pub async fn clear(&self, opts: &CallOptions) -> StoreResult<()> {
        self.execute(None, Write::Clear, opts).await.map(|_| ())
    }

    // Template

    pub(crate) async fn execute(&self, key: Option<&Bytes>, write: Write, opts: &CallOptions) -> StoreResult<WriteOutcome> {
        Self::validate_group(opts.group)?;
        self.check_writable()?;

        let tx = self.transaction_for(opts.group)?;
        let result = self.execute_locked(&tx, key, &write, opts).await;
        if let Err(e) = &result {
            tracing::debug!(op = write.name(), group = %opts.group, error = %e, "mutation failed");
            if tx.is_ad_hoc() {
                self.txns.remove_transaction(&tx);
            }
            if matches!(e, StoreError::ResourceExhausted(_)) {
                self.set_faulted(FaultType::Transient);
            }
        }
        result
    }

    async fn execute_locked(
        &self,
        tx: &Arc<Transaction>,
        key: Option<&Bytes>,
        write: &Write,
        opts: &CallOptions,
    ) -> StoreResult<WriteOutcome> {
        let deadline = Deadline::after(self.timeout(opts));
        match key {
            Some(key) => {
                self.txns
                    .lock_table(tx, LockMode::IntentExclusive, deadline, &opts.cancel)
                    .await?;
                self.txns
                    .lock_key(tx, key, LockMode::Exclusive, deadline, &opts.cancel)
                    .await?;
            }
            None => {
                self.txns
                    .lock_table(tx, LockMode::Exclusive, deadline, &opts.cancel)
                    .await?;
            }
        }

        if let (Write::GetOrAdd(_), Some(key)) = (write, key) {
            if let Some(existing) = self.store.seek(key).await? {
                self.finish_unchanged(tx);
                return Ok(WriteOutcome {
                    applied: false,
                    prior: Some(existing),
                });
            }
        }

        let seq = self.reserve(&opts.cancel).await?;
        let mutation = match self.mutate(key, write, seq, &opts.cancel).await {
            Ok(m) => m,
            Err(e) => {
                self.replicator.cancel_sequence_number(seq);
                return Err(e);
            }
        };

        let Some(redo_undo) = mutation.redo_undo else {
            self.replicator.cancel_sequence_number(seq);
            self.finish_unchanged(tx);
            return Ok(WriteOutcome {
                applied: false,
                prior: mutation.prior,
            });
        };

        let kind = match write {
            Write::Clear => OperationKind::Clear,
            Write::Remove | Write::ConditionalRemove(_) => OperationKind::Remove,
            _ if mutation.prior.is_some() => OperationKind::Update,
            _ => OperationKind::Add,
        };
        let record = OperationRecord {
            kind,
            key: key.cloned(),
            old_value: mutation.prior.clone(),
            new_value: write.value().cloned(),
            sequence_number: seq,
            group: opts.group,
            redo_undo: Some(redo_undo),
            compensating: false,
        };

        // past this point the call is no longer cancellable
        self.replicate_record(&record).await?;
        self.finish_applied(tx, record).await;
        Ok(WriteOutcome {
            applied: true,
            prior: mutation.prior,
        })
    }

    /// Fresh transaction for ad hoc calls, the group's transaction otherwise.
    pub(crate) fn transaction_for(&self, group: GroupId) -> StoreResult<Arc<Transaction>> {
        if group.is_ad_hoc() {
            return Ok(self.txns.create_transaction(group)?.0);
        }
        self.txns
            .get_transaction(group)
            .ok_or_else(|| StoreError::InvalidArgument(format!("atomic group {group} is not active")))
    }

    pub(crate) async fn reserve(&self, cancel: &CancellationToken) -> StoreResult<SequenceNumber> {
        let replicator = &self.replicator;
        self.with_retry("reserve", cancel, move || {
            std::future::ready(replicator.reserve_sequence_number())
        })
        .await
    }

    async fn mutate(
        &self,
        key: Option<&Bytes>,
        write: &Write,
        seq: SequenceNumber,
        cancel: &CancellationToken,
    ) -> StoreResult<Mutation> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let store = &self.store;
        let Some(key) = key else {
            return match write {
                Write::Clear => store.erase(seq).await,
                _ => invariant_violation("keyed mutation without a key"),
            };
        };
        match write {
            Write::Add(value) | Write::GetOrAdd(value) => store.insert(key, value, seq).await,
            Write::Upsert(value) => store.upsert(key, value, seq).await,
            Write::Update(value) => store.update(key, value, seq).await,
            Write::ConditionalUpdate { value, expected } => {
                store.conditional_update(key, value, expected, seq).await
            }
            Write::Remove => store.delete(key, seq).await,
            Write::ConditionalRemove(expected) => store.conditional_delete(key, expected, seq).await,
            Write::Clear => invariant_violation("clear with a key"),
        }
    }

    /// Replicate with a token that never fires. Only non-retryable errors and
    /// faults may come back from here.
    async fn replicate_record(&self, record: &OperationRecord) -> StoreResult<()> {
        let Some(redo_undo) = record.redo_undo.as_ref() else {
            invariant_violation("replicating a record without redo/undo");
        };
        let replication = ReplicationRecord {
            group: record.group,
            sequence_number: record.sequence_number,
            metadata: OperationMetadata { kind: record.kind },
            redo: redo_undo.redo.clone(),
            undo: redo_undo.undo.clone(),
        };
        let uncancellable = CancellationToken::new();
        let replicator = &self.replicator;
        let rec = &replication;
        let token = &uncancellable;
        let result = self
            .with_retry("replicate", token, move || replicator.replicate(rec, token))
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e @ StoreError::NonRetryable(_)) => {
                self.set_faulted(FaultType::Permanent);
                Err(e)
            }
            Err(e @ StoreError::Faulted(_)) => Err(e),
            Err(e) => invariant_violation(&format!("unexpected replication failure: {e}")),
        }
    }

    fn finish_unchanged(&self, tx: &Transaction) {
        if tx.is_ad_hoc() {
            self.txns.remove_transaction(tx);
        }
    }

    async fn finish_applied(&self, tx: &Transaction, record: OperationRecord) {
        if !tx.is_ad_hoc() {
            tx.add_record(record);
            return;
        }
        self.txns.remove_transaction(tx);
        self.mark_stable(record.sequence_number).await;
        self.observers.publish([record.change_event()]);
    }

    pub(crate) async fn mark_stable(&self, seq: SequenceNumber) {
        if let Err(e) = self.store.on_operation_stable(seq).await {
            tracing::warn!(%seq, error = %e, "marking sequence number stable failed");
        }
    }
}
