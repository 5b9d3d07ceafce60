//! Atomic groups.
//!
//! Records gathered under a group are held back until the group ends. Commit
//! releases the locks and delivers every deferred notification as one batch.
//! Rollback releases the locks without add/remove/update notifications.
//! Abort only releases the locks.

use super::SortedMapProvider;
use super::applier::DrainMode;
use crate::error::{StoreError, StoreResult};
use crate::record::OperationKind;
use crate::replicator::EntryStream;
use crate::types::{GroupId, SequenceNumber};
use tokio_util::sync::CancellationToken;

impl SortedMapProvider {
    pub async fn create_group(&self, cancel: &CancellationToken) -> StoreResult<GroupId> {
        self.check_writable()?;
        let replicator = &self.replicator;
        let group = self
            .with_retry("create-group", cancel, move || {
                replicator.create_atomic_group(cancel)
            })
            .await?;
        self.txns.create_transaction(group)?;
        tracing::debug!(provider = %self.config.name, %group, "atomic group created");
        Ok(group)
    }

    /// Commit through the replicator, then finalize locally.
    pub async fn commit_group(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<SequenceNumber> {
        Self::validate_explicit_group(group)?;
        self.check_writable()?;
        let replicator = &self.replicator;
        let seq = self
            .with_retry("commit-group", cancel, move || {
                replicator.commit_atomic_group(group, cancel)
            })
            .await?;
        self.atomic_group_commit(group, seq).await?;
        Ok(seq)
    }

    /// Roll back through the replicator and drain the undo stream it returns.
    pub async fn rollback_group(&self, group: GroupId, cancel: &CancellationToken) -> StoreResult<()> {
        Self::validate_explicit_group(group)?;
        self.check_writable()?;
        let replicator = &self.replicator;
        let undo = self
            .with_retry("rollback-group", cancel, move || {
                replicator.rollback_atomic_group(group, cancel)
            })
            .await?;
        self.atomic_group_rollback(group, undo, cancel).await
    }

    fn validate_explicit_group(group: GroupId) -> StoreResult<()> {
        Self::validate_group(group)?;
        if group.is_ad_hoc() {
            return Err(StoreError::InvalidArgument(
                "operation requires an atomic group".into(),
            ));
        }
        Ok(())
    }

    /// The group's commit is stable: release its locks, mark the commit
    /// stable, and deliver its deferred notifications in order.
    pub async fn atomic_group_commit(&self, group: GroupId, commit_seq: SequenceNumber) -> StoreResult<()> {
        Self::validate_group(group)?;
        let records = match self.txns.get_transaction(group) {
            Some(tx) => {
                let records = tx.take_records();
                self.txns.remove_transaction(&tx);
                records
            }
            None => Vec::new(),
        };
        self.mark_stable(commit_seq).await;
        tracing::debug!(%group, %commit_seq, records = records.len(), "atomic group committed");

        self.observers.publish(
            records
                .iter()
                .filter(|r| !r.compensating)
                .map(|r| r.change_event()),
        );
        self.report_load_metrics();
        Ok(())
    }

    /// Apply the compensating undo stream for `group`. The trailing rollback
    /// entry finalizes the group.
    pub async fn atomic_group_rollback(
        &self,
        group: GroupId,
        undo: EntryStream,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        Self::validate_group(group)?;
        if !self.drain(DrainMode::Undo, undo, cancel).await? {
            tracing::warn!(%group, "undo stream ended without end-of-stream");
        }
        Ok(())
    }

    /// Release the group's locks. Nothing is undone and nothing is notified.
    pub fn atomic_group_abort(&self, group: GroupId) -> StoreResult<()> {
        Self::validate_group(group)?;
        if let Some(tx) = self.txns.get_transaction(group) {
            self.txns.remove_transaction(&tx);
            tracing::debug!(%group, "atomic group aborted");
        }
        Ok(())
    }

    /// Runs when a rollback entry is applied.
    pub(crate) async fn finish_rollback(&self, group: GroupId, seq: SequenceNumber) {
        if let Some(tx) = self.txns.get_transaction(group) {
            let records = tx.take_records();
            self.txns.remove_transaction(&tx);
            // contents were reset wholesale; observers must rebuild
            if records.iter().any(|r| r.kind == OperationKind::Clear) {
                self.observers.publish([crate::notify::ChangeEvent::Cleared]);
            }
        }
        self.mark_stable(seq).await;
        tracing::debug!(%group, %seq, "atomic group rolled back");
        self.report_load_metrics();
    }
}
