//! Open, role changes, epochs, close.

use super::SortedMapProvider;
use crate::error::{StoreError, StoreResult};
use crate::progress::ProgressEntry;
use crate::types::{Epoch, OpenMode, ReplicaRole, SequenceNumber};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

impl SortedMapProvider {
    /// Open the transaction manager and the store. A new replica has nothing
    /// to recover and is readable as soon as it is primary.
    pub async fn open(&self, mode: OpenMode, cancel: &CancellationToken) -> StoreResult<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.txns.open();
        if let Err(e) = self.store.open(mode).await {
            self.txns.abort();
            return Err(e);
        }
        self.fault.clear();
        self.redo_pass_complete
            .store(mode == OpenMode::New, Ordering::SeqCst);
        *self.statistics.write() = self.store.statistics();
        tracing::info!(provider = %self.config.name, ?mode, "provider opened");
        Ok(())
    }

    pub async fn change_role(&self, new_role: ReplicaRole, cancel: &CancellationToken) -> StoreResult<()> {
        if let Some(fault) = self.fault.get() {
            if new_role != ReplicaRole::None {
                return Err(StoreError::Faulted(fault));
            }
        }
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let current = self.role();
        if current == new_role {
            return Ok(());
        }

        use ReplicaRole as R;
        match (current, new_role) {
            (_, R::Unknown) | (R::Unknown, R::ActiveSecondary) => {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot change role from {current} to {new_role}"
                )));
            }
            (_, R::None) => {
                self.store.close(true).await?;
                self.txns.abort();
                self.fault.clear();
            }
            (R::ActiveSecondary, R::Primary) | (R::Primary, R::ActiveSecondary) => {
                // locks taken under the old role must not survive it
                self.txns.close();
                self.txns.open();
                if new_role == R::Primary {
                    // a caught-up secondary holds every committed record
                    self.redo_pass_complete.store(true, Ordering::SeqCst);
                }
            }
            (R::Unknown, R::Primary) | (R::Unknown, R::IdleSecondary) | (R::IdleSecondary, R::ActiveSecondary) => {}
            _ => {
                return Err(StoreError::InvalidArgument(format!(
                    "cannot change role from {current} to {new_role}"
                )));
            }
        }

        *self.role.write() = new_role;
        tracing::info!(provider = %self.config.name, from = %current, to = %new_role, "role changed");
        if current == R::Unknown && new_role != R::None {
            self.report_load_metrics();
        }
        Ok(())
    }

    pub async fn close(&self, cancel: &CancellationToken) -> StoreResult<()> {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.store.close(false).await?;
        self.txns.close();
        tracing::info!(provider = %self.config.name, "provider closed");
        Ok(())
    }

    /// Tear down without waiting for anything.
    pub fn abort(&self) {
        self.store.abort();
        self.txns.abort();
        tracing::warn!(provider = %self.config.name, "provider aborted");
    }

    /// Record a new epoch in the progress history.
    pub async fn update_epoch(
        &self,
        epoch: Epoch,
        previous_epoch_last_sequence_number: SequenceNumber,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        self.check_not_faulted()?;
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        self.progress
            .lock()
            .push(epoch, previous_epoch_last_sequence_number);
        tracing::debug!(?epoch, %previous_epoch_last_sequence_number, "epoch updated");
        Ok(())
    }

    pub fn progress(&self) -> Vec<ProgressEntry> {
        self.progress.lock().entries().copied().collect()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.progress.lock().current().map(|e| e.epoch)
    }

    pub async fn checkpoint(&self, seq: SequenceNumber) -> StoreResult<()> {
        self.check_not_faulted()?;
        self.store.checkpoint(seq).await
    }

    /// Advance the store's stable watermark to `seq`.
    pub async fn on_operation_stable(&self, seq: SequenceNumber) -> StoreResult<SequenceNumber> {
        self.store.on_operation_stable(seq).await
    }

    pub fn last_committed_sequence_number(&self) -> SequenceNumber {
        self.store.last_committed_sequence_number()
    }

    /// Whether data-loss handling changed the state. It never does here.
    pub async fn on_data_loss(&self) -> StoreResult<bool> {
        self.check_not_faulted()?;
        tracing::warn!(provider = %self.config.name, "data loss reported");
        Ok(false)
    }
}
