//! Replicated sorted-map provider.
//!
//! Ties the ordered store, lock table, transaction manager, and replicator
//! together: point and bulk mutations, atomic groups, stream application,
//! isolation-aware enumeration, and the replica lifecycle.

mod applier;
mod bulk;
mod enumerate;
mod group;
mod lifecycle;
mod local;
mod ops;

#[cfg(test)]
mod tests;

pub use applier::DrainMode;
pub use bulk::RemoveSummary;
pub use enumerate::{EnumerationOptions, IsolationLevel, RangeEnumerator};
pub use local::LocalReplica;

use crate::config::ProviderConfig;
use crate::error::{ReplicationError, StoreError, StoreResult};
use crate::notify::{ChangeObserver, ObserverSet};
use crate::partition::PartitionHost;
use crate::progress::ProgressVector;
use crate::replicator::AtomicGroupReplicator;
use crate::storage::{OrderedStore, StoreStatistics};
use crate::txn::TransactionManager;
use crate::types::{AccessStatus, FaultType, GroupId, ReplicaRole};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call options: atomic group, timeout budget, cancellation.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub group: GroupId,
    /// `None` uses the provider's default timeout.
    pub timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl CallOptions {
    pub fn in_group(group: GroupId) -> Self {
        Self {
            group,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

const NOT_FAULTED: u8 = 0;
const TRANSIENT: u8 = 1;
const PERMANENT: u8 = 2;

/// Fault flag. A permanent fault is never downgraded.
#[derive(Default)]
pub(crate) struct FaultState(AtomicU8);

impl FaultState {
    pub(crate) fn get(&self) -> Option<FaultType> {
        match self.0.load(Ordering::SeqCst) {
            TRANSIENT => Some(FaultType::Transient),
            PERMANENT => Some(FaultType::Permanent),
            _ => None,
        }
    }

    /// Returns true when the stored fault changed.
    pub(crate) fn set(&self, fault: FaultType) -> bool {
        let value = match fault {
            FaultType::Transient => TRANSIENT,
            FaultType::Permanent => PERMANENT,
        };
        self.0.fetch_max(value, Ordering::SeqCst) < value
    }

    pub(crate) fn clear(&self) {
        self.0.store(NOT_FAULTED, Ordering::SeqCst);
    }
}

pub struct SortedMapProvider {
    config: ProviderConfig,
    store: Arc<dyn OrderedStore>,
    replicator: Arc<dyn AtomicGroupReplicator>,
    partition: Arc<dyn PartitionHost>,
    txns: Arc<TransactionManager>,
    observers: ObserverSet,
    role: RwLock<ReplicaRole>,
    fault: FaultState,
    redo_pass_complete: AtomicBool,
    statistics: RwLock<StoreStatistics>,
    progress: Mutex<ProgressVector>,
}

impl SortedMapProvider {
    pub fn new(
        config: ProviderConfig,
        store: Arc<dyn OrderedStore>,
        replicator: Arc<dyn AtomicGroupReplicator>,
        partition: Arc<dyn PartitionHost>,
    ) -> Self {
        let progress = ProgressVector::new(config.max_progress_entries);
        Self {
            config,
            store,
            replicator,
            partition,
            txns: Arc::new(TransactionManager::new()),
            observers: ObserverSet::new(),
            role: RwLock::new(ReplicaRole::Unknown),
            fault: FaultState::default(),
            redo_pass_complete: AtomicBool::new(false),
            statistics: RwLock::new(StoreStatistics::default()),
            progress: Mutex::new(progress),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    pub fn fault(&self) -> Option<FaultType> {
        self.fault.get()
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.get().is_some()
    }

    pub fn is_readable(&self) -> bool {
        self.check_readable().is_ok()
    }

    pub fn is_writable(&self) -> bool {
        self.check_writable().is_ok()
    }

    pub fn subscribe(&self, observer: Arc<dyn ChangeObserver>) {
        self.observers.subscribe(observer);
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.txns
    }

    // Gates

    fn check_not_faulted(&self) -> StoreResult<()> {
        match self.fault.get() {
            Some(fault) => Err(StoreError::Faulted(fault)),
            None => Ok(()),
        }
    }

    pub(crate) fn check_readable(&self) -> StoreResult<()> {
        self.check_not_faulted()?;
        if self.partition.read_status() != AccessStatus::Granted {
            return Err(StoreError::NotReadable);
        }
        match self.role() {
            ReplicaRole::Primary if !self.redo_pass_complete.load(Ordering::SeqCst) => {
                Err(StoreError::NotReadable)
            }
            ReplicaRole::Unknown | ReplicaRole::None => Err(StoreError::NotReadable),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_writable(&self) -> StoreResult<()> {
        self.check_not_faulted()?;
        match self.partition.write_status() {
            AccessStatus::Granted => {}
            AccessStatus::NotPrimary => return Err(StoreError::NotPrimary),
            AccessStatus::ReconfigurationPending | AccessStatus::NoWriteQuorum => {
                return Err(StoreError::NotWritable);
            }
        }
        if self.role() != ReplicaRole::Primary {
            return Err(StoreError::NotWritable);
        }
        Ok(())
    }

    pub(crate) fn validate_group(group: GroupId) -> StoreResult<()> {
        if group.is_out_of_range() {
            return Err(StoreError::ArgumentOutOfRange("atomic group id"));
        }
        Ok(())
    }

    pub(crate) fn set_faulted(&self, fault: FaultType) {
        if self.fault.set(fault) {
            tracing::warn!(provider = %self.config.name, ?fault, "provider faulted");
            self.partition.report_fault(fault);
        }
    }

    /// Permanent for non-retryable failures, transient otherwise.
    pub(crate) fn fault_for(&self, error: &StoreError) {
        let fault = match error {
            StoreError::NonRetryable(_) | StoreError::Closed => FaultType::Permanent,
            _ => FaultType::Transient,
        };
        self.set_faulted(fault);
    }

    pub(crate) fn timeout(&self, opts: &CallOptions) -> Duration {
        opts.timeout.unwrap_or_else(|| self.config.default_timeout())
    }

    /// Run a replicator call, retrying transient failures with exponential
    /// backoff until it succeeds, fails for good, the provider faults, or
    /// `cancel` fires.
    pub(crate) async fn with_retry<T, F, Fut>(
        &self,
        what: &'static str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ReplicationError>>,
    {
        let mut delay = self.config.backoff.initial();
        let max = self.config.backoff.max();
        loop {
            self.check_not_faulted()?;
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(what, error = %e, ?delay, "retrying replicator call");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                    }
                    delay = (delay * 2).min(max);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Report statistics to the partition. Failures are logged and dropped.
    pub fn report_load_metrics(&self) {
        use crate::partition::LoadMetric;
        let stats = self.store.statistics();
        *self.statistics.write() = stats;
        let metrics = [
            LoadMetric {
                name: "RecordCount",
                value: stats.record_count,
            },
            LoadMetric {
                name: "PageCount",
                value: stats.page_count,
            },
            LoadMetric {
                name: "MemoryUsageBytes",
                value: stats.memory_bytes,
            },
            LoadMetric {
                name: "StorageUsageBytes",
                value: stats.storage_bytes,
            },
        ];
        if let Err(e) = self.partition.report_load(&metrics) {
            tracing::warn!(error = %e, "load report failed");
        }
    }

    /// Statistics captured at open or at the last load report.
    pub fn statistics_snapshot(&self) -> StoreStatistics {
        *self.statistics.read()
    }
}
