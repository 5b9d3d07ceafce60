//! Range enumeration under an isolation level.
//!
//! `StrictSerializable` takes a shared table lock up front, so writers wait
//! until the enumerator is closed. The weaker levels lock per step: the
//! enumerator finds the next candidate, share-locks its key, then looks the
//! key up again so the value returned is a committed one.

use super::SortedMapProvider;
use crate::error::{StoreError, StoreResult};
use crate::lock::{Deadline, LockMode};
use crate::storage::{OrderedStore, ScanRange, StoreScan};
use crate::txn::{Transaction, TransactionManager};
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    /// Table shared lock held for the enumerator's lifetime.
    StrictSerializable,
    /// Key shared locks held until close.
    Repeatable,
    /// Key shared lock held only while the step reads.
    #[default]
    Committed,
    /// Table intent lock per step; no key locks.
    Uncommitted,
    /// No locks at all.
    Unprotected,
}

#[derive(Debug, Clone, Default)]
pub struct EnumerationOptions {
    pub start: Option<Bytes>,
    /// Exclusive upper bound. Requires `prefix` to be set; an empty prefix
    /// matches every key.
    pub end: Option<Bytes>,
    pub prefix: Option<Bytes>,
    pub isolation: IsolationLevel,
    /// Lock wait budget per step. `None` uses the provider default.
    pub step_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl EnumerationOptions {
    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<Bytes>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_range(mut self, start: Option<Bytes>, end: Option<Bytes>) -> Self {
        self.start = start;
        self.end = end;
        if self.end.is_some() && self.prefix.is_none() {
            self.prefix = Some(Bytes::new());
        }
        self
    }
}

pub struct RangeEnumerator {
    txns: Arc<TransactionManager>,
    store: Arc<dyn OrderedStore>,
    scan: Box<dyn StoreScan>,
    isolation: IsolationLevel,
    step_timeout: Duration,
    cancel: CancellationToken,
    /// Holds the table lock (and, for `Repeatable`, key locks) until close.
    tx: Option<Arc<Transaction>>,
    done: bool,
}

impl SortedMapProvider {
    pub async fn create_enumerator(&self, opts: EnumerationOptions) -> StoreResult<RangeEnumerator> {
        if opts.end.is_some() && opts.prefix.is_none() {
            return Err(StoreError::NullArgument("prefix"));
        }
        self.check_readable()?;

        let step_timeout = opts.step_timeout.unwrap_or_else(|| self.config.default_timeout());
        let table_mode = match opts.isolation {
            IsolationLevel::StrictSerializable => Some(LockMode::Shared),
            IsolationLevel::Repeatable => Some(LockMode::IntentShared),
            _ => None,
        };
        let tx = match table_mode {
            Some(mode) => {
                let tx = self.txns.begin_read_only()?;
                let locked = self
                    .txns
                    .lock_table(&tx, mode, Deadline::after(step_timeout), &opts.cancel)
                    .await;
                if let Err(e) = locked {
                    self.txns.remove_transaction(&tx);
                    return Err(e);
                }
                Some(tx)
            }
            None => None,
        };

        let range = ScanRange {
            start: opts.start,
            end: opts.end,
            prefix: opts.prefix.filter(|p| !p.is_empty()),
        };
        tracing::debug!(isolation = ?opts.isolation, ?range, "enumerator created");
        Ok(RangeEnumerator {
            txns: Arc::clone(&self.txns),
            store: Arc::clone(&self.store),
            scan: self.store.scan(range),
            isolation: opts.isolation,
            step_timeout,
            cancel: opts.cancel,
            tx,
            done: false,
        })
    }
}

impl RangeEnumerator {
    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Next key/value pair in key order, or `None` at the end of the range.
    pub async fn next(&mut self) -> StoreResult<Option<(Bytes, Bytes)>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let item = match self.isolation {
            IsolationLevel::StrictSerializable | IsolationLevel::Unprotected => self.scan.next().await?,
            IsolationLevel::Uncommitted => self.step_uncommitted().await?,
            IsolationLevel::Repeatable | IsolationLevel::Committed => self.step_locked().await?,
        };
        if item.is_none() {
            self.done = true;
        }
        Ok(item)
    }

    async fn step_uncommitted(&mut self) -> StoreResult<Option<(Bytes, Bytes)>> {
        let tx = self.txns.begin_read_only()?;
        let deadline = Deadline::after(self.step_timeout);
        let result = match self
            .txns
            .lock_table(&tx, LockMode::IntentShared, deadline, &self.cancel)
            .await
        {
            Ok(_) => self.scan.next().await,
            Err(e) => Err(e),
        };
        self.txns.remove_transaction(&tx);
        result
    }

    async fn step_locked(&mut self) -> StoreResult<Option<(Bytes, Bytes)>> {
        let (tx, ephemeral) = match &self.tx {
            Some(tx) => (Arc::clone(tx), false),
            None => (self.txns.begin_read_only()?, true),
        };
        let result = self.step_with(&tx, ephemeral).await;
        if ephemeral {
            self.txns.remove_transaction(&tx);
        }
        result
    }

    async fn step_with(&mut self, tx: &Transaction, lock_table: bool) -> StoreResult<Option<(Bytes, Bytes)>> {
        let deadline = Deadline::after(self.step_timeout);
        if lock_table {
            self.txns
                .lock_table(tx, LockMode::IntentShared, deadline, &self.cancel)
                .await?;
        }
        loop {
            let Some((key, _)) = self.scan.next().await? else {
                return Ok(None);
            };
            let grant = self
                .txns
                .lock_key(tx, &key, LockMode::Shared, deadline, &self.cancel)
                .await?;
            match self.store.seek(&key).await? {
                Some(value) => {
                    if self.isolation == IsolationLevel::Committed {
                        self.txns.unlock(tx, grant);
                    }
                    return Ok(Some((key, value)));
                }
                None => {
                    // removed before the lock was granted
                    self.txns.unlock(tx, grant);
                }
            }
        }
    }

    /// Restart from the beginning of the range. Locks already held stay held.
    pub fn reset(&mut self) {
        self.scan.reset();
        self.done = false;
    }

    /// Release every lock the enumerator holds.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(tx) = self.tx.take() {
            self.txns.remove_transaction(&tx);
        }
        self.done = true;
    }

    /// Adapt into a stream. The stream stops after the first error.
    pub fn into_stream(self) -> BoxStream<'static, StoreResult<(Bytes, Bytes)>> {
        stream::unfold(Some(self), |state| async move {
            let mut enumerator = state?;
            match enumerator.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(enumerator))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }
}

impl Drop for RangeEnumerator {
    fn drop(&mut self) {
        self.release();
    }
}
