//! Multi-key operations.
//!
//! Each bulk call runs its items one after another inside a single atomic
//! group. Unless the caller already supplied a group, the call creates one,
//! commits it when every item succeeds, and rolls it back when an item fails
//! with a recoverable error.

use super::{CallOptions, SortedMapProvider};
use crate::error::{StoreError, StoreResult};
use crate::types::GroupId;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a bulk removal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoveSummary {
    pub removed: usize,
    pub requested: usize,
}

impl RemoveSummary {
    pub fn any(&self) -> bool {
        self.removed > 0
    }

    pub fn all(&self) -> bool {
        self.removed == self.requested
    }
}

struct Bulk {
    group: GroupId,
    owned: bool,
    item: CallOptions,
}

impl SortedMapProvider {
    async fn begin_bulk(&self, items: usize, opts: &CallOptions) -> StoreResult<Bulk> {
        Self::validate_group(opts.group)?;
        let slice = self.timeout(opts) / items.max(1) as u32;
        let (group, owned) = if opts.group.is_ad_hoc() {
            (self.create_group(&opts.cancel).await?, true)
        } else {
            (opts.group, false)
        };
        Ok(Bulk {
            group,
            owned,
            item: CallOptions {
                group,
                timeout: Some(slice.max(Duration::from_millis(1))),
                cancel: opts.cancel.clone(),
            },
        })
    }

    async fn end_bulk<T>(&self, bulk: &Bulk, result: StoreResult<T>) -> StoreResult<T> {
        if !bulk.owned {
            return result;
        }
        // finalization is not cancellable once the items are done
        let finish = CancellationToken::new();
        match result {
            Ok(value) => {
                self.commit_group(bulk.group, &finish).await?;
                Ok(value)
            }
            Err(e) if e.is_recoverable() => {
                tracing::debug!(group = %bulk.group, error = %e, "bulk operation rolling back");
                if let Err(rollback) = self.rollback_group(bulk.group, &finish).await {
                    tracing::warn!(group = %bulk.group, error = %rollback, "bulk rollback failed");
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Add every item or none of them.
    pub async fn add_all(&self, items: &[(Bytes, Bytes)], opts: &CallOptions) -> StoreResult<()> {
        if items.is_empty() {
            return Ok(());
        }
        let bulk = self.begin_bulk(items.len(), opts).await?;
        let result = async {
            for (key, value) in items {
                self.add(key, value, &bulk.item).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        self.end_bulk(&bulk, result).await
    }

    pub async fn remove_all(&self, keys: &[Bytes], opts: &CallOptions) -> StoreResult<RemoveSummary> {
        let mut summary = RemoveSummary {
            removed: 0,
            requested: keys.len(),
        };
        if keys.is_empty() {
            return Ok(summary);
        }
        let bulk = self.begin_bulk(keys.len(), opts).await?;
        let result = async {
            for key in keys {
                if self.remove(key, &bulk.item).await?.is_some() {
                    summary.removed += 1;
                }
            }
            Ok::<_, StoreError>(summary)
        }
        .await;
        self.end_bulk(&bulk, result).await
    }

    /// Update `keys[i]` to `values[i]`. Every key must exist.
    pub async fn update_all(&self, keys: &[Bytes], values: &[Bytes], opts: &CallOptions) -> StoreResult<()> {
        if keys.len() != values.len() {
            return Err(StoreError::InvalidArgument(format!(
                "{} keys but {} values",
                keys.len(),
                values.len()
            )));
        }
        if keys.is_empty() {
            return Ok(());
        }
        let bulk = self.begin_bulk(keys.len(), opts).await?;
        let result = async {
            for (key, value) in keys.iter().zip(values) {
                self.update(key, value, &bulk.item).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;
        self.end_bulk(&bulk, result).await
    }

    /// Move the value under `existing` to `new_key`, or store `value` there
    /// when given. Returns false, with nothing changed, if `existing` is absent.
    pub async fn replace(
        &self,
        existing: &Bytes,
        new_key: &Bytes,
        value: Option<&Bytes>,
        opts: &CallOptions,
    ) -> StoreResult<bool> {
        let bulk = self.begin_bulk(2, opts).await?;
        let result = async {
            let Some(removed) = self.remove(existing, &bulk.item).await? else {
                return Ok(None);
            };
            let value = value.cloned().unwrap_or(removed);
            self.add(new_key, &value, &bulk.item).await?;
            Ok::<_, StoreError>(Some(()))
        }
        .await;

        match result {
            Ok(None) => {
                if bulk.owned {
                    self.rollback_group(bulk.group, &CancellationToken::new()).await?;
                }
                Ok(false)
            }
            other => self.end_bulk(&bulk, other).await.map(|_| true),
        }
    }
}
