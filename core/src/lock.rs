//! Table and key locks.
//!
//! Writers take the table in `IntentExclusive` and the key in `Exclusive`;
//! readers take `IntentShared` and `Shared`. Erase takes the table in
//! `Exclusive`. Locks are always requested table first, key second.

use crate::error::{StoreError, StoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use xxhash_rust::xxh3::xxh3_64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn is_compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        matches!(
            (self, other),
            (IntentShared, IntentShared)
                | (IntentShared, IntentExclusive)
                | (IntentShared, Shared)
                | (IntentExclusive, IntentShared)
                | (IntentExclusive, IntentExclusive)
                | (Shared, IntentShared)
                | (Shared, Shared)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockResource {
    Table(u64),
    /// xxh3 hash of the key bytes.
    Key(u64),
}

impl LockResource {
    pub fn key(bytes: &[u8]) -> Self {
        LockResource::Key(xxh3_64(bytes))
    }
}

pub type OwnerId = u64;

/// A lock held by one owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockGrant {
    pub resource: LockResource,
    pub mode: LockMode,
}

/// What is left of one call's timeout budget.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// `Duration::MAX` (or anything that overflows the clock) never expires.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now().checked_add(timeout))
    }

    pub fn never() -> Self {
        Self(None)
    }

    pub fn remaining(&self) -> Duration {
        match self.0 {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.0, Some(at) if Instant::now() >= at)
    }

    async fn elapsed(&self) {
        match self.0 {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }
}

/// Lock table for one provider.
pub struct LockTable {
    table: LockResource,
    holders: Mutex<HashMap<LockResource, Vec<(OwnerId, LockMode)>>>,
    released: Notify,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LockTable {
    pub fn new() -> Self {
        let (hi, lo) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            table: LockResource::Table(hi ^ lo),
            holders: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Resource standing for the whole table.
    pub fn table_resource(&self) -> LockResource {
        self.table
    }

    /// Acquire `mode` on `resource`, waiting until granted, the deadline
    /// passes, or `cancel` fires. An owner never conflicts with itself.
    pub async fn acquire(
        &self,
        owner: OwnerId,
        resource: LockResource,
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> StoreResult<LockGrant> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_grant(owner, resource, mode) {
                return Ok(LockGrant { resource, mode });
            }
            if deadline.is_expired() {
                tracing::debug!(owner, ?resource, ?mode, "lock wait timed out");
                return Err(StoreError::Timeout);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = deadline.elapsed() => {}
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
            }
        }
    }

    fn try_grant(&self, owner: OwnerId, resource: LockResource, mode: LockMode) -> bool {
        let mut holders = self.holders.lock();
        let entry = holders.entry(resource).or_default();
        let conflict = entry
            .iter()
            .any(|(holder, held)| *holder != owner && !held.is_compatible_with(mode));
        if conflict {
            return false;
        }
        entry.push((owner, mode));
        true
    }

    /// Release one grant previously returned to `owner`.
    pub fn release(&self, owner: OwnerId, grant: LockGrant) {
        {
            let mut holders = self.holders.lock();
            if let Some(entry) = holders.get_mut(&grant.resource) {
                if let Some(pos) = entry
                    .iter()
                    .position(|(holder, mode)| *holder == owner && *mode == grant.mode)
                {
                    entry.swap_remove(pos);
                }
                if entry.is_empty() {
                    holders.remove(&grant.resource);
                }
            }
        }
        self.released.notify_waiters();
    }

    /// Drop every lock held by `owner`.
    pub fn release_owner(&self, owner: OwnerId) {
        {
            let mut holders = self.holders.lock();
            holders.retain(|_, entry| {
                entry.retain(|(holder, _)| *holder != owner);
                !entry.is_empty()
            });
        }
        self.released.notify_waiters();
    }

    /// Drop every lock of every owner.
    pub fn clear(&self) {
        self.holders.lock().clear();
        self.released.notify_waiters();
    }

    pub fn holder_count(&self, resource: LockResource) -> usize {
        self.holders.lock().get(&resource).map_or(0, Vec::len)
    }
}
