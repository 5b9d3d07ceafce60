//! Transaction management

use crate::error::{StoreError, StoreResult};
use crate::lock::{Deadline, LockGrant, LockMode, LockResource, LockTable};
use crate::record::OperationRecord;
use crate::types::GroupId;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio_util::sync::CancellationToken;

pub type TransactionId = u64;

/// Holder of locks and deferred operation records.
///
/// Group-scoped transactions live until their group commits, rolls back, or
/// aborts. Ad hoc transactions end with their single operation.
pub struct Transaction {
    pub id: TransactionId,
    pub group: GroupId,
    pub read_only: bool,
    locks: Mutex<SmallVec<[LockGrant; 4]>>,
    records: Mutex<Vec<OperationRecord>>,
}

impl Transaction {
    fn new(id: TransactionId, group: GroupId, read_only: bool) -> Self {
        Self {
            id,
            group,
            read_only,
            locks: Mutex::new(SmallVec::new()),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn is_ad_hoc(&self) -> bool {
        self.group.is_ad_hoc()
    }

    /// Defer a record until the transaction ends.
    pub fn add_record(&self, record: OperationRecord) {
        self.records.lock().push(record);
    }

    pub fn take_records(&self) -> Vec<OperationRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }
}

/// Transaction manager
pub struct TransactionManager {
    next_id: AtomicU64,
    groups: DashMap<GroupId, Arc<Transaction>>,
    active: DashMap<TransactionId, Arc<Transaction>>,
    locks: LockTable,
    open: AtomicBool,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            groups: DashMap::new(),
            active: DashMap::new(),
            locks: LockTable::new(),
            open: AtomicBool::new(false),
        }
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop accepting transactions and drop the ones in flight.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let stale = self.active.len();
        if stale > 0 {
            tracing::debug!(stale, "discarding in-flight transactions on close");
        }
        self.discard_all();
    }

    pub fn abort(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.discard_all();
    }

    fn discard_all(&self) {
        self.groups.clear();
        self.active.clear();
        self.locks.clear();
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_open() { Ok(()) } else { Err(StoreError::Closed) }
    }

    fn begin(&self, group: GroupId, read_only: bool) -> Arc<Transaction> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let tx = Arc::new(Transaction::new(id, group, read_only));
        self.active.insert(id, Arc::clone(&tx));
        tx
    }

    /// Returns the transaction for `group` and whether it already existed.
    /// `GroupId::AD_HOC` always yields a fresh transaction.
    pub fn create_transaction(&self, group: GroupId) -> StoreResult<(Arc<Transaction>, bool)> {
        self.ensure_open()?;
        if group.is_ad_hoc() {
            return Ok((self.begin(group, false), false));
        }
        match self.groups.entry(group) {
            Entry::Occupied(e) => Ok((Arc::clone(e.get()), true)),
            Entry::Vacant(v) => {
                let tx = self.begin(group, false);
                v.insert(Arc::clone(&tx));
                Ok((tx, false))
            }
        }
    }

    /// Transaction that only takes shared locks, used by enumerators.
    pub fn begin_read_only(&self) -> StoreResult<Arc<Transaction>> {
        self.ensure_open()?;
        Ok(self.begin(GroupId::AD_HOC, true))
    }

    pub fn get_transaction(&self, group: GroupId) -> Option<Arc<Transaction>> {
        self.groups.get(&group).map(|e| Arc::clone(e.value()))
    }

    /// Release the transaction's locks and forget it.
    pub fn remove_transaction(&self, tx: &Transaction) {
        self.release_locks(tx);
        self.active.remove(&tx.id);
        if !tx.is_ad_hoc() {
            self.groups.remove(&tx.group);
        }
    }

    pub async fn lock(
        &self,
        tx: &Transaction,
        resource: LockResource,
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> StoreResult<LockGrant> {
        let grant = self
            .locks
            .acquire(tx.id, resource, mode, deadline, cancel)
            .await?;
        tx.locks.lock().push(grant);
        Ok(grant)
    }

    pub async fn lock_table(
        &self,
        tx: &Transaction,
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> StoreResult<LockGrant> {
        self.lock(tx, self.locks.table_resource(), mode, deadline, cancel)
            .await
    }

    pub async fn lock_key(
        &self,
        tx: &Transaction,
        key: &[u8],
        mode: LockMode,
        deadline: Deadline,
        cancel: &CancellationToken,
    ) -> StoreResult<LockGrant> {
        let grant = self.lock(tx, LockResource::key(key), mode, deadline, cancel).await;
        if let Err(e) = &grant {
            tracing::debug!(tx = %tx.id, key = %hex::encode(key), ?mode, error = %e, "key lock not granted");
        }
        grant
    }

    /// Release one grant early, before the transaction ends.
    pub fn unlock(&self, tx: &Transaction, grant: LockGrant) {
        let mut held = tx.locks.lock();
        if let Some(pos) = held.iter().position(|g| *g == grant) {
            held.swap_remove(pos);
            self.locks.release(tx.id, grant);
        }
    }

    pub fn release_locks(&self, tx: &Transaction) {
        let had_locks = {
            let mut held = tx.locks.lock();
            let had = !held.is_empty();
            held.clear();
            had
        };
        if had_locks {
            self.locks.release_owner(tx.id);
        }
    }

    pub fn active_transaction_count(&self) -> usize {
        self.active.len()
    }

    pub fn lock_table_handle(&self) -> &LockTable {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager() -> TransactionManager {
        let txns = TransactionManager::new();
        txns.open();
        txns
    }

    #[test]
    fn group_transaction_is_shared() {
        let txns = manager();
        let (first, existed) = txns.create_transaction(GroupId(7)).unwrap();
        assert!(!existed);
        let (second, existed) = txns.create_transaction(GroupId(7)).unwrap();
        assert!(existed);
        assert_eq!(first.id, second.id);
        assert!(txns.get_transaction(GroupId(7)).is_some());

        txns.remove_transaction(&first);
        assert!(txns.get_transaction(GroupId(7)).is_none());
        assert_eq!(txns.active_transaction_count(), 0);
    }

    #[test]
    fn ad_hoc_transactions_are_distinct() {
        let txns = manager();
        let (a, _) = txns.create_transaction(GroupId::AD_HOC).unwrap();
        let (b, _) = txns.create_transaction(GroupId::AD_HOC).unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.is_ad_hoc());
        assert!(txns.get_transaction(GroupId::AD_HOC).is_none());
    }

    #[test]
    fn closed_manager_rejects_transactions() {
        let txns = TransactionManager::new();
        assert!(matches!(
            txns.create_transaction(GroupId(1)),
            Err(StoreError::Closed)
        ));
    }

    #[tokio::test]
    async fn removing_transaction_releases_its_locks() {
        let txns = manager();
        let cancel = CancellationToken::new();
        let deadline = || Deadline::after(Duration::from_millis(30));
        let (writer, _) = txns.create_transaction(GroupId(1)).unwrap();
        txns.lock_table(&writer, LockMode::IntentExclusive, deadline(), &cancel)
            .await
            .unwrap();
        txns.lock_key(&writer, b"k", LockMode::Exclusive, deadline(), &cancel)
            .await
            .unwrap();
        assert_eq!(writer.lock_count(), 2);

        let reader = txns.begin_read_only().unwrap();
        assert_eq!(
            txns.lock_key(&reader, b"k", LockMode::Shared, deadline(), &cancel)
                .await
                .unwrap_err(),
            StoreError::Timeout
        );

        txns.remove_transaction(&writer);
        let grant = txns
            .lock_key(&reader, b"k", LockMode::Shared, deadline(), &cancel)
            .await
            .unwrap();
        txns.unlock(&reader, grant);
        assert_eq!(reader.lock_count(), 0);
    }
}
