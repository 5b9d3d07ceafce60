use super::*;
use crate::config::{BackoffConfig, StoreConfig};
use crate::error::ReplicationError;
use crate::lock::LockResource;
use crate::notify::ChangeEvent;
use crate::record::LogEntry;
use crate::replicator::FaultPoint;
use crate::storage::OrderedStore;
use crate::types::{Epoch, OpenMode, SequenceNumber};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use tempfile::tempdir;

fn b(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn fast_config() -> ProviderConfig {
    ProviderConfig {
        backoff: BackoffConfig {
            initial_ms: 1,
            max_ms: 4,
        },
        ..ProviderConfig::default()
    }
}

async fn primary() -> LocalReplica {
    LocalReplica::start_primary(fast_config()).await.unwrap()
}

async fn secondary(config: ProviderConfig) -> LocalReplica {
    let replica = LocalReplica::new(config).unwrap();
    let cancel = CancellationToken::new();
    replica.provider.open(OpenMode::New, &cancel).await.unwrap();
    replica
        .provider
        .change_role(ReplicaRole::IdleSecondary, &cancel)
        .await
        .unwrap();
    replica
        .provider
        .change_role(ReplicaRole::ActiveSecondary, &cancel)
        .await
        .unwrap();
    replica
}

fn record_events(provider: &SortedMapProvider) -> Arc<Mutex<Vec<ChangeEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    provider.subscribe(Arc::new(move |event: &ChangeEvent| -> anyhow::Result<()> {
        sink.lock().push(event.clone());
        Ok(())
    }));
    seen
}

fn ad_hoc() -> CallOptions {
    CallOptions::default()
}

// Point operations

#[tokio::test]
async fn add_then_get() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("1")));
    assert_eq!(p.get(&b("zz"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.count().await.unwrap(), 1);
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn duplicate_add_fails_and_try_add_reports_false() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    assert_eq!(p.add(&b("a"), &b("2"), &ad_hoc()).await.unwrap_err(), StoreError::DuplicateKey);
    assert!(!p.try_add(&b("a"), &b("2"), &ad_hoc()).await.unwrap());
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("1")));
    assert_eq!(replica.replicator.outstanding_reservations(), 0);
    assert!(!p.is_faulted());
}

#[tokio::test]
async fn update_and_conditional_variants() {
    let replica = primary().await;
    let p = &replica.provider;

    assert_eq!(p.update(&b("a"), &b("1"), &ad_hoc()).await.unwrap_err(), StoreError::KeyNotFound);
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();
    assert_eq!(p.update(&b("a"), &b("2"), &ad_hoc()).await.unwrap(), b("1"));

    assert!(!p.try_update(&b("a"), &b("3"), &b("1"), &ad_hoc()).await.unwrap());
    assert!(p.try_update(&b("a"), &b("3"), &b("2"), &ad_hoc()).await.unwrap());
    assert!(!p.remove_if(&b("a"), &b("2"), &ad_hoc()).await.unwrap());
    assert!(p.remove_if(&b("a"), &b("3"), &ad_hoc()).await.unwrap());
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
}

#[tokio::test]
async fn remove_upsert_and_get_or_add() {
    let replica = primary().await;
    let p = &replica.provider;

    assert_eq!(p.add_or_update(&b("k"), &b("1"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.add_or_update(&b("k"), &b("2"), &ad_hoc()).await.unwrap(), Some(b("1")));
    assert_eq!(p.get_or_add(&b("k"), &b("9"), &ad_hoc()).await.unwrap(), b("2"));
    assert_eq!(p.get_or_add(&b("n"), &b("9"), &ad_hoc()).await.unwrap(), b("9"));

    assert_eq!(p.remove(&b("k"), &ad_hoc()).await.unwrap(), Some(b("2")));
    assert_eq!(p.remove(&b("k"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.count().await.unwrap(), 1);
}

#[tokio::test]
async fn argument_checks() {
    let replica = primary().await;
    let p = &replica.provider;

    assert_eq!(
        p.add(&b("a"), &b("1"), &CallOptions::in_group(GroupId(-5)))
            .await
            .unwrap_err(),
        StoreError::ArgumentOutOfRange("atomic group id")
    );
    assert!(matches!(
        p.add(&b("a"), &b("1"), &CallOptions::in_group(GroupId(99))).await,
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(!p.is_faulted());
}

#[tokio::test]
async fn empty_key_is_an_ordinary_key() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("2"), &ad_hoc()).await.unwrap();
    p.add(&Bytes::new(), &b("1"), &ad_hoc()).await.unwrap();

    assert_eq!(p.get(&Bytes::new(), &ad_hoc()).await.unwrap(), Some(b("1")));
    assert_eq!(p.add(&Bytes::new(), &b("9"), &ad_hoc()).await.unwrap_err(), StoreError::DuplicateKey);
    assert_eq!(replica.store.records(), vec![(Bytes::new(), b("1")), (b("a"), b("2"))]);
    assert_eq!(p.remove(&Bytes::new(), &ad_hoc()).await.unwrap(), Some(b("1")));
    assert_eq!(p.count().await.unwrap(), 1);
}

#[tokio::test]
async fn cancelled_call_leaves_nothing_behind() {
    let replica = primary().await;
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    cancel.cancel();
    let opts = ad_hoc().with_cancel(cancel);

    assert_eq!(p.add(&b("a"), &b("1"), &opts).await.unwrap_err(), StoreError::Cancelled);
    assert!(!p.try_add(&b("a"), &b("1"), &opts).await.unwrap());
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(replica.replicator.outstanding_reservations(), 0);
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

// Gates and faults

#[tokio::test]
async fn write_status_gates_mutations() {
    let replica = primary().await;
    let p = &replica.provider;

    replica.partition.set_write_status(AccessStatus::NotPrimary);
    assert_eq!(p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap_err(), StoreError::NotPrimary);
    replica.partition.set_write_status(AccessStatus::ReconfigurationPending);
    assert_eq!(p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap_err(), StoreError::NotWritable);

    // reads are unaffected
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
    replica.partition.set_read_status(AccessStatus::NoWriteQuorum);
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap_err(), StoreError::NotReadable);
}

#[tokio::test]
async fn resource_exhaustion_faults_transiently() {
    let config = ProviderConfig {
        store: StoreConfig {
            max_records: Some(1),
            log_path: None,
        },
        ..fast_config()
    };
    let replica = LocalReplica::start_primary(config).await.unwrap();
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    assert!(matches!(
        p.add(&b("b"), &b("2"), &ad_hoc()).await,
        Err(StoreError::ResourceExhausted(_))
    ));
    assert_eq!(p.fault(), Some(FaultType::Transient));
    assert_eq!(replica.partition.reported_faults(), vec![FaultType::Transient]);
    assert_eq!(replica.replicator.outstanding_reservations(), 0);
    assert_eq!(
        p.get(&b("a"), &ad_hoc()).await.unwrap_err(),
        StoreError::Faulted(FaultType::Transient)
    );
}

#[tokio::test]
async fn transient_replication_failure_is_retried() {
    let replica = primary().await;
    replica
        .replicator
        .inject_fault(FaultPoint::Replicate, ReplicationError::Transient("busy".into()));
    replica
        .replicator
        .inject_fault(FaultPoint::Reserve, ReplicationError::Transient("busy".into()));

    replica.provider.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();
    assert!(!replica.provider.is_faulted());
    assert!(matches!(
        replica.replicator.entries().last(),
        Some(LogEntry::SingleOperation { .. })
    ));
}

#[tokio::test]
async fn non_retryable_replication_failure_faults_permanently() {
    let replica = primary().await;
    let p = &replica.provider;
    replica
        .replicator
        .inject_fault(FaultPoint::Replicate, ReplicationError::NotPrimary);

    assert!(matches!(
        p.add(&b("a"), &b("1"), &ad_hoc()).await,
        Err(StoreError::NonRetryable(_))
    ));
    assert_eq!(p.fault(), Some(FaultType::Permanent));
    assert_eq!(
        p.add(&b("b"), &b("1"), &ad_hoc()).await.unwrap_err(),
        StoreError::Faulted(FaultType::Permanent)
    );
}

#[tokio::test]
async fn lock_wait_times_out() {
    let replica = primary().await;
    replica
        .replicator
        .set_replication_delay(Duration::from_millis(300));

    let provider = Arc::clone(&replica.provider);
    let writer = tokio::spawn(async move { provider.add(&b("a"), &b("1"), &CallOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let short = ad_hoc().with_timeout(Duration::from_millis(20));
    assert_eq!(replica.provider.get(&b("a"), &short).await.unwrap_err(), StoreError::Timeout);
    assert!(!replica.provider.try_add(&b("a"), &b("2"), &short).await.unwrap());

    writer.await.unwrap().unwrap();
    assert_eq!(replica.provider.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("1")));
}

// Atomic groups

#[tokio::test]
async fn group_commit_delivers_notifications_in_order() {
    let replica = primary().await;
    let p = &replica.provider;
    let events = record_events(p);
    let cancel = CancellationToken::new();

    let group = p.create_group(&cancel).await.unwrap();
    let in_group = CallOptions::in_group(group);
    p.add(&b("a"), &b("1"), &in_group).await.unwrap();
    p.add(&b("b"), &b("2"), &in_group).await.unwrap();
    assert!(events.lock().is_empty());
    assert_eq!(p.get(&b("a"), &in_group).await.unwrap(), Some(b("1")));

    p.commit_group(group, &cancel).await.unwrap();
    assert_eq!(
        *events.lock(),
        vec![
            ChangeEvent::Added {
                key: b("a"),
                value: b("1")
            },
            ChangeEvent::Added {
                key: b("b"),
                value: b("2")
            },
        ]
    );
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn group_rollback_undoes_without_notifying() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("keep"), &b("0"), &ad_hoc()).await.unwrap();
    let events = record_events(p);
    let cancel = CancellationToken::new();

    let group = p.create_group(&cancel).await.unwrap();
    let in_group = CallOptions::in_group(group);
    p.add(&b("a"), &b("1"), &in_group).await.unwrap();
    p.update(&b("keep"), &b("changed"), &in_group).await.unwrap();
    p.rollback_group(group, &cancel).await.unwrap();

    assert!(events.lock().is_empty());
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.get(&b("keep"), &ad_hoc()).await.unwrap(), Some(b("0")));
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn rolled_back_clear_reports_cleared() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();
    let events = record_events(p);
    let cancel = CancellationToken::new();

    let group = p.create_group(&cancel).await.unwrap();
    p.clear(&CallOptions::in_group(group)).await.unwrap();
    p.rollback_group(group, &cancel).await.unwrap();

    assert_eq!(*events.lock(), vec![ChangeEvent::Cleared]);
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("1")));
}

#[tokio::test]
async fn ad_hoc_clear_empties_the_map() {
    let replica = primary().await;
    let p = &replica.provider;
    let keys = [b("a"), b("b"), b("c")];
    for key in &keys {
        p.add(key, &b("v"), &ad_hoc()).await.unwrap();
    }
    let events = record_events(p);

    p.clear(&ad_hoc()).await.unwrap();
    assert_eq!(p.count().await.unwrap(), 0);
    for key in &keys {
        assert_eq!(p.get(key, &ad_hoc()).await.unwrap(), None);
    }
    assert_eq!(*events.lock(), vec![ChangeEvent::Cleared]);
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn clear_and_point_writes_exclude_each_other() {
    let replica = primary().await;
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    let short = ad_hoc().with_timeout(Duration::from_millis(20));

    // a point write waits for an uncommitted clear
    let clearing = p.create_group(&cancel).await.unwrap();
    p.clear(&CallOptions::in_group(clearing)).await.unwrap();
    assert_eq!(p.add(&b("x"), &b("1"), &short).await.unwrap_err(), StoreError::Timeout);

    let provider = Arc::clone(p);
    let writer = tokio::spawn(async move { provider.add(&b("x"), &b("1"), &CallOptions::default()).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());
    p.commit_group(clearing, &cancel).await.unwrap();
    writer.await.unwrap().unwrap();
    assert_eq!(p.get(&b("x"), &ad_hoc()).await.unwrap(), Some(b("1")));

    // a clear waits for an uncommitted point write
    let writing = p.create_group(&cancel).await.unwrap();
    p.add(&b("y"), &b("2"), &CallOptions::in_group(writing)).await.unwrap();
    assert_eq!(p.clear(&short).await.unwrap_err(), StoreError::Timeout);
    assert_eq!(p.count().await.unwrap(), 2);

    p.commit_group(writing, &cancel).await.unwrap();
    p.clear(&ad_hoc()).await.unwrap();
    assert_eq!(p.count().await.unwrap(), 0);
    assert!(!p.is_faulted());
}

#[tokio::test]
async fn panicking_observer_does_not_break_commit() {
    let replica = primary().await;
    let p = &replica.provider;
    p.subscribe(Arc::new(|_: &ChangeEvent| -> anyhow::Result<()> {
        panic!("observer bug")
    }));
    let events = record_events(p);
    let cancel = CancellationToken::new();

    let group = p.create_group(&cancel).await.unwrap();
    p.add(&b("a"), &b("1"), &CallOptions::in_group(group)).await.unwrap();
    p.commit_group(group, &cancel).await.unwrap();
    p.add(&b("b"), &b("2"), &ad_hoc()).await.unwrap();

    assert_eq!(
        *events.lock(),
        vec![
            ChangeEvent::Added {
                key: b("a"),
                value: b("1")
            },
            ChangeEvent::Added {
                key: b("b"),
                value: b("2")
            },
        ]
    );
    assert!(!p.is_faulted());
    assert_eq!(p.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn load_metrics_reach_the_partition() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add_all(&[(b("a"), b("1")), (b("b"), b("2"))], &ad_hoc())
        .await
        .unwrap();
    let before = replica.partition.load_report_count();

    p.report_load_metrics();
    assert_eq!(replica.partition.load_report_count(), before + 1);
    let report = replica.partition.last_load_report().unwrap();
    let names: Vec<&str> = report.iter().map(|m| m.name).collect();
    assert_eq!(
        names,
        vec!["RecordCount", "PageCount", "MemoryUsageBytes", "StorageUsageBytes"]
    );
    assert_eq!(report[0].value, 2);
    assert_eq!(p.statistics_snapshot().record_count, 2);
}

#[tokio::test]
async fn group_locks_block_outside_writers_until_abort() {
    let replica = primary().await;
    let p = &replica.provider;
    let cancel = CancellationToken::new();

    let group = p.create_group(&cancel).await.unwrap();
    p.add(&b("a"), &b("1"), &CallOptions::in_group(group)).await.unwrap();

    let short = ad_hoc().with_timeout(Duration::from_millis(20));
    assert_eq!(p.update(&b("a"), &b("2"), &short).await.unwrap_err(), StoreError::Timeout);

    p.atomic_group_abort(group).unwrap();
    assert_eq!(p.update(&b("a"), &b("2"), &ad_hoc()).await.unwrap(), b("1"));
}

// Bulk

#[tokio::test]
async fn bulk_add_with_duplicate_rolls_back_everything() {
    let replica = primary().await;
    let p = &replica.provider;
    let items = vec![(b("x"), b("1")), (b("y"), b("2")), (b("x"), b("3"))];

    assert_eq!(p.add_all(&items, &ad_hoc()).await.unwrap_err(), StoreError::DuplicateKey);
    assert_eq!(p.get(&b("x"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.get(&b("y"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.transactions().active_transaction_count(), 0);
    assert!(!p.is_faulted());
}

#[tokio::test]
async fn bulk_remove_reports_both_counts() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add_all(&[(b("a"), b("1")), (b("b"), b("2"))], &ad_hoc())
        .await
        .unwrap();

    let summary = p
        .remove_all(&[b("a"), b("b"), b("missing")], &ad_hoc())
        .await
        .unwrap();
    assert_eq!(
        summary,
        RemoveSummary {
            removed: 2,
            requested: 3
        }
    );
    assert!(summary.any());
    assert!(!summary.all());
    assert_eq!(p.count().await.unwrap(), 0);
}

#[tokio::test]
async fn bulk_update_checks_lengths_and_existence() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    assert!(matches!(
        p.update_all(&[b("a")], &[b("1"), b("2")], &ad_hoc()).await,
        Err(StoreError::InvalidArgument(_))
    ));
    assert_eq!(
        p.update_all(&[b("a"), b("nope")], &[b("5"), b("6")], &ad_hoc())
            .await
            .unwrap_err(),
        StoreError::KeyNotFound
    );
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("1")));

    p.update_all(&[b("a")], &[b("7")], &ad_hoc()).await.unwrap();
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), Some(b("7")));
}

#[tokio::test]
async fn replace_moves_a_value() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("5"), &ad_hoc()).await.unwrap();

    assert!(p.replace(&b("a"), &b("b"), None, &ad_hoc()).await.unwrap());
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
    assert_eq!(p.get(&b("b"), &ad_hoc()).await.unwrap(), Some(b("5")));

    assert!(!p.replace(&b("gone"), &b("c"), None, &ad_hoc()).await.unwrap());
    assert_eq!(p.get(&b("c"), &ad_hoc()).await.unwrap(), None);

    assert!(p.replace(&b("b"), &b("c"), Some(&b("9")), &ad_hoc()).await.unwrap());
    assert_eq!(p.get(&b("c"), &ad_hoc()).await.unwrap(), Some(b("9")));
}

// Stream application

#[tokio::test]
async fn secondary_replays_replication_stream() {
    let source = primary().await;
    let p = &source.provider;
    let cancel = CancellationToken::new();
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();
    p.add(&b("b"), &b("2"), &ad_hoc()).await.unwrap();
    let group = p.create_group(&cancel).await.unwrap();
    p.add(&b("c"), &b("3"), &CallOptions::in_group(group)).await.unwrap();
    p.remove(&b("a"), &CallOptions::in_group(group)).await.unwrap();
    p.commit_group(group, &cancel).await.unwrap();

    let target = secondary(fast_config()).await;
    let events = record_events(&target.provider);
    let drained = target
        .provider
        .drain_replication(source.replicator.replication_stream(), &cancel)
        .await
        .unwrap();

    assert!(drained);
    assert_eq!(target.store.records(), source.store.records());
    assert_eq!(
        *events.lock(),
        vec![
            ChangeEvent::Added {
                key: b("a"),
                value: b("1")
            },
            ChangeEvent::Added {
                key: b("b"),
                value: b("2")
            },
            ChangeEvent::Added {
                key: b("c"),
                value: b("3")
            },
            ChangeEvent::Removed {
                key: b("a"),
                old_value: Some(b("1"))
            },
        ]
    );
    assert_eq!(target.provider.get(&b("c"), &ad_hoc()).await.unwrap(), Some(b("3")));
    assert_eq!(target.provider.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn secondary_without_concurrent_reads_applies_silently() {
    let source = primary().await;
    let cancel = CancellationToken::new();
    source.provider.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    let config = ProviderConfig {
        concurrent_reads: false,
        ..fast_config()
    };
    let target = secondary(config).await;
    let events = record_events(&target.provider);
    target
        .provider
        .drain_replication(source.replicator.replication_stream(), &cancel)
        .await
        .unwrap();

    assert_eq!(target.store.records(), vec![(b("a"), b("1"))]);
    assert!(events.lock().is_empty());
}

#[tokio::test]
async fn secondary_replays_rollback() {
    let source = primary().await;
    let p = &source.provider;
    let cancel = CancellationToken::new();
    let group = p.create_group(&cancel).await.unwrap();
    p.add(&b("a"), &b("1"), &CallOptions::in_group(group)).await.unwrap();
    p.rollback_group(group, &cancel).await.unwrap();

    let target = secondary(fast_config()).await;
    target
        .provider
        .drain_replication(source.replicator.replication_stream(), &cancel)
        .await
        .unwrap();
    assert!(target.store.records().is_empty());
    assert_eq!(target.provider.transactions().active_transaction_count(), 0);
}

#[tokio::test]
async fn restart_recovers_and_undoes_open_groups() {
    let dir = tempdir().unwrap();
    let config = ProviderConfig {
        store: StoreConfig {
            max_records: None,
            log_path: Some(dir.path().join("replication.log")),
        },
        ..fast_config()
    };

    {
        let replica = LocalReplica::start_primary(config.clone()).await.unwrap();
        let p = &replica.provider;
        p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();
        p.add(&b("b"), &b("2"), &ad_hoc()).await.unwrap();
        let group = p.create_group(&CancellationToken::new()).await.unwrap();
        p.add(&b("c"), &b("3"), &CallOptions::in_group(group)).await.unwrap();
    }

    let replica = LocalReplica::start_primary(config).await.unwrap();
    assert!(replica.provider.is_readable());
    assert_eq!(replica.store.records(), vec![(b("a"), b("1")), (b("b"), b("2"))]);
    assert_eq!(replica.provider.transactions().active_transaction_count(), 0);

    replica.provider.add(&b("d"), &b("4"), &ad_hoc()).await.unwrap();
    assert_eq!(replica.provider.count().await.unwrap(), 3);
}

#[tokio::test]
async fn open_group_is_undone_only_once_across_restarts() {
    let dir = tempdir().unwrap();
    let config = ProviderConfig {
        store: StoreConfig {
            max_records: None,
            log_path: Some(dir.path().join("replication.log")),
        },
        ..fast_config()
    };

    {
        let replica = LocalReplica::start_primary(config.clone()).await.unwrap();
        let p = &replica.provider;
        let group = p.create_group(&CancellationToken::new()).await.unwrap();
        p.add(&b("k"), &b("uncommitted"), &CallOptions::in_group(group))
            .await
            .unwrap();
    }

    {
        let replica = LocalReplica::start_primary(config.clone()).await.unwrap();
        let p = &replica.provider;
        assert_eq!(p.get(&b("k"), &ad_hoc()).await.unwrap(), None);
        p.add(&b("k"), &b("committed"), &ad_hoc()).await.unwrap();
    }

    let replica = LocalReplica::start_primary(config).await.unwrap();
    assert_eq!(
        replica.provider.get(&b("k"), &ad_hoc()).await.unwrap(),
        Some(b("committed"))
    );
    assert_eq!(replica.store.records(), vec![(b("k"), b("committed"))]);
    assert_eq!(replica.replicator.complete_recovery().unwrap(), 0);
}

#[tokio::test]
async fn existing_primary_is_unreadable_until_redo_pass_completes() {
    let replica = LocalReplica::new(fast_config()).unwrap();
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    p.open(OpenMode::Existing, &cancel).await.unwrap();
    p.change_role(ReplicaRole::Primary, &cancel).await.unwrap();

    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap_err(), StoreError::NotReadable);
    p.recovery_operation(LogEntry::RedoPassComplete).await.unwrap();
    assert_eq!(p.get(&b("a"), &ad_hoc()).await.unwrap(), None);
}

#[tokio::test]
async fn copy_stream_rebuilds_a_replica() {
    let source = primary().await;
    let items: Vec<(Bytes, Bytes)> = (0..300)
        .map(|i| (b(&format!("k{i:04}")), b(&i.to_string())))
        .collect();
    source.provider.add_all(&items, &ad_hoc()).await.unwrap();

    let target = LocalReplica::new(fast_config()).unwrap();
    let cancel = CancellationToken::new();
    target.provider.open(OpenMode::New, &cancel).await.unwrap();
    target
        .provider
        .change_role(ReplicaRole::IdleSecondary, &cancel)
        .await
        .unwrap();

    let copy = source
        .provider
        .get_copy_state(source.provider.last_committed_sequence_number())
        .unwrap();
    assert!(target.provider.drain_copy(copy, &cancel).await.unwrap());
    assert_eq!(target.store.records(), source.store.records());
}

#[tokio::test]
async fn stream_without_end_marker_reports_incomplete() {
    let replica = secondary(fast_config()).await;
    let stream = crate::replicator::entry_stream(vec![LogEntry::SingleOperation {
        sequence_number: SequenceNumber(1),
        payload: crate::storage::encode_op(&crate::storage::StoreOp::Insert {
            key: b("a"),
            value: b("1"),
        })
        .unwrap(),
    }]);

    let drained = replica
        .provider
        .drain_replication(stream, &CancellationToken::new())
        .await
        .unwrap();
    assert!(!drained);
    assert_eq!(replica.store.records(), vec![(b("a"), b("1"))]);
}

#[tokio::test]
async fn corrupt_payload_faults_the_replica() {
    let replica = secondary(fast_config()).await;
    let result = replica
        .provider
        .replication_operation(LogEntry::SingleOperation {
            sequence_number: SequenceNumber(1),
            payload: b("not a payload"),
        })
        .await;

    assert!(result.is_err());
    assert_eq!(replica.provider.fault(), Some(FaultType::Transient));
}

// Enumeration

async fn seeded() -> LocalReplica {
    let replica = primary().await;
    let items: Vec<(Bytes, Bytes)> = ["a1", "a2", "b1", "b2", "c1"]
        .iter()
        .map(|k| (b(k), b(&k.to_uppercase())))
        .collect();
    replica.provider.add_all(&items, &ad_hoc()).await.unwrap();
    replica
}

async fn keys(enumerator: &mut RangeEnumerator) -> Vec<Bytes> {
    let mut out = Vec::new();
    while let Some((key, _)) = enumerator.next().await.unwrap() {
        out.push(key);
    }
    out
}

#[tokio::test]
async fn enumerates_prefix_and_range() {
    let replica = seeded().await;
    let p = &replica.provider;

    let mut by_prefix = p
        .create_enumerator(EnumerationOptions::default().with_prefix(b("a")))
        .await
        .unwrap();
    assert_eq!(keys(&mut by_prefix).await, vec![b("a1"), b("a2")]);

    let mut by_range = p
        .create_enumerator(EnumerationOptions::default().with_range(Some(b("b1")), Some(b("c1"))))
        .await
        .unwrap();
    assert_eq!(keys(&mut by_range).await, vec![b("b1"), b("b2")]);

    by_range.reset();
    assert_eq!(keys(&mut by_range).await, vec![b("b1"), b("b2")]);

    let end_only = EnumerationOptions {
        end: Some(b("b")),
        ..EnumerationOptions::default()
    };
    assert_eq!(
        p.create_enumerator(end_only).await.err(),
        Some(StoreError::NullArgument("prefix"))
    );
}

#[tokio::test]
async fn serializable_enumerator_blocks_writers() {
    let replica = seeded().await;
    let p = &replica.provider;

    let enumerator = p
        .create_enumerator(EnumerationOptions::default().with_isolation(IsolationLevel::StrictSerializable))
        .await
        .unwrap();
    let short = ad_hoc().with_timeout(Duration::from_millis(20));
    assert_eq!(p.add(&b("d1"), &b("D1"), &short).await.unwrap_err(), StoreError::Timeout);

    enumerator.close();
    p.add(&b("d1"), &b("D1"), &ad_hoc()).await.unwrap();
}

#[tokio::test]
async fn unprotected_enumerator_sees_concurrent_writes() {
    let replica = seeded().await;
    let p = &replica.provider;

    let mut enumerator = p
        .create_enumerator(EnumerationOptions::default().with_isolation(IsolationLevel::Unprotected))
        .await
        .unwrap();
    assert_eq!(enumerator.next().await.unwrap().map(|(k, _)| k), Some(b("a1")));
    p.add(&b("a15"), &b("A15"), &ad_hoc()).await.unwrap();
    assert_eq!(enumerator.next().await.unwrap().map(|(k, _)| k), Some(b("a15")));
}

#[tokio::test]
async fn repeatable_keeps_key_locks_until_close() {
    let replica = seeded().await;
    let p = &replica.provider;
    let locks = p.transactions().lock_table_handle();

    let mut committed = p.create_enumerator(EnumerationOptions::default()).await.unwrap();
    assert_eq!(keys(&mut committed).await.len(), 5);
    assert_eq!(locks.holder_count(LockResource::key(b"a1")), 0);
    assert_eq!(locks.holder_count(locks.table_resource()), 0);

    let mut repeatable = p
        .create_enumerator(EnumerationOptions::default().with_isolation(IsolationLevel::Repeatable))
        .await
        .unwrap();
    assert_eq!(keys(&mut repeatable).await.len(), 5);
    assert_eq!(locks.holder_count(LockResource::key(b"a1")), 1);

    let short = ad_hoc().with_timeout(Duration::from_millis(20));
    assert_eq!(p.update(&b("a1"), &b("x"), &short).await.unwrap_err(), StoreError::Timeout);

    repeatable.close();
    assert_eq!(locks.holder_count(LockResource::key(b"a1")), 0);
    p.update(&b("a1"), &b("x"), &ad_hoc()).await.unwrap();
}

#[tokio::test]
async fn enumerator_as_stream() {
    use futures::StreamExt;

    let replica = seeded().await;
    let enumerator = replica
        .provider
        .create_enumerator(EnumerationOptions::default().with_prefix(b("b")))
        .await
        .unwrap();
    let items: Vec<(Bytes, Bytes)> = enumerator
        .into_stream()
        .map(|item| item.unwrap())
        .collect()
        .await;
    assert_eq!(items, vec![(b("b1"), b("B1")), (b("b2"), b("B2"))]);
}

// Lifecycle

#[tokio::test]
async fn role_transitions() {
    let replica = LocalReplica::new(fast_config()).unwrap();
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    p.open(OpenMode::New, &cancel).await.unwrap();

    assert!(!p.is_readable());
    assert!(matches!(
        p.change_role(ReplicaRole::ActiveSecondary, &cancel).await,
        Err(StoreError::InvalidArgument(_))
    ));
    p.change_role(ReplicaRole::IdleSecondary, &cancel).await.unwrap();
    p.change_role(ReplicaRole::IdleSecondary, &cancel).await.unwrap();
    assert!(matches!(
        p.change_role(ReplicaRole::Primary, &cancel).await,
        Err(StoreError::InvalidArgument(_))
    ));
    p.change_role(ReplicaRole::ActiveSecondary, &cancel).await.unwrap();
    assert!(p.is_readable());
    assert!(!p.is_writable());

    p.change_role(ReplicaRole::Primary, &cancel).await.unwrap();
    assert!(p.is_writable());
    assert!(matches!(
        p.change_role(ReplicaRole::Unknown, &cancel).await,
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(replica.partition.load_report_count() >= 1);

    p.change_role(ReplicaRole::None, &cancel).await.unwrap();
    assert_eq!(p.role(), ReplicaRole::None);
    assert!(!p.is_readable());
}

#[tokio::test]
async fn faulted_replica_may_only_drop_its_role() {
    let replica = primary().await;
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    replica
        .replicator
        .inject_fault(FaultPoint::Replicate, ReplicationError::Closed);
    assert!(p.add(&b("a"), &b("1"), &ad_hoc()).await.is_err());
    assert!(p.is_faulted());

    assert_eq!(
        p.change_role(ReplicaRole::ActiveSecondary, &cancel).await.unwrap_err(),
        StoreError::Faulted(FaultType::Permanent)
    );
    assert!(p.update_epoch(Epoch::new(0, 2), SequenceNumber(1), &cancel).await.is_err());

    p.change_role(ReplicaRole::None, &cancel).await.unwrap();
    assert!(!p.is_faulted());
}

#[tokio::test]
async fn epoch_history_is_bounded() {
    let config = ProviderConfig {
        max_progress_entries: 2,
        ..fast_config()
    };
    let replica = LocalReplica::start_primary(config).await.unwrap();
    let p = &replica.provider;
    let cancel = CancellationToken::new();
    for n in 1..=3 {
        p.update_epoch(Epoch::new(0, n), SequenceNumber(n * 10), &cancel)
            .await
            .unwrap();
    }

    let progress = p.progress();
    assert_eq!(progress.len(), 2);
    assert_eq!(progress[0].epoch, Epoch::new(0, 2));
    assert_eq!(p.current_epoch(), Some(Epoch::new(0, 3)));
}

#[tokio::test]
async fn checkpoint_and_stability_pass_through() {
    let replica = primary().await;
    let p = &replica.provider;
    p.add(&b("a"), &b("1"), &ad_hoc()).await.unwrap();

    let seq = p.last_committed_sequence_number();
    assert!(seq > SequenceNumber::ZERO);
    assert_eq!(replica.store.stable_sequence_number(), seq);
    p.checkpoint(seq).await.unwrap();
    assert_eq!(replica.store.checkpointed_sequence_number(), seq);
    assert!(!p.on_data_loss().await.unwrap());

    p.close(&CancellationToken::new()).await.unwrap();
    assert_eq!(replica.store.statistics().record_count, 1);
}
