use super::SortedMapProvider;
use crate::codec::lexicographic;
use crate::config::ProviderConfig;
use crate::error::StoreResult;
use crate::partition::LocalPartition;
use crate::replicator::LoopbackReplicator;
use crate::storage::MemoryStore;
use crate::types::{OpenMode, ReplicaRole};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A provider wired to in-process collaborators: the in-memory store, the
/// loopback replicator, and a hand-driven partition.
pub struct LocalReplica {
    pub provider: Arc<SortedMapProvider>,
    pub store: Arc<MemoryStore>,
    pub replicator: Arc<LoopbackReplicator>,
    pub partition: Arc<LocalPartition>,
}

impl LocalReplica {
    pub fn new(config: ProviderConfig) -> StoreResult<Self> {
        let store = Arc::new(MemoryStore::new(lexicographic).with_max_records(config.store.max_records));
        let replicator = Arc::new(match &config.store.log_path {
            Some(path) => LoopbackReplicator::open(path)?,
            None => LoopbackReplicator::new(),
        });
        let partition = Arc::new(LocalPartition::new());
        let provider = Arc::new(SortedMapProvider::new(
            config,
            store.clone(),
            replicator.clone(),
            partition.clone(),
        ));
        Ok(Self {
            provider,
            store,
            replicator,
            partition,
        })
    }

    /// Open, replay whatever the replication log already holds, and become
    /// primary.
    pub async fn start_primary(config: ProviderConfig) -> StoreResult<Self> {
        let replica = Self::new(config)?;
        let cancel = CancellationToken::new();
        let recovering = !replica.replicator.entries().is_empty();
        let mode = if recovering { OpenMode::Existing } else { OpenMode::New };
        replica.provider.open(mode, &cancel).await?;
        if recovering {
            let stream = replica.replicator.recovery_stream();
            replica.provider.drain_recovery(stream, &cancel).await?;
            let aborted = replica.replicator.complete_recovery()?;
            if aborted > 0 {
                tracing::info!(aborted, "groups left open were rolled back");
            }
        }
        replica.provider.change_role(ReplicaRole::Primary, &cancel).await?;
        Ok(replica)
    }
}
