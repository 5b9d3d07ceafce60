//! Replication collaborator.
//!
//! The provider reserves a sequence number before touching storage, then
//! either consumes it by replicating the operation or cancels it. Groups are
//! created, committed, and rolled back through the same replicator.

mod log;
mod loopback;

pub use log::ReplicationLog;
pub use loopback::{FaultPoint, LoopbackReplicator};

use crate::error::ReplicationError;
use crate::record::{LogEntry, ReplicationRecord};
use crate::types::{GroupId, SequenceNumber};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Ordered stream of log entries handed to the provider.
pub type EntryStream = BoxStream<'static, LogEntry>;

#[async_trait]
pub trait AtomicGroupReplicator: Send + Sync {
    fn reserve_sequence_number(&self) -> Result<SequenceNumber, ReplicationError>;

    /// Give back a reserved number that will never be replicated.
    fn cancel_sequence_number(&self, seq: SequenceNumber);

    /// Replicate one operation under its reserved sequence number.
    async fn replicate(
        &self,
        record: &ReplicationRecord,
        cancel: &CancellationToken,
    ) -> Result<SequenceNumber, ReplicationError>;

    async fn create_atomic_group(&self, cancel: &CancellationToken) -> Result<GroupId, ReplicationError>;

    /// Returns the commit's sequence number.
    async fn commit_atomic_group(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<SequenceNumber, ReplicationError>;

    /// Returns the compensating undo stream, ending with a rollback entry
    /// and end-of-stream.
    async fn rollback_atomic_group(
        &self,
        group: GroupId,
        cancel: &CancellationToken,
    ) -> Result<EntryStream, ReplicationError>;
}

/// Wrap copy-state chunks as a copy stream.
pub fn copy_stream(chunks: Vec<Bytes>) -> EntryStream {
    stream::iter(chunks)
        .map(|payload| LogEntry::Copy { payload })
        .chain(stream::iter([LogEntry::EndOfStream]))
        .boxed()
}

/// Wrap already-materialised entries as a stream.
pub fn entry_stream(entries: Vec<LogEntry>) -> EntryStream {
    stream::iter(entries).boxed()
}
