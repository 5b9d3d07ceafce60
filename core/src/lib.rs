//! Tandem - replicated, ordered key-value provider

pub mod codec;
pub mod config;
pub mod error;
pub mod lock;
pub mod map;
pub mod notify;
pub mod partition;
pub mod progress;
pub mod provider;
pub mod record;
pub mod replicator;
pub mod storage;
pub mod txn;
pub mod types;

pub use codec::{Codec, KeyComparator, lexicographic};
pub use config::ProviderConfig;
pub use error::{ReplicationError, StoreError, StoreResult};
pub use map::{AtomicGroups, ChangeSource, MapChange, MapRead, MapWrite, ReplicatedMap};
pub use notify::{ChangeEvent, ChangeObserver};
pub use provider::{
    CallOptions, DrainMode, EnumerationOptions, IsolationLevel, LocalReplica, RangeEnumerator,
    RemoveSummary, SortedMapProvider,
};
pub use types::{AccessStatus, Epoch, FaultType, GroupId, OpenMode, ReplicaRole, SequenceNumber};
