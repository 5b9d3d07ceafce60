//! Identifiers and small value types shared across the provider.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Log sequence number assigned by the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0 + 1)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Atomic group identifier.
///
/// Negative values are reserved: `AD_HOC` marks a call outside any group,
/// every other negative value is out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub i64);

impl GroupId {
    /// Sentinel for operations that run in their own ad hoc transaction.
    pub const AD_HOC: GroupId = GroupId(-1);

    pub fn is_ad_hoc(self) -> bool {
        self == Self::AD_HOC
    }

    pub fn is_out_of_range(self) -> bool {
        self.0 < 0 && !self.is_ad_hoc()
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::AD_HOC
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ad_hoc() {
            write!(f, "ad-hoc")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Replication epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Epoch {
    pub data_loss_number: u64,
    pub configuration_number: u64,
}

impl Epoch {
    pub fn new(data_loss_number: u64, configuration_number: u64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }
}

/// Role of this replica within its partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    Unknown,
    Primary,
    IdleSecondary,
    ActiveSecondary,
    None,
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaRole::Unknown => "unknown",
            ReplicaRole::Primary => "primary",
            ReplicaRole::IdleSecondary => "idle-secondary",
            ReplicaRole::ActiveSecondary => "active-secondary",
            ReplicaRole::None => "none",
        };
        f.write_str(name)
    }
}

/// Whether `open` starts from empty storage or existing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    New,
    Existing,
}

/// Severity of a fault reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultType {
    /// Replica may be restarted in place.
    Transient,
    /// Replica must be rebuilt.
    Permanent,
}

/// Read or write access granted by the hosting partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessStatus {
    Granted,
    ReconfigurationPending,
    NoWriteQuorum,
    NotPrimary,
}
