//! Operation records and replication stream entries.

use crate::notify::ChangeEvent;
use crate::storage::{MutationKind, RedoUndo};
use crate::types::{GroupId, SequenceNumber};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Logical operation as observers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Remove,
    Update,
    Clear,
}

impl From<MutationKind> for OperationKind {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Insert => OperationKind::Add,
            MutationKind::Update => OperationKind::Update,
            MutationKind::Delete => OperationKind::Remove,
            MutationKind::Erase | MutationKind::Restore => OperationKind::Clear,
        }
    }
}

/// One applied mutation, kept by its transaction until the transaction ends.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub kind: OperationKind,
    pub key: Option<Bytes>,
    pub old_value: Option<Bytes>,
    pub new_value: Option<Bytes>,
    pub sequence_number: SequenceNumber,
    pub group: GroupId,
    pub redo_undo: Option<RedoUndo>,
    /// Set for records reconstructed from an undo payload.
    pub compensating: bool,
}

impl OperationRecord {
    /// Notification fired when the owning transaction commits.
    pub fn change_event(&self) -> ChangeEvent {
        match self.kind {
            OperationKind::Add => ChangeEvent::Added {
                key: self.key.clone().unwrap_or_default(),
                value: self.new_value.clone().unwrap_or_default(),
            },
            OperationKind::Update => ChangeEvent::Updated {
                key: self.key.clone().unwrap_or_default(),
                old_value: self.old_value.clone(),
                new_value: self.new_value.clone().unwrap_or_default(),
            },
            OperationKind::Remove => ChangeEvent::Removed {
                key: self.key.clone().unwrap_or_default(),
                old_value: self.old_value.clone(),
            },
            OperationKind::Clear => ChangeEvent::Cleared,
        }
    }
}

/// Metadata replicated beside the redo/undo payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub kind: OperationKind,
}

/// What the orchestrator hands to the replicator for one mutation.
#[derive(Debug, Clone)]
pub struct ReplicationRecord {
    pub group: GroupId,
    pub sequence_number: SequenceNumber,
    pub metadata: OperationMetadata,
    pub redo: Bytes,
    pub undo: Bytes,
}

/// Entry of a recovery, replication, copy, or undo stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    CreateAtomicGroup {
        group: GroupId,
        sequence_number: SequenceNumber,
    },
    CommitAtomicGroup {
        group: GroupId,
        sequence_number: SequenceNumber,
    },
    RollbackAtomicGroup {
        group: GroupId,
        sequence_number: SequenceNumber,
    },
    AbortAtomicGroup {
        group: GroupId,
        sequence_number: SequenceNumber,
    },
    Redo {
        group: GroupId,
        sequence_number: SequenceNumber,
        payload: Bytes,
        /// Kept so a restarting replica can undo a group left open.
        undo: Bytes,
    },
    Undo {
        group: GroupId,
        sequence_number: SequenceNumber,
        payload: Bytes,
    },
    /// Redo-only operation outside any group.
    SingleOperation {
        sequence_number: SequenceNumber,
        payload: Bytes,
    },
    Copy {
        payload: Bytes,
    },
    RedoPassComplete,
    UndoPassComplete,
    EndOfStream,
}

impl LogEntry {
    pub fn name(&self) -> &'static str {
        match self {
            LogEntry::CreateAtomicGroup { .. } => "create-group",
            LogEntry::CommitAtomicGroup { .. } => "commit-group",
            LogEntry::RollbackAtomicGroup { .. } => "rollback-group",
            LogEntry::AbortAtomicGroup { .. } => "abort-group",
            LogEntry::Redo { .. } => "redo",
            LogEntry::Undo { .. } => "undo",
            LogEntry::SingleOperation { .. } => "single-operation",
            LogEntry::Copy { .. } => "copy",
            LogEntry::RedoPassComplete => "redo-pass-complete",
            LogEntry::UndoPassComplete => "undo-pass-complete",
            LogEntry::EndOfStream => "end-of-stream",
        }
    }

    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        match self {
            LogEntry::CreateAtomicGroup { sequence_number, .. }
            | LogEntry::CommitAtomicGroup { sequence_number, .. }
            | LogEntry::RollbackAtomicGroup { sequence_number, .. }
            | LogEntry::AbortAtomicGroup { sequence_number, .. }
            | LogEntry::Redo { sequence_number, .. }
            | LogEntry::Undo { sequence_number, .. }
            | LogEntry::SingleOperation { sequence_number, .. } => Some(*sequence_number),
            _ => None,
        }
    }
}
