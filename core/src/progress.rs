use crate::types::{Epoch, SequenceNumber};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEntry {
    pub epoch: Epoch,
    /// Last sequence number of the epoch before `epoch`.
    pub previous_epoch_last_sequence_number: SequenceNumber,
}

/// Epoch history, oldest first, bounded in length.
#[derive(Debug, Clone)]
pub struct ProgressVector {
    entries: VecDeque<ProgressEntry>,
    capacity: usize,
}

impl ProgressVector {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an epoch. Repeating the current epoch is ignored.
    pub fn push(&mut self, epoch: Epoch, previous_epoch_last_sequence_number: SequenceNumber) {
        if self.current().map(|e| e.epoch) == Some(epoch) {
            return;
        }
        self.entries.push_back(ProgressEntry {
            epoch,
            previous_epoch_last_sequence_number,
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn current(&self) -> Option<&ProgressEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ProgressEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_entries_fall_off() {
        let mut progress = ProgressVector::new(3);
        for i in 1..=5u64 {
            progress.push(Epoch::new(1, i), SequenceNumber(i * 10));
        }
        assert_eq!(progress.len(), 3);
        let first = progress.entries().next().unwrap();
        assert_eq!(first.epoch, Epoch::new(1, 3));
        assert_eq!(progress.current().unwrap().previous_epoch_last_sequence_number, SequenceNumber(50));
    }

    #[test]
    fn repeated_epoch_is_ignored() {
        let mut progress = ProgressVector::new(8);
        progress.push(Epoch::new(0, 1), SequenceNumber(0));
        progress.push(Epoch::new(0, 1), SequenceNumber(4));
        assert_eq!(progress.len(), 1);
    }
}
