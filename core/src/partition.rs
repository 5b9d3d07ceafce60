//! Hosting partition: access status, fault and load reporting.

use crate::types::{AccessStatus, FaultType};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMetric {
    pub name: &'static str,
    pub value: u64,
}

pub trait PartitionHost: Send + Sync {
    fn id(&self) -> Uuid;

    fn read_status(&self) -> AccessStatus;

    fn write_status(&self) -> AccessStatus;

    fn report_fault(&self, fault: FaultType);

    fn report_load(&self, metrics: &[LoadMetric]) -> anyhow::Result<()>;
}

/// Partition hosted in this process. Statuses are set by hand.
pub struct LocalPartition {
    id: Uuid,
    read: RwLock<AccessStatus>,
    write: RwLock<AccessStatus>,
    faults: Mutex<Vec<FaultType>>,
    loads: Mutex<Vec<Vec<LoadMetric>>>,
}

impl Default for LocalPartition {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPartition {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            read: RwLock::new(AccessStatus::Granted),
            write: RwLock::new(AccessStatus::Granted),
            faults: Mutex::new(Vec::new()),
            loads: Mutex::new(Vec::new()),
        }
    }

    pub fn set_read_status(&self, status: AccessStatus) {
        *self.read.write() = status;
    }

    pub fn set_write_status(&self, status: AccessStatus) {
        *self.write.write() = status;
    }

    pub fn reported_faults(&self) -> Vec<FaultType> {
        self.faults.lock().clone()
    }

    pub fn last_load_report(&self) -> Option<Vec<LoadMetric>> {
        self.loads.lock().last().cloned()
    }

    pub fn load_report_count(&self) -> usize {
        self.loads.lock().len()
    }
}

impl PartitionHost for LocalPartition {
    fn id(&self) -> Uuid {
        self.id
    }

    fn read_status(&self) -> AccessStatus {
        *self.read.read()
    }

    fn write_status(&self) -> AccessStatus {
        *self.write.read()
    }

    fn report_fault(&self, fault: FaultType) {
        tracing::warn!(partition = %self.id, ?fault, "fault reported");
        self.faults.lock().push(fault);
    }

    fn report_load(&self, metrics: &[LoadMetric]) -> anyhow::Result<()> {
        self.loads.lock().push(metrics.to_vec());
        Ok(())
    }
}
