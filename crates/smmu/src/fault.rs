use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use smmu_types::{FaultRecord, FaultType, StreamId};

use crate::sync::lock;

/// Capacity of a handler created with [`FaultHandler::new`].
pub const DEFAULT_FAULT_LOG_SIZE: usize = 1024;

/// Collects fault records, oldest first. One handler may be attached to many streams.
///
/// The log is bounded: once it holds `capacity` records, each new record discards the oldest.
#[derive(Debug)]
pub struct FaultHandler {
    log: Mutex<FaultLog>,
}

#[derive(Debug)]
struct FaultLog {
    records: VecDeque<FaultRecord>,
    capacity: usize,
}

impl FaultLog {
    fn trim(&mut self) -> usize {
        let excess = self.records.len().saturating_sub(self.capacity);
        self.records.drain(..excess);
        excess
    }
}

pub type SharedFaultHandler = Arc<FaultHandler>;

impl Default for FaultHandler {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FAULT_LOG_SIZE)
    }
}

impl FaultHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// A zero capacity is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            log: Mutex::new(FaultLog {
                records: VecDeque::with_capacity(capacity.min(DEFAULT_FAULT_LOG_SIZE)),
                capacity,
            }),
        }
    }

    pub fn new_shared() -> SharedFaultHandler {
        Arc::new(Self::new())
    }

    /// Returns `true` if the oldest record was discarded to make room.
    pub fn record_fault(&self, record: FaultRecord) -> bool {
        let mut log = lock(&self.log);
        log.records.push_back(record);
        log.trim() > 0
    }

    pub fn capacity(&self) -> usize {
        lock(&self.log).capacity
    }

    /// Shrinking keeps the newest records. Returns how many were discarded.
    pub fn set_capacity(&self, capacity: usize) -> usize {
        let mut log = lock(&self.log);
        log.capacity = capacity.max(1);
        log.trim()
    }

    pub fn faults(&self) -> Vec<FaultRecord> {
        lock(&self.log).records.iter().copied().collect()
    }

    pub fn faults_for_stream(&self, stream_id: StreamId) -> Vec<FaultRecord> {
        lock(&self.log)
            .records
            .iter()
            .filter(|r| r.stream_id == stream_id)
            .copied()
            .collect()
    }

    pub fn count_of(&self, fault_type: FaultType) -> usize {
        lock(&self.log)
            .records
            .iter()
            .filter(|r| r.fault_type == fault_type)
            .count()
    }

    pub fn fault_count(&self) -> usize {
        lock(&self.log).records.len()
    }

    pub fn clear(&self) {
        lock(&self.log).records.clear();
    }
}
