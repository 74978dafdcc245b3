use std::sync::Arc;

use serde::Serialize;
use smmu_types::{FaultRecord, FaultType, Pasid, Result, SmmuError, StreamId};

use super::{BoundedQueue, QueueCounters, Timestamped};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TranslationFault,
    PermissionFault,
    CommandSyncCompletion,
    PriPageRequest,
    AtcInvalidateCompletion,
    ConfigurationError,
    InternalError,
}

impl EventType {
    pub fn for_fault(fault_type: FaultType) -> Self {
        match fault_type {
            FaultType::TranslationFault | FaultType::AddressSizeFault => EventType::TranslationFault,
            FaultType::PermissionFault | FaultType::SecurityFault => EventType::PermissionFault,
            FaultType::ConfigurationFault => EventType::ConfigurationError,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEntry {
    pub event_type: EventType,
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub address: u64,
    /// Set for fault events.
    pub fault: Option<FaultRecord>,
    pub timestamp: u64,
}

impl EventEntry {
    pub fn new(event_type: EventType, stream_id: StreamId, pasid: Pasid, address: u64) -> Self {
        Self {
            event_type,
            stream_id,
            pasid,
            address,
            fault: None,
            timestamp: 0,
        }
    }

    pub fn from_fault(record: FaultRecord) -> Self {
        Self {
            fault: Some(record),
            ..Self::new(
                EventType::for_fault(record.fault_type),
                record.stream_id,
                record.pasid,
                record.address,
            )
        }
    }
}

impl Timestamped for EventEntry {
    fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

/// Consumer of drained events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &EventEntry);
}

impl<F> EventSink for F
where
    F: Fn(&EventEntry) + Send + Sync,
{
    fn deliver(&self, event: &EventEntry) {
        self(event)
    }
}

#[derive(Debug)]
pub struct EventQueue {
    queue: BoundedQueue<EventEntry>,
}

impl EventQueue {
    pub fn new(capacity: usize, clock: Arc<Clock>) -> Self {
        Self {
            queue: BoundedQueue::new(capacity, clock),
        }
    }

    pub fn submit(&self, event: EventEntry) -> Result<()> {
        self.queue
            .push(event)
            .map_err(|full| SmmuError::EventQueueFull {
                capacity: full.capacity,
            })
    }

    /// Queued events, oldest first, without consuming them.
    pub fn events(&self) -> Vec<EventEntry> {
        self.queue.snapshot()
    }

    pub fn drain(&self) -> Vec<EventEntry> {
        self.queue.drain()
    }

    pub fn clear(&self) -> usize {
        self.queue.clear()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn resize(&self, capacity: usize) -> Result<()> {
        self.queue.resize(capacity).map_err(|_| {
            SmmuError::InvalidConfiguration(format!(
                "event queue holds {} entries, more than the requested size {capacity}",
                self.queue.len()
            ))
        })
    }

    pub fn counters(&self) -> QueueCounters {
        self.queue.counters()
    }

    pub fn reset_counters(&self) {
        self.queue.reset_counters()
    }
}
