use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smmu_types::{AccessType, Pasid, Result, SmmuError, StreamId};

use super::{BoundedQueue, QueueCounters, Timestamped};
use crate::clock::Clock;

/// Page request raised by a stalled translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriEntry {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub requested_address: u64,
    pub access_type: AccessType,
    /// Last request of its page request group.
    pub is_last_request: bool,
    #[serde(default)]
    pub timestamp: u64,
}

impl PriEntry {
    pub fn new(
        stream_id: StreamId,
        pasid: Pasid,
        requested_address: u64,
        access_type: AccessType,
    ) -> Self {
        Self {
            stream_id,
            pasid,
            requested_address,
            access_type,
            is_last_request: true,
            timestamp: 0,
        }
    }
}

impl Timestamped for PriEntry {
    fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

#[derive(Debug)]
pub struct PriQueue {
    queue: BoundedQueue<PriEntry>,
}

impl PriQueue {
    pub fn new(capacity: usize, clock: Arc<Clock>) -> Self {
        Self {
            queue: BoundedQueue::new(capacity, clock),
        }
    }

    pub fn submit(&self, entry: PriEntry) -> Result<()> {
        self.queue
            .push(entry)
            .map_err(|full| SmmuError::PriQueueFull {
                capacity: full.capacity,
            })
    }

    /// Removes requests from the head while `respond` accepts them; see
    /// [`BoundedQueue::drain_while`].
    pub fn drain_while(&self, respond: impl FnMut(&PriEntry) -> bool) -> usize {
        self.queue.drain_while(respond)
    }

    pub fn entries(&self) -> Vec<PriEntry> {
        self.queue.snapshot()
    }

    /// Removes and returns every queued request, oldest first.
    pub fn drain(&self) -> Vec<PriEntry> {
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
                "PRI queue holds {} entries, more than the requested size {capacity}",
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
