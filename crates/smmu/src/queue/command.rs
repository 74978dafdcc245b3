use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smmu_types::{Pasid, Result, SmmuError, StreamId};

use super::{BoundedQueue, QueueCounters, Timestamped};
use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    PrefetchConfig,
    PrefetchAddr,
    CfgiSte,
    CfgiAll,
    TlbiNhAll,
    TlbiEl2All,
    TlbiS12Vmall,
    TlbiNhAsid,
    TlbiNhVa,
    AtcInv,
    PriResp,
    Resume,
    Sync,
}

impl CommandType {
    /// Whether the command names a stream that must exist.
    pub fn targets_stream(self) -> bool {
        !matches!(
            self,
            CommandType::CfgiAll | CommandType::TlbiNhAll | CommandType::TlbiEl2All | CommandType::Sync
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEntry {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub stream_id: StreamId,
    #[serde(default)]
    pub pasid: Pasid,
    #[serde(default)]
    pub start_address: u64,
    /// Exclusive. Equal to `start_address` for single-page commands.
    #[serde(default)]
    pub end_address: u64,
    #[serde(default, skip_deserializing)]
    pub timestamp: u64,
}

impl CommandEntry {
    pub fn new(command_type: CommandType, stream_id: StreamId, pasid: Pasid) -> Self {
        Self {
            command_type,
            stream_id,
            pasid,
            start_address: 0,
            end_address: 0,
            timestamp: 0,
        }
    }

    pub fn with_range(mut self, start_address: u64, end_address: u64) -> Self {
        self.start_address = start_address;
        self.end_address = end_address;
        self
    }

    pub fn sync() -> Self {
        Self::new(CommandType::Sync, 0, 0)
    }

    pub fn tlbi_nh_all() -> Self {
        Self::new(CommandType::TlbiNhAll, 0, 0)
    }

    pub fn tlbi_el2_all() -> Self {
        Self::new(CommandType::TlbiEl2All, 0, 0)
    }

    pub fn tlbi_s12_vmall(stream_id: StreamId) -> Self {
        Self::new(CommandType::TlbiS12Vmall, stream_id, 0)
    }

    pub fn tlbi_nh_asid(stream_id: StreamId, pasid: Pasid) -> Self {
        Self::new(CommandType::TlbiNhAsid, stream_id, pasid)
    }

    pub fn tlbi_nh_va(stream_id: StreamId, pasid: Pasid, start: u64, end: u64) -> Self {
        Self::new(CommandType::TlbiNhVa, stream_id, pasid).with_range(start, end)
    }

    pub fn atc_inv(stream_id: StreamId, pasid: Pasid, start: u64, end: u64) -> Self {
        Self::new(CommandType::AtcInv, stream_id, pasid).with_range(start, end)
    }

    pub fn cfgi_ste(stream_id: StreamId) -> Self {
        Self::new(CommandType::CfgiSte, stream_id, 0)
    }

    pub fn cfgi_all() -> Self {
        Self::new(CommandType::CfgiAll, 0, 0)
    }

    pub fn prefetch_config(stream_id: StreamId) -> Self {
        Self::new(CommandType::PrefetchConfig, stream_id, 0)
    }

    pub fn prefetch_addr(stream_id: StreamId, pasid: Pasid, address: u64) -> Self {
        Self::new(CommandType::PrefetchAddr, stream_id, pasid).with_range(address, address)
    }

    pub fn pri_resp(stream_id: StreamId, pasid: Pasid, address: u64) -> Self {
        Self::new(CommandType::PriResp, stream_id, pasid).with_range(address, address)
    }

    pub fn resume(stream_id: StreamId, pasid: Pasid, start: u64, end: u64) -> Self {
        Self::new(CommandType::Resume, stream_id, pasid).with_range(start, end)
    }

    pub fn is_sync(&self) -> bool {
        self.command_type == CommandType::Sync
    }
}

impl Timestamped for CommandEntry {
    fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }
}

#[derive(Debug)]
pub struct CommandQueue {
    queue: BoundedQueue<CommandEntry>,
}

impl CommandQueue {
    pub fn new(capacity: usize, clock: Arc<Clock>) -> Self {
        Self {
            queue: BoundedQueue::new(capacity, clock),
        }
    }

    pub fn submit(&self, command: CommandEntry) -> Result<()> {
        self.queue
            .push(command)
            .map_err(|full| SmmuError::CommandQueueFull {
                capacity: full.capacity,
            })
    }

    pub fn front(&self) -> Option<CommandEntry> {
        self.queue.front()
    }

    pub fn pop_front(&self) -> Option<CommandEntry> {
        self.queue.pop_front()
    }

    pub fn commands(&self) -> Vec<CommandEntry> {
        self.queue.snapshot()
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

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn resize(&self, capacity: usize) -> Result<()> {
        self.queue.resize(capacity).map_err(|_| {
            SmmuError::InvalidConfiguration(format!(
                "command queue holds {} entries, more than the requested size {capacity}",
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
