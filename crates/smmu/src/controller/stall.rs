use std::sync::Mutex;

use serde::Serialize;
use smmu_types::{page_base, AccessType, Pasid, SecurityState, StreamId};

use crate::sync::lock;

/// A transaction held by a Stall-mode stream until software answers its page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledTransaction {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub address: u64,
    pub access_type: AccessType,
    pub security_state: SecurityState,
    pub timestamp: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StallTable {
    entries: Mutex<Vec<StalledTransaction>>,
}

impl StallTable {
    pub fn record(&self, stalled: StalledTransaction) {
        lock(&self.entries).push(stalled);
    }

    /// Releases stalls of `stream_id`/`pasid` whose page overlaps `[start, end)`. An empty range
    /// names the page containing `start`.
    pub fn resume(&self, stream_id: StreamId, pasid: Pasid, start: u64, end: u64) -> usize {
        let first = page_base(start);
        let in_range = |address: u64| {
            let page = page_base(address);
            if end <= start {
                page == first
            } else {
                page >= first && page < end
            }
        };
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|s| !(s.stream_id == stream_id && s.pasid == pasid && in_range(s.address)));
        before - entries.len()
    }

    pub fn drop_stream(&self, stream_id: StreamId) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|s| s.stream_id != stream_id);
        before - entries.len()
    }

    pub fn drop_pasid(&self, stream_id: StreamId, pasid: Pasid) -> usize {
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|s| !(s.stream_id == stream_id && s.pasid == pasid));
        before - entries.len()
    }

    pub fn snapshot(&self) -> Vec<StalledTransaction> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}
