use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::tlb::CacheStatistics;

/// Snapshot of controller-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SmmuStatistics {
    pub total_translations: u64,
    pub successful_translations: u64,
    pub failed_translations: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub faults_recorded: u64,
    /// Fault records pushed out of the controller's bounded fault log.
    pub fault_records_discarded: u64,
    pub events_dropped: u64,
    pub commands_processed: u64,
    pub commands_failed: u64,
    pub sync_completions: u64,
    pub pri_requests_submitted: u64,
    pub pri_responses: u64,
    pub pri_overflows: u64,
    pub stalls_resumed: u64,
    /// Stalls released without a response: their PASID, stream or page request went away.
    pub stalls_terminated: u64,
    pub configured_streams: usize,
    pub cache: CacheStatistics,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    translations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    faults: AtomicU64,
    fault_records_discarded: AtomicU64,
    events_dropped: AtomicU64,
    commands_processed: AtomicU64,
    commands_failed: AtomicU64,
    sync_completions: AtomicU64,
    pri_submitted: AtomicU64,
    pri_responses: AtomicU64,
    pri_overflows: AtomicU64,
    stalls_resumed: AtomicU64,
    stalls_terminated: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    /// Success and failure are bumped before the total so a concurrent snapshot never sees
    /// `successful + failed` lag behind `total`.
    pub fn translation(&self, success: bool) {
        if success {
            bump(&self.successes);
        } else {
            bump(&self.failures);
        }
        bump(&self.translations);
    }

    pub fn total_translations(&self) -> u64 {
        self.translations.load(Ordering::Relaxed)
    }

    pub fn fault_recorded(&self) {
        bump(&self.faults);
    }

    pub fn fault_records_discarded(&self, count: usize) {
        self.fault_records_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        bump(&self.events_dropped);
    }

    pub fn command_processed(&self) {
        bump(&self.commands_processed);
    }

    pub fn command_failed(&self) {
        bump(&self.commands_failed);
    }

    pub fn sync_completed(&self) {
        bump(&self.sync_completions);
    }

    pub fn pri_submitted(&self) {
        bump(&self.pri_submitted);
    }

    pub fn pri_responded(&self) {
        bump(&self.pri_responses);
    }

    pub fn pri_overflowed(&self) {
        bump(&self.pri_overflows);
    }

    pub fn stalls_resumed(&self, count: usize) {
        self.stalls_resumed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn stalls_terminated(&self, count: usize) {
        self.stalls_terminated
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cache: CacheStatistics, configured_streams: usize) -> SmmuStatistics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        SmmuStatistics {
            total_translations: load(&self.translations),
            successful_translations: load(&self.successes),
            failed_translations: load(&self.failures),
            cache_hits: cache.hit_count,
            cache_misses: cache.miss_count,
            faults_recorded: load(&self.faults),
            fault_records_discarded: load(&self.fault_records_discarded),
            events_dropped: load(&self.events_dropped),
            commands_processed: load(&self.commands_processed),
            commands_failed: load(&self.commands_failed),
            sync_completions: load(&self.sync_completions),
            pri_requests_submitted: load(&self.pri_submitted),
            pri_responses: load(&self.pri_responses),
            pri_overflows: load(&self.pri_overflows),
            stalls_resumed: load(&self.stalls_resumed),
            stalls_terminated: load(&self.stalls_terminated),
            configured_streams,
            cache,
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.translations,
            &self.successes,
            &self.failures,
            &self.faults,
            &self.fault_records_discarded,
            &self.events_dropped,
            &self.commands_processed,
            &self.commands_failed,
            &self.sync_completions,
            &self.pri_submitted,
            &self.pri_responses,
            &self.pri_overflows,
            &self.stalls_resumed,
            &self.stalls_terminated,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
