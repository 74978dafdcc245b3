//! The SMMU controller: stream table, shared TLB, the three queues and running statistics.
//!
//! Lock order: configuration, command processing, stream map, stream state, address space,
//! TLB, PRI queue, command queue, event queue. Every path that can add queue entries or
//! translate holds the configuration read lock for its whole duration, so
//! [`SmmuController::update_configuration`] and [`SmmuController::reset`] are atomic with respect
//! to them.

mod commands;
mod stall;

pub use commands::CommandQueueReport;
pub use stall::StalledTransaction;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use smmu_config::SmmuConfiguration;
use smmu_types::{
    AccessType, FaultRecord, PagePermissions, Pasid, Result, SecurityState, SmmuError, StreamId,
    TranslationResult,
};
use tracing::{debug, trace, warn};

use crate::address_space::{PageMapping, SharedAddressSpace};
use crate::clock::Clock;
use crate::fault::{FaultHandler, SharedFaultHandler};
use crate::queue::{
    CommandQueue, EventEntry, EventQueue, EventSink, EventType, PriEntry, PriQueue,
};
use crate::stats::{Counters, SmmuStatistics};
use crate::stream::{FaultMode, StageFault, StreamConfig, StreamContext, StreamLimits, StreamStatistics};
use crate::sync::{lock, read, write};
use crate::tlb::{CacheStatistics, TlbCache, TlbEntry};
use stall::StallTable;

pub struct SmmuController {
    config: RwLock<SmmuConfiguration>,
    streams: RwLock<HashMap<StreamId, Arc<StreamContext>>>,
    tlb: TlbCache,
    event_queue: EventQueue,
    command_queue: CommandQueue,
    pri_queue: PriQueue,
    /// Serializes command queue consumers.
    command_processing: Mutex<()>,
    fault_handler: SharedFaultHandler,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
    stalls: StallTable,
    counters: Counters,
    clock: Arc<Clock>,
}

impl core::fmt::Debug for SmmuController {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuController")
            .field("config", &*read(&self.config))
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl Default for SmmuController {
    fn default() -> Self {
        Self::build(SmmuConfiguration::default())
    }
}

fn invalid(err: impl core::fmt::Display) -> SmmuError {
    SmmuError::InvalidConfiguration(err.to_string())
}

fn stream_limits(config: &SmmuConfiguration) -> StreamLimits {
    StreamLimits {
        allow_pasid_zero: config.allow_pasid_zero,
        max_pasids: config.address.max_pasid_count,
        max_iova_bits: config.address.max_iova_bits,
        max_pa_bits: config.address.max_pa_bits,
    }
}

impl SmmuController {
    pub fn new(config: SmmuConfiguration) -> Result<Self> {
        config.validate().map_err(invalid)?;
        Ok(Self::build(config))
    }

    fn build(config: SmmuConfiguration) -> Self {
        let clock = Clock::new_shared();
        let tlb = TlbCache::with_clock(config.cache.tlb_cache_size, Arc::clone(&clock));
        tlb.set_max_age_ms(config.cache.cache_max_age_ms);
        Self {
            tlb,
            event_queue: EventQueue::new(config.queue.event_queue_size, Arc::clone(&clock)),
            command_queue: CommandQueue::new(config.queue.command_queue_size, Arc::clone(&clock)),
            pri_queue: PriQueue::new(config.queue.pri_queue_size, Arc::clone(&clock)),
            config: RwLock::new(config),
            streams: RwLock::new(HashMap::new()),
            command_processing: Mutex::new(()),
            fault_handler: Arc::new(FaultHandler::with_capacity(config.queue.fault_log_size)),
            sinks: RwLock::new(Vec::new()),
            stalls: StallTable::default(),
            counters: Counters::default(),
            clock,
        }
    }

    pub fn configuration(&self) -> SmmuConfiguration {
        *read(&self.config)
    }

    /// Applies `new` as a whole or not at all.
    ///
    /// Fails with [`SmmuError::InvalidConfiguration`] if `new` is invalid or cannot hold the
    /// current state: more streams than `max_stream_count`, a stream with more PASIDs than
    /// `max_pasid_count`, or a queue holding more entries than its new size.
    pub fn update_configuration(&self, new: SmmuConfiguration) -> Result<()> {
        let mut config = write(&self.config);
        new.validate().map_err(invalid)?;

        let streams = read(&self.streams);
        if streams.len() > new.address.max_stream_count {
            return Err(SmmuError::InvalidConfiguration(format!(
                "{} streams configured, more than maxStreamCount {}",
                streams.len(),
                new.address.max_stream_count
            )));
        }
        if let Some(stream) = streams
            .values()
            .find(|s| s.pasid_count() > new.address.max_pasid_count)
        {
            return Err(SmmuError::InvalidConfiguration(format!(
                "stream {:#x} holds {} PASIDs, more than maxPasidCount {}",
                stream.stream_id(),
                stream.pasid_count(),
                new.address.max_pasid_count
            )));
        }

        let old = config.queue;
        self.event_queue.resize(new.queue.event_queue_size)?;
        if let Err(err) = self.command_queue.resize(new.queue.command_queue_size) {
            let _ = self.event_queue.resize(old.event_queue_size);
            return Err(err);
        }
        if let Err(err) = self.pri_queue.resize(new.queue.pri_queue_size) {
            let _ = self.event_queue.resize(old.event_queue_size);
            let _ = self.command_queue.resize(old.command_queue_size);
            return Err(err);
        }

        let discarded = self.fault_handler.set_capacity(new.queue.fault_log_size);
        self.counters.fault_records_discarded(discarded);

        let limits = stream_limits(&new);
        for stream in streams.values() {
            stream.set_limits(limits);
        }
        // Cached translations were admitted under the old address widths and PASID policy.
        let rules_changed =
            config.address != new.address || config.allow_pasid_zero != new.allow_pasid_zero;
        self.tlb.resize(new.cache.tlb_cache_size);
        self.tlb.set_max_age_ms(new.cache.cache_max_age_ms);
        if !new.cache.enable_caching || rules_changed {
            self.tlb.invalidate_all();
        }
        *config = new;
        debug!(?new, "configuration updated");
        Ok(())
    }

    pub fn enable_caching(&self, enable: bool) {
        let mut config = write(&self.config);
        config.cache.enable_caching = enable;
        if !enable {
            self.tlb.invalidate_all();
        }
        debug!(enable, "translation caching toggled");
    }

    pub fn is_caching_enabled(&self) -> bool {
        read(&self.config).cache.enable_caching
    }

    fn stream(&self, stream_id: StreamId) -> Result<Arc<StreamContext>> {
        read(&self.streams)
            .get(&stream_id)
            .cloned()
            .ok_or(SmmuError::StreamNotConfigured { stream_id })
    }

    /// Configures a new stream or replaces the configuration of an existing one. Replacing
    /// keeps the stream's PASIDs and drops its cached translations.
    pub fn configure_stream(&self, stream_id: StreamId, stream_config: StreamConfig) -> Result<()> {
        let config = read(&self.config);
        let mut streams = write(&self.streams);
        if let Some(stream) = streams.get(&stream_id) {
            stream.update_configuration(stream_config)?;
            drop(streams);
            self.tlb.invalidate_stream(stream_id);
            return Ok(());
        }
        if streams.len() >= config.address.max_stream_count {
            return Err(SmmuError::InvalidConfiguration(format!(
                "cannot configure stream {stream_id:#x}: maxStreamCount {} reached",
                config.address.max_stream_count
            )));
        }
        let stream = StreamContext::with_limits(
            stream_id,
            stream_config,
            stream_limits(&config),
            Arc::clone(&self.clock),
        )?;
        streams.insert(stream_id, Arc::new(stream));
        debug!(stream_id, ?stream_config, "stream configured");
        Ok(())
    }

    pub fn remove_stream(&self, stream_id: StreamId) -> Result<()> {
        let _config = read(&self.config);
        write(&self.streams)
            .remove(&stream_id)
            .ok_or(SmmuError::StreamNotConfigured { stream_id })?;
        self.tlb.invalidate_stream(stream_id);
        self.counters
            .stalls_terminated(self.stalls.drop_stream(stream_id));
        debug!(stream_id, "stream removed");
        Ok(())
    }

    pub fn enable_stream(&self, stream_id: StreamId) -> Result<()> {
        self.stream(stream_id)?.enable();
        debug!(stream_id, "stream enabled");
        Ok(())
    }

    pub fn disable_stream(&self, stream_id: StreamId) -> Result<()> {
        self.stream(stream_id)?.disable();
        self.tlb.invalidate_stream(stream_id);
        debug!(stream_id, "stream disabled");
        Ok(())
    }

    pub fn is_stream_configured(&self, stream_id: StreamId) -> bool {
        read(&self.streams).contains_key(&stream_id)
    }

    pub fn is_stream_enabled(&self, stream_id: StreamId) -> Result<bool> {
        Ok(self.stream(stream_id)?.is_enabled())
    }

    pub fn stream_config(&self, stream_id: StreamId) -> Result<StreamConfig> {
        Ok(self.stream(stream_id)?.config())
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = read(&self.streams).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn stream_count(&self) -> usize {
        read(&self.streams).len()
    }

    pub fn create_stream_pasid(&self, stream_id: StreamId, pasid: Pasid) -> Result<()> {
        self.stream(stream_id)?.create_pasid(pasid)
    }

    pub fn remove_stream_pasid(&self, stream_id: StreamId, pasid: Pasid) -> Result<()> {
        self.stream(stream_id)?.remove_pasid(pasid)?;
        self.tlb.invalidate_pasid(stream_id, pasid);
        self.counters
            .stalls_terminated(self.stalls.drop_pasid(stream_id, pasid));
        Ok(())
    }

    pub fn clear_stream_pasids(&self, stream_id: StreamId) -> Result<()> {
        self.stream(stream_id)?.clear_pasids();
        self.tlb.invalidate_stream(stream_id);
        self.counters
            .stalls_terminated(self.stalls.drop_stream(stream_id));
        Ok(())
    }

    pub fn map_page(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        physical_address: u64,
        permissions: PagePermissions,
    ) -> Result<()> {
        self.map_page_secure(
            stream_id,
            pasid,
            iova,
            physical_address,
            permissions,
            SecurityState::NonSecure,
        )
    }

    /// Maps one page. A remap drops the page's cached translation.
    pub fn map_page_secure(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        physical_address: u64,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> Result<()> {
        self.stream(stream_id)?.map_page(
            pasid,
            iova,
            physical_address,
            permissions,
            security_state,
        )?;
        self.tlb.invalidate_range(stream_id, pasid, iova, iova);
        Ok(())
    }

    pub fn unmap_page(&self, stream_id: StreamId, pasid: Pasid, iova: u64) -> Result<bool> {
        let removed = self.stream(stream_id)?.unmap_page(pasid, iova)?;
        self.tlb.invalidate_range(stream_id, pasid, iova, iova);
        Ok(removed)
    }

    pub fn map_pages(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        mappings: &[PageMapping],
    ) -> Result<()> {
        self.stream(stream_id)?.map_pages(pasid, mappings)?;
        self.tlb.invalidate_pasid(stream_id, pasid);
        Ok(())
    }

    pub fn unmap_pages(&self, stream_id: StreamId, pasid: Pasid, iovas: &[u64]) -> Result<()> {
        self.stream(stream_id)?.unmap_pages(pasid, iovas)?;
        self.tlb.invalidate_pasid(stream_id, pasid);
        Ok(())
    }

    /// Attaches (or detaches) a Stage-2 table. The same table may back many streams.
    pub fn set_stage2_address_space(
        &self,
        stream_id: StreamId,
        space: Option<SharedAddressSpace>,
    ) -> Result<()> {
        self.stream(stream_id)?.set_stage2_address_space(space);
        self.tlb.invalidate_stream(stream_id);
        Ok(())
    }

    /// Attaches a handler receiving this stream's faults in addition to the controller's own.
    pub fn set_stream_fault_handler(
        &self,
        stream_id: StreamId,
        handler: Option<SharedFaultHandler>,
    ) -> Result<()> {
        self.stream(stream_id)?.set_fault_handler(handler);
        Ok(())
    }

    pub fn set_global_fault_mode(&self, fault_mode: FaultMode) {
        for stream in read(&self.streams).values() {
            stream.set_fault_mode(fault_mode);
        }
        debug!(?fault_mode, "fault mode applied to all streams");
    }

    pub fn translate(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
    ) -> Result<TranslationResult> {
        self.translate_secure(stream_id, pasid, iova, access, SecurityState::NonSecure)
    }

    /// Translates through the TLB, walking the stream's tables on a miss.
    ///
    /// A cached entry that does not grant `access` is not trusted to produce the fault; the
    /// walk runs so the fault is attributed to the stage that denies it.
    pub fn translate_secure(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> Result<TranslationResult> {
        let config = read(&self.config);
        let result = self.translate_locked(&config, stream_id, pasid, iova, access, security);
        self.counters.translation(result.is_ok());
        result
    }

    fn translate_locked(
        &self,
        config: &SmmuConfiguration,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> Result<TranslationResult> {
        let stream = match self.stream(stream_id) {
            Ok(stream) => stream,
            Err(error) => {
                let fault = StageFault::unstaged(error);
                self.report_fault(stream_id, pasid, iova, access, security, &fault);
                return Err(fault.error);
            }
        };

        let caching = config.cache.enable_caching;
        if caching {
            if let Some(entry) = self.tlb.lookup(stream_id, pasid, iova, security) {
                if entry.permissions.allows(access) {
                    stream.count_translation(true);
                    trace!(stream_id, pasid, iova, "tlb hit");
                    return Ok(entry.to_translation(iova));
                }
            }
        }

        let epoch = self.tlb.epoch();
        match stream.resolve(pasid, iova, access, security) {
            Ok(result) => {
                if caching && !result.bypassed {
                    let entry = TlbEntry::from_translation(stream_id, pasid, iova, &result);
                    self.tlb.insert_if_current(entry, epoch);
                }
                Ok(result)
            }
            Err(fault) => {
                self.report_fault(stream_id, pasid, iova, access, security, &fault);
                if fault.error.is_retryable() && stream.fault_mode() == FaultMode::Stall {
                    self.stall(stream_id, pasid, iova, access, security);
                }
                Err(fault.error)
            }
        }
    }

    fn report_fault(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
        fault: &StageFault,
    ) {
        let record = FaultRecord {
            stream_id,
            pasid,
            address: iova,
            fault_type: fault.error.fault_type(),
            access_type: access,
            security_state: security,
            stage: fault.stage,
            timestamp: self.clock.now_ns(),
        };
        if self.fault_handler.record_fault(record) {
            self.counters.fault_records_discarded(1);
        }
        self.counters.fault_recorded();
        trace!(stream_id, pasid, iova, error = %fault.error, "translation fault");
        self.emit(EventEntry::from_fault(record));
    }

    fn stall(
        &self,
        stream_id: StreamId,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) {
        if self
            .pri_queue
            .submit(PriEntry::new(stream_id, pasid, iova, access))
            .is_err()
        {
            self.counters.pri_overflowed();
            warn!(stream_id, pasid, iova, "PRI queue full, stalled transaction terminated");
            return;
        }
        self.counters.pri_submitted();
        self.stalls.record(StalledTransaction {
            stream_id,
            pasid,
            address: iova,
            access_type: access,
            security_state: security,
            timestamp: self.clock.now_ns(),
        });
        self.emit(EventEntry::new(EventType::PriPageRequest, stream_id, pasid, iova));
    }

    /// Queues an internally generated event, counting it as dropped when the queue is full.
    fn emit(&self, event: EventEntry) {
        let event_type = event.event_type;
        if self.event_queue.submit(event).is_err() {
            self.counters.event_dropped();
            warn!(?event_type, "event queue full, event dropped");
        }
    }

    pub fn add_event_sink(&self, sink: Arc<dyn EventSink>) {
        write(&self.sinks).push(sink);
    }

    pub fn stalled_transactions(&self) -> Vec<StalledTransaction> {
        self.stalls.snapshot()
    }

    pub fn stalled_transaction_count(&self) -> usize {
        self.stalls.len()
    }

    /// Faults recorded by the controller for translation failures, oldest first. Only the newest
    /// `fault_log_size` records are kept.
    pub fn faults(&self) -> Vec<FaultRecord> {
        self.fault_handler.faults()
    }

    pub fn fault_handler(&self) -> SharedFaultHandler {
        Arc::clone(&self.fault_handler)
    }

    pub fn tlb(&self) -> &TlbCache {
        &self.tlb
    }

    pub fn event_queue(&self) -> &EventQueue {
        &self.event_queue
    }

    pub fn command_queue(&self) -> &CommandQueue {
        &self.command_queue
    }

    pub fn pri_queue(&self) -> &PriQueue {
        &self.pri_queue
    }

    pub fn invalidate_translation_cache(&self) -> usize {
        self.tlb.invalidate_all()
    }

    pub fn invalidate_stream_cache(&self, stream_id: StreamId) -> usize {
        self.tlb.invalidate_stream(stream_id)
    }

    pub fn invalidate_pasid_cache(&self, stream_id: StreamId, pasid: Pasid) -> usize {
        self.tlb.invalidate_pasid(stream_id, pasid)
    }

    pub fn total_translations(&self) -> u64 {
        self.counters.total_translations()
    }

    pub fn cache_statistics(&self) -> CacheStatistics {
        self.tlb.statistics()
    }

    pub fn stream_statistics(&self, stream_id: StreamId) -> Result<StreamStatistics> {
        Ok(self.stream(stream_id)?.statistics())
    }

    pub fn statistics(&self) -> SmmuStatistics {
        self.counters
            .snapshot(self.tlb.statistics(), self.stream_count())
    }

    pub fn reset_statistics(&self) {
        self.counters.reset();
        self.tlb.reset_statistics();
        for stream in read(&self.streams).values() {
            stream.reset_statistics();
        }
        self.event_queue.reset_counters();
        self.command_queue.reset_counters();
        self.pri_queue.reset_counters();
    }

    /// Drops every stream, queued entry, cached translation, stall, fault record and statistic.
    /// Configuration and event sinks are kept.
    pub fn reset(&self) {
        let _config = write(&self.config);
        let _processing = lock(&self.command_processing);
        write(&self.streams).clear();
        self.tlb.invalidate_all();
        self.event_queue.clear();
        self.command_queue.clear();
        self.pri_queue.clear();
        self.stalls.clear();
        self.fault_handler.clear();
        self.reset_statistics();
        debug!("controller reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smmu_types::FaultStage;

    const STREAM: StreamId = 0x1000;

    fn controller_with_mapping() -> SmmuController {
        let smmu = SmmuController::default();
        smmu.configure_stream(STREAM, StreamConfig::stage1_only())
            .unwrap();
        smmu.create_stream_pasid(STREAM, 1).unwrap();
        smmu.map_page(STREAM, 1, 0x1000_0000, 0x4000_0000, PagePermissions::READ_WRITE)
            .unwrap();
        smmu
    }

    #[test]
    fn miss_then_hit() {
        let smmu = controller_with_mapping();
        let first = smmu.translate(STREAM, 1, 0x1000_0010, AccessType::Read).unwrap();
        assert!(!first.cache_hit);
        let second = smmu.translate(STREAM, 1, 0x1000_0020, AccessType::Write).unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.physical_address, 0x4000_0020);

        let cache = smmu.cache_statistics();
        assert_eq!(cache.hit_count, 1);
        assert_eq!(cache.miss_count, 1);
        assert_eq!(smmu.stream_statistics(STREAM).unwrap().translations, 2);
    }

    #[test]
    fn unknown_stream_faults_with_caller_stream_id() {
        let smmu = SmmuController::default();
        assert_eq!(
            smmu.translate(0xbeef, 3, 0x1000, AccessType::Read),
            Err(SmmuError::StreamNotConfigured { stream_id: 0xbeef })
        );
        let faults = smmu.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].stream_id, 0xbeef);
        assert_eq!(faults[0].stage, FaultStage::None);
        assert_eq!(smmu.events()[0].event_type, EventType::ConfigurationError);
        assert_eq!(smmu.statistics().failed_translations, 1);
    }

    #[test]
    fn cached_entry_lacking_permission_walks_for_attribution() {
        let smmu = controller_with_mapping();
        smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).unwrap();
        assert!(matches!(
            smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Execute),
            Err(SmmuError::PagePermissionViolation { .. })
        ));
        let faults = smmu.faults();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].stage, FaultStage::Stage1);
    }

    #[test]
    fn disable_drops_cached_translations() {
        let smmu = controller_with_mapping();
        smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).unwrap();
        assert_eq!(smmu.tlb().entries_for_stream(STREAM), 1);
        smmu.disable_stream(STREAM).unwrap();
        assert_eq!(smmu.tlb().entries_for_stream(STREAM), 0);
        assert_eq!(
            smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read),
            Err(SmmuError::StreamDisabled { stream_id: STREAM })
        );
        smmu.enable_stream(STREAM).unwrap();
        assert!(smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).is_ok());
    }

    #[test]
    fn remap_is_visible_through_cache() {
        let smmu = controller_with_mapping();
        smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).unwrap();
        smmu.map_page(STREAM, 1, 0x1000_0000, 0x5000_0000, PagePermissions::READ)
            .unwrap();
        let result = smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).unwrap();
        assert_eq!(result.physical_address, 0x5000_0000);
        assert!(!result.cache_hit);
    }

    #[test]
    fn caching_disabled_never_touches_tlb() {
        let smmu = controller_with_mapping();
        smmu.enable_caching(false);
        for _ in 0..3 {
            let result = smmu.translate(STREAM, 1, 0x1000_0000, AccessType::Read).unwrap();
            assert!(!result.cache_hit);
        }
        assert_eq!(smmu.cache_statistics().total_lookups, 0);
        assert!(smmu.tlb().is_empty());
    }

    #[test]
    fn stream_count_limit() {
        let mut config = SmmuConfiguration::minimal();
        config.address.max_stream_count = 2;
        let smmu = SmmuController::new(config).unwrap();
        smmu.configure_stream(1, StreamConfig::default()).unwrap();
        smmu.configure_stream(2, StreamConfig::default()).unwrap();
        // Reconfiguring an existing stream does not count against the limit.
        smmu.configure_stream(2, StreamConfig::both_stages()).unwrap();
        assert!(matches!(
            smmu.configure_stream(3, StreamConfig::default()),
            Err(SmmuError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn invalid_configuration_is_rejected_at_construction() {
        let mut config = SmmuConfiguration::default();
        config.queue.event_queue_size = 0;
        assert!(matches!(
            SmmuController::new(config),
            Err(SmmuError::InvalidConfiguration(_))
        ));
    }
}
