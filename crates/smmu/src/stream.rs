//! Per-stream translation state.
//!
//! A [`StreamContext`] keeps everything the stream table entry and its context descriptors would
//! describe on hardware: which stages run, the fault mode, the PASID to Stage-1 table relation
//! and the (possibly shared) Stage-2 table. All of it sits behind one lock, so a concurrent
//! translation observes either the old or the new configuration, never a mix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use smmu_types::{
    fits_in_bits, page_offset, AccessType, FaultRecord, FaultStage, PagePermissions, Pasid,
    Result, SecurityState, SmmuError, StreamId, TranslationResult, MAX_PASID,
};
use tracing::{debug, trace};

use crate::address_space::{AddressSpace, PageMapping, SharedAddressSpace};
use crate::clock::Clock;
use crate::fault::SharedFaultHandler;
use crate::sync::{read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultMode {
    /// Abort the transaction and report the fault.
    #[default]
    Terminate,
    /// Hold the transaction and raise a page request so software can fix the mapping.
    Stall,
}

/// Which stages a stream runs, derived from [`StreamConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageMode {
    Bypass,
    Stage1Only,
    Stage2Only,
    BothStages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    pub translation_enabled: bool,
    pub stage1_enabled: bool,
    pub stage2_enabled: bool,
    pub fault_mode: FaultMode,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::stage1_only()
    }
}

impl StreamConfig {
    pub fn stage1_only() -> Self {
        Self {
            translation_enabled: true,
            stage1_enabled: true,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        }
    }

    pub fn stage2_only() -> Self {
        Self {
            stage1_enabled: false,
            stage2_enabled: true,
            ..Self::stage1_only()
        }
    }

    pub fn both_stages() -> Self {
        Self {
            stage2_enabled: true,
            ..Self::stage1_only()
        }
    }

    pub fn bypass() -> Self {
        Self {
            translation_enabled: false,
            stage1_enabled: false,
            stage2_enabled: false,
            fault_mode: FaultMode::Terminate,
        }
    }

    pub fn with_fault_mode(mut self, fault_mode: FaultMode) -> Self {
        self.fault_mode = fault_mode;
        self
    }

    /// A translating stream needs at least one stage. A Stage-2 table need not be attached yet;
    /// its absence surfaces when a translation reaches Stage 2.
    pub fn is_valid(&self) -> bool {
        !self.translation_enabled || self.stage1_enabled || self.stage2_enabled
    }

    pub fn stage_mode(&self) -> StageMode {
        match (
            self.translation_enabled,
            self.stage1_enabled,
            self.stage2_enabled,
        ) {
            (false, _, _) | (true, false, false) => StageMode::Bypass,
            (true, true, false) => StageMode::Stage1Only,
            (true, false, true) => StageMode::Stage2Only,
            (true, true, true) => StageMode::BothStages,
        }
    }
}

/// Limits a stream inherits from the controller configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub allow_pasid_zero: bool,
    pub max_pasids: usize,
    pub max_iova_bits: u32,
    pub max_pa_bits: u32,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            allow_pasid_zero: true,
            max_pasids: MAX_PASID as usize + 1,
            max_iova_bits: 64,
            max_pa_bits: 64,
        }
    }
}

/// Error of a failed walk together with the stage it is attributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFault {
    pub error: SmmuError,
    pub stage: FaultStage,
}

impl StageFault {
    pub fn new(error: SmmuError, stage: FaultStage) -> Self {
        Self { error, stage }
    }

    pub fn unstaged(error: SmmuError) -> Self {
        Self::new(error, FaultStage::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatistics {
    pub stream_id: StreamId,
    pub translations: u64,
    pub successful_translations: u64,
    pub faults: u64,
    pub pasid_count: usize,
    pub enabled: bool,
    pub config: StreamConfig,
}

struct StreamState {
    config: StreamConfig,
    limits: StreamLimits,
    enabled: bool,
    pasids: HashMap<Pasid, SharedAddressSpace>,
    stage2: Option<SharedAddressSpace>,
    fault_handler: Option<SharedFaultHandler>,
}

impl StreamState {
    fn check_pasid(&self, pasid: Pasid) -> Result<()> {
        if pasid > MAX_PASID || (pasid == 0 && !self.limits.allow_pasid_zero) {
            return Err(SmmuError::InvalidPasid { pasid });
        }
        Ok(())
    }

    fn check_mapping(&self, iova: u64, physical_address: u64) -> Result<()> {
        if !fits_in_bits(iova, self.limits.max_iova_bits) {
            return Err(SmmuError::InvalidAddress {
                address: iova,
                bits: self.limits.max_iova_bits,
            });
        }
        if !fits_in_bits(physical_address, self.limits.max_pa_bits) {
            return Err(SmmuError::InvalidAddress {
                address: physical_address,
                bits: self.limits.max_pa_bits,
            });
        }
        Ok(())
    }
}

pub struct StreamContext {
    stream_id: StreamId,
    state: RwLock<StreamState>,
    clock: Arc<Clock>,
    translations: AtomicU64,
    successes: AtomicU64,
    faults: AtomicU64,
}

impl core::fmt::Debug for StreamContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamContext")
            .field("stream_id", &self.stream_id)
            .field("statistics", &self.statistics())
            .finish()
    }
}

impl StreamContext {
    pub fn new(stream_id: StreamId, config: StreamConfig) -> Result<Self> {
        Self::with_limits(
            stream_id,
            config,
            StreamLimits::default(),
            Clock::new_shared(),
        )
    }

    pub fn with_limits(
        stream_id: StreamId,
        config: StreamConfig,
        limits: StreamLimits,
        clock: Arc<Clock>,
    ) -> Result<Self> {
        if !config.is_valid() {
            return Err(invalid_stream_config(stream_id));
        }
        Ok(Self {
            stream_id,
            state: RwLock::new(StreamState {
                config,
                limits,
                enabled: true,
                pasids: HashMap::new(),
                stage2: None,
                fault_handler: None,
            }),
            clock,
            translations: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            faults: AtomicU64::new(0),
        })
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn config(&self) -> StreamConfig {
        read(&self.state).config
    }

    pub fn limits(&self) -> StreamLimits {
        read(&self.state).limits
    }

    pub fn fault_mode(&self) -> FaultMode {
        read(&self.state).config.fault_mode
    }

    /// Replaces the stream configuration. PASIDs, tables and the enabled flag are kept.
    pub fn update_configuration(&self, config: StreamConfig) -> Result<()> {
        if !config.is_valid() {
            return Err(invalid_stream_config(self.stream_id));
        }
        write(&self.state).config = config;
        debug!(stream_id = self.stream_id, ?config, "stream configuration updated");
        Ok(())
    }

    pub fn set_fault_mode(&self, fault_mode: FaultMode) {
        write(&self.state).config.fault_mode = fault_mode;
    }

    pub(crate) fn set_limits(&self, limits: StreamLimits) {
        write(&self.state).limits = limits;
    }

    pub fn enable(&self) {
        write(&self.state).enabled = true;
    }

    pub fn disable(&self) {
        write(&self.state).enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        read(&self.state).enabled
    }

    pub fn set_fault_handler(&self, handler: Option<SharedFaultHandler>) {
        write(&self.state).fault_handler = handler;
    }

    pub fn fault_handler(&self) -> Option<SharedFaultHandler> {
        read(&self.state).fault_handler.clone()
    }

    pub fn set_stage2_address_space(&self, space: Option<SharedAddressSpace>) {
        write(&self.state).stage2 = space;
    }

    pub fn stage2_address_space(&self) -> Option<SharedAddressSpace> {
        read(&self.state).stage2.clone()
    }

    /// Creates an empty Stage-1 address space for `pasid`. Creating an existing PASID is a
    /// no-op.
    pub fn create_pasid(&self, pasid: Pasid) -> Result<()> {
        let mut state = write(&self.state);
        state.check_pasid(pasid)?;
        if state.pasids.contains_key(&pasid) {
            return Ok(());
        }
        if state.pasids.len() >= state.limits.max_pasids {
            return Err(SmmuError::AddressSpaceExhausted {
                stream_id: self.stream_id,
                limit: state.limits.max_pasids,
            });
        }
        state.pasids.insert(pasid, AddressSpace::new_shared());
        Ok(())
    }

    /// Drops the PASID and its address space.
    pub fn remove_pasid(&self, pasid: Pasid) -> Result<()> {
        match write(&self.state).pasids.remove(&pasid) {
            Some(_) => Ok(()),
            None => Err(self.pasid_not_found(pasid)),
        }
    }

    pub fn clear_pasids(&self) {
        write(&self.state).pasids.clear();
    }

    pub fn has_pasid(&self, pasid: Pasid) -> bool {
        read(&self.state).pasids.contains_key(&pasid)
    }

    pub fn pasid_count(&self) -> usize {
        read(&self.state).pasids.len()
    }

    pub fn pasids(&self) -> Vec<Pasid> {
        let mut pasids: Vec<_> = read(&self.state).pasids.keys().copied().collect();
        pasids.sort_unstable();
        pasids
    }

    pub fn address_space(&self, pasid: Pasid) -> Result<SharedAddressSpace> {
        read(&self.state)
            .pasids
            .get(&pasid)
            .cloned()
            .ok_or_else(|| self.pasid_not_found(pasid))
    }

    fn pasid_not_found(&self, pasid: Pasid) -> SmmuError {
        SmmuError::PasidNotFound {
            stream_id: self.stream_id,
            pasid,
        }
    }

    pub fn map_page(
        &self,
        pasid: Pasid,
        iova: u64,
        physical_address: u64,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) -> Result<()> {
        let state = read(&self.state);
        state.check_mapping(iova, physical_address)?;
        let space = state
            .pasids
            .get(&pasid)
            .ok_or_else(|| self.pasid_not_found(pasid))?;
        space.map_page_secure(iova, physical_address, permissions, security_state);
        Ok(())
    }

    pub fn unmap_page(&self, pasid: Pasid, iova: u64) -> Result<bool> {
        Ok(self.address_space(pasid)?.unmap_page(iova))
    }

    /// Validates every mapping against the address limits before applying any of them.
    pub fn map_pages(&self, pasid: Pasid, mappings: &[PageMapping]) -> Result<()> {
        let state = read(&self.state);
        for mapping in mappings {
            state.check_mapping(mapping.iova, mapping.physical_address)?;
        }
        let space = state
            .pasids
            .get(&pasid)
            .ok_or_else(|| self.pasid_not_found(pasid))?;
        space.map_pages(mappings)
    }

    pub fn unmap_pages(&self, pasid: Pasid, iovas: &[u64]) -> Result<()> {
        self.address_space(pasid)?.unmap_pages(iovas)
    }

    /// Translates without recording faults or touching statistics.
    pub fn walk(
        &self,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> core::result::Result<TranslationResult, StageFault> {
        let state = read(&self.state);
        if !state.config.translation_enabled {
            return Ok(TranslationResult::bypass(iova, security));
        }
        if !state.enabled {
            return Err(StageFault::unstaged(SmmuError::StreamDisabled {
                stream_id: self.stream_id,
            }));
        }
        state.check_pasid(pasid).map_err(StageFault::unstaged)?;
        let stage1 = state
            .pasids
            .get(&pasid)
            .cloned()
            .ok_or_else(|| StageFault::unstaged(self.pasid_not_found(pasid)))?;
        if !fits_in_bits(iova, state.limits.max_iova_bits) {
            return Err(StageFault::unstaged(SmmuError::InvalidAddress {
                address: iova,
                bits: state.limits.max_iova_bits,
            }));
        }
        let stage2 = state.stage2.clone();
        let mode = state.config.stage_mode();
        drop(state);

        let offset = page_offset(iova);
        match mode {
            StageMode::Bypass => Ok(TranslationResult::bypass(iova, security)),
            StageMode::Stage1Only => {
                let entry = stage1
                    .translate_secure(iova, access, security)
                    .map_err(|e| StageFault::new(e, FaultStage::Stage1))?;
                Ok(translated(entry.physical_address | offset, None, entry.permissions, security))
            }
            StageMode::Stage2Only => {
                let stage2 = self.require_stage2(stage2)?;
                let entry = stage2
                    .translate_secure(iova, access, security)
                    .map_err(|e| StageFault::new(e, FaultStage::Stage2))?;
                Ok(translated(entry.physical_address | offset, None, entry.permissions, security))
            }
            StageMode::BothStages => {
                let s1 = stage1
                    .translate_secure(iova, access, security)
                    .map_err(|e| StageFault::new(e, FaultStage::Stage1))?;
                let ipa = s1.physical_address | offset;
                let stage2 = self.require_stage2(stage2)?;
                let s2 = stage2
                    .translate_secure(ipa, access, security)
                    .map_err(|e| StageFault::new(e, FaultStage::Stage2))?;
                Ok(translated(
                    s2.physical_address | offset,
                    Some(ipa),
                    s1.permissions & s2.permissions,
                    security,
                ))
            }
        }
    }

    fn require_stage2(
        &self,
        stage2: Option<SharedAddressSpace>,
    ) -> core::result::Result<SharedAddressSpace, StageFault> {
        stage2.ok_or_else(|| {
            StageFault::new(
                SmmuError::InvalidConfiguration(format!(
                    "stream {:#x} has Stage 2 enabled but no Stage-2 address space",
                    self.stream_id
                )),
                FaultStage::Stage2,
            )
        })
    }

    /// Translates, counting the attempt and forwarding any fault to the attached handler.
    pub(crate) fn resolve(
        &self,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> core::result::Result<TranslationResult, StageFault> {
        let result = self.walk(pasid, iova, access, security);
        self.count_translation(result.is_ok());
        match &result {
            Ok(translation) => {
                trace!(
                    stream_id = self.stream_id,
                    pasid,
                    iova,
                    pa = translation.physical_address,
                    "translated"
                );
            }
            Err(fault) => self.record_fault(pasid, iova, access, security, fault),
        }
        result
    }

    pub fn translate(
        &self,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> Result<TranslationResult> {
        self.resolve(pasid, iova, access, security)
            .map_err(|fault| fault.error)
    }

    /// Forwards a fault to the attached handler. Without a handler this only counts it.
    pub fn record_fault(
        &self,
        pasid: Pasid,
        iova: u64,
        access: AccessType,
        security: SecurityState,
        fault: &StageFault,
    ) {
        self.faults.fetch_add(1, Ordering::Relaxed);
        let Some(handler) = self.fault_handler() else {
            return;
        };
        handler.record_fault(FaultRecord {
            stream_id: self.stream_id,
            pasid,
            address: iova,
            fault_type: fault.error.fault_type(),
            access_type: access,
            security_state: security,
            stage: fault.stage,
            timestamp: self.clock.now_ns(),
        });
    }

    pub(crate) fn count_translation(&self, success: bool) {
        self.translations.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn statistics(&self) -> StreamStatistics {
        let (pasid_count, enabled, config) = {
            let state = read(&self.state);
            (state.pasids.len(), state.enabled, state.config)
        };
        StreamStatistics {
            stream_id: self.stream_id,
            translations: self.translations.load(Ordering::Relaxed),
            successful_translations: self.successes.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            pasid_count,
            enabled,
            config,
        }
    }

    pub fn reset_statistics(&self) {
        self.translations.store(0, Ordering::Relaxed);
        self.successes.store(0, Ordering::Relaxed);
        self.faults.store(0, Ordering::Relaxed);
    }
}

fn translated(
    physical_address: u64,
    intermediate_address: Option<u64>,
    permissions: PagePermissions,
    security_state: SecurityState,
) -> TranslationResult {
    TranslationResult {
        physical_address,
        intermediate_address,
        permissions,
        security_state,
        cache_hit: false,
        bypassed: false,
    }
}

fn invalid_stream_config(stream_id: StreamId) -> SmmuError {
    SmmuError::InvalidConfiguration(format!(
        "stream {stream_id:#x}: translation enabled with neither stage enabled"
    ))
}
