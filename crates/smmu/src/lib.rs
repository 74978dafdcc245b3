//! ARM SMMUv3 emulation: device address translation with a shared TLB and the hardware queues.
//!
//! The model covers:
//! - Per-PASID Stage-1 address spaces and shareable Stage-2 address spaces
//! - Stream configuration (bypass, Stage 1, Stage 2, nested) with enable/disable
//! - A cross-stream LRU translation cache with stream, PASID and range invalidation
//! - Bounded event, command and page-request queues, including the SYNC barrier
//! - Terminate and Stall fault modes, with stalled transactions resumed through PRI
//!
//! [`SmmuController`] is the entry point. Every type is `Send + Sync`; share the controller
//! across threads with an [`Arc`](std::sync::Arc).

mod address_space;
mod clock;
mod controller;
mod fault;
pub mod queue;
mod stats;
mod stream;
mod sync;
mod tlb;

pub use address_space::{AddressSpace, PageMapping, SharedAddressSpace};
pub use clock::Clock;
pub use controller::{CommandQueueReport, SmmuController, StalledTransaction};
pub use fault::{FaultHandler, SharedFaultHandler, DEFAULT_FAULT_LOG_SIZE};
pub use queue::{
    CommandEntry, CommandQueue, CommandType, EventEntry, EventQueue, EventSink, EventType,
    PriEntry, PriQueue,
};
pub use stats::SmmuStatistics;
pub use stream::{
    FaultMode, StageFault, StageMode, StreamConfig, StreamContext, StreamLimits, StreamStatistics,
};
pub use tlb::{CacheStatistics, TlbCache, TlbEntry, TlbKey};

pub use smmu_config as config;
pub use smmu_config::SmmuConfiguration;
pub use smmu_types::*;
