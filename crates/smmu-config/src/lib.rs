//! Controller configuration: queue depths, TLB sizing, address widths and advisory resource
//! limits.
//!
//! Every section validates itself; [`SmmuConfiguration::validate`] reports the first problem
//! found so callers can reject an update without touching the configuration already in force.

use serde::{Deserialize, Serialize};
use smmu_types::MAX_PASID;
use thiserror::Error;

pub const MAX_QUEUE_SIZE: usize = 1 << 16;
pub const MAX_TLB_CACHE_SIZE: usize = 1 << 20;
pub const MIN_IOVA_BITS: u32 = 32;
pub const MAX_IOVA_BITS: u32 = 64;
pub const MIN_PA_BITS: u32 = 32;
pub const MAX_PA_BITS: u32 = 52;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("malformed configuration: {0}")]
    Parse(String),
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfiguration {
    pub event_queue_size: usize,
    pub command_queue_size: usize,
    pub pri_queue_size: usize,
    /// Fault records the controller keeps; the oldest is discarded once full.
    pub fault_log_size: usize,
}

impl Default for QueueConfiguration {
    fn default() -> Self {
        Self {
            event_queue_size: 512,
            command_queue_size: 256,
            pri_queue_size: 128,
            fault_log_size: 1024,
        }
    }
}

impl QueueConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = MAX_QUEUE_SIZE as u64;
        check_range("eventQueueSize", self.event_queue_size as u64, 1, max)?;
        check_range("commandQueueSize", self.command_queue_size as u64, 1, max)?;
        check_range("priQueueSize", self.pri_queue_size as u64, 1, max)?;
        check_range("faultLogSize", self.fault_log_size as u64, 1, max)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfiguration {
    pub tlb_cache_size: usize,
    /// Entries older than this are treated as misses. `0` disables ageing.
    pub cache_max_age_ms: u64,
    pub enable_caching: bool,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            tlb_cache_size: 1024,
            cache_max_age_ms: 0,
            enable_caching: true,
        }
    }
}

impl CacheConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "tlbCacheSize",
            self.tlb_cache_size as u64,
            1,
            MAX_TLB_CACHE_SIZE as u64,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddressConfiguration {
    /// Width of the input (IOVA) address bus in bits.
    pub max_iova_bits: u32,
    /// Width of the output (PA) address bus in bits.
    pub max_pa_bits: u32,
    pub max_stream_count: usize,
    /// PASIDs allowed per stream.
    pub max_pasid_count: usize,
}

impl Default for AddressConfiguration {
    fn default() -> Self {
        Self {
            max_iova_bits: 48,
            max_pa_bits: 48,
            max_stream_count: 256,
            max_pasid_count: 1024,
        }
    }
}

impl AddressConfiguration {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range(
            "maxIovaBits",
            self.max_iova_bits.into(),
            MIN_IOVA_BITS.into(),
            MAX_IOVA_BITS.into(),
        )?;
        check_range(
            "maxPaBits",
            self.max_pa_bits.into(),
            MIN_PA_BITS.into(),
            MAX_PA_BITS.into(),
        )?;
        if self.max_stream_count == 0 {
            return Err(ConfigError::Zero("maxStreamCount"));
        }
        check_range(
            "maxPasidCount",
            self.max_pasid_count as u64,
            1,
            u64::from(MAX_PASID) + 1,
        )
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

/// Advisory limits. Validated here, consumed by embedders rather than the translation path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub max_memory_usage: u64,
    pub max_thread_count: usize,
    pub timeout_ms: u64,
    pub enable_resource_tracking: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_usage: 256 * 1024 * 1024,
            max_thread_count: 16,
            timeout_ms: 1000,
            enable_resource_tracking: false,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_usage == 0 {
            return Err(ConfigError::Zero("maxMemoryUsage"));
        }
        if self.max_thread_count == 0 {
            return Err(ConfigError::Zero("maxThreadCount"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Zero("timeoutMs"));
        }
        Ok(())
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmmuConfiguration {
    pub queue: QueueConfiguration,
    pub cache: CacheConfiguration,
    pub address: AddressConfiguration,
    pub limits: ResourceLimits,
    /// PASID 0 names the kernel/hypervisor context on some platforms and is reserved on others.
    pub allow_pasid_zero: bool,
}

impl Default for SmmuConfiguration {
    fn default() -> Self {
        Self {
            queue: QueueConfiguration::default(),
            cache: CacheConfiguration::default(),
            address: AddressConfiguration::default(),
            limits: ResourceLimits::default(),
            allow_pasid_zero: true,
        }
    }
}

impl SmmuConfiguration {
    /// Large queues and TLB for throughput-oriented simulation.
    pub fn high_performance() -> Self {
        Self {
            queue: QueueConfiguration {
                event_queue_size: 4096,
                command_queue_size: 2048,
                pri_queue_size: 1024,
                fault_log_size: 8192,
            },
            cache: CacheConfiguration {
                tlb_cache_size: 16 * 1024,
                cache_max_age_ms: 0,
                enable_caching: true,
            },
            address: AddressConfiguration {
                max_iova_bits: 48,
                max_pa_bits: 52,
                max_stream_count: 4096,
                max_pasid_count: 64 * 1024,
            },
            limits: ResourceLimits {
                max_memory_usage: 2 * 1024 * 1024 * 1024,
                max_thread_count: 64,
                timeout_ms: 5000,
                enable_resource_tracking: false,
            },
            allow_pasid_zero: true,
        }
    }

    /// Smallest useful footprint; handy for exercising queue-full and eviction paths.
    pub fn minimal() -> Self {
        Self {
            queue: QueueConfiguration {
                event_queue_size: 16,
                command_queue_size: 16,
                pri_queue_size: 8,
                fault_log_size: 64,
            },
            cache: CacheConfiguration {
                tlb_cache_size: 64,
                cache_max_age_ms: 0,
                enable_caching: true,
            },
            address: AddressConfiguration {
                max_iova_bits: 32,
                max_pa_bits: 32,
                max_stream_count: 16,
                max_pasid_count: 16,
            },
            limits: ResourceLimits {
                max_memory_usage: 16 * 1024 * 1024,
                max_thread_count: 2,
                timeout_ms: 100,
                enable_resource_tracking: false,
            },
            allow_pasid_zero: true,
        }
    }

    /// Default sizing with resource tracking on and PASID 0 reserved.
    pub fn development() -> Self {
        Self {
            limits: ResourceLimits {
                enable_resource_tracking: true,
                ..ResourceLimits::default()
            },
            allow_pasid_zero: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.queue.validate()?;
        self.cache.validate()?;
        self.address.validate()?;
        self.limits.validate()
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Parses and validates a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: SmmuConfiguration =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> String {
        // Plain data with no maps keyed by non-strings; serialization cannot fail.
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
