use thiserror::Error;

use crate::{AccessType, FaultType, Pasid, SecurityState, StreamId};

pub type Result<T> = std::result::Result<T, SmmuError>;

/// Unified error type for every fallible SMMU operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SmmuError {
    #[error("stream {stream_id:#x} is not configured")]
    StreamNotConfigured { stream_id: StreamId },

    #[error("stream {stream_id:#x} is disabled")]
    StreamDisabled { stream_id: StreamId },

    #[error("PASID {pasid:#x} is outside the permitted range")]
    InvalidPasid { pasid: Pasid },

    #[error("PASID {pasid:#x} is not present on stream {stream_id:#x}")]
    PasidNotFound { stream_id: StreamId, pasid: Pasid },

    #[error("no mapping for address {address:#x}")]
    PageNotMapped { address: u64 },

    #[error("{access:?} access to {address:#x} is not permitted")]
    PagePermissionViolation { address: u64, access: AccessType },

    #[error("address {address:#x} does not fit in {bits} bits")]
    InvalidAddress { address: u64, bits: u32 },

    #[error("stream {stream_id:#x} already holds the maximum of {limit} PASIDs")]
    AddressSpaceExhausted { stream_id: StreamId, limit: usize },

    #[error("page {address:#x} is already mapped")]
    PageAlreadyMapped { address: u64 },

    #[error("{requested:?} transaction may not access {page:?} page at {address:#x}")]
    InvalidSecurityState {
        address: u64,
        requested: SecurityState,
        page: SecurityState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("command queue full (capacity {capacity})")]
    CommandQueueFull { capacity: usize },

    #[error("PRI queue full (capacity {capacity})")]
    PriQueueFull { capacity: usize },

    #[error("event queue full (capacity {capacity})")]
    EventQueueFull { capacity: usize },

    #[error("cache operation failed: {0}")]
    CacheOperationFailed(String),

    #[error("internal error: {0}")]
    InternalError(String),
}

impl SmmuError {
    /// Fault type recorded when this error terminates a translation.
    pub fn fault_type(&self) -> FaultType {
        match self {
            SmmuError::PageNotMapped { .. } => FaultType::TranslationFault,
            SmmuError::PagePermissionViolation { .. } => FaultType::PermissionFault,
            SmmuError::InvalidAddress { .. } => FaultType::AddressSizeFault,
            SmmuError::InvalidSecurityState { .. } => FaultType::SecurityFault,
            _ => FaultType::ConfigurationFault,
        }
    }

    /// Faults a stalled transaction can recover from once software fixes up the mapping.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SmmuError::PageNotMapped { .. } | SmmuError::PagePermissionViolation { .. }
        )
    }

    /// Stable variant name, used when reports refer to an error without its payload.
    pub fn kind(&self) -> &'static str {
        match self {
            SmmuError::StreamNotConfigured { .. } => "StreamNotConfigured",
            SmmuError::StreamDisabled { .. } => "StreamDisabled",
            SmmuError::InvalidPasid { .. } => "InvalidPasid",
            SmmuError::PasidNotFound { .. } => "PasidNotFound",
            SmmuError::PageNotMapped { .. } => "PageNotMapped",
            SmmuError::PagePermissionViolation { .. } => "PagePermissionViolation",
            SmmuError::InvalidAddress { .. } => "InvalidAddress",
            SmmuError::AddressSpaceExhausted { .. } => "AddressSpaceExhausted",
            SmmuError::PageAlreadyMapped { .. } => "PageAlreadyMapped",
            SmmuError::InvalidSecurityState { .. } => "InvalidSecurityState",
            SmmuError::InvalidConfiguration(_) => "InvalidConfiguration",
            SmmuError::CommandQueueFull { .. } => "CommandQueueFull",
            SmmuError::PriQueueFull { .. } => "PriQueueFull",
            SmmuError::EventQueueFull { .. } => "EventQueueFull",
            SmmuError::CacheOperationFailed(_) => "CacheOperationFailed",
            SmmuError::InternalError(_) => "InternalError",
        }
    }

    pub fn is_queue_full(&self) -> bool {
        matches!(
            self,
            SmmuError::CommandQueueFull { .. }
                | SmmuError::PriQueueFull { .. }
                | SmmuError::EventQueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_type_mapping() {
        assert_eq!(
            SmmuError::PageNotMapped { address: 0 }.fault_type(),
            FaultType::TranslationFault
        );
        assert_eq!(
            SmmuError::PagePermissionViolation {
                address: 0,
                access: AccessType::Write
            }
            .fault_type(),
            FaultType::PermissionFault
        );
        assert_eq!(
            SmmuError::InvalidAddress { address: 0, bits: 48 }.fault_type(),
            FaultType::AddressSizeFault
        );
        assert_eq!(
            SmmuError::StreamDisabled { stream_id: 1 }.fault_type(),
            FaultType::ConfigurationFault
        );
    }

    #[test]
    fn retryable_faults() {
        assert!(SmmuError::PageNotMapped { address: 0 }.is_retryable());
        assert!(!SmmuError::PasidNotFound {
            stream_id: 1,
            pasid: 2
        }
        .is_retryable());
    }

    #[test]
    fn kind_names_the_variant() {
        assert_eq!(SmmuError::PageNotMapped { address: 0x40 }.kind(), "PageNotMapped");
        assert_eq!(
            SmmuError::InvalidConfiguration("x".into()).kind(),
            "InvalidConfiguration"
        );
    }

    #[test]
    fn messages_include_ids() {
        let msg = SmmuError::PasidNotFound {
            stream_id: 0x1000,
            pasid: 7,
        }
        .to_string();
        assert_eq!(msg, "PASID 0x7 is not present on stream 0x1000");
    }
}
