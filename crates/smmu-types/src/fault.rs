use serde::{Deserialize, Serialize};

use crate::{AccessType, Pasid, SecurityState, StreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultType {
    /// No valid mapping for the input address.
    TranslationFault,
    /// Mapping present but the access is not granted.
    PermissionFault,
    /// Input or output address outside the configured bus width.
    AddressSizeFault,
    /// Security state of the transaction may not use the page.
    SecurityFault,
    /// Stream/PASID configuration prevented translation.
    ConfigurationFault,
}

/// Which part of the pipeline a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FaultStage {
    Stage1,
    Stage2,
    /// Raised before any stage ran (stream lookup, PASID checks, bus-width checks).
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultRecord {
    pub stream_id: StreamId,
    pub pasid: Pasid,
    pub address: u64,
    pub fault_type: FaultType,
    pub access_type: AccessType,
    pub security_state: SecurityState,
    pub stage: FaultStage,
    /// Nanoseconds since the owning controller was created.
    pub timestamp: u64,
}
