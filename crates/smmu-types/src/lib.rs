//! Shared vocabulary for the SMMUv3 emulator.
//!
//! Everything here is plain data: identifiers, address helpers, page permissions, security
//! states, fault records and the single error enum returned by every fallible operation in the
//! emulator crates.

mod addr;
mod error;
mod fault;
mod perms;

pub use addr::{
    fits_in_bits, page_base, page_offset, Pasid, StreamId, MAX_PASID, PAGE_MASK, PAGE_SHIFT,
    PAGE_SIZE, PASID_BITS,
};
pub use error::{Result, SmmuError};
pub use fault::{FaultRecord, FaultStage, FaultType};
pub use perms::{AccessType, PageEntry, PagePermissions, ParsePermissionsError, SecurityState};

/// Outcome of a successful translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TranslationResult {
    pub physical_address: u64,
    /// Stage-1 output when both stages ran.
    pub intermediate_address: Option<u64>,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
    pub cache_hit: bool,
    /// Translation was disabled for the stream and the address passed through untouched.
    pub bypassed: bool,
}

impl TranslationResult {
    pub fn bypass(address: u64, security_state: SecurityState) -> Self {
        Self {
            physical_address: address,
            intermediate_address: None,
            permissions: PagePermissions::all(),
            security_state,
            cache_hit: false,
            bypassed: true,
        }
    }
}
