/// Requester identifier presented by a device on every transaction.
pub type StreamId = u32;

/// Process address-space identifier (SubstreamID in SMMU terms).
pub type Pasid = u32;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

pub const PASID_BITS: u32 = 20;
pub const MAX_PASID: Pasid = (1 << PASID_BITS) - 1;

#[inline]
pub const fn page_base(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: u64) -> u64 {
    addr & PAGE_MASK
}

/// Whether `addr` is representable in an address bus `bits` wide.
#[inline]
pub const fn fits_in_bits(addr: u64, bits: u32) -> bool {
    bits >= 64 || addr >> bits == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_helpers_split_address() {
        assert_eq!(page_base(0x1234_5678), 0x1234_5000);
        assert_eq!(page_offset(0x1234_5678), 0x678);
        assert_eq!(page_base(0x1000), 0x1000);
    }

    #[test]
    fn fits_in_bits_edges() {
        assert!(fits_in_bits(u64::MAX, 64));
        assert!(fits_in_bits((1 << 48) - 1, 48));
        assert!(!fits_in_bits(1 << 48, 48));
        assert!(fits_in_bits(0, 32));
    }
}
