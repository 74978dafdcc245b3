use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use smmu_types::{
    page_base, AccessType, PageEntry, PagePermissions, Result, SecurityState, SmmuError,
};

use crate::sync::{read, write};

/// Handle to an address space that may be shared between PASIDs and streams (Stage-2 tables).
/// Mutations through any handle are visible to every holder.
pub type SharedAddressSpace = Arc<AddressSpace>;

/// One entry of a bulk [`AddressSpace::map_pages`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    pub iova: u64,
    pub physical_address: u64,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
}

impl PageMapping {
    pub fn new(iova: u64, physical_address: u64, permissions: PagePermissions) -> Self {
        Self {
            iova,
            physical_address,
            permissions,
            security_state: SecurityState::NonSecure,
        }
    }
}

/// Flat page table: page-aligned input address to [`PageEntry`].
///
/// Addresses handed in are aligned down to the containing page, so any address inside a page
/// names that page.
#[derive(Debug, Default)]
pub struct AddressSpace {
    pages: RwLock<HashMap<u64, PageEntry>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> SharedAddressSpace {
        Arc::new(Self::new())
    }

    pub fn lookup(&self, iova: u64) -> Option<PageEntry> {
        read(&self.pages).get(&page_base(iova)).copied()
    }

    /// Resolves the page containing `iova`, checking `access` against its permissions.
    pub fn translate(&self, iova: u64, access: AccessType) -> Result<PageEntry> {
        let entry = self.mapped_entry(iova)?;
        if !entry.permissions.allows(access) {
            return Err(SmmuError::PagePermissionViolation {
                address: iova,
                access,
            });
        }
        Ok(entry)
    }

    /// Like [`AddressSpace::translate`], additionally requiring that a transaction issued in
    /// `security` may use the page. The security check precedes the permission check.
    pub fn translate_secure(
        &self,
        iova: u64,
        access: AccessType,
        security: SecurityState,
    ) -> Result<PageEntry> {
        let entry = self.mapped_entry(iova)?;
        if !security.can_access(entry.security_state) {
            return Err(SmmuError::InvalidSecurityState {
                address: iova,
                requested: security,
                page: entry.security_state,
            });
        }
        if !entry.permissions.allows(access) {
            return Err(SmmuError::PagePermissionViolation {
                address: iova,
                access,
            });
        }
        Ok(entry)
    }

    fn mapped_entry(&self, iova: u64) -> Result<PageEntry> {
        match self.lookup(iova) {
            Some(entry) if entry.valid => Ok(entry),
            _ => Err(SmmuError::PageNotMapped { address: iova }),
        }
    }

    /// Creates or overwrites the mapping for the page containing `iova`.
    pub fn map_page(&self, iova: u64, physical_address: u64, permissions: PagePermissions) {
        self.map_page_secure(iova, physical_address, permissions, SecurityState::NonSecure);
    }

    pub fn map_page_secure(
        &self,
        iova: u64,
        physical_address: u64,
        permissions: PagePermissions,
        security_state: SecurityState,
    ) {
        let entry =
            PageEntry::new(page_base(physical_address), permissions).with_security(security_state);
        write(&self.pages).insert(page_base(iova), entry);
    }

    /// Returns `false` if nothing was mapped there.
    pub fn unmap_page(&self, iova: u64) -> bool {
        write(&self.pages).remove(&page_base(iova)).is_some()
    }

    /// Maps every entry or none. Two entries naming the same page make the batch invalid.
    pub fn map_pages(&self, mappings: &[PageMapping]) -> Result<()> {
        let mut seen = HashSet::with_capacity(mappings.len());
        for mapping in mappings {
            if !seen.insert(page_base(mapping.iova)) {
                return Err(SmmuError::PageAlreadyMapped {
                    address: page_base(mapping.iova),
                });
            }
        }

        let mut pages = write(&self.pages);
        pages.reserve(mappings.len());
        for mapping in mappings {
            let entry = PageEntry::new(page_base(mapping.physical_address), mapping.permissions)
                .with_security(mapping.security_state);
            pages.insert(page_base(mapping.iova), entry);
        }
        Ok(())
    }

    /// Unmaps every page or none; fails if any page is not mapped.
    pub fn unmap_pages(&self, iovas: &[u64]) -> Result<()> {
        let mut pages = write(&self.pages);
        if let Some(&missing) = iovas.iter().find(|&&iova| !pages.contains_key(&page_base(iova))) {
            return Err(SmmuError::PageNotMapped { address: missing });
        }
        for &iova in iovas {
            pages.remove(&page_base(iova));
        }
        Ok(())
    }

    pub fn is_mapped(&self, iova: u64) -> bool {
        read(&self.pages).contains_key(&page_base(iova))
    }

    pub fn page_count(&self) -> usize {
        read(&self.pages).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.pages).is_empty()
    }

    pub fn clear(&self) {
        write(&self.pages).clear();
    }

    /// Snapshot of all mappings ordered by input address.
    pub fn mappings(&self) -> Vec<(u64, PageEntry)> {
        let mut out: Vec<_> = read(&self.pages)
            .iter()
            .map(|(&iova, &entry)| (iova, entry))
            .collect();
        out.sort_unstable_by_key(|&(iova, _)| iova);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_then_translate_returns_page_entry() {
        let space = AddressSpace::new();
        space.map_page(0x1000_0000, 0x4000_0000, PagePermissions::READ_WRITE);

        let entry = space.translate(0x1000_0123, AccessType::Read).unwrap();
        assert_eq!(entry.physical_address, 0x4000_0000);
        assert!(entry.valid);
        assert_eq!(
            space.translate(0x1000_0000, AccessType::Execute),
            Err(SmmuError::PagePermissionViolation {
                address: 0x1000_0000,
                access: AccessType::Execute
            })
        );
    }

    #[test]
    fn unaligned_map_names_containing_page() {
        let space = AddressSpace::new();
        space.map_page(0x2fff, 0x9abc, PagePermissions::READ);
        assert_eq!(space.mappings(), vec![(0x2000, PageEntry::new(0x9000, PagePermissions::READ))]);
    }

    #[test]
    fn remap_overwrites() {
        let space = AddressSpace::new();
        space.map_page(0x1000, 0x5000, PagePermissions::READ);
        space.map_page(0x1000, 0x6000, PagePermissions::WRITE);
        let entry = space.translate(0x1000, AccessType::Write).unwrap();
        assert_eq!(entry.physical_address, 0x6000);
        assert_eq!(space.page_count(), 1);
    }

    #[test]
    fn unmap_missing_page_is_not_an_error() {
        let space = AddressSpace::new();
        assert!(!space.unmap_page(0x1000));
        space.map_page(0x1000, 0x2000, PagePermissions::READ);
        assert!(space.unmap_page(0x1000));
        assert_eq!(
            space.translate(0x1000, AccessType::Read),
            Err(SmmuError::PageNotMapped { address: 0x1000 })
        );
    }

    #[test]
    fn bulk_map_with_duplicate_page_maps_nothing() {
        let space = AddressSpace::new();
        let batch = [
            PageMapping::new(0x1000, 0xa000, PagePermissions::READ),
            PageMapping::new(0x2000, 0xb000, PagePermissions::READ),
            PageMapping::new(0x2800, 0xc000, PagePermissions::READ),
        ];
        assert_eq!(
            space.map_pages(&batch),
            Err(SmmuError::PageAlreadyMapped { address: 0x2000 })
        );
        assert!(space.is_empty());

        space.map_pages(&batch[..2]).unwrap();
        assert_eq!(space.page_count(), 2);
    }

    #[test]
    fn bulk_unmap_is_all_or_nothing() {
        let space = AddressSpace::new();
        space.map_page(0x1000, 0xa000, PagePermissions::READ);
        space.map_page(0x2000, 0xb000, PagePermissions::READ);

        assert_eq!(
            space.unmap_pages(&[0x1000, 0x3000]),
            Err(SmmuError::PageNotMapped { address: 0x3000 })
        );
        assert_eq!(space.page_count(), 2);

        space.unmap_pages(&[0x1000, 0x2000]).unwrap();
        assert!(space.is_empty());
    }

    #[test]
    fn security_check_precedes_permissions() {
        let space = AddressSpace::new();
        space.map_page_secure(0x1000, 0x8000, PagePermissions::empty(), SecurityState::Secure);

        assert_eq!(
            space.translate_secure(0x1000, AccessType::Read, SecurityState::NonSecure),
            Err(SmmuError::InvalidSecurityState {
                address: 0x1000,
                requested: SecurityState::NonSecure,
                page: SecurityState::Secure,
            })
        );
        assert!(matches!(
            space.translate_secure(0x1000, AccessType::Read, SecurityState::Secure),
            Err(SmmuError::PagePermissionViolation { .. })
        ));
    }

    #[test]
    fn shared_handle_sees_mutations() {
        let a = AddressSpace::new_shared();
        let b = Arc::clone(&a);
        a.map_page(0x1000, 0x2000, PagePermissions::READ);
        assert!(b.is_mapped(0x1000));
        b.clear();
        assert!(a.is_empty());
    }
}
