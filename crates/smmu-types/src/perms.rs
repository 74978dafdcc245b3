use core::fmt;
use core::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Access rights granted by a page mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PagePermissions: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
    }
}

impl PagePermissions {
    pub fn new(read: bool, write: bool, execute: bool) -> Self {
        let mut perms = PagePermissions::empty();
        perms.set(PagePermissions::READ, read);
        perms.set(PagePermissions::WRITE, write);
        perms.set(PagePermissions::EXECUTE, execute);
        perms
    }

    #[inline]
    pub fn allows(self, access: AccessType) -> bool {
        self.contains(access.required_permission())
    }
}

impl fmt::Display for PagePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = if self.contains(PagePermissions::READ) { 'r' } else { '-' };
        let w = if self.contains(PagePermissions::WRITE) { 'w' } else { '-' };
        let x = if self.contains(PagePermissions::EXECUTE) { 'x' } else { '-' };
        write!(f, "{r}{w}{x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid permission string {0:?} (expected a combination of r, w, x)")]
pub struct ParsePermissionsError(pub String);

impl FromStr for PagePermissions {
    type Err = ParsePermissionsError;

    /// Accepts `"rwx"`-style strings; `-` is a placeholder and `"none"` is the empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("none") {
            return Ok(PagePermissions::empty());
        }
        let mut perms = PagePermissions::empty();
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'r' => perms |= PagePermissions::READ,
                'w' => perms |= PagePermissions::WRITE,
                'x' => perms |= PagePermissions::EXECUTE,
                '-' => {}
                _ => return Err(ParsePermissionsError(s.to_string())),
            }
        }
        Ok(perms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    pub const ALL: [AccessType; 3] = [AccessType::Read, AccessType::Write, AccessType::Execute];

    #[inline]
    pub const fn required_permission(self) -> PagePermissions {
        match self {
            AccessType::Read => PagePermissions::READ,
            AccessType::Write => PagePermissions::WRITE,
            AccessType::Execute => PagePermissions::EXECUTE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityState {
    #[default]
    NonSecure,
    Secure,
    Realm,
}

impl SecurityState {
    /// Whether a transaction issued in `self` may use a page mapped under `page`.
    ///
    /// Non-secure memory is reachable from every state; Secure and Realm memory only from their
    /// own state.
    #[inline]
    pub fn can_access(self, page: SecurityState) -> bool {
        page == SecurityState::NonSecure || page == self
    }
}

/// One page mapping inside an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    /// Page-aligned output address.
    pub physical_address: u64,
    pub permissions: PagePermissions,
    pub security_state: SecurityState,
    pub valid: bool,
}

impl PageEntry {
    pub fn new(physical_address: u64, permissions: PagePermissions) -> Self {
        Self {
            physical_address,
            permissions,
            security_state: SecurityState::NonSecure,
            valid: true,
        }
    }

    pub fn with_security(mut self, security_state: SecurityState) -> Self {
        self.security_state = security_state;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_matrix_matches_flags() {
        for bits in 0u8..8 {
            let perms = PagePermissions::from_bits_truncate(bits);
            assert_eq!(perms.allows(AccessType::Read), bits & 1 != 0);
            assert_eq!(perms.allows(AccessType::Write), bits & 2 != 0);
            assert_eq!(perms.allows(AccessType::Execute), bits & 4 != 0);
        }
    }

    #[test]
    fn permissions_parse_and_display() {
        assert_eq!("rw".parse::<PagePermissions>().unwrap(), PagePermissions::READ_WRITE);
        assert_eq!("r-x".parse::<PagePermissions>().unwrap(), PagePermissions::READ_EXECUTE);
        assert_eq!("none".parse::<PagePermissions>().unwrap(), PagePermissions::empty());
        assert!("rq".parse::<PagePermissions>().is_err());
        assert_eq!(PagePermissions::READ_WRITE.to_string(), "rw-");
        assert_eq!(PagePermissions::new(false, false, true).to_string(), "--x");
    }

    #[test]
    fn security_state_access_rules() {
        use SecurityState::*;
        assert!(NonSecure.can_access(NonSecure));
        assert!(!NonSecure.can_access(Secure));
        assert!(!NonSecure.can_access(Realm));
        assert!(Secure.can_access(NonSecure));
        assert!(Secure.can_access(Secure));
        assert!(!Secure.can_access(Realm));
        assert!(Realm.can_access(NonSecure));
        assert!(!Realm.can_access(Secure));
        assert!(Realm.can_access(Realm));
    }

    #[test]
    fn access_type_serializes_camel_case() {
        let json = serde_json::to_string(&AccessType::Execute).unwrap();
        assert_eq!(json, "\"execute\"");
        let state: SecurityState = serde_json::from_str("\"nonSecure\"").unwrap();
        assert_eq!(state, SecurityState::NonSecure);
    }
}
