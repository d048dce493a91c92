use core::fmt;

/// Opaque identifier for an address space.
///
/// Used anywhere a component must *name* an address space without borrowing
/// it, most importantly the frame table's reverse lookup, which records
/// which space's page-table slot a user frame backs. Identifiers are
/// assigned once at address-space creation and never reused within a boot.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as#{}", self.0)
    }
}
