use crate::{MemoryAddress, PageSize};
use core::fmt;
use core::marker::PhantomData;

/// A page base address (lower `S::SHIFT` bits are zero).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemoryPage<S: PageSize> {
    value: u64,
    _phantom: PhantomData<S>,
}

impl<S> fmt::Display for MemoryPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}/{}", self.value, S::as_str())
    }
}

impl<S: PageSize> MemoryPage<S> {
    /// Create from an address, aligning down to the page boundary.
    #[inline]
    #[must_use]
    pub const fn from_addr(addr: MemoryAddress) -> Self {
        Self {
            value: addr.as_u64() & !S::OFFSET_MASK,
            _phantom: PhantomData,
        }
    }

    /// Page number `index`, i.e. the page based at `index * S::SIZE`.
    #[inline]
    #[must_use]
    pub const fn from_index(index: u64) -> Self {
        Self::from_addr(MemoryAddress::new(index << S::SHIFT))
    }

    /// Return the base as `MemoryAddress`.
    #[inline]
    #[must_use]
    pub const fn base(self) -> MemoryAddress {
        MemoryAddress::new(self.value)
    }

    /// Page number of this base.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u64 {
        self.value >> S::SHIFT
    }

    /// Combine with an in-page offset to form a full address.
    ///
    /// Offset bits beyond the page size are discarded.
    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> MemoryAddress {
        MemoryAddress::new(self.value | (offset & S::OFFSET_MASK))
    }
}

impl<S: PageSize> fmt::Debug for MemoryPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryPage<{}>(0x{:016X})", S::as_str(), self.value)
    }
}
