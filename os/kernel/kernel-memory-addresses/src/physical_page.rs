use crate::{MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`, i.e. a page frame.
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
/// - The frame index is `base / S::SIZE`; the frame bitmap is indexed by it.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    /// Frame containing `p` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: u64) -> Self {
        Self(MemoryPage::from_index(index))
    }

    #[inline]
    #[must_use]
    pub const fn frame_index(self) -> u64 {
        self.0.index()
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    #[inline]
    #[must_use]
    pub const fn join(self, offset: u64) -> PhysicalAddress {
        PhysicalAddress(self.0.join(offset))
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>({:#018X})",
            S::as_str(),
            self.0.base().as_u64()
        )
    }
}
