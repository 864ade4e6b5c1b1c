//! Page tables and level-tagged table frames.

use crate::PageEntry;
use crate::info::PAGE_TABLE_ENTRIES;
use core::fmt;
use core::marker::PhantomData;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

mod sealed {
    pub trait Sealed {}
}

/// One of the four paging levels.
pub trait TableLevel: sealed::Sealed {
    /// Position of this level's 9-bit index inside a virtual address.
    const SHIFT: u32;
    const NAME: &'static str;

    /// Index into a table of this level selected by `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    fn index_of(va: VirtualAddress) -> usize {
        ((va.as_u64() >> Self::SHIFT) & 0x1FF) as usize
    }
}

/// A level whose entries point at further tables.
pub trait NonLeafLevel: TableLevel {
    type Next: TableLevel;
}

/// Root table (PML4), bits 47–39.
pub enum L4 {}
/// Page-directory-pointer table, bits 38–30.
pub enum L3 {}
/// Page directory, bits 29–21.
pub enum L2 {}
/// Page table holding 4 KiB leaves, bits 20–12.
pub enum L1 {}

impl sealed::Sealed for L4 {}
impl sealed::Sealed for L3 {}
impl sealed::Sealed for L2 {}
impl sealed::Sealed for L1 {}

impl TableLevel for L4 {
    const SHIFT: u32 = 39;
    const NAME: &'static str = "L4";
}

impl TableLevel for L3 {
    const SHIFT: u32 = 30;
    const NAME: &'static str = "L3";
}

impl TableLevel for L2 {
    const SHIFT: u32 = 21;
    const NAME: &'static str = "L2";
}

impl TableLevel for L1 {
    const SHIFT: u32 = 12;
    const NAME: &'static str = "L1";
}

impl NonLeafLevel for L4 {
    type Next = L3;
}

impl NonLeafLevel for L3 {
    type Next = L2;
}

impl NonLeafLevel for L2 {
    type Next = L1;
}

/// A 4 KiB page table of any level.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::absent(); PAGE_TABLE_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageEntry::absent());
    }

    #[inline]
    #[must_use]
    pub const fn entries(&self) -> &[PageEntry; PAGE_TABLE_ENTRIES] {
        &self.entries
    }

    /// Number of present entries.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = assert!(size_of::<PageTable>() == 4096);

/// A physical frame known to hold a page table of level `L`.
pub struct TableFrame<L: TableLevel> {
    frame: PhysicalPage<Size4K>,
    _level: PhantomData<L>,
}

impl<L: TableLevel> TableFrame<L> {
    /// Tag `frame` as holding a level-`L` table.
    ///
    /// The caller vouches for the frame's contents; nothing is checked.
    #[inline]
    #[must_use]
    pub const fn from_frame(frame: PhysicalPage<Size4K>) -> Self {
        Self {
            frame,
            _level: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalPage<Size4K> {
        self.frame
    }
}

impl<L: NonLeafLevel> TableFrame<L> {
    /// The next-level table referenced by `entry`, if it is a table link.
    #[inline]
    #[must_use]
    pub const fn child(entry: PageEntry) -> Option<TableFrame<L::Next>> {
        if entry.is_table() {
            Some(TableFrame::from_frame(entry.frame()))
        } else {
            None
        }
    }
}

#[allow(clippy::expl_impl_clone_on_copy)]
impl<L: TableLevel> Clone for TableFrame<L> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<L: TableLevel> Copy for TableFrame<L> {}

impl<L: TableLevel> PartialEq for TableFrame<L> {
    fn eq(&self, other: &Self) -> bool {
        self.frame == other.frame
    }
}

impl<L: TableLevel> Eq for TableFrame<L> {}

impl<L: TableLevel> fmt::Debug for TableFrame<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:#X}", L::NAME, self.frame.base().as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageFlags;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn index_decomposition() {
        let va = VirtualAddress::new(0x0000_7FFF_FFFF_F123);
        assert_eq!(L4::index_of(va), 255);
        assert_eq!(L3::index_of(va), 511);
        assert_eq!(L2::index_of(va), 511);
        assert_eq!(L1::index_of(va), 511);

        let va = VirtualAddress::new((3 << 39) | (5 << 30) | (7 << 21) | (9 << 12) | 0xABC);
        assert_eq!(L4::index_of(va), 3);
        assert_eq!(L3::index_of(va), 5);
        assert_eq!(L2::index_of(va), 7);
        assert_eq!(L1::index_of(va), 9);
    }

    #[test]
    fn kernel_base_lands_in_upper_half() {
        let va = VirtualAddress::new(crate::info::KERNEL_BASE);
        assert_eq!(L4::index_of(va), 511);
        assert_eq!(L3::index_of(va), 510);
    }

    #[test]
    fn child_follows_table_links_only() {
        let frame = PhysicalAddress::new(0x9000).page::<Size4K>();
        let link = PageEntry::owned_table(frame);
        assert_eq!(
            TableFrame::<L4>::child(link).map(TableFrame::frame),
            Some(frame)
        );

        let huge = PageEntry::leaf(frame, PageFlags::WRITABLE).with_huge(true);
        assert!(TableFrame::<L2>::child(huge).is_none());
        assert!(TableFrame::<L3>::child(PageEntry::absent()).is_none());
    }

    #[test]
    fn table_counts_present_entries() {
        let mut t = PageTable::new();
        let frame = PhysicalAddress::new(0x1000).page::<Size4K>();
        t.set(0, PageEntry::leaf(frame, PageFlags::WRITABLE));
        t.set(511, PageEntry::leaf(frame, PageFlags::WRITABLE));
        assert_eq!(t.present_count(), 2);
        t.zero();
        assert_eq!(t.present_count(), 0);
    }
}
