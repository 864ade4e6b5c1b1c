//! Page-table entry and mapping-flag bitfields.

use bitfield_struct::bitfield;
use core::ops::{BitOr, BitOrAssign};
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// One 64-bit entry of a page table at any level.
///
/// An entry is either absent (all zero) or `frame | flags | present`. In a
/// non-leaf entry the frame is the next-level table; in an L1 entry it is
/// the mapped page.
///
/// Bits 9 and 52–62 are ignored by the processor in non-leaf entries; this
/// crate uses them for table bookkeeping (see [`PageEntry::owned`] and
/// [`PageEntry::live_children`]). Leaf entries keep them zero.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntry {
    /// Bit 0 — Present.
    pub present: bool,
    /// Bit 1 — Writable.
    pub writable: bool,
    /// Bit 2 — User accessible.
    pub user: bool,
    /// Bit 3 — Page-level write-through.
    pub write_through: bool,
    /// Bit 4 — Page-level cache disable.
    pub cache_disabled: bool,
    /// Bit 5 — Accessed (set by the CPU).
    pub accessed: bool,
    /// Bit 6 — Dirty (set by the CPU on leaves).
    pub dirty: bool,
    /// Bit 7 — Page size: a 2 MiB / 1 GiB leaf in L2 / L3 entries.
    pub huge: bool,
    /// Bit 8 — Global translation.
    pub global: bool,

    /// Bit 9 — The referenced table was allocated by this crate and may be
    /// freed when it becomes empty.
    pub owned: bool,

    /// Bits 10–11 — Available to software, unused.
    #[bits(2)]
    pub available: u8,

    /// Bits 12–51 — Frame number.
    #[bits(40)]
    frame_number: u64,

    /// Bits 52–62 — Present entries in the referenced table (non-leaf only).
    #[bits(11)]
    pub live_children: u16,

    /// Bit 63 — No-execute.
    pub no_execute: bool,
}

impl PageEntry {
    /// Entries per table cannot exceed what the counter field holds.
    pub const MAX_LIVE_CHILDREN: u16 = (1 << 11) - 1;

    /// Bits that carry meaning to the MMU in a 4 KiB leaf we install.
    const LEAF_FLAG_MASK: u64 = PageFlags::ARCH_BITS & !PageFlags::HUGE.into_bits();

    /// A zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn absent() -> Self {
        Self::new()
    }

    #[inline]
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.into_bits() == 0
    }

    /// Non-leaf entry linking a freshly allocated table: present, writable, owned.
    #[inline]
    #[must_use]
    pub const fn owned_table(table: PhysicalPage<Size4K>) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_owned(true)
            .with_frame_number(table.frame_index())
    }

    /// 4 KiB leaf entry: `frame | flags | present`.
    ///
    /// Bit 7 selects the PAT in 4 KiB leaves and is dropped from `flags`.
    #[inline]
    #[must_use]
    pub const fn leaf(frame: PhysicalPage<Size4K>, flags: PageFlags) -> Self {
        Self::from_bits(flags.into_bits() & Self::LEAF_FLAG_MASK)
            .with_present(true)
            .with_frame_number(frame.frame_index())
    }

    /// The frame this entry points at.
    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_index(self.frame_number())
    }

    /// Whether the walk continues below this entry.
    #[inline]
    #[must_use]
    pub const fn is_table(&self) -> bool {
        self.present() && !self.huge()
    }

    /// The hardware-visible flags of this entry.
    #[inline]
    #[must_use]
    pub const fn flags(&self) -> PageFlags {
        PageFlags::from_bits(self.into_bits() & PageFlags::ARCH_BITS)
    }

    /// Copy of this entry as it appears in a foreign root: bookkeeping bits cleared.
    #[inline]
    #[must_use]
    pub const fn borrowed(self) -> Self {
        self.with_owned(false).with_live_children(0)
    }
}

/// Flags a caller may request for a mapping.
///
/// Bit positions match the hardware entry layout so `PageFlags` values can be
/// combined with `|` and installed directly.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFlags {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub no_cache: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub huge: bool,
    pub global: bool,
    #[bits(54)]
    __: u64,
    pub no_execute: bool,
}

impl PageFlags {
    pub const PRESENT: Self = Self::new().with_present(true);
    pub const WRITABLE: Self = Self::new().with_writable(true);
    pub const USER: Self = Self::new().with_user(true);
    pub const WRITE_THROUGH: Self = Self::new().with_write_through(true);
    pub const NO_CACHE: Self = Self::new().with_no_cache(true);
    pub const ACCESSED: Self = Self::new().with_accessed(true);
    pub const DIRTY: Self = Self::new().with_dirty(true);
    pub const HUGE: Self = Self::new().with_huge(true);
    pub const GLOBAL: Self = Self::new().with_global(true);
    pub const NO_EXECUTE: Self = Self::new().with_no_execute(true);

    /// Hardware flag bits 0–8 and 63.
    pub const ARCH_BITS: u64 = 0x1FF | (1 << 63);

    /// Keep only recognized flag bits of a raw value.
    #[inline]
    #[must_use]
    pub const fn from_bits_truncate(bits: u64) -> Self {
        Self::from_bits(bits & Self::ARCH_BITS)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.into_bits() & other.into_bits() == other.into_bits()
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() | rhs.into_bits())
    }
}

impl BitOrAssign for PageFlags {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        *self = *self | rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn flag_values_match_hardware_bits() {
        assert_eq!(PageFlags::PRESENT.into_bits(), 0x1);
        assert_eq!(PageFlags::WRITABLE.into_bits(), 0x2);
        assert_eq!(PageFlags::USER.into_bits(), 0x4);
        assert_eq!(PageFlags::WRITE_THROUGH.into_bits(), 0x8);
        assert_eq!(PageFlags::NO_CACHE.into_bits(), 0x10);
        assert_eq!(PageFlags::ACCESSED.into_bits(), 0x20);
        assert_eq!(PageFlags::DIRTY.into_bits(), 0x40);
        assert_eq!(PageFlags::HUGE.into_bits(), 0x80);
        assert_eq!(PageFlags::GLOBAL.into_bits(), 0x100);
        assert_eq!(PageFlags::NO_EXECUTE.into_bits(), 1 << 63);
    }

    #[test]
    fn leaf_forces_present_and_keeps_frame() {
        let frame = PhysicalAddress::new(0x2000).page::<Size4K>();
        let e = PageEntry::leaf(frame, PageFlags::WRITABLE);
        assert_eq!(e.into_bits(), 0x2000 | 0x3);
        assert_eq!(e.frame(), frame);
        assert!(!e.owned());
        assert_eq!(e.live_children(), 0);
    }

    #[test]
    fn leaf_drops_bookkeeping_and_pat_bits() {
        let frame = PhysicalAddress::new(0x5000).page::<Size4K>();
        let e = PageEntry::leaf(frame, PageFlags::from_bits(u64::MAX));
        assert!(!e.owned());
        assert!(!e.huge());
        assert_eq!(e.live_children(), 0);
        assert_eq!(e.available(), 0);
        assert!(e.no_execute());
        assert_eq!(e.frame(), frame);
    }

    #[test]
    fn owned_table_entry_layout() {
        let table = PhysicalAddress::new(0x7_F000).page::<Size4K>();
        let e = PageEntry::owned_table(table).with_live_children(512);
        assert!(e.present() && e.writable() && e.owned());
        assert!(e.is_table());
        assert_eq!(e.frame(), table);
        assert_eq!(e.into_bits() & 0x000F_FFFF_FFFF_F000, 0x7_F000);
        assert_eq!(e.into_bits() >> 52 & 0x7FF, 512);
        assert_eq!(e.flags(), PageFlags::PRESENT | PageFlags::WRITABLE);
        assert!(PageEntry::MAX_LIVE_CHILDREN >= 512);
    }

    #[test]
    fn borrowed_clears_bookkeeping() {
        let table = PhysicalAddress::new(0x3000).page::<Size4K>();
        let e = PageEntry::owned_table(table).with_live_children(3).borrowed();
        assert!(!e.owned());
        assert_eq!(e.live_children(), 0);
        assert!(e.is_table());
    }

    #[test]
    fn flags_combine() {
        let f = PageFlags::WRITABLE | PageFlags::USER;
        assert!(f.contains(PageFlags::USER));
        assert!(!f.contains(PageFlags::GLOBAL));
        assert_eq!(PageFlags::from_bits_truncate(0xFFF).into_bits(), 0x1FF);
    }
}
