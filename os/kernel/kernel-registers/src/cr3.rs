#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalPage, Size4K};

/// CR3 — Page-Map Level-4 Base Register (IA-32e, PCID disabled).
///
/// Holds the physical frame of the root (L4) table and cache-control flags
/// for root-table walks.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2 — Reserved (must be 0).
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3 — PWT: Page-level Write-Through for the root table.
    pub pwt: bool,

    /// Bit 4 — PCD: Page-level Cache Disable for the root table.
    pub pcd: bool,

    /// Bits 5–11 — Reserved (must be 0 when written).
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12–51 — root table frame number.
    #[bits(40)]
    root_frame: u64,

    /// Bits 52–63 — Reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// A `Cr3` value pointing at `root` with write-back caching.
    #[must_use]
    pub fn from_root(root: PhysicalPage<Size4K>) -> Self {
        Self::new().with_root_frame(root.frame_index())
    }

    /// The frame of the active root table.
    #[must_use]
    pub fn root(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_index(self.root_frame())
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
