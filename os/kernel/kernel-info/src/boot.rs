//! # Boot Memory Information
//!
//! Bootloader-independent description of physical memory as reported at boot.

/// Type of a physical memory region.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum MemoryRegionKind {
    /// Free RAM the frame allocator may hand out.
    Usable,
    Reserved,
    AcpiReclaimable,
    AcpiNvs,
    BadMemory,
    /// Bootloader data (page tables, boot stack); reclaimable once boot data is consumed.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    KernelAndModules,
    Framebuffer,
}

impl MemoryRegionKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "usable",
            Self::Reserved => "reserved",
            Self::AcpiReclaimable => "acpi-reclaimable",
            Self::AcpiNvs => "acpi-nvs",
            Self::BadMemory => "bad",
            Self::BootloaderReclaimable => "bootloader-reclaimable",
            Self::KernelAndModules => "kernel+modules",
            Self::Framebuffer => "framebuffer",
        }
    }
}

/// A contiguous physical range reported by the firmware.
///
/// The frame allocator may shrink a usable region to carve out its bitmap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryRegionKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryRegionKind) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MemoryRegionKind::Usable)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }

    /// Exclusive end address, saturating at `u64::MAX`.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// Physical memory facts the memory subsystem is initialized from.
#[derive(Debug)]
pub struct BootMemoryInfo<'a> {
    /// Memory map, in the order reported by the bootloader.
    pub regions: &'a mut [MemoryRegion],
    /// Offset of the higher-half direct map: `virt = phys + hhdm_offset`.
    pub hhdm_offset: u64,
}

impl BootMemoryInfo<'_> {
    /// Sum of the lengths of all usable regions.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.length)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usable_bytes_ignores_other_kinds() {
        let mut regions = [
            MemoryRegion::usable(0, 0x8000),
            MemoryRegion::new(0x8000, 0x1000, MemoryRegionKind::Reserved),
            MemoryRegion::usable(0x10_0000, 0x2000),
        ];
        let info = BootMemoryInfo {
            regions: &mut regions,
            hhdm_offset: 0,
        };
        assert_eq!(info.usable_bytes(), 0xA000);
    }

    #[test]
    fn end_saturates() {
        let r = MemoryRegion::usable(u64::MAX - 1, 16);
        assert_eq!(r.end(), u64::MAX);
    }
}
