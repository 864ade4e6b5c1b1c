//! # HHDM-based `PhysMapper`
//!
//! The bootloader maps all of physical memory at a fixed offset in the upper
//! half (the higher-half direct map, HHDM). Physical address `pa` is then
//! reachable at virtual address `hhdm_offset + pa`, independent of which
//! address space is active, because every root shares the kernel half.
//!
//! ```text
//! physical:  0x0000_0000_0012_3000
//!               + hhdm_offset (e.g. 0xffff_8000_0000_0000)
//! virtual:   0xffff_8000_0012_3000
//! ```

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for kernels with a higher-half direct map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// Mapper for an HHDM at `offset`, as reported by the bootloader.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Virtual address through which `pa` is reachable.
    #[must_use]
    pub const fn virt(&self, pa: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(self.offset.wrapping_add(pa.as_u64()))
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.virt(pa).as_u64() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adds_offset() {
        let mapper = HhdmPhysMapper::new(0xffff_8000_0000_0000);
        let pa = PhysicalAddress::new(0x0012_3000);
        assert_eq!(mapper.virt(pa).as_u64(), 0xffff_8000_0012_3000);
        assert_eq!(mapper.phys_to_ptr(pa).addr(), 0xffff_8000_0012_3000);
    }

    #[test]
    fn identity_when_offset_is_zero() {
        let mapper = HhdmPhysMapper::new(0);
        assert_eq!(mapper.phys_to_ptr(PhysicalAddress::new(0x1000)).addr(), 0x1000);
    }
}
