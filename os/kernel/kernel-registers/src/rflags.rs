#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use crate::LoadRegister;
use bitfield_struct::bitfield;

/// Architectural RFLAGS model for x86-64.
///
/// Only the interrupt-enable flag is consulted by the kernel; the remaining
/// arithmetic and system flags are grouped.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Bits 0–8 — status flags (CF, PF, AF, ZF, SF, TF) and fixed bits.
    #[bits(9)]
    pub low_flags: u16,

    /// Bit 9 — Interrupt Enable Flag (IF).
    pub if_interrupt_enable: bool,

    /// Bit 10 — Direction Flag.
    pub df_direction: bool,

    /// Bit 11 — Overflow Flag.
    pub of_overflow: bool,

    /// Bits 12–63 — IOPL, NT, RF, VM, AC, VIF, VIP, ID and reserved bits.
    #[bits(52)]
    pub high_flags: u64,
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegister for Rflags {
    fn load() -> Self {
        let r: u64;
        unsafe {
            core::arch::asm!("pushfq; pop {}", out(reg) r, options(preserves_flags));
        }
        Self::from_bits(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interrupt_flag_is_bit_9() {
        assert!(Rflags::from_bits(0x202).if_interrupt_enable());
        assert!(!Rflags::from_bits(0x002).if_interrupt_enable());
    }
}
