//! Interrupt masking.
//!
//! On bare-metal `x86_64` the guard uses `cli`/`sti` and the `IF` bit of
//! `RFLAGS`. Hosted builds (unit tests) have no interrupts to mask, so the
//! guard only records that it was taken.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use kernel_registers::{LoadRegister, rflags::Rflags};

/// Disables hardware interrupts (`cli`).
///
/// # Safety & Privilege
///
/// Must only be called in ring 0.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Safety & Privilege
///
/// Must only be called in ring 0, typically to restore a previously disabled
/// interrupt state.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        Rflags::load().if_interrupt_enable()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `sti` is executed on drop **only** if interrupts were enabled when the
/// guard was created, so guards nest.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let were_enabled = interrupts_enabled();
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if were_enabled {
            cli_stop_interrupts();
        }
        Self { were_enabled }
    }

    /// Whether interrupts will be re-enabled when this guard drops.
    #[inline]
    #[must_use]
    pub const fn restores_interrupts(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
