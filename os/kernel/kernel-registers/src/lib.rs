//! # Typed `X86_64` Registers
//!
//! Bitfield models of the control registers the memory subsystem touches:
//! `CR0` (paging enable), `CR2` (page-fault linear address), `CR3` (root
//! table) and `RFLAGS` (interrupt enable). Loading and storing goes through
//! inline assembly behind the `asm` feature.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "rflags")]
pub mod rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, writing `CR3` replaces the active address space.
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// Loading this register is valid in any privilege level.
    fn load() -> Self;
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}
