//! # Kernel synchronization primitives
//!
//! The memory subsystem runs on a single processor; its global state is
//! serialized by keeping interrupts disabled while it is mutated.
//! [`IrqSpinLock`] bundles that with a spin flag so re-entry from an
//! interrupt handler is detected instead of silently corrupting state.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod irq_spin_lock;
mod sync_once_cell;

pub use irq::IrqGuard;
pub use irq_spin_lock::{IrqSpinLock, IrqSpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
