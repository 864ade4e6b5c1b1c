//! # Kernel
//!
//! Boot glue and the global memory facade. Everything here targets bare
//! metal; on a hosted target the library is empty.

#![cfg_attr(target_os = "none", no_std)]
#![allow(unsafe_code)]

#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
pub mod interrupts;
#[cfg(target_os = "none")]
pub mod memory;
