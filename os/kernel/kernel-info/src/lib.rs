//! # Kernel Configuration and Boot Interface
//!
//! Shared data model and layout constants for the memory subsystem.
//!
//! ## Overview
//!
//! The boot protocol hands the kernel a physical memory map and the offset of
//! the higher-half direct map (HHDM). The kernel translates the protocol's
//! memory map into [`MemoryRegion`](boot::MemoryRegion) values so the frame
//! allocator does not depend on a particular bootloader crate.
//!
//! ### Boot Information ([`boot`])
//! * **Memory Regions**: `{base, length, kind}` triples describing RAM.
//! * **Boot Memory Info**: the regions plus the HHDM offset.
//!
//! ### Memory Layout ([`memory`])
//! * **Page geometry**: frame size and page-table fan-out.
//! * **Higher half**: the kernel image location and the root-table split
//!   between user and kernel space.
//! * **Capacities**: fixed-size buffers used before a heap exists.
//!
//! ```text
//! Virtual Address Space Layout (64-bit, 4-level paging):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │   Lower half (L4 index 0..256)  │
//!                       │   per-address-space mappings    │
//! 0x0000_7fff_ffff_ffff ├─────────────────────────────────┤
//!                       │   non-canonical hole            │
//! 0xffff_8000_0000_0000 ├─────────────────────────────────┤
//!                       │   Upper half (L4 index 256..512)│
//!                       │   HHDM, kernel image            │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
