//! Page faults are fatal: report once, then halt.

use crate::memory;
use core::arch::naked_asm;
use kernel_registers::LoadRegisterUnsafe;
use kernel_registers::cr0::Cr0;
use kernel_vmem::fault::{FaultEntry, FaultMonitor, PageFault};
use kernel_vmem::{AddressSpace, PagingControl, X86Paging};
use log::{Level, error};

pub const PAGE_FAULT_VECTOR: usize = 0x0E;

static FAULTS: FaultMonitor = FaultMonitor::new();

/// Interrupt-gate entry: passes the pushed error code on, never returns.
#[unsafe(naked)]
pub extern "C" fn page_fault_entry() {
    naked_asm!(
        "cli",
        // rdi := error code pushed by the CPU
        "mov rdi, [rsp]",
        "and rsp, -16",
        "call {report}",
        "2: hlt",
        "jmp 2b",
        report = sym report_page_fault,
    )
}

extern "C" fn report_page_fault(code: u64) -> ! {
    if FAULTS.enter() == FaultEntry::Report {
        // SAFETY: exception handlers run at CPL0.
        let arch = unsafe { X86Paging::new() };
        let fault = PageFault::capture(&arch, code);
        error!("{fault}");

        // SAFETY: reading CR0 at CPL0 has no side effects.
        let cr0 = unsafe { Cr0::load_unsafe() };
        error!("control: {cr0:?}");

        if let Some(mapper) = memory::phys_mapper() {
            AddressSpace::from_root(mapper, arch.active_root()).log_walk(Level::Error, fault.address);
        }
        FAULTS.halt();
    }
    crate::interrupts::halt()
}
