//! Page-fault decoding and the fail-stop fault state machine.
//!
//! ```text
//! Running ──fault──► FaultHandling ──report done──► Halted
//!                         │
//!                         └──fault while handling──► Halted
//! ```
//!
//! Faults are never resolved; the handler reports once and stops the CPU.

use bitfield_struct::bitfield;
use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use crate::arch::PagingControl;
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code pushed by the processor.
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,

    /// 0 = read or execute, 1 = write.
    pub write: bool,

    /// 0 = supervisor access, 1 = user-mode access.
    pub user: bool,

    /// A reserved bit was set in a paging-structure entry.
    pub reserved_bit: bool,

    /// The access was an instruction fetch.
    pub instruction_fetch: bool,

    /// Protection-key violation.
    pub protection_key: bool,

    /// Shadow-stack access.
    pub shadow_stack: bool,

    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    /// One-line description of the most specific cause.
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging-structure entry"
        } else if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.protection_key() {
            "Protection-key violation"
        } else if self.shadow_stack() {
            "Shadow-stack access to protected page"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }

    #[must_use]
    pub const fn access(&self) -> &'static str {
        if self.instruction_fetch() {
            "execute"
        } else if self.write() {
            "write"
        } else {
            "read"
        }
    }

    #[must_use]
    pub const fn mode(&self) -> &'static str {
        if self.user() { "user" } else { "kernel" }
    }
}

/// A decoded page fault: the faulting address (CR2) and the error code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub address: VirtualAddress,
    pub error: PageFaultError,
}

impl PageFault {
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self { address, error }
    }

    /// The fault `arch` just took, with the error code the processor pushed.
    #[must_use]
    pub fn capture<C: PagingControl>(arch: &C, code: u64) -> Self {
        Self::new(arch.fault_address(), PageFaultError::from_bits(code))
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {}: {} {} access, err={:#x} ({})",
            self.address,
            self.error.mode(),
            self.error.access(),
            self.error.into_bits(),
            self.error.explain()
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultState {
    Running = 0,
    FaultHandling = 1,
    Halted = 2,
}

/// What a handler should do after [`FaultMonitor::enter`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultEntry {
    /// First fault: report it, then call [`FaultMonitor::halt`].
    Report,
    /// Faulted while handling a fault (or after halting): stop at once.
    HaltNow,
}

/// Tracks the fault state of the processor.
#[derive(Debug)]
pub struct FaultMonitor {
    state: AtomicU8,
}

impl FaultMonitor {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(FaultState::Running as u8),
        }
    }

    #[must_use]
    pub fn state(&self) -> FaultState {
        match self.state.load(Ordering::Acquire) {
            0 => FaultState::Running,
            1 => FaultState::FaultHandling,
            _ => FaultState::Halted,
        }
    }

    /// Record entry into the fault handler.
    #[must_use]
    pub fn enter(&self) -> FaultEntry {
        match self.state.compare_exchange(
            FaultState::Running as u8,
            FaultState::FaultHandling as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => FaultEntry::Report,
            Err(_) => {
                self.halt();
                FaultEntry::HaltNow
            }
        }
    }

    /// The report is out; the processor stops for good.
    pub fn halt(&self) {
        self.state.store(FaultState::Halted as u8, Ordering::Release);
    }
}

impl Default for FaultMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_code_bits() {
        let err = PageFaultError::from_bits(0b0000_0111);
        assert!(err.present() && err.write() && err.user());
        assert!(!err.instruction_fetch());
        assert_eq!(err.explain(), "Write access to protected page");
        assert_eq!(err.access(), "write");
        assert_eq!(err.mode(), "user");

        let err = PageFaultError::from_bits(0b0100_0000);
        assert!(err.shadow_stack());
        assert_eq!(err.explain(), "Non-present page (page not mapped)");

        let err = PageFaultError::from_bits(0b0001_0001);
        assert_eq!(err.explain(), "Kernel instruction fetch on protected page");
        assert_eq!(err.access(), "execute");

        let err = PageFaultError::from_bits(0b0000_1001);
        assert!(err.reserved_bit());
        assert_eq!(err.explain(), "Reserved bit set in a paging-structure entry");

        assert!(PageFaultError::from_bits(0b10_0001).protection_key());
    }

    #[test]
    fn report_line_names_address_and_cause() {
        let fault = PageFault::new(
            VirtualAddress::new(0xDEAD_B000),
            PageFaultError::from_bits(0b10),
        );
        let buf = format!("{fault}");
        assert!(buf.contains("kernel write access"));
        assert!(buf.contains("err=0x2"));
        assert!(buf.contains("Non-present page"));
    }

    #[test]
    fn capture_reads_the_faulting_address() {
        use crate::sim::SimPaging;
        use kernel_memory_addresses::PhysicalPage;

        let arch = SimPaging::booted(PhysicalPage::from_frame_index(1));
        arch.raise_fault(VirtualAddress::new(0x4000_0000_1234));

        let fault = PageFault::capture(&arch, 0b0101);
        assert_eq!(fault.address, VirtualAddress::new(0x4000_0000_1234));
        assert!(fault.error.present() && fault.error.user() && !fault.error.write());
        assert!(format!("{fault}").contains("user read access"));
    }

    #[test]
    fn first_fault_reports_then_halts() {
        let monitor = FaultMonitor::new();
        assert_eq!(monitor.state(), FaultState::Running);

        assert_eq!(monitor.enter(), FaultEntry::Report);
        assert_eq!(monitor.state(), FaultState::FaultHandling);

        monitor.halt();
        assert_eq!(monitor.state(), FaultState::Halted);
    }

    #[test]
    fn nested_fault_halts_immediately() {
        let monitor = FaultMonitor::new();
        assert_eq!(monitor.enter(), FaultEntry::Report);
        assert_eq!(monitor.enter(), FaultEntry::HaltNow);
        assert_eq!(monitor.state(), FaultState::Halted);
        assert_eq!(monitor.enter(), FaultEntry::HaltNow);
    }
}
