//! Processor paging controls.
//!
//! Everything that touches control registers or the TLB goes through
//! [`PagingControl`]; the rest of the crate only edits tables in memory.

use crate::RootPage;
use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};

/// Architecture interface used by the VMM.
pub trait PagingControl {
    /// Root table the processor currently translates through.
    fn active_root(&self) -> RootPage;

    /// Make `root` the active address space.
    ///
    /// # Safety
    /// `root` must hold a valid L4 table that maps the currently executing
    /// code, its stack, and every structure touched afterwards.
    unsafe fn load_root(&self, root: RootPage);

    fn paging_enabled(&self) -> bool;

    /// Turn on address translation through the active root.
    ///
    /// # Safety
    /// Same requirements as [`PagingControl::load_root`] for the active root.
    unsafe fn enable_paging(&self);

    /// Drop any cached translation for `page` on this processor.
    fn invalidate_page(&self, page: VirtualPage<Size4K>);

    /// Address of the most recent page fault.
    fn fault_address(&self) -> VirtualAddress;
}

#[cfg(target_arch = "x86_64")]
pub use x86::X86Paging;

#[cfg(target_arch = "x86_64")]
mod x86 {
    use super::PagingControl;
    use crate::RootPage;
    use kernel_memory_addresses::{Size4K, VirtualAddress, VirtualPage};
    use kernel_registers::cr0::Cr0;
    use kernel_registers::cr2::Cr2;
    use kernel_registers::cr3::Cr3;
    use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

    /// [`PagingControl`] backed by CR0/CR2/CR3 and `invlpg`.
    #[derive(Debug)]
    pub struct X86Paging {
        _private: (),
    }

    impl X86Paging {
        /// # Safety
        /// The returned value executes privileged instructions; it may only
        /// be used at CPL 0.
        #[must_use]
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }
    }

    impl PagingControl for X86Paging {
        fn active_root(&self) -> RootPage {
            // SAFETY: constructing `X86Paging` asserted CPL 0.
            unsafe { Cr3::load_unsafe() }.root()
        }

        unsafe fn load_root(&self, root: RootPage) {
            unsafe { Cr3::from_root(root).store_unsafe() };
        }

        fn paging_enabled(&self) -> bool {
            // SAFETY: constructing `X86Paging` asserted CPL 0.
            unsafe { Cr0::load_unsafe() }.pg_paging()
        }

        unsafe fn enable_paging(&self) {
            unsafe {
                Cr0::load_unsafe().with_pg_paging(true).store_unsafe();
            }
        }

        fn invalidate_page(&self, page: VirtualPage<Size4K>) {
            let va = page.base().as_u64();
            // SAFETY: invalidating a translation never breaks memory safety.
            unsafe {
                core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
            }
        }

        fn fault_address(&self) -> VirtualAddress {
            // SAFETY: constructing `X86Paging` asserted CPL 0.
            unsafe { Cr2::load_unsafe() }.fault_address()
        }
    }
}
