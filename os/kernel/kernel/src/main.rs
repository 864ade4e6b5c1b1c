//! # Kernel Entry Point
//!
//! Limine loads the kernel into the higher half, maps all of physical memory
//! at the HHDM offset, and jumps to [`kmain`] with paging already on.
//!
//! ```text
//! kmain
//!  ├─ QemuLogger::install
//!  ├─ interrupts::install      page-fault gate, everything else masked
//!  ├─ BootMemory::from_limine  memory map + HHDM offset
//!  ├─ memory::init             frame bitmap, heap, kernel root
//!  ├─ memory::report
//!  ├─ (feature "vmm") own address space, paging self test
//!  └─ halt
//! ```
//!
//! On a hosted target the binary only explains that it needs bare metal;
//! the memory subsystem itself is tested in `kernel-alloc` and `kernel-vmem`.

#![cfg_attr(target_os = "none", no_std, no_main)]
#![allow(unsafe_code)]

#[cfg(target_os = "none")]
mod entry {
    use kernel::boot::BootMemory;
    use kernel::{interrupts, memory};
    use kernel_qemu::{QemuLogger, qemu_trace};
    use log::{LevelFilter, error, info};

    static LOGGER: QemuLogger = QemuLogger::new(if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        qemu_trace!("kernel panic: {info}\n");
        interrupts::halt()
    }

    #[unsafe(no_mangle)]
    extern "C" fn kmain() -> ! {
        qemu_trace!("kernel: entered kmain\n");
        if LOGGER.install().is_err() {
            qemu_trace!("kernel: a logger was already installed\n");
        }

        // SAFETY: first thing after entry, at CPL0.
        unsafe { interrupts::install() };

        let mut boot = match BootMemory::from_limine() {
            Ok(boot) => boot,
            Err(e) => {
                error!("boot: {e}");
                interrupts::halt()
            }
        };

        // SAFETY: the map and HHDM offset come straight from the bootloader.
        if let Err(e) = unsafe { memory::init(boot.info()) } {
            error!("memory: init failed: {e}");
            interrupts::halt()
        }
        memory::report();

        #[cfg(feature = "vmm")]
        if let Err(e) = paging_bring_up() {
            error!("vmm: bring-up failed: {e}");
        }

        info!("kernel: boot complete");
        interrupts::halt()
    }

    /// Move onto a kernel-owned root and exercise map/unmap on it.
    #[cfg(feature = "vmm")]
    fn paging_bring_up() -> Result<(), memory::MemoryError> {
        use kernel_info::memory::VMM_SELF_TEST_VA;
        use kernel_memory_addresses::VirtualAddress;

        let root = memory::create_address_space()?;
        memory::enable_paging(root)?;
        info!("vmm: running on {:?}", root.frame());

        memory::self_test(VirtualAddress::new(VMM_SELF_TEST_VA))?;
        memory::report();
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("the kernel runs on bare metal only; build it for x86_64-unknown-none");
}
