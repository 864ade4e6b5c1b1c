//! # Kernel Memory Facade
//!
//! One frame allocator, one VMM, and one heap for the whole kernel, each
//! behind the same interrupt-masking spin lock. Callers never see the
//! allocator types; page-table roots are handed out as [`RootHandle`]s.
//!
//! ```text
//! memory::map(root, va, pa, flags)
//!     └─ with_memory ── IrqSpinLock (cli … restore IF)
//!           └─ Vmm::map(&mut frames, …) ── invlpg
//! ```
//!
//! Everything here is usable once [`init`] has run. Before that, queries
//! report zero/false and fallible calls return [`MemoryError::Uninitialized`].

use core::ptr::NonNull;
use kernel_alloc::{
    BitmapFrameAlloc, BumpHeap, FrameAllocError, HeapError, HhdmPhysMapper, Vmm,
};
use kernel_info::boot::BootMemoryInfo;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::{IrqSpinLock, SyncOnceCell};
use kernel_vmem::{PageFlags, RootPage, Translation, VmmError, X86Paging};
use log::{debug, info, warn};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory subsystem is not initialized")]
    Uninitialized,
    #[error("memory subsystem is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Frame(#[from] FrameAllocError),
    #[error(transparent)]
    Vmm(#[from] VmmError),
    #[error(transparent)]
    Heap(#[from] HeapError),
}

/// A page-table root created or adopted by the kernel.
///
/// Every handle maps the kernel half, so switching to one is always safe.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RootHandle(RootPage);

impl RootHandle {
    /// Physical frame of the L4 table.
    #[must_use]
    pub const fn frame(self) -> RootPage {
        self.0
    }
}

struct MemoryState {
    frames: BitmapFrameAlloc<'static>,
    vmm: Vmm<'static, HhdmPhysMapper, X86Paging>,
    /// `None` if not even one frame was free at boot.
    heap: Option<BumpHeap<'static, HhdmPhysMapper>>,
}

static MAPPER: SyncOnceCell<HhdmPhysMapper> = SyncOnceCell::new();
static MEMORY: SyncOnceCell<IrqSpinLock<MemoryState>> = SyncOnceCell::new();

/// Bring up the frame allocator and the heap, and adopt the active root as
/// the kernel address space.
///
/// # Errors
/// [`MemoryError::AlreadyInitialized`] on a second call.
///
/// # Safety
/// - `info` must describe this machine; usable regions are taken over.
/// - Physical memory must be mapped at `info.hhdm_offset`.
pub unsafe fn init(info: BootMemoryInfo<'_>) -> Result<(), MemoryError> {
    let mapper = MAPPER
        .set(HhdmPhysMapper::new(info.hhdm_offset))
        .map_err(|_| MemoryError::AlreadyInitialized)?;
    debug!("memory: hhdm at {:#x}", mapper.offset());

    // SAFETY: the caller hands over the usable regions; the HHDM covers them.
    let mut frames = unsafe { BitmapFrameAlloc::init(info.regions, mapper) };
    if !frames.is_initialized() {
        warn!("memory: running without a frame allocator");
    }

    let heap = BumpHeap::new(mapper, &mut frames)
        .inspect_err(|e| warn!("memory: no kernel heap: {e}"))
        .ok();

    // SAFETY: the kernel runs at CPL0 with paging set up by the bootloader.
    let vmm = Vmm::new(mapper, unsafe { X86Paging::new() });

    MEMORY
        .set(IrqSpinLock::new(MemoryState { frames, vmm, heap }))
        .map_err(|_| MemoryError::AlreadyInitialized)?;
    Ok(())
}

fn with_memory<R>(f: impl FnOnce(&mut MemoryState) -> R) -> Result<R, MemoryError> {
    let memory = MEMORY.get().ok_or(MemoryError::Uninitialized)?;
    Ok(memory.with_lock(f))
}

/// The direct-map mapper, for code that must not take the memory lock.
#[must_use]
pub fn phys_mapper() -> Option<&'static HhdmPhysMapper> {
    MAPPER.get()
}

fn succeeded<T>(op: &str, result: Result<Result<T, VmmError>, MemoryError>) -> bool {
    match result.and_then(|inner| inner.map_err(MemoryError::from)) {
        Ok(_) => true,
        Err(MemoryError::Vmm(e)) => {
            debug!("memory: {op} failed: {e}");
            false
        }
        Err(e) => {
            warn!("memory: {op} failed: {e}");
            false
        }
    }
}

/// Take one free 4 KiB frame.
///
/// # Errors
/// [`MemoryError::Frame`] if memory is exhausted.
pub fn allocate_frame() -> Result<PhysicalAddress, MemoryError> {
    let frame = with_memory(|m| m.frames.allocate())??;
    Ok(frame.base())
}

/// Return the frame containing `pa`.
pub fn free_frame(pa: PhysicalAddress) {
    if with_memory(|m| m.frames.free(pa)).is_err() {
        warn!("memory: free of {pa} before init");
    }
}

#[must_use]
pub fn free_memory_bytes() -> u64 {
    with_memory(|m| m.frames.free_memory()).unwrap_or(0)
}

/// Bytes covered by the frame bitmap, usable or not.
#[must_use]
pub fn total_memory_bytes() -> u64 {
    with_memory(|m| m.frames.total_memory()).unwrap_or(0)
}

/// A new root sharing the kernel half of the active one.
///
/// # Errors
/// [`MemoryError::Vmm`] if no frame is available for the table.
pub fn create_address_space() -> Result<RootHandle, MemoryError> {
    let root = with_memory(|m| m.vmm.create_kernel_address_space(&mut m.frames))??;
    Ok(RootHandle(root))
}

/// The root the kernel runs on: the boot root until [`enable_paging`]
/// installs another.
///
/// # Errors
/// [`MemoryError::Uninitialized`] before [`init`].
pub fn kernel_address_space() -> Result<RootHandle, MemoryError> {
    with_memory(|m| RootHandle(m.vmm.kernel_root()))
}

/// The root loaded right now.
///
/// # Errors
/// [`MemoryError::Uninitialized`] before [`init`].
pub fn active_root() -> Result<RootHandle, MemoryError> {
    with_memory(|m| RootHandle(m.vmm.active_root()))
}

pub fn switch_address_space(root: RootHandle) {
    // SAFETY: every handle maps the kernel half.
    if with_memory(|m| unsafe { m.vmm.switch(root.0) }).is_err() {
        warn!("memory: address space switch before init");
    }
}

/// Map the page at `virt` to the frame at `phys` in `root`.
pub fn map(root: RootHandle, virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) -> bool {
    succeeded(
        "map",
        with_memory(|m| m.vmm.map(&mut m.frames, root.0, virt, phys, flags)),
    )
}

/// Remove the mapping of `virt` in `root`. The mapped frame stays allocated.
pub fn unmap(root: RootHandle, virt: VirtualAddress) -> bool {
    succeeded("unmap", with_memory(|m| m.vmm.unmap(&mut m.frames, root.0, virt)))
}

#[must_use]
pub fn is_mapped(root: RootHandle, virt: VirtualAddress) -> bool {
    with_memory(|m| m.vmm.is_mapped(root.0, virt)).unwrap_or(false)
}

/// # Errors
/// [`MemoryError::Vmm`] if `virt` is not mapped.
pub fn translate(root: RootHandle, virt: VirtualAddress) -> Result<Translation, MemoryError> {
    Ok(with_memory(|m| m.vmm.translate(root.0, virt))??)
}

/// Map `size / 4096` pages `virt_base + k·4096 → phys_base + k·4096` into the
/// kernel address space, leaving pages that are already mapped alone.
/// Returns how many pages were newly mapped.
///
/// # Errors
/// The first failure other than an existing mapping.
pub fn identity_map(
    virt_base: VirtualAddress,
    phys_base: PhysicalAddress,
    size: u64,
    flags: PageFlags,
) -> Result<u64, MemoryError> {
    Ok(with_memory(|m| {
        m.vmm
            .identity_map(&mut m.frames, virt_base, phys_base, size, flags)
    })??)
}

/// Load `root` and turn on paging. Works once; `root` becomes the kernel
/// address space.
///
/// # Errors
/// [`MemoryError::Vmm`] if paging was already enabled through this facade.
pub fn enable_paging(root: RootHandle) -> Result<(), MemoryError> {
    // SAFETY: every handle maps the kernel half.
    Ok(with_memory(|m| unsafe { m.vmm.enable_paging(root.0) })??)
}

/// Map, read back and unmap a scratch page at `va` in the kernel root.
///
/// # Errors
/// Whatever step failed.
pub fn self_test(va: VirtualAddress) -> Result<(), MemoryError> {
    Ok(with_memory(|m| m.vmm.self_test(&mut m.frames, va))??)
}

/// Allocate `size` bytes from the kernel heap, 8-byte aligned.
///
/// `None` for `size == 0`, when the heap cannot grow, or before init.
#[must_use]
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
    let result = with_memory(|m| match m.heap.as_mut() {
        Some(heap) => heap.alloc(&mut m.frames, size),
        None => Err(HeapError::OutOfMemory),
    });
    match result {
        Ok(Ok(ptr)) => Some(ptr),
        Ok(Err(e)) => {
            debug!("kmalloc({size}): {e}");
            None
        }
        Err(_) => None,
    }
}

/// Heap memory is never reclaimed.
pub fn kfree(ptr: NonNull<u8>) {
    let result = with_memory(|m| {
        if let Some(heap) = m.heap.as_mut() {
            heap.free(ptr);
        }
    });
    if result.is_err() {
        warn!("memory: kfree of {ptr:p} before init");
    }
}

#[must_use]
pub fn heap_used() -> u64 {
    with_memory(|m| m.heap.as_ref().map_or(0, BumpHeap::used)).unwrap_or(0)
}

#[must_use]
pub fn heap_total() -> u64 {
    with_memory(|m| m.heap.as_ref().map_or(0, BumpHeap::total)).unwrap_or(0)
}

/// Log total and free physical memory and the heap's size.
pub fn report() {
    info!(
        "memory: {} MiB total, {} MiB free; heap {} of {} bytes used",
        total_memory_bytes() / MIB,
        free_memory_bytes() / MIB,
        heap_used(),
        heap_total()
    );
}
