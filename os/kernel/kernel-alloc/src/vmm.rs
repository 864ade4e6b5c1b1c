//! Kernel virtual memory manager.
//!
//! Ties [`AddressSpace`] to a [`PagingControl`]: every change to a mapping is
//! followed by a TLB invalidation, roots can be created, switched to, and
//! paging enabled once. Frames come from a caller-provided [`FrameAlloc`] so
//! the same `Vmm` works over the bitmap allocator and over test pools.
//!
//! # Example
//! ```ignore
//! let mut vmm = Vmm::new(&mapper, unsafe { X86Paging::new() });
//! let root = vmm.create_kernel_address_space(&mut pmm)?;
//! vmm.map(&mut pmm, root, va, pa, PageFlags::WRITABLE)?;
//! unsafe { vmm.switch(root) };
//! ```

use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::{
    AddressSpace, FrameAlloc, PageFlags, PagingControl, PhysMapper, RootPage, Translation,
    VmmError,
};
use log::{debug, info};

/// Virtual memory manager for one processor.
pub struct Vmm<'m, M: PhysMapper, C: PagingControl> {
    mapper: &'m M,
    arch: C,
    /// Root the kernel itself runs on; identity maps go here. Starts as the
    /// boot root and follows [`Vmm::enable_paging`].
    kernel_root: RootPage,
    paging_enabled: bool,
}

impl<'m, M: PhysMapper, C: PagingControl> Vmm<'m, M, C> {
    /// Manage memory starting from the root that is active right now.
    #[must_use]
    pub fn new(mapper: &'m M, arch: C) -> Self {
        let kernel_root = arch.active_root();
        debug!("vmm: kernel root {kernel_root:?}");
        Self {
            mapper,
            arch,
            kernel_root,
            paging_enabled: false,
        }
    }

    #[must_use]
    pub const fn arch(&self) -> &C {
        &self.arch
    }

    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    /// Root the processor currently translates through.
    #[must_use]
    pub fn active_root(&self) -> RootPage {
        self.arch.active_root()
    }

    /// View of the tree rooted at `root`.
    #[must_use]
    pub const fn address_space(&self, root: RootPage) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// A fresh, empty root.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available.
    pub fn create_address_space<A: FrameAlloc>(&self, alloc: &mut A) -> Result<RootPage, VmmError> {
        Ok(AddressSpace::create(self.mapper, alloc)?.root())
    }

    /// A fresh root sharing the kernel half of the active root, so it can be
    /// switched to while the kernel keeps running.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available.
    pub fn create_kernel_address_space<A: FrameAlloc>(
        &self,
        alloc: &mut A,
    ) -> Result<RootPage, VmmError> {
        let space = AddressSpace::create(self.mapper, alloc)?;
        space.copy_kernel_half_from(self.arch.active_root());
        Ok(space.root())
    }

    /// Make `root` the active address space. The previous root is untouched.
    ///
    /// # Safety
    /// `root` must map the running kernel (see
    /// [`Vmm::create_kernel_address_space`]).
    pub unsafe fn switch(&self, root: RootPage) {
        debug!("vmm: switching to {root:?}");
        unsafe { self.arch.load_root(root) };
    }

    /// Map the page at `va` to the frame at `pa` in `root` and drop any stale
    /// translation for `va`.
    ///
    /// # Errors
    /// See [`AddressSpace::map`].
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        root: RootPage,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        self.address_space(root).map(alloc, va, pa, flags)?;
        self.arch.invalidate_page(VirtualPage::containing(va));
        Ok(())
    }

    /// Remove the mapping of `va` in `root`, returning the frame it mapped.
    ///
    /// # Errors
    /// See [`AddressSpace::unmap`].
    pub fn unmap<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        root: RootPage,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let frame = self.address_space(root).unmap(alloc, va)?;
        self.arch.invalidate_page(VirtualPage::containing(va));
        Ok(frame)
    }

    #[must_use]
    pub fn is_mapped(&self, root: RootPage, va: VirtualAddress) -> bool {
        self.address_space(root).is_mapped(va)
    }

    /// # Errors
    /// See [`AddressSpace::translate`].
    pub fn translate(&self, root: RootPage, va: VirtualAddress) -> Result<Translation, VmmError> {
        self.address_space(root).translate(va)
    }

    /// Map `size / 4096` consecutive pages `virt_base + k·4096 → phys_base + k·4096`
    /// in the kernel root. A trailing partial page is not mapped.
    ///
    /// Pages that are already mapped are left as they are. Returns the number
    /// of pages newly mapped.
    ///
    /// # Errors
    /// The first error other than [`VmmError::AlreadyMapped`]; pages mapped
    /// before it stay mapped.
    pub fn identity_map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        virt_base: VirtualAddress,
        phys_base: PhysicalAddress,
        size: u64,
        flags: PageFlags,
    ) -> Result<u64, VmmError> {
        let pages = size / PAGE_SIZE;
        let mut mapped = 0;
        for k in 0..pages {
            let offset = k * PAGE_SIZE;
            let va = virt_base
                .as_u64()
                .checked_add(offset)
                .ok_or(VmmError::InvalidRequest("virtual range wraps around"))?;
            let pa = phys_base
                .as_u64()
                .checked_add(offset)
                .ok_or(VmmError::InvalidRequest("physical range wraps around"))?;

            match self.map(
                alloc,
                self.kernel_root,
                VirtualAddress::new(va),
                PhysicalAddress::new(pa),
                flags,
            ) {
                Ok(()) => mapped += 1,
                Err(VmmError::AlreadyMapped) => debug!("identity map: {va:#x} already mapped"),
                Err(e) => return Err(e),
            }
        }
        Ok(mapped)
    }

    /// Load `root`, turn on paging, and make `root` the kernel root that
    /// [`Vmm::identity_map`] and [`Vmm::self_test`] work on. Allowed once per
    /// `Vmm`.
    ///
    /// # Errors
    /// [`VmmError::InvalidRequest`] on a second call; nothing is changed.
    ///
    /// # Safety
    /// `root` must map the running kernel.
    pub unsafe fn enable_paging(&mut self, root: RootPage) -> Result<(), VmmError> {
        if self.paging_enabled {
            return Err(VmmError::InvalidRequest("paging is already enabled"));
        }
        unsafe {
            self.arch.load_root(root);
            self.arch.enable_paging();
        }
        self.paging_enabled = true;
        self.kernel_root = root;
        info!("vmm: paging enabled with root {root:?}");
        Ok(())
    }

    /// Map one scratch page at `va`, check it is visible, unmap it again.
    ///
    /// # Errors
    /// Any failure of the individual steps.
    pub fn self_test<A: FrameAlloc>(&self, alloc: &mut A, va: VirtualAddress) -> Result<(), VmmError> {
        let frame = alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        let result = self.exercise(alloc, va, frame);
        alloc.free_4k(frame);
        result
    }

    fn exercise<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
    ) -> Result<(), VmmError> {
        let root = self.kernel_root;
        self.map(alloc, root, va, frame.base(), PageFlags::WRITABLE | PageFlags::NO_EXECUTE)?;
        let seen = self.translate(root, va)?.address;
        let unmapped = self.unmap(alloc, root, va)?;

        if seen != frame.base() || unmapped != frame {
            return Err(VmmError::InvalidRequest("self test read back a different frame"));
        }
        if self.is_mapped(root, va) {
            return Err(VmmError::InvalidRequest("self test page still mapped"));
        }
        info!("vmm: self test at {va} passed");
        Ok(())
    }
}
