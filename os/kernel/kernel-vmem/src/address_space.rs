//! # Address Space (x86-64, L4-rooted)
//!
//! One tree of page tables rooted at an L4 frame, and the operations on it:
//!
//! - [`AddressSpace::walk`] / [`AddressSpace::walk_or_create`] to reach the
//!   L1 slot for a virtual address, optionally creating missing tables.
//! - [`AddressSpace::map`] to install a 4 KiB leaf, never overwriting one.
//! - [`AddressSpace::unmap`] to clear a leaf and give empty tables back.
//! - [`AddressSpace::translate`] / [`AddressSpace::is_mapped`] for lookups,
//!   including large pages installed by the bootloader.
//!
//! TLB maintenance and root switching are not done here; see
//! [`PagingControl`](crate::PagingControl).
//!
//! ## Live-entry counting
//!
//! A table at depth `d` is described by the entry at depth `d - 1` that
//! links it (its *holder*). For owned tables the holder's `live_children`
//! field equals the number of present entries in the table:
//!
//! ```text
//!   L4[i4] (owned, live=1) ──► L3: [i3] (owned, live=2) ──► L2: [i2a] ─► L1 ...
//!                                                             [i2b] ─► L1 ...
//! ```
//!
//! Clearing the last present entry of an owned table frees the table and
//! clears its holder, which may in turn empty the next table up. The root
//! has no holder and is never freed.

use crate::info::{KERNEL_HALF_START_INDEX, PAGE_TABLE_ENTRIES};
use crate::{
    FrameAlloc, L1, L2, L3, L4, PageEntry, PageFlags, PageTable, PhysMapper, TableFrame,
    TableLevel, VmmError,
};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{Level, log, trace};

/// The L4 root page of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Number of table levels between the root and a 4 KiB leaf, inclusive.
const DEPTH: usize = 4;

/// Page-table entries hold at most 52 physical address bits.
const PHYS_ADDRESS_LIMIT: u64 = 1 << 52;

/// Index shift of each depth, root first.
const SHIFTS: [u32; DEPTH] = [L4::SHIFT, L3::SHIFT, L2::SHIFT, L1::SHIFT];

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: TableFrame<L4>,
    mapper: &'m M,
}

/// Tables visited from the root towards one virtual address.
#[derive(Copy, Clone, Debug)]
struct Path {
    tables: [PhysicalPage<Size4K>; DEPTH],
    indices: [usize; DEPTH],
    len: usize,
}

impl Path {
    fn new(root: TableFrame<L4>, va: VirtualAddress) -> Self {
        Self {
            tables: [root.frame(); DEPTH],
            indices: [
                L4::index_of(va),
                L3::index_of(va),
                L2::index_of(va),
                L1::index_of(va),
            ],
            len: 1,
        }
    }

    const fn deepest(&self) -> usize {
        self.len - 1
    }

    const fn push(&mut self, table: PhysicalPage<Size4K>) {
        self.tables[self.len] = table;
        self.len += 1;
    }
}

/// The L1 entry slot for one virtual page, with the path that leads to it.
#[derive(Copy, Clone, Debug)]
pub struct LeafSlot {
    path: Path,
}

impl LeafSlot {
    /// The L1 table holding the slot.
    #[must_use]
    pub const fn table(&self) -> TableFrame<L1> {
        TableFrame::from_frame(self.path.tables[DEPTH - 1])
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.path.indices[DEPTH - 1]
    }
}

/// Result of translating a mapped virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Translation {
    /// Physical address of the byte (page base + in-page offset).
    pub address: PhysicalAddress,
    pub flags: PageFlags,
    /// Size in bytes of the page that maps the address.
    pub page_size: u64,
}

enum Walk {
    Leaf(LeafSlot),
    /// A large-page entry at `depth` covers the address.
    Large { entry: PageEntry, depth: usize },
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    /// Allocate a zeroed root table and wrap it.
    ///
    /// # Errors
    /// [`VmmError::OutOfMemory`] if no frame is available.
    pub fn create<A: FrameAlloc + ?Sized>(mapper: &'m M, alloc: &mut A) -> Result<Self, VmmError> {
        let root = alloc.alloc_4k().ok_or(VmmError::OutOfMemory)?;
        mapper.zero_frame(root);
        trace!("new address space with root {root:?}");
        Ok(Self::from_root(mapper, root))
    }

    /// Wrap an existing root table.
    #[inline]
    #[must_use]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self {
            root: TableFrame::from_frame(root),
            mapper,
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root.frame()
    }

    #[inline]
    #[must_use]
    pub const fn root_table(&self) -> TableFrame<L4> {
        self.root
    }

    /// Borrow the table held in `frame`.
    ///
    /// # Safety
    /// `frame` must hold a page table reachable from this root (or the root
    /// itself), and the returned reference must not outlive the current
    /// operation.
    #[inline]
    unsafe fn table(&self, frame: PhysicalPage<Size4K>) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut(frame.base()) }
    }

    #[inline]
    fn entry(&self, frame: PhysicalPage<Size4K>, index: usize) -> PageEntry {
        // SAFETY: only called for frames reached through the walk from the root.
        unsafe { self.table(frame) }.get(index)
    }

    #[inline]
    fn store(&self, frame: PhysicalPage<Size4K>, index: usize, entry: PageEntry) {
        // SAFETY: only called for frames reached through the walk from the root.
        unsafe { self.table(frame) }.set(index, entry);
    }

    /// Share the kernel half of `source` (L4 entries 256..512) with this root.
    ///
    /// Copied entries are not owned; the tables behind them belong to
    /// `source` and are never freed through this address space. Intended for
    /// fresh roots whose upper half is still empty.
    pub fn copy_kernel_half_from(&self, source: RootPage) {
        for index in KERNEL_HALF_START_INDEX..PAGE_TABLE_ENTRIES {
            let entry = self.entry(source, index);
            let copied = if entry.present() {
                entry.borrowed()
            } else {
                PageEntry::absent()
            };
            self.store(self.root(), index, copied);
        }
    }

    /// Reach the L1 slot for `va` without creating anything.
    ///
    /// # Errors
    /// - [`VmmError::InvalidRequest`] for a non-canonical address or one
    ///   covered by a large page.
    /// - [`VmmError::NotMapped`] if an intermediate table is missing.
    pub fn walk(&self, va: VirtualAddress) -> Result<LeafSlot, VmmError> {
        match self.walk_inner(va, None)? {
            Walk::Leaf(slot) => Ok(slot),
            Walk::Large { .. } => Err(VmmError::InvalidRequest("address is covered by a large page")),
        }
    }

    /// Reach the L1 slot for `va`, creating missing tables from `alloc`.
    ///
    /// # Errors
    /// As [`AddressSpace::walk`], with [`VmmError::OutOfMemory`] instead of
    /// [`VmmError::NotMapped`]. Tables created before running out of memory
    /// are released again.
    pub fn walk_or_create<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<LeafSlot, VmmError> {
        match self.walk_inner(va, Some(alloc as &mut dyn FrameAlloc))? {
            Walk::Leaf(slot) => Ok(slot),
            Walk::Large { .. } => Err(VmmError::InvalidRequest("address is covered by a large page")),
        }
    }

    fn walk_inner(
        &self,
        va: VirtualAddress,
        mut alloc: Option<&mut dyn FrameAlloc>,
    ) -> Result<Walk, VmmError> {
        if !va.is_canonical() {
            return Err(VmmError::InvalidRequest("non-canonical virtual address"));
        }

        let mut path = Path::new(self.root, va);
        while path.len < DEPTH {
            let depth = path.deepest();
            let entry = self.entry(path.tables[depth], path.indices[depth]);

            if entry.is_table() {
                path.push(entry.frame());
                continue;
            }
            if entry.present() {
                return Ok(Walk::Large { entry, depth });
            }

            let Some(alloc) = alloc.as_deref_mut() else {
                return Err(VmmError::NotMapped);
            };
            let Some(frame) = alloc.alloc_4k() else {
                self.release(&path, depth, alloc);
                return Err(VmmError::OutOfMemory);
            };
            self.mapper.zero_frame(frame);
            self.fill(&path, depth, PageEntry::owned_table(frame));
            trace!("created table {frame:?} below depth {depth} for {va}");
            path.push(frame);
        }

        Ok(Walk::Leaf(LeafSlot { path }))
    }

    /// Current contents of a leaf slot.
    #[must_use]
    pub fn leaf(&self, slot: &LeafSlot) -> PageEntry {
        self.entry(slot.table().frame(), slot.index())
    }

    /// Map the 4 KiB page containing `va` to the frame containing `pa`.
    ///
    /// Both addresses are aligned down. `flags` are masked to the
    /// architectural bits and `present` is always set.
    ///
    /// # Errors
    /// - [`VmmError::AlreadyMapped`] if the page is mapped; nothing changes.
    /// - [`VmmError::OutOfMemory`] if a table could not be allocated; the
    ///   tree is left as it was.
    /// - [`VmmError::InvalidRequest`] for a non-canonical `va` or a `pa`
    ///   beyond 52 bits.
    pub fn map<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmmError> {
        if pa.as_u64() >= PHYS_ADDRESS_LIMIT {
            return Err(VmmError::InvalidRequest("physical address beyond 52 bits"));
        }
        let slot = match self.walk_inner(va, Some(alloc as &mut dyn FrameAlloc))? {
            Walk::Leaf(slot) => slot,
            Walk::Large { .. } => return Err(VmmError::AlreadyMapped),
        };
        if self.leaf(&slot).present() {
            return Err(VmmError::AlreadyMapped);
        }

        let leaf = PageEntry::leaf(pa.page::<Size4K>(), flags);
        self.fill(&slot.path, DEPTH - 1, leaf);
        Ok(())
    }

    /// Remove the mapping of the page containing `va`.
    ///
    /// Tables left empty are returned to `alloc`. Returns the frame that was
    /// mapped; the frame itself is not freed.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if the page is not mapped.
    /// - [`VmmError::InvalidRequest`] for a non-canonical `va` or one inside a
    ///   large page.
    pub fn unmap<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
    ) -> Result<PhysicalPage<Size4K>, VmmError> {
        let slot = self.walk(va)?;
        let leaf = self.leaf(&slot);
        if !leaf.present() {
            return Err(VmmError::NotMapped);
        }

        self.clear(&slot.path, DEPTH - 1);
        self.release(&slot.path, DEPTH - 1, alloc);
        Ok(leaf.frame())
    }

    /// Whether `va` is mapped. Never allocates; false for non-canonical input.
    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        match self.walk_inner(va, None) {
            Ok(Walk::Leaf(slot)) => self.leaf(&slot).present(),
            Ok(Walk::Large { .. }) => true,
            Err(_) => false,
        }
    }

    /// Physical address `va` maps to.
    ///
    /// # Errors
    /// [`VmmError::NotMapped`] if it is not mapped, [`VmmError::InvalidRequest`]
    /// if it is not canonical.
    pub fn translate(&self, va: VirtualAddress) -> Result<Translation, VmmError> {
        let (entry, depth) = match self.walk_inner(va, None)? {
            Walk::Leaf(slot) => (self.leaf(&slot), DEPTH - 1),
            Walk::Large { entry, depth } => (entry, depth),
        };
        if !entry.present() {
            return Err(VmmError::NotMapped);
        }

        let page_size = 1u64 << SHIFTS[depth];
        let base = entry.frame().base().as_u64() & !(page_size - 1);
        Ok(Translation {
            address: PhysicalAddress::new(base | (va.as_u64() & (page_size - 1))),
            flags: entry.flags(),
            page_size,
        })
    }

    /// Log each entry on the way to `va` at `level`.
    pub fn log_walk(&self, level: Level, va: VirtualAddress) {
        let e4 = self.log_step(level, self.root, va);
        let Some(l3) = TableFrame::<L4>::child(e4) else {
            return;
        };
        let e3 = self.log_step(level, l3, va);
        let Some(l2) = TableFrame::<L3>::child(e3) else {
            return;
        };
        let e2 = self.log_step(level, l2, va);
        let Some(l1) = TableFrame::<L2>::child(e2) else {
            return;
        };
        self.log_step(level, l1, va);
    }

    fn log_step<L: TableLevel>(&self, level: Level, table: TableFrame<L>, va: VirtualAddress) -> PageEntry {
        let index = L::index_of(va);
        let entry = self.entry(table.frame(), index);
        log!(
            level,
            "  {table:?}[{index:3}] = {:#018x} present={} huge={} owned={} live={}",
            entry.into_bits(),
            entry.present(),
            entry.huge(),
            entry.owned(),
            entry.live_children()
        );
        entry
    }

    /// Write a present `entry` into the table at `depth`, counting it if the
    /// slot was empty.
    fn fill(&self, path: &Path, depth: usize, entry: PageEntry) {
        let previous = self.entry(path.tables[depth], path.indices[depth]);
        self.store(path.tables[depth], path.indices[depth], entry);
        if !previous.present() {
            self.adjust_live(path, depth, true);
        }
    }

    /// Clear the slot at `depth`, uncounting it if it was present.
    fn clear(&self, path: &Path, depth: usize) {
        let previous = self.entry(path.tables[depth], path.indices[depth]);
        self.store(path.tables[depth], path.indices[depth], PageEntry::absent());
        if previous.present() {
            self.adjust_live(path, depth, false);
        }
    }

    /// Update the live count kept in the holder of the table at `depth`.
    fn adjust_live(&self, path: &Path, depth: usize, added: bool) {
        if depth == 0 {
            return;
        }
        let (table, index) = (path.tables[depth - 1], path.indices[depth - 1]);
        let holder = self.entry(table, index);
        if !holder.owned() {
            return;
        }

        let live = holder.live_children();
        let live = if added {
            debug_assert!(live < PageEntry::MAX_LIVE_CHILDREN);
            live + 1
        } else {
            debug_assert!(live > 0, "live count underflow in {:?}", path.tables[depth]);
            live.saturating_sub(1)
        };
        self.store(table, index, holder.with_live_children(live));
    }

    /// Free owned tables that became empty, starting at `depth` and moving up.
    fn release(&self, path: &Path, depth: usize, alloc: &mut dyn FrameAlloc) {
        let mut depth = depth;
        while depth > 0 {
            let holder = self.entry(path.tables[depth - 1], path.indices[depth - 1]);
            if !holder.owned() || holder.live_children() != 0 {
                return;
            }

            let table = path.tables[depth];
            self.clear(path, depth - 1);
            alloc.free_4k(table);
            trace!("released empty table {table:?} at depth {depth}");
            depth -= 1;
        }
    }
}
