//! # Virtual Memory Manager (VMM)
//!
//! Owns the frame allocator, the [`Mmu`] seam and the roots of the kernel and
//! the current address space. All page-table edits of the kernel go through
//! here.
//!
//! ## Responsibilities
//!
//! - Build the kernel directory and turn paging on ([`Vmm::install`]).
//! - Map, unmap and translate in the current space, with TLB invalidation.
//! - Clone address spaces (eager copy, kernel tables shared) and tear them down.
//! - Decide what a page fault means ([`Vmm::resolve_page_fault`]).
//! - Back the kernel heap ([`HeapBacking`]).
//!
//! Every mutator runs under an [`IrqGuard`].
//!
//! # Example
//! ```ignore
//! use kernel_alloc::{frame_alloc::FrameStack, phys_mapper::IdentityPhysMapper, vmm::Vmm};
//! let frames = FrameStack::new(&IdentityPhysMapper, placement, limit, Default::default());
//! let mut vmm = Vmm::install(&IdentityPhysMapper, frames, X86Mmu, &KernelLayout::default())?;
//! vmm.map(va, frame, PageEntryBits::new_kernel_rw())?;
//! ```

use crate::frame_alloc::FrameAllocError;
use crate::heap::HeapBacking;
use kernel_info::memory::{KernelLayout, WINDOW_RESERVED_START};
use kernel_sync::IrqGuard;
use kernel_vmem::address_space::{AddressSpace, AddressSpaceError, RootPage};
use kernel_vmem::addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress, VirtualPage,
};
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::page_fault::{PageFaultError, PageFaultReport};
use kernel_vmem::page_table::pd::{L2Index, PdEntry};
use kernel_vmem::page_table::pt::PtEntry;
use kernel_vmem::{FrameAlloc, Mmu, PageEntryBits, PageTableWindow, PhysMapper};

/// How many demand-paged regions can be registered.
pub const MAX_DEMAND_REGIONS: usize = 8;

/// A virtual range `[start, end)` in which absence faults are resolved by
/// mapping a fresh frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DemandRegion {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl DemandRegion {
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        self.start.as_u32() <= va.as_u32() && va.as_u32() < self.end.as_u32()
    }
}

/// Outcome of a recovered page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageFaultResolution {
    /// A fresh, zeroed frame now backs the faulting page.
    DemandMapped(PhysicalPage<Size4K>),
    /// The page was already mapped; only the TLB entry was stale.
    StaleTranslation,
}

/// Why a page fault cannot be recovered.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FaultCause {
    #[error("protection violation")]
    Protection,
    #[error("reserved bit set in a paging structure")]
    ReservedBit,
    #[error("absent page inside the page-table window")]
    InWindow,
    #[error("absent page outside every demand region")]
    OutsideDemandRegion,
    #[error("null page access")]
    NullPage,
    #[error("absent page inside the kernel heap range")]
    KernelHeap,
    #[error("out of physical memory while resolving")]
    OutOfPhysicalMemory,
    #[error("fault inside the memory core")]
    CoreBusy,
    #[error("memory core not installed")]
    Uninitialized,
}

/// A page fault the kernel cannot survive.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[error("fatal page fault, {cause}: {report}")]
pub struct FatalPageFault {
    pub report: PageFaultReport,
    pub cause: FaultCause,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmmError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("{0} lies in the page-table window")]
    ReservedWindow(VirtualAddress),
    #[error("{0} is not page aligned")]
    Misaligned(VirtualAddress),
    #[error("refusing to destroy the kernel address space")]
    KernelSpace,
    #[error("refusing to destroy the active address space")]
    ActiveSpace,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("{0} is not a page directory of this VMM")]
    NotAnAddressSpace(RootPage),
    #[error("no demand region slot left")]
    DemandRegionsFull,
    #[error(transparent)]
    Frame(FrameAllocError),
}

impl From<AddressSpaceError> for VmmError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfMemory { .. } => Self::OutOfPhysicalMemory,
        }
    }
}

impl From<FrameAllocError> for VmmError {
    fn from(value: FrameAllocError) -> Self {
        match value {
            FrameAllocError::OutOfPhysicalMemory => Self::OutOfPhysicalMemory,
            other => Self::Frame(other),
        }
    }
}

/// The kernel's virtual memory manager.
pub struct Vmm<'m, M: PhysMapper, A: FrameAlloc, H: Mmu> {
    mapper: &'m M,
    frames: A,
    mmu: H,
    kernel_root: RootPage,
    current_root: RootPage,
    window: PageTableWindow,
    heap_range: DemandRegion,
    demand: [Option<DemandRegion>; MAX_DEMAND_REGIONS],
}

impl<'m, M: PhysMapper, A: FrameAlloc, H: Mmu> Vmm<'m, M, A, H> {
    /// Build the kernel directory and enable paging.
    ///
    /// 1. Allocate and zero the kernel directory.
    /// 2. Identity-map `[4 KiB, layout.identity_map_end)` supervisor read/write.
    ///    The null page stays unmapped.
    /// 3. Create the page tables covering `[heap_start, heap_max)` so every
    ///    cloned space shares them.
    /// 4. Install the page-table window.
    /// 5. Load the directory and set CR0.PG.
    ///
    /// Runs with interrupts masked. Does not register a fault handler; the
    /// interrupt dispatcher calls [`handle_page_fault`](Self::handle_page_fault).
    ///
    /// # Errors
    /// - [`VmmError::OutOfPhysicalMemory`] if `frames` cannot supply the
    ///   directory or a table.
    /// - [`VmmError::ReservedWindow`] if the heap range reaches into the window.
    pub fn install(
        mapper: &'m M,
        mut frames: A,
        mut mmu: H,
        layout: &KernelLayout,
    ) -> Result<Self, VmmError> {
        let _irq = IrqGuard::new();
        let window = PageTableWindow;
        if layout.heap_max.as_u32() > WINDOW_RESERVED_START {
            return Err(VmmError::ReservedWindow(layout.heap_max));
        }

        let root = frames.alloc_4k().ok_or(VmmError::OutOfPhysicalMemory)?;
        mapper.zero_frame(root);
        let aspace = AddressSpace::from_root(mapper, root);

        let kernel = PageEntryBits::new_kernel_rw();
        let mut pa = PAGE_SIZE;
        while pa < layout.identity_map_end {
            let frame = PhysicalPage::from_addr(PhysicalAddress::new(pa));
            aspace.map_one(&mut frames, VirtualAddress::new(pa), frame, kernel, kernel)?;
            pa += PAGE_SIZE;
        }

        let heap_tables = PageEntryBits::for_access(!layout.heap_supervisor, true);
        let mut slot = layout.heap_start.as_u32() & !(Size4M::SIZE - 1);
        while slot < layout.heap_max.as_u32() {
            aspace.ensure_table(&mut frames, VirtualAddress::new(slot), heap_tables)?;
            let Some(next) = slot.checked_add(Size4M::SIZE) else {
                break;
            };
            slot = next;
        }

        window.install(&aspace, &mut frames)?;

        // SAFETY: the directory identity-maps the running kernel.
        unsafe {
            mmu.load_root(root);
            mmu.enable_paging();
        }
        log::info!(
            "paging enabled: directory {root}, identity map below {:#010x}, heap tables {}..{}",
            layout.identity_map_end,
            layout.heap_start,
            layout.heap_max
        );

        Ok(Self {
            mapper,
            frames,
            mmu,
            kernel_root: root,
            current_root: root,
            window,
            heap_range: DemandRegion {
                start: layout.heap_start,
                end: layout.heap_max,
            },
            demand: [None; MAX_DEMAND_REGIONS],
        })
    }

    #[inline]
    #[must_use]
    pub const fn kernel_root(&self) -> RootPage {
        self.kernel_root
    }

    #[inline]
    #[must_use]
    pub const fn current_root(&self) -> RootPage {
        self.current_root
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> PageTableWindow {
        self.window
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &A {
        &self.frames
    }

    #[inline]
    pub const fn frames_mut(&mut self) -> &mut A {
        &mut self.frames
    }

    #[inline]
    #[must_use]
    pub const fn mmu(&self) -> &H {
        &self.mmu
    }

    /// A view of the address space rooted at `root`.
    #[inline]
    #[must_use]
    pub const fn address_space(&self, root: RootPage) -> AddressSpace<'m, M> {
        AddressSpace::from_root(self.mapper, root)
    }

    /// Make `root` the current address space.
    ///
    /// # Errors
    /// - [`VmmError::NotAnAddressSpace`] if `root` carries no page-table window.
    pub fn switch_address_space(&mut self, root: RootPage) -> Result<(), VmmError> {
        self.ensure_space(root)?;
        let _irq = IrqGuard::new();
        // SAFETY: every directory built here shares the kernel's identity map
        // and heap tables.
        unsafe { self.mmu.load_root(root) };
        self.current_root = root;
        log::debug!("switched to address space {root}");
        Ok(())
    }

    /// Map `virt → frame` in the current address space and invalidate the
    /// TLB entry. An existing mapping is overwritten.
    ///
    /// A missing page table is allocated; its directory entry is writable and
    /// user-accessible if `flags` are.
    ///
    /// # Errors
    /// - [`VmmError::ReservedWindow`] for addresses in the page-table window.
    /// - [`VmmError::Misaligned`] if `virt` is not page aligned.
    /// - [`VmmError::OutOfPhysicalMemory`] if a page table cannot be allocated.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.check_mappable(virt)?;
        let _irq = IrqGuard::new();
        let aspace = self.address_space(self.current_root);
        let table_flags = PageEntryBits::for_access(flags.user_access(), true);
        let previous = aspace.map_one(&mut self.frames, virt, frame, table_flags, flags)?;
        self.mmu.invalidate_page(VirtualPage::containing_address(virt));
        match previous {
            Some(old) if old != frame => log::trace!("remap {virt}: {old} -> {frame}"),
            _ => log::trace!("map {virt} -> {frame}"),
        }
        Ok(())
    }

    /// Map `len` bytes (rounded up to pages) of contiguous physical memory.
    ///
    /// # Errors
    /// - As [`map`](Self::map); `phys` must be frame aligned.
    pub fn map_range(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        len: u32,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let first = PhysicalPage::<Size4K>::try_from(phys)
            .map_err(|pa| VmmError::Frame(FrameAllocError::Misaligned(pa)))?;
        let pages = len.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            let va = virt
                .checked_add(i * PAGE_SIZE)
                .ok_or(VmmError::ReservedWindow(virt))?;
            let frame = first
                .checked_add_pages(i)
                .ok_or(VmmError::Frame(FrameAllocError::Misaligned(phys)))?;
            self.map(va, frame, flags)?;
        }
        Ok(())
    }

    /// Identity-map the frames covering `[start, end)` and return how many
    /// pages were mapped. The null page is never mapped.
    ///
    /// # Errors
    /// - As [`map`](Self::map).
    pub fn identity_map(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<usize, VmmError> {
        let first = start.as_u32().max(PAGE_SIZE) & !(PAGE_SIZE - 1);
        let mut mapped = 0;
        let mut pa = first;
        while pa < end.as_u32() {
            let frame = PhysicalPage::from_addr(PhysicalAddress::new(pa));
            self.map(VirtualAddress::new(pa), frame, flags)?;
            mapped += 1;
            let Some(next) = pa.checked_add(PAGE_SIZE) else {
                break;
            };
            pa = next;
        }
        Ok(mapped)
    }

    /// Clear the mapping of the page containing `virt` in the current address
    /// space and invalidate it. Returns the frame that was mapped; the caller
    /// decides whether to free it. Unmapping an unmapped page is a no-op.
    ///
    /// # Errors
    /// - [`VmmError::ReservedWindow`] for addresses in the page-table window.
    pub fn unmap(&mut self, virt: VirtualAddress) -> Result<Option<PhysicalPage<Size4K>>, VmmError> {
        if self.window.contains(virt) {
            return Err(VmmError::ReservedWindow(virt));
        }
        let _irq = IrqGuard::new();
        let page = VirtualPage::<Size4K>::containing_address(virt);
        let frame = self.address_space(self.current_root).unmap_one(page.base());
        if let Some(frame) = frame {
            self.mmu.invalidate_page(page);
            log::trace!("unmap {page} (was {frame})");
        }
        Ok(frame)
    }

    /// [`unmap`](Self::unmap), then return the frame to the allocator.
    /// Returns whether anything was mapped.
    ///
    /// # Errors
    /// - As [`unmap`](Self::unmap).
    pub fn unmap_and_free(&mut self, virt: VirtualAddress) -> Result<bool, VmmError> {
        let frame = self.unmap(virt)?;
        if let Some(frame) = frame {
            self.frames.free_4k(frame);
        }
        Ok(frame.is_some())
    }

    /// Translate `virt` in the current address space, including the in-page
    /// offset.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.address_space(self.current_root).query(virt)
    }

    /// Create a copy of the address space rooted at `src`.
    ///
    /// Page tables that `src` shares with the kernel directory are linked, not
    /// copied. Every other table is copied along with every page it maps
    /// (contents and the present, writable, user, accessed and dirty bits).
    /// The copy gets its own page-table window.
    ///
    /// # Errors
    /// - [`VmmError::NotAnAddressSpace`] if `src` carries no page-table window.
    /// - [`VmmError::OutOfPhysicalMemory`]; the partial copy is released.
    pub fn clone_address_space(&mut self, src: RootPage) -> Result<RootPage, VmmError> {
        self.ensure_space(src)?;
        let _irq = IrqGuard::new();
        let root = self
            .frames
            .alloc_4k()
            .ok_or(VmmError::OutOfPhysicalMemory)?;
        self.mapper.zero_frame(root);

        match self.copy_space(src, root) {
            Ok(copied) => {
                log::debug!("cloned address space {src} into {root} ({copied} pages copied)");
                Ok(root)
            }
            Err(e) => {
                self.release_space(root);
                Err(e)
            }
        }
    }

    /// Free an address space made by [`clone_address_space`](Self::clone_address_space):
    /// every table not shared with the kernel, every frame those tables map,
    /// the window table and the directory.
    ///
    /// # Errors
    /// - [`VmmError::KernelSpace`] / [`VmmError::ActiveSpace`] for the kernel or
    ///   current directory.
    /// - [`VmmError::NotAnAddressSpace`] if `root` carries no page-table window.
    pub fn destroy_address_space(&mut self, root: RootPage) -> Result<(), VmmError> {
        if root == self.kernel_root {
            return Err(VmmError::KernelSpace);
        }
        if root == self.current_root {
            return Err(VmmError::ActiveSpace);
        }
        self.ensure_space(root)?;
        let _irq = IrqGuard::new();
        self.release_space(root);
        log::debug!("destroyed address space {root}");
        Ok(())
    }

    /// Register `[start, end)` for demand paging.
    ///
    /// As long as no region is registered, every absence fault outside the
    /// window is resolved.
    ///
    /// # Errors
    /// - [`VmmError::ReservedWindow`] if the range reaches into the window.
    /// - [`VmmError::DemandRegionsFull`] after [`MAX_DEMAND_REGIONS`] regions.
    pub fn reserve_demand_region(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmmError> {
        if end.as_u32() > WINDOW_RESERVED_START {
            return Err(VmmError::ReservedWindow(end));
        }
        let _irq = IrqGuard::new();
        let slot = self
            .demand
            .iter_mut()
            .find(|r| r.is_none())
            .ok_or(VmmError::DemandRegionsFull)?;
        *slot = Some(DemandRegion { start, end });
        log::debug!("demand region {start}..{end}");
        Ok(())
    }

    pub fn demand_regions(&self) -> impl Iterator<Item = &DemandRegion> {
        self.demand.iter().flatten()
    }

    /// Decide what a page fault at `address` means and recover if possible.
    ///
    /// An absence fault inside a demand region (or anywhere, without regions)
    /// gets a fresh zeroed frame, writable, with the user bit of the faulting
    /// access. The null page, the page-table window and the kernel heap range
    /// are never demand-paged. Everything else is fatal.
    ///
    /// # Errors
    /// - [`FatalPageFault`] describing the fault and why it is fatal.
    pub fn resolve_page_fault(
        &mut self,
        address: VirtualAddress,
        error: PageFaultError,
        instruction_pointer: Option<VirtualAddress>,
    ) -> Result<PageFaultResolution, FatalPageFault> {
        let mut report = PageFaultReport::new(address, error);
        if let Some(ip) = instruction_pointer {
            report = report.with_instruction_pointer(ip);
        }
        let fatal = |cause| FatalPageFault { report, cause };

        if error.reserved_bit() {
            return Err(fatal(FaultCause::ReservedBit));
        }
        if error.present() {
            return Err(fatal(FaultCause::Protection));
        }
        if self.window.contains(address) {
            return Err(fatal(FaultCause::InWindow));
        }
        if address.as_u32() < PAGE_SIZE {
            return Err(fatal(FaultCause::NullPage));
        }
        if self.heap_range.contains(address) {
            return Err(fatal(FaultCause::KernelHeap));
        }
        if !self.demand_allows(address) {
            return Err(fatal(FaultCause::OutsideDemandRegion));
        }

        let _irq = IrqGuard::new();
        let page = VirtualPage::<Size4K>::containing_address(address);
        if self.translate(address).is_some() {
            self.mmu.invalidate_page(page);
            return Ok(PageFaultResolution::StaleTranslation);
        }

        let frame = self
            .frames
            .alloc_4k()
            .ok_or(fatal(FaultCause::OutOfPhysicalMemory))?;
        self.mapper.zero_frame(frame);
        let flags = PageEntryBits::for_access(error.user(), true);
        let aspace = self.address_space(self.current_root);
        if aspace
            .map_one(&mut self.frames, page.base(), frame, flags, flags)
            .is_err()
        {
            self.frames.free_4k(frame);
            return Err(fatal(FaultCause::OutOfPhysicalMemory));
        }
        self.mmu.invalidate_page(page);
        log::warn!("recovered page fault: {report}; mapped {page} -> {frame}");
        Ok(PageFaultResolution::DemandMapped(frame))
    }

    /// Page-fault handler body: resolve or halt.
    ///
    /// Never returns for a fatal fault.
    pub fn handle_page_fault(
        &mut self,
        address: VirtualAddress,
        error_code: u32,
        instruction_pointer: Option<VirtualAddress>,
    ) -> PageFaultResolution {
        let error = PageFaultError::from_bits(error_code);
        match self.resolve_page_fault(address, error, instruction_pointer) {
            Ok(resolution) => resolution,
            Err(fatal) => fatal_page_fault(&fatal),
        }
    }

    fn demand_allows(&self, va: VirtualAddress) -> bool {
        let mut regions = self.demand_regions().peekable();
        regions.peek().is_none() || regions.any(|r| r.contains(va))
    }

    fn check_mappable(&self, virt: VirtualAddress) -> Result<(), VmmError> {
        if self.window.contains(virt) {
            return Err(VmmError::ReservedWindow(virt));
        }
        if !virt.is_aligned::<Size4K>() {
            return Err(VmmError::Misaligned(virt));
        }
        Ok(())
    }

    fn ensure_space(&self, root: RootPage) -> Result<(), VmmError> {
        self.window
            .window_table(&self.address_space(root))
            .map(|_| ())
            .ok_or(VmmError::NotAnAddressSpace(root))
    }

    /// Whether `entry` points at the kernel's own table for `slot`. Flag bits
    /// (accessed, user) may differ between the two directories.
    fn is_shared_with_kernel(&self, slot: L2Index, entry: PdEntry) -> bool {
        let kernel = self.address_space(self.kernel_root).directory_entry(slot);
        entry.table().is_some() && kernel.table() == entry.table()
    }

    fn copy_space(&mut self, src: RootPage, dst: RootPage) -> Result<usize, VmmError> {
        let mapper = self.mapper;
        let from = self.address_space(src);
        let to = self.address_space(dst);
        let mut copied = 0;

        for slot in L2Index::all() {
            if self.window.is_window_slot(slot) {
                continue;
            }
            let pde = from.directory_entry(slot);
            let Some(src_table) = pde.table() else {
                continue;
            };
            if self.is_shared_with_kernel(slot, pde) {
                to.set_directory_entry(slot, pde);
                continue;
            }

            let dst_table = self
                .frames
                .alloc_4k()
                .ok_or(VmmError::OutOfPhysicalMemory)?;
            mapper.zero_frame(dst_table);
            to.set_directory_entry(slot, PdEntry::make_table(dst_table, pde.flags()));

            let dst_pt = mapper.table_mut(dst_table);
            for (i, frame, flags) in mapper.table_mut(src_table).present_entries() {
                let copy = self
                    .frames
                    .alloc_4k()
                    .ok_or(VmmError::OutOfPhysicalMemory)?;
                mapper.copy_frame(frame, copy);
                dst_pt.set(i, PtEntry::make_4k(copy, flags.clone_flags()));
                copied += 1;
            }
        }

        self.window.install(&to, &mut self.frames)?;
        Ok(copied)
    }

    fn release_space(&mut self, root: RootPage) {
        let mapper = self.mapper;
        let aspace = self.address_space(root);

        for slot in L2Index::all() {
            if self.window.is_window_slot(slot) {
                continue;
            }
            let pde = aspace.directory_entry(slot);
            let Some(table) = pde.table() else {
                continue;
            };
            if self.is_shared_with_kernel(slot, pde) {
                continue;
            }
            for (_, frame, _) in mapper.table_mut(table).present_entries() {
                self.frames.free_4k(frame);
            }
            self.frames.free_4k(table);
        }

        if let Some(window_table) = self.window.window_table(&aspace) {
            self.frames.free_4k(window_table);
        }
        self.frames.free_4k(root);
    }

    fn kernel_translate(&self, va: VirtualAddress) -> Result<PhysicalAddress, VmmError> {
        self.address_space(self.kernel_root)
            .query(va)
            .ok_or(VmmError::NotMapped(va))
    }
}

/// Log a fatal page fault and halt.
pub fn fatal_page_fault(fatal: &FatalPageFault) -> ! {
    log::error!("{fatal}");
    panic!("{fatal}");
}

impl<M: PhysMapper, A: FrameAlloc, H: Mmu> HeapBacking for Vmm<'_, M, A, H> {
    fn map_heap_page(
        &mut self,
        page: VirtualPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        let _irq = IrqGuard::new();
        let frame = self
            .frames
            .alloc_4k()
            .ok_or(VmmError::OutOfPhysicalMemory)?;
        let kernel = self.address_space(self.kernel_root);
        let table_flags = PageEntryBits::for_access(flags.user_access(), true);
        match kernel.map_one(&mut self.frames, page.base(), frame, table_flags, flags) {
            Ok(Some(stale)) => self.frames.free_4k(stale),
            Ok(None) => {}
            Err(e) => {
                self.frames.free_4k(frame);
                return Err(e.into());
            }
        }
        self.mmu.invalidate_page(page);
        Ok(())
    }

    fn release_heap_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), VmmError> {
        let _irq = IrqGuard::new();
        let frame = self
            .address_space(self.kernel_root)
            .unmap_one(page.base())
            .ok_or(VmmError::NotMapped(page.base()))?;
        self.mmu.invalidate_page(page);
        self.frames.free_4k(frame);
        Ok(())
    }

    fn read_u32(&self, va: VirtualAddress) -> Result<u32, VmmError> {
        let pa = self.kernel_translate(va)?;
        // SAFETY: heap words are 4-byte aligned and never straddle a frame.
        Ok(unsafe { *self.mapper.phys_to_mut::<u32>(pa) })
    }

    fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<(), VmmError> {
        let pa = self.kernel_translate(va)?;
        // SAFETY: as above.
        unsafe { *self.mapper.phys_to_mut::<u32>(pa) = value };
        Ok(())
    }

    fn fill(&mut self, va: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError> {
        let mut cursor = va;
        let mut left = len;
        while left > 0 {
            let pa = self.kernel_translate(cursor)?;
            let offset = pa.offset::<Size4K>().as_u32();
            let chunk = left.min(PAGE_SIZE - offset);
            let bytes = self.mapper.frame_bytes_mut(pa.page::<Size4K>());
            bytes[offset as usize..(offset + chunk) as usize].fill(byte);
            left -= chunk;
            if left > 0 {
                cursor = cursor.checked_add(chunk).ok_or(VmmError::NotMapped(cursor))?;
            }
        }
        Ok(())
    }
}
