//! # Kernel Memory Context
//!
//! [`KernelMemory`] bundles the frame allocator, the VMM and the kernel heap
//! into the one value the boot code builds and hands to everything that
//! allocates or maps. It replaces global allocator, directory and heap state.
//!
//! ## Boot order
//!
//! 1. Frame allocator in bump mode, starting at the placement address.
//! 2. VMM: kernel directory, identity map, heap tables, window, paging on.
//! 3. Frame allocator switches to stack mode and takes over the usable RAM
//!    from the boot memory map.
//! 4. Heap: initial pages mapped, one big hole.

use crate::frame_alloc::{FrameAllocError, FrameStack, FrameStackConfig};
use crate::heap::{Blocks, Heap, HeapError};
use crate::vmm::{FatalPageFault, PageFaultResolution, Vmm, VmmError};
use kernel_info::boot::KernelBootInfo;
use kernel_info::memory::KernelLayout;
use kernel_vmem::address_space::RootPage;
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_vmem::page_fault::PageFaultError;
use kernel_vmem::{Mmu, PageEntryBits, PhysMapper};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum BootError {
    #[error("placement address {0} is not inside a usable memory region")]
    NoPlacementRegion(PhysicalAddress),
    #[error("paging setup failed: {0}")]
    Vmm(#[from] VmmError),
    #[error("heap setup failed: {0}")]
    Heap(#[from] HeapError),
}

/// The memory core of the kernel.
pub struct KernelMemory<'m, M: PhysMapper, H: Mmu> {
    vmm: Vmm<'m, M, FrameStack<'m, M>, H>,
    heap: Heap,
}

impl<'m, M: PhysMapper, H: Mmu> KernelMemory<'m, M, H> {
    /// Bring up frame allocator, paging and heap.
    ///
    /// Only frames below `layout.identity_map_end` are managed, since page
    /// tables, frame stack pages and heap frames are reached through the
    /// identity map.
    ///
    /// # Errors
    /// - [`BootError::NoPlacementRegion`] if the placement address lies in no
    ///   usable region of the memory map.
    /// - [`BootError::Vmm`] / [`BootError::Heap`] if a layer runs out of frames.
    pub fn boot(
        mapper: &'m M,
        mmu: H,
        layout: &KernelLayout,
        boot: &KernelBootInfo<'_>,
    ) -> Result<Self, BootError> {
        let no_region = BootError::NoPlacementRegion(boot.placement);
        let region_end = boot.placement_region_end().ok_or(no_region)?;
        let managed_end = u64::from(layout.identity_map_end);
        let bump_limit = u32::try_from(region_end.min(managed_end)).map_err(|_| no_region)?;

        let config = FrameStackConfig {
            limit: managed_end,
            ..FrameStackConfig::default()
        };
        let frames = FrameStack::new(
            mapper,
            boot.placement,
            PhysicalAddress::new(bump_limit),
            config,
        );

        let mut vmm = Vmm::install(mapper, frames, mmu, layout)?;
        vmm.frames_mut().map_physical_ram(boot.memory_map);

        let mut heap = Heap::create(
            &mut vmm,
            layout.heap_start,
            layout.heap_end(),
            layout.heap_max,
            layout.heap_supervisor,
            layout.heap_readonly,
        )?;
        heap.set_min_size(layout.heap_min_size);

        log::info!(
            "memory core up: {} free frames, heap {}..{}",
            vmm.frames().free_frames(),
            heap.start(),
            heap.end()
        );
        Ok(Self { vmm, heap })
    }

    #[inline]
    #[must_use]
    pub const fn vmm(&self) -> &Vmm<'m, M, FrameStack<'m, M>, H> {
        &self.vmm
    }

    #[inline]
    pub const fn vmm_mut(&mut self) -> &mut Vmm<'m, M, FrameStack<'m, M>, H> {
        &mut self.vmm
    }

    #[inline]
    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    #[inline]
    #[must_use]
    pub const fn frames(&self) -> &FrameStack<'m, M> {
        self.vmm.frames()
    }

    // Frames

    /// See [`FrameStack::alloc_frame`].
    ///
    /// # Errors
    /// - [`FrameAllocError::OutOfPhysicalMemory`].
    pub fn alloc_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        self.vmm.frames_mut().alloc_frame()
    }

    /// See [`FrameStack::free_frame`].
    ///
    /// # Errors
    /// - As [`FrameStack::free_frame`].
    pub fn free_frame(&mut self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        self.vmm.frames_mut().free_frame(frame)
    }

    // Paging

    /// See [`Vmm::map`].
    ///
    /// # Errors
    /// - As [`Vmm::map`].
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError> {
        self.vmm.map(virt, frame, flags)
    }

    /// See [`Vmm::identity_map`].
    ///
    /// # Errors
    /// - As [`Vmm::identity_map`].
    pub fn identity_map(
        &mut self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<usize, VmmError> {
        self.vmm.identity_map(start, end, flags)
    }

    /// See [`Vmm::unmap`].
    ///
    /// # Errors
    /// - As [`Vmm::unmap`].
    pub fn unmap(&mut self, virt: VirtualAddress) -> Result<Option<PhysicalPage<Size4K>>, VmmError> {
        self.vmm.unmap(virt)
    }

    /// See [`Vmm::unmap_and_free`].
    ///
    /// # Errors
    /// - As [`Vmm::unmap`].
    pub fn unmap_and_free(&mut self, virt: VirtualAddress) -> Result<bool, VmmError> {
        self.vmm.unmap_and_free(virt)
    }

    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.vmm.translate(virt)
    }

    /// See [`Vmm::switch_address_space`].
    ///
    /// # Errors
    /// - As [`Vmm::switch_address_space`].
    pub fn switch_address_space(&mut self, root: RootPage) -> Result<(), VmmError> {
        self.vmm.switch_address_space(root)
    }

    /// See [`Vmm::clone_address_space`].
    ///
    /// # Errors
    /// - As [`Vmm::clone_address_space`].
    pub fn clone_address_space(&mut self, src: RootPage) -> Result<RootPage, VmmError> {
        self.vmm.clone_address_space(src)
    }

    /// See [`Vmm::destroy_address_space`].
    ///
    /// # Errors
    /// - As [`Vmm::destroy_address_space`].
    pub fn destroy_address_space(&mut self, root: RootPage) -> Result<(), VmmError> {
        self.vmm.destroy_address_space(root)
    }

    /// See [`Vmm::reserve_demand_region`].
    ///
    /// # Errors
    /// - As [`Vmm::reserve_demand_region`].
    pub fn reserve_demand_region(
        &mut self,
        start: VirtualAddress,
        end: VirtualAddress,
    ) -> Result<(), VmmError> {
        self.vmm.reserve_demand_region(start, end)
    }

    /// Decode `error_code` and run the page-fault policy.
    ///
    /// # Errors
    /// - [`FatalPageFault`] for every fault that cannot be recovered.
    pub fn resolve_page_fault(
        &mut self,
        address: VirtualAddress,
        error_code: u32,
        instruction_pointer: Option<VirtualAddress>,
    ) -> Result<PageFaultResolution, FatalPageFault> {
        let error = PageFaultError::from_bits(error_code);
        self.vmm
            .resolve_page_fault(address, error, instruction_pointer)
    }

    /// Page-fault handler body. Halts on fatal faults.
    pub fn handle_page_fault(
        &mut self,
        address: VirtualAddress,
        error_code: u32,
        instruction_pointer: Option<VirtualAddress>,
    ) -> PageFaultResolution {
        self.vmm
            .handle_page_fault(address, error_code, instruction_pointer)
    }

    // Heap

    /// See [`Heap::allocate`].
    ///
    /// # Errors
    /// - As [`Heap::allocate`].
    pub fn allocate(&mut self, size: u32, align: u32) -> Result<VirtualAddress, HeapError> {
        self.heap.allocate(&mut self.vmm, size, align)
    }

    /// See [`Heap::allocate_zeroed`].
    ///
    /// # Errors
    /// - As [`Heap::allocate`].
    pub fn allocate_zeroed(&mut self, size: u32, align: u32) -> Result<VirtualAddress, HeapError> {
        self.heap.allocate_zeroed(&mut self.vmm, size, align)
    }

    /// See [`Heap::free`].
    ///
    /// # Errors
    /// - As [`Heap::free`].
    pub fn free(&mut self, ptr: VirtualAddress) -> Result<(), HeapError> {
        self.heap.free(&mut self.vmm, ptr)
    }

    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> u32 {
        self.heap.used_bytes()
    }

    pub fn heap_blocks(&self) -> Blocks<'_, Vmm<'m, M, FrameStack<'m, M>, H>> {
        self.heap.blocks(&self.vmm)
    }

    /// See [`Heap::check`].
    ///
    /// # Errors
    /// - [`HeapError::Corrupted`] at the first broken block.
    pub fn check_heap(&self) -> Result<(), HeapError> {
        self.heap.check(&self.vmm)
    }
}
