//! # Global Allocator Adapter
//!
//! [`KernelHeapAllocator`] lets the kernel use its heap through
//! `#[global_allocator]`. It owns the [`KernelMemory`] behind an
//! interrupt-masking [`SpinLock`].
//!
//! ```ignore
//! #[global_allocator]
//! static KERNEL: KernelHeapAllocator<IdentityPhysMapper, X86Mmu> = KernelHeapAllocator::new();
//!
//! let memory = KernelMemory::boot(&IdentityPhysMapper, X86Mmu, &layout, &boot_info)?;
//! KERNEL.install(memory).ok();
//! ```
//!
//! Exhaustion makes `alloc` return null, which ends in the alloc error handler.
//! Heap corruption and foreign frees panic.

use crate::heap::HeapError;
use crate::kernel_memory::KernelMemory;
use crate::vmm::{FatalPageFault, FaultCause, PageFaultResolution, VmmError, fatal_page_fault};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{null_mut, with_exposed_provenance_mut};
use kernel_sync::SpinLock;
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::page_fault::{PageFaultError, PageFaultReport};
use kernel_vmem::{Mmu, PhysMapper};

pub struct KernelHeapAllocator<M: PhysMapper + 'static, H: Mmu + 'static> {
    memory: SpinLock<Option<KernelMemory<'static, M, H>>>,
}

impl<M: PhysMapper + 'static, H: Mmu + 'static> Default for KernelHeapAllocator<M, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: PhysMapper + 'static, H: Mmu + 'static> KernelHeapAllocator<M, H> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: SpinLock::new(None),
        }
    }

    /// Hand the booted memory core to the allocator.
    ///
    /// # Errors
    /// Gives `memory` back if a core is already installed.
    pub fn install(&self, memory: KernelMemory<'static, M, H>) -> Result<(), KernelMemory<'static, M, H>> {
        let mut slot = self.memory.lock_irq();
        if slot.is_some() {
            return Err(memory);
        }
        *slot = Some(memory);
        Ok(())
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.memory.lock_irq().is_some()
    }

    /// Run `f` on the installed memory core with interrupts masked.
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelMemory<'static, M, H>) -> R) -> Option<R> {
        self.memory.lock_irq().as_mut().map(f)
    }

    /// Page-fault handler body for the interrupt dispatcher.
    ///
    /// A fault taken while the memory core is locked hit the core's own
    /// metadata and is fatal, as is a fault before installation.
    pub fn handle_page_fault(
        &self,
        address: VirtualAddress,
        error_code: u32,
        instruction_pointer: Option<VirtualAddress>,
    ) -> PageFaultResolution {
        let Some(mut memory) = self.memory.try_lock_irq() else {
            fatal(address, error_code, instruction_pointer, FaultCause::CoreBusy)
        };
        match memory.as_mut() {
            Some(memory) => memory.handle_page_fault(address, error_code, instruction_pointer),
            None => fatal(address, error_code, instruction_pointer, FaultCause::Uninitialized),
        }
    }
}

fn fatal(
    address: VirtualAddress,
    error_code: u32,
    instruction_pointer: Option<VirtualAddress>,
    cause: FaultCause,
) -> ! {
    let mut report = PageFaultReport::new(address, PageFaultError::from_bits(error_code));
    if let Some(ip) = instruction_pointer {
        report = report.with_instruction_pointer(ip);
    }
    fatal_page_fault(&FatalPageFault { report, cause })
}

fn to_pointer(result: Option<Result<VirtualAddress, HeapError>>) -> *mut u8 {
    match result {
        Some(Ok(va)) => with_exposed_provenance_mut(va.as_usize()),
        Some(Err(
            e @ (HeapError::Exhausted { .. } | HeapError::Backing(VmmError::OutOfPhysicalMemory)),
        )) => {
            log::warn!("kernel heap: {e}");
            null_mut()
        }
        Some(Err(e)) => {
            log::error!("kernel heap: {e}");
            panic!("kernel heap: {e}");
        }
        None => null_mut(),
    }
}

fn layout_parts(layout: Layout) -> Option<(u32, u32)> {
    Some((
        u32::try_from(layout.size()).ok()?,
        u32::try_from(layout.align()).ok()?,
    ))
}

unsafe impl<M: PhysMapper + 'static, H: Mmu + 'static> GlobalAlloc for KernelHeapAllocator<M, H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some((size, align)) = layout_parts(layout) else {
            return null_mut();
        };
        to_pointer(self.with(|memory| memory.allocate(size, align)))
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let Some((size, align)) = layout_parts(layout) else {
            return null_mut();
        };
        to_pointer(self.with(|memory| memory.allocate_zeroed(size, align)))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let Ok(address) = u32::try_from(ptr.expose_provenance()) else {
            panic!("{ptr:p} is not a kernel heap pointer");
        };
        match self.with(|memory| memory.free(VirtualAddress::new(address))) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                log::error!("kernel heap: {e}");
                panic!("kernel heap: {e}");
            }
            None => panic!("dealloc of {ptr:p} before the kernel heap was installed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::{KernelBootInfo, MemoryRegion};
    use kernel_info::memory::KernelLayout;
    use kernel_vmem::testing::{RecordingMmu, TestPhys};

    type TestAllocator = KernelHeapAllocator<TestPhys, RecordingMmu>;

    fn boot() -> KernelMemory<'static, TestPhys, RecordingMmu> {
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(64)));
        let map = [MemoryRegion::usable(
            u64::from(phys.base().as_u32()),
            u64::from(phys.end().as_u32() - phys.base().as_u32()),
        )];
        let layout = KernelLayout {
            identity_map_end: 0x0040_0000,
            heap_initial_size: 0x2000,
            heap_min_size: 0x2000,
            heap_max: VirtualAddress::new(0xC040_0000),
            ..KernelLayout::default()
        };
        let info = KernelBootInfo {
            placement: phys.base(),
            memory_map: &map,
        };
        KernelMemory::boot(phys, RecordingMmu::default(), &layout, &info).unwrap()
    }

    #[test]
    fn allocations_go_through_the_installed_heap() {
        let allocator = TestAllocator::new();
        let layout = Layout::from_size_align(24, 8).unwrap();
        assert!(unsafe { allocator.alloc(layout) }.is_null());

        assert!(allocator.install(boot()).is_ok());
        assert!(allocator.is_installed());
        assert!(allocator.install(boot()).is_err());

        let p = unsafe { allocator.alloc(layout) };
        assert_eq!(p.addr(), 0xC000_0000 + 16);
        assert_eq!(allocator.with(|m| m.used_bytes()), Some(32));

        unsafe { allocator.dealloc(p, layout) };
        assert_eq!(allocator.with(|m| m.used_bytes()), Some(0));
        assert_eq!(allocator.with(|m| m.check_heap()), Some(Ok(())));
    }

    #[test]
    fn exhaustion_returns_null() {
        let allocator = TestAllocator::new();
        assert!(allocator.install(boot()).is_ok());
        let huge = Layout::from_size_align(0x0100_0000, 16).unwrap();
        assert!(unsafe { allocator.alloc(huge) }.is_null());
        assert_eq!(allocator.with(|m| m.check_heap()), Some(Ok(())));
    }

    #[test]
    #[should_panic(expected = "already free")]
    fn double_dealloc_panics() {
        let allocator = TestAllocator::new();
        assert!(allocator.install(boot()).is_ok());
        let layout = Layout::from_size_align(8, 8).unwrap();
        let p = unsafe { allocator.alloc(layout) };
        let _q = unsafe { allocator.alloc(layout) };
        unsafe {
            allocator.dealloc(p, layout);
            allocator.dealloc(p, layout);
        }
    }

    #[test]
    #[should_panic(expected = "memory core not installed")]
    fn page_fault_before_install_is_fatal() {
        let allocator = TestAllocator::new();
        allocator.handle_page_fault(VirtualAddress::new(0x1000), 0, None);
    }
}
