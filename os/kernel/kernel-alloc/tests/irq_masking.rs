mod common;

use common::{FRAMES, boot};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::KernelHeapAllocator;
use kernel_sync::interrupts_enabled;
use kernel_sync::irq::{cli_stop_interrupts, sti_enable_interrupts};
use kernel_vmem::PageEntryBits;
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::testing::{RecordingMmu, TestPhys};

// The emulated interrupt flag is process-wide, so every scenario lives in
// one test function.
#[test]
fn mutators_restore_the_interrupt_flag() {
    sti_enable_interrupts();
    let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::with_frames(FRAMES)));
    let mut memory = boot(phys);
    assert!(interrupts_enabled(), "boot");

    let p = memory.allocate(40, 0).unwrap();
    assert!(interrupts_enabled(), "allocate");
    memory.free(p).unwrap();
    assert!(interrupts_enabled(), "free");

    let frame = memory.alloc_frame().unwrap();
    assert!(interrupts_enabled(), "alloc_frame");
    let page = VirtualAddress::new(0x0800_0000);
    memory
        .map(page, frame, PageEntryBits::new_kernel_rw())
        .unwrap();
    assert!(interrupts_enabled(), "map");
    memory.unmap_and_free(page).unwrap();
    assert!(interrupts_enabled(), "unmap");

    let kernel = memory.vmm().kernel_root();
    let space = memory.clone_address_space(kernel).unwrap();
    assert!(interrupts_enabled(), "clone");
    memory.destroy_address_space(space).unwrap();
    assert!(interrupts_enabled(), "destroy");

    memory.handle_page_fault(VirtualAddress::new(0x0900_0000), 0b010, None);
    assert!(interrupts_enabled(), "page fault");

    // Called with interrupts off, mutators leave them off.
    cli_stop_interrupts();
    let p = memory.allocate(40, 0).unwrap();
    memory.free(p).unwrap();
    assert!(!interrupts_enabled(), "masked caller");
    sti_enable_interrupts();

    // The global adapter masks for the whole critical section.
    let allocator = KernelHeapAllocator::<TestPhys, RecordingMmu>::new();
    assert!(allocator.install(memory).is_ok());
    let inside = allocator.with(|_| interrupts_enabled());
    assert_eq!(inside, Some(false));
    assert!(interrupts_enabled(), "with");

    let layout = Layout::from_size_align(64, 16).unwrap();
    let ptr = unsafe { allocator.alloc(layout) };
    assert!(!ptr.is_null());
    unsafe { allocator.dealloc(ptr, layout) };
    assert!(interrupts_enabled(), "GlobalAlloc");
}
