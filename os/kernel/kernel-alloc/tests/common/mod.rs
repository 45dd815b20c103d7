#![allow(dead_code)]

use kernel_alloc::KernelMemory;
use kernel_info::boot::{KernelBootInfo, MemoryRegion};
use kernel_info::memory::KernelLayout;
use kernel_vmem::addresses::VirtualAddress;
use kernel_vmem::testing::{RecordingMmu, TestPhys};

pub const FRAMES: usize = 256;
pub const HEAP_START: u32 = 0xC000_0000;

/// Directory, identity table, heap table and window table.
pub const PAGING_FRAMES: usize = 4;

pub type Memory<'p> = KernelMemory<'p, TestPhys, RecordingMmu>;

/// A 4 MiB identity map and a 16 KiB heap that may grow to 4 MiB.
pub fn layout() -> KernelLayout {
    KernelLayout {
        identity_map_end: 0x0040_0000,
        heap_start: VirtualAddress::new(HEAP_START),
        heap_initial_size: 0x4000,
        heap_min_size: 0x2000,
        heap_max: VirtualAddress::new(HEAP_START + 0x0040_0000),
        ..KernelLayout::default()
    }
}

pub fn boot(phys: &TestPhys) -> Memory<'_> {
    let map = [
        MemoryRegion::usable(0, 0x9_F000),
        MemoryRegion::new(0x9_F000, 0x6_1000, 2),
        MemoryRegion::usable(
            u64::from(phys.base().as_u32()),
            u64::from(phys.end().as_u32() - phys.base().as_u32()),
        ),
    ];
    let info = KernelBootInfo {
        placement: phys.base(),
        memory_map: &map,
    };
    KernelMemory::boot(phys, RecordingMmu::default(), &layout(), &info).expect("boot")
}
