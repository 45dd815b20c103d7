//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, Size4M, VirtualAddress};

/// Size of one frame / page in bytes.
pub const PAGE_SIZE: u32 = Size4K::SIZE;

/// Entries in a page directory and in a page table.
pub const ENTRIES_PER_TABLE: usize = 1024;

/// Physical address where the boot loader places the kernel image.
pub const PHYS_LOAD: u32 = 0x0010_0000; // 1 MiB

/// End (exclusive) of the low identity map built by paging install. Covers
/// the kernel image, its boot stack and the early frames taken by the bump
/// allocator, so execution continues after CR0.PG is set. The frame allocator
/// only manages frames below it, because page tables and its own stack pages
/// are written through the identity map.
pub const IDENTITY_MAP_END: u32 = 0x0100_0000; // 16 MiB

/// Start of the kernel heap region.
pub const KERNEL_HEAP_START: u32 = 0xC000_0000;

/// Bytes mapped when the kernel heap is created.
pub const KERNEL_HEAP_INITIAL_SIZE: u32 = 0x0010_0000; // 1 MiB

/// The kernel heap never contracts below this many bytes.
pub const KERNEL_HEAP_MIN_SIZE: u32 = 0x0007_0000;

/// Upper bound (exclusive) the kernel heap may grow to.
pub const KERNEL_HEAP_MAX: u32 = 0xCFFF_F000;

/// Directory slot whose table maps the directory at [`PAGE_DIRECTORY_WINDOW`].
pub const DIRECTORY_WINDOW_SLOT: usize = 1022;

/// Directory slot that maps the directory onto itself.
pub const RECURSIVE_SLOT: usize = 1023;

/// Virtual address of the active page directory (via slot 1022).
pub const PAGE_DIRECTORY_WINDOW: u32 = 0xFFBF_F000;

/// Base of the 4 MiB window through which every page table of the active
/// directory is visible (via slot 1023); table `i` is at `+ i * 4096`.
pub const PAGE_TABLE_WINDOW: u32 = 0xFFC0_0000;

/// First virtual address reserved for the page-table window.
pub const WINDOW_RESERVED_START: u32 = (DIRECTORY_WINDOW_SLOT as u32) << Size4M::SHIFT;

/// Runtime geometry of the kernel address space.
///
/// [`Default`] uses the constants of this module; tests and alternative boot
/// paths shrink the heap or the identity map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelLayout {
    /// End (exclusive) of the low identity map.
    pub identity_map_end: u32,
    /// First byte of the kernel heap.
    pub heap_start: VirtualAddress,
    /// Initially mapped heap bytes.
    pub heap_initial_size: u32,
    /// The heap never contracts below this many bytes.
    pub heap_min_size: u32,
    /// Exclusive upper bound of heap growth.
    pub heap_max: VirtualAddress,
    /// Heap pages are supervisor-only.
    pub heap_supervisor: bool,
    /// Heap pages are mapped read-only.
    pub heap_readonly: bool,
}

impl Default for KernelLayout {
    fn default() -> Self {
        Self {
            identity_map_end: IDENTITY_MAP_END,
            heap_start: VirtualAddress::new(KERNEL_HEAP_START),
            heap_initial_size: KERNEL_HEAP_INITIAL_SIZE,
            heap_min_size: KERNEL_HEAP_MIN_SIZE,
            heap_max: VirtualAddress::new(KERNEL_HEAP_MAX),
            heap_supervisor: true,
            heap_readonly: false,
        }
    }
}

impl KernelLayout {
    /// Exclusive end of the initially mapped heap.
    #[must_use]
    pub const fn heap_end(&self) -> VirtualAddress {
        VirtualAddress::new(self.heap_start.as_u32() + self.heap_initial_size)
    }
}

const _: () = {
    assert!(IDENTITY_MAP_END.is_multiple_of(Size4M::SIZE));
    assert!(PHYS_LOAD < IDENTITY_MAP_END);
    assert!(KERNEL_HEAP_START.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_INITIAL_SIZE.is_multiple_of(PAGE_SIZE));
    assert!(KERNEL_HEAP_MIN_SIZE <= KERNEL_HEAP_INITIAL_SIZE);
    assert!(KERNEL_HEAP_START + KERNEL_HEAP_INITIAL_SIZE <= KERNEL_HEAP_MAX);
    assert!(KERNEL_HEAP_MAX <= WINDOW_RESERVED_START);
    assert!(PAGE_DIRECTORY_WINDOW == PAGE_TABLE_WINDOW - PAGE_SIZE);
    assert!(PAGE_TABLE_WINDOW == (RECURSIVE_SLOT as u32) << Size4M::SHIFT);
};
