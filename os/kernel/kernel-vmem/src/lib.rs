//! # Virtual Memory Support
//!
//! 32-bit x86 paging structures and helpers for the kernel's memory core.
//!
//! ## What you get
//! - An [`address space`](address_space) rooted at one page directory, with
//!   map/unmap/query over 4 KiB pages.
//! - Typed [`PageDirectory`](page_table::pd::PageDirectory) /
//!   [`PageTable`](page_table::pt::PageTable) and the shared [`PageEntryBits`].
//! - The [`PageTableWindow`]: the recursive self-map that keeps every table of
//!   the active directory visible at a fixed virtual range.
//! - Page-fault error code decoding ([`page_fault`]).
//! - The [`Mmu`] seam for the few privileged instructions paging needs.
//! - A tiny allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! Each 32-bit virtual address is divided into three fields:
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! ```text
//!  CR3 → Page Directory → Page Table → 4 KiB frame
//!          │                 │
//!          │                 └──► PTE (Page Table Entry)     → maps one 4 KiB page
//!          └────────────────────► PDE (Page Directory Entry) → points at one page table
//! ```
//!
//! | Level | Table | Entry | Description |
//! |:------|:------|:------|:------------|
//! | 1 | **Page Directory** | **PDE** | 1024 entries, each covering 4 MiB. Referenced by CR3. |
//! | 2 | **Page Table** | **PTE** | 1024 entries, each mapping a 4 KiB frame. |
//!
//! Permissions are the intersection of the PDE and the PTE: a page is
//! user-accessible only if both entries have `US=1`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

#[cfg(any(test, feature = "testing"))]
extern crate alloc;

pub mod address_space;
mod mmu;
mod page_entry_bits;
pub mod page_fault;
pub mod page_table;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod window;

pub use crate::address_space::{AddressSpace, AddressSpaceError, RootPage};
pub use crate::mmu::Mmu;
#[cfg(all(feature = "asm", target_arch = "x86"))]
pub use crate::mmu::X86Mmu;
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_fault::{PageFaultError, PageFaultReport};
pub use crate::window::PageTableWindow;

/// Address types used throughout the paging code.
pub use kernel_memory_addresses as addresses;

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use crate::page_table::pd::PageDirectory;
use crate::page_table::pt::PageTable;

/// Source of **physical** 4 KiB frames for page tables and mapped pages.
///
/// The implementation decides where frames come from (boot bump region, free
/// stack, test pool). Returned frames are page-aligned by construction.
pub trait FrameAlloc {
    /// Allocate one 4 KiB physical frame; `None` when physical memory is exhausted.
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>>;

    /// Return a frame obtained from [`alloc_4k`](Self::alloc_4k).
    fn free_4k(&mut self, page: PhysicalPage<Size4K>);
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// The kernel identity-maps the memory it hands out for paging structures;
/// host tests back "physical memory" with a heap buffer.
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// - `pa` must be mapped writable in the current address space for `'a`.
    /// - `T` must fit between `pa` and the end of its frame and match the
    ///   bytes stored there.
    /// - The caller must not create a second live reference to the same bytes.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;

    /// Borrow the page directory stored in `page`.
    #[inline]
    fn directory_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageDirectory {
        // SAFETY: directory frames are owned by the paging code and 4 KiB sized.
        unsafe { self.phys_to_mut::<PageDirectory>(page.base()) }
    }

    /// Borrow the page table stored in `page`.
    #[inline]
    fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        // SAFETY: table frames are owned by the paging code and 4 KiB sized.
        unsafe { self.phys_to_mut::<PageTable>(page.base()) }
    }

    /// Borrow the raw bytes of a frame.
    #[inline]
    fn frame_bytes_mut(&self, page: PhysicalPage<Size4K>) -> &mut [u8; 4096] {
        // SAFETY: every frame is exactly 4096 bytes.
        unsafe { self.phys_to_mut::<[u8; 4096]>(page.base()) }
    }

    /// Fill a frame with zeros.
    #[inline]
    fn zero_frame(&self, page: PhysicalPage<Size4K>) {
        self.frame_bytes_mut(page).fill(0);
    }

    /// Copy the full contents of `from` into `to`.
    #[inline]
    fn copy_frame(&self, from: PhysicalPage<Size4K>, to: PhysicalPage<Size4K>) {
        debug_assert_ne!(from, to, "copying a frame onto itself");
        let src = *self.frame_bytes_mut(from);
        self.frame_bytes_mut(to).copy_from_slice(&src);
    }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0, 4096), 0);
/// assert_eq!(align_down(4095, 4096), 0);
/// assert_eq!(align_down(8191, 4096), 4096);
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`, or `None` on overflow.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0, 4096), Some(0));
/// assert_eq!(align_up(1, 4096), Some(4096));
/// assert_eq!(align_up(4096, 4096), Some(4096));
/// assert_eq!(align_up(0x12345, 16), Some(0x12350));
/// assert_eq!(align_up(u32::MAX, 16), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> Option<u32> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}
