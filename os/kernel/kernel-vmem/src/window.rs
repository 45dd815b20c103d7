//! # Page-Table Window
//!
//! Directory slot 1023 points back at the directory itself. Walking through
//! that slot treats the directory as a page table, so every page table of the
//! *active* directory shows up as an ordinary 4 KiB page:
//!
//! ```text
//!  0xFFC0_0000 + i * 0x1000   page table i (PDE[i] must be present)
//!  0xFFFF_F000                the directory (through PDE[1023] twice)
//!  0xFFBF_F000                the directory (through the window table in slot 1022)
//! ```
//!
//! The window is made of directory entries, so it follows the active directory
//! automatically after every CR3 load. Nothing else may be mapped in
//! `[0xFF80_0000, 0xFFFF_FFFF]`.

use crate::address_space::{AddressSpace, AddressSpaceError};
use crate::addresses::{PhysicalPage, Size4K, VirtualAddress};
use crate::info::{
    DIRECTORY_WINDOW_SLOT, PAGE_DIRECTORY_WINDOW, PAGE_SIZE, PAGE_TABLE_WINDOW, RECURSIVE_SLOT,
    WINDOW_RESERVED_START,
};
use crate::page_table::pd::{L2Index, PdEntry};
use crate::page_table::pt::{L1Index, PtEntry};
use crate::{FrameAlloc, PageEntryBits, PhysMapper};

/// Fixed virtual addresses of the recursive self-map.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct PageTableWindow;

impl PageTableWindow {
    /// Virtual address of the active page directory.
    #[inline]
    #[must_use]
    pub const fn directory(self) -> VirtualAddress {
        VirtualAddress::new(PAGE_DIRECTORY_WINDOW)
    }

    /// Virtual address of page table `index` of the active directory.
    ///
    /// Only dereferenceable while `PDE[index]` is present.
    #[inline]
    #[must_use]
    pub const fn table(self, index: L2Index) -> VirtualAddress {
        VirtualAddress::new(PAGE_TABLE_WINDOW + (index.as_usize() as u32) * PAGE_SIZE)
    }

    /// Whether `va` lies in the reserved window range.
    #[inline]
    #[must_use]
    pub const fn contains(self, va: VirtualAddress) -> bool {
        va.as_u32() >= WINDOW_RESERVED_START
    }

    /// Whether a directory slot belongs to the window.
    #[inline]
    #[must_use]
    pub const fn is_window_slot(self, slot: L2Index) -> bool {
        let s = slot.as_usize();
        s == DIRECTORY_WINDOW_SLOT || s == RECURSIVE_SLOT
    }

    /// Install the window into `aspace`.
    ///
    /// Allocates the window table and returns it. Both window slots are
    /// supervisor-only.
    ///
    /// # Errors
    /// - [`AddressSpaceError::OutOfMemory`] if no frame is left for the window table.
    pub fn install<M: PhysMapper, A: FrameAlloc>(
        self,
        aspace: &AddressSpace<'_, M>,
        alloc: &mut A,
    ) -> Result<PhysicalPage<Size4K>, AddressSpaceError> {
        let directory = aspace.root_page();
        let flags = PageEntryBits::new_kernel_rw();

        let window_table = alloc.alloc_4k().ok_or(AddressSpaceError::OutOfMemory {
            va: self.directory(),
        })?;
        let mapper = aspace.mapper();
        mapper.zero_frame(window_table);
        mapper
            .table_mut(window_table)
            .set(L1Index::new(1023), PtEntry::make_4k(directory, flags));

        aspace.set_directory_entry(
            L2Index::new(DIRECTORY_WINDOW_SLOT as u16),
            PdEntry::make_table(window_table, flags),
        );
        aspace.set_directory_entry(
            L2Index::new(RECURSIVE_SLOT as u16),
            PdEntry::make_table(directory, flags),
        );
        Ok(window_table)
    }

    /// The window table of `aspace`, if the window is installed.
    #[must_use]
    pub fn window_table<M: PhysMapper>(
        self,
        aspace: &AddressSpace<'_, M>,
    ) -> Option<PhysicalPage<Size4K>> {
        let recursive = aspace.directory_entry(L2Index::new(RECURSIVE_SLOT as u16));
        if recursive.table() != Some(aspace.root_page()) {
            return None;
        }
        aspace
            .directory_entry(L2Index::new(DIRECTORY_WINDOW_SLOT as u16))
            .table()
    }
}
