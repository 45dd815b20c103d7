//! # Address Space (32-bit x86, directory-rooted)
//!
//! Strongly-typed helpers to build and manipulate a **single** virtual address
//! space: one page directory plus the page tables it points at.
//!
//! ## Highlights
//!
//! - [`AddressSpace::ensure_table`] to allocate and link a missing page table.
//! - [`AddressSpace::map_one`] to install one 4 KiB mapping.
//! - [`AddressSpace::unmap_one`] to clear a single PTE.
//! - [`AddressSpace::query`] to translate a VA to a PA.
//!
//! ## Design
//!
//! - Directory entries are created with caller-provided **table flags**
//!   (typically present + writable, US as needed). Leaf flags come from the
//!   mapping call.
//! - Tables are reached through the [`PhysMapper`], never through the
//!   recursive window, so inactive spaces can be edited too.
//!
//! ## Safety
//!
//! - Mutating active mappings requires **TLB maintenance** (`invlpg` per page
//!   or a CR3 reload); that is the caller's job.

use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use crate::page_table::pd::{L2Index, PageDirectory, PdEntry};
use crate::page_table::pt::{PageTable, PtEntry};
use crate::page_table::split_indices;
use crate::{FrameAlloc, PageEntryBits, PhysMapper};

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper> {
    root: RootPage,
    mapper: &'m M,
}

/// The page directory frame of an [`AddressSpace`].
pub type RootPage = PhysicalPage<Size4K>;

/// Errors raised while editing an address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AddressSpaceError {
    #[error("no frame available for the page table covering {va}")]
    OutOfMemory { va: VirtualAddress },
}

impl<'m, M: PhysMapper> AddressSpace<'m, M> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self { root, mapper }
    }

    /// Physical page of the page directory.
    #[inline]
    #[must_use]
    pub const fn root_page(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    #[inline]
    pub(crate) fn directory_mut(&self) -> &mut PageDirectory {
        self.mapper.directory_mut(self.root)
    }

    #[inline]
    pub(crate) fn table_mut(&self, page: PhysicalPage<Size4K>) -> &mut PageTable {
        self.mapper.table_mut(page)
    }

    /// Read one directory slot.
    #[inline]
    #[must_use]
    pub fn directory_entry(&self, slot: L2Index) -> PdEntry {
        self.directory_mut().get(slot)
    }

    /// Overwrite one directory slot.
    #[inline]
    pub fn set_directory_entry(&self, slot: L2Index, entry: PdEntry) {
        self.directory_mut().set(slot, entry);
    }

    /// The page table frame covering `va`, if one is linked.
    #[inline]
    #[must_use]
    pub fn table_for(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        self.directory_entry(L2Index::from(va)).table()
    }

    /// Return the page table covering `va`, allocating and zeroing one if the
    /// directory slot is empty.
    ///
    /// An existing entry gains `US=1` when `table_flags` asks for it; no other
    /// bits of an existing entry are changed.
    ///
    /// # Errors
    /// - [`AddressSpaceError::OutOfMemory`] if `alloc` has no frame left.
    pub fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        table_flags: PageEntryBits,
    ) -> Result<PhysicalPage<Size4K>, AddressSpaceError> {
        let slot = L2Index::from(va);
        let pde = self.directory_entry(slot);
        if let Some(table) = pde.table() {
            if table_flags.user_access() && !pde.flags().user_access() {
                let upgraded = pde.flags().with_user_access(true);
                self.set_directory_entry(slot, PdEntry::make_table(table, upgraded));
            }
            return Ok(table);
        }

        let table = alloc
            .alloc_4k()
            .ok_or(AddressSpaceError::OutOfMemory { va })?;
        self.mapper.zero_frame(table);
        self.set_directory_entry(slot, PdEntry::make_table(table, table_flags));
        log::trace!("new page table {table} for {}", slot.base());
        Ok(table)
    }

    /// Map **one** 4 KiB page `va → frame` with `leaf_flags`.
    ///
    /// Returns the frame previously mapped at `va`, if any. The caller owns
    /// that frame from here on.
    ///
    /// # Errors
    /// - Propagates allocation failures from [`ensure_table`](Self::ensure_table).
    pub fn map_one<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalPage<Size4K>,
        table_flags: PageEntryBits,
        leaf_flags: PageEntryBits,
    ) -> Result<Option<PhysicalPage<Size4K>>, AddressSpaceError> {
        let (_, i1) = split_indices(va);
        let table = self.ensure_table(alloc, va, table_flags)?;
        let pt = self.table_mut(table);
        let previous = pt.get(i1).page_4k().map(|(p, _)| p);
        pt.set(i1, PtEntry::make_4k(frame, leaf_flags));
        Ok(previous)
    }

    /// Clear the PTE for `va` and return the frame it mapped.
    ///
    /// Missing tables or entries are not an error; the result is `None`.
    pub fn unmap_one(&self, va: VirtualAddress) -> Option<PhysicalPage<Size4K>> {
        let (_, i1) = split_indices(va);
        let table = self.table_for(va)?;
        let pt = self.table_mut(table);
        let (frame, _) = pt.get(i1).page_4k()?;
        pt.set(i1, PtEntry::zero());
        Some(frame)
    }

    /// The PTE covering `va`, if its table exists.
    #[must_use]
    pub fn entry(&self, va: VirtualAddress) -> Option<PtEntry> {
        let (_, i1) = split_indices(va);
        let table = self.table_for(va)?;
        Some(self.table_mut(table).get(i1))
    }

    /// Translate a `VirtualAddress` to a `PhysicalAddress` if mapped,
    /// including the in-page offset.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let (frame, _) = self.entry(va)?.page_4k()?;
        Some(frame.join(va.offset::<Size4K>()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpAlloc, TestPhys};

    #[test]
    fn map_query_unmap() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(&phys);
        let root = alloc.alloc_4k().unwrap();
        phys.zero_frame(root);
        let aspace = AddressSpace::from_root(&phys, root);

        let va = VirtualAddress::new(0x0804_8000);
        let frame = alloc.alloc_4k().unwrap();
        let prev = aspace
            .map_one(
                &mut alloc,
                va,
                frame,
                PageEntryBits::new_user_rw(),
                PageEntryBits::new_user_rw(),
            )
            .unwrap();
        assert_eq!(prev, None);

        let pa = aspace.query(va + 0x123).unwrap();
        assert_eq!(pa, frame.base() + 0x123);
        assert!(aspace.table_for(va).is_some());

        assert_eq!(aspace.unmap_one(va), Some(frame));
        assert_eq!(aspace.query(va), None);
        assert_eq!(aspace.unmap_one(va), None);
    }

    #[test]
    fn remap_returns_previous_frame() {
        let phys = TestPhys::with_frames(8);
        let mut alloc = BumpAlloc::new(&phys);
        let root = alloc.alloc_4k().unwrap();
        phys.zero_frame(root);
        let aspace = AddressSpace::from_root(&phys, root);

        let va = VirtualAddress::new(0x0040_0000);
        let a = alloc.alloc_4k().unwrap();
        let b = alloc.alloc_4k().unwrap();
        let kernel = PageEntryBits::new_kernel_rw();
        aspace.map_one(&mut alloc, va, a, kernel, kernel).unwrap();
        let prev = aspace.map_one(&mut alloc, va, b, kernel, kernel).unwrap();
        assert_eq!(prev, Some(a));
        assert_eq!(aspace.query(va), Some(b.base()));
    }

    #[test]
    fn ensure_table_upgrades_user_bit() {
        let phys = TestPhys::with_frames(4);
        let mut alloc = BumpAlloc::new(&phys);
        let root = alloc.alloc_4k().unwrap();
        phys.zero_frame(root);
        let aspace = AddressSpace::from_root(&phys, root);

        let va = VirtualAddress::new(0x1000_0000);
        let t1 = aspace
            .ensure_table(&mut alloc, va, PageEntryBits::new_kernel_rw())
            .unwrap();
        assert!(!aspace.directory_entry(L2Index::from(va)).flags().user_access());

        let t2 = aspace
            .ensure_table(&mut alloc, va, PageEntryBits::new_user_rw())
            .unwrap();
        assert_eq!(t1, t2);
        assert!(aspace.directory_entry(L2Index::from(va)).flags().user_access());
    }

    #[test]
    fn table_allocation_failure_is_reported() {
        let phys = TestPhys::with_frames(1);
        let mut alloc = BumpAlloc::new(&phys);
        let root = alloc.alloc_4k().unwrap();
        phys.zero_frame(root);
        let aspace = AddressSpace::from_root(&phys, root);

        let va = VirtualAddress::new(0x2000_0000);
        let err = aspace
            .ensure_table(&mut alloc, va, PageEntryBits::new_kernel_rw())
            .unwrap_err();
        assert_eq!(err, AddressSpaceError::OutOfMemory { va });
    }
}
