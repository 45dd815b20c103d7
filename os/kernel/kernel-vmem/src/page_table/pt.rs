//! # Page Table (PT / L1)
//!
//! - [`L1Index`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a PTE; every present entry maps one 4 KiB frame.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! ## Invariants & Notes
//!
//! - Entries written here have `frame != 0` exactly when `present == 1`:
//!   [`PtEntry::make_4k`] always sets present, clearing writes a zero entry.
//! - After modifying active mappings, the caller must invalidate the TLB.

use crate::PageEntryBits;
use crate::addresses::{PhysicalPage, Size4K, VirtualAddress};
use crate::page_table::ENTRIES;

/// Index into the Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L1Index(u16);

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// The Page Table (L1): 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; ENTRIES],
}

impl L1Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.table_index() as u16)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!((v as usize) < ENTRIES);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES as u16).map(Self)
    }
}

impl PtEntry {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    #[inline]
    #[must_use]
    pub const fn flags(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the mapped 4 KiB frame and the entry flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(PhysicalPage<Size4K>, PageEntryBits)> {
        if self.is_present() {
            Some((self.0.physical_page(), self.0))
        } else {
            None
        }
    }

    /// Create a 4 KiB leaf PTE: sets `present=1`, clears PAT and writes the
    /// frame address.
    #[inline]
    #[must_use]
    pub const fn make_4k(page: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_page(page),
        )
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PtEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L1Index) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: L1Index, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    /// Iterate `(index, frame, flags)` over all present entries.
    pub fn present_entries(
        &self,
    ) -> impl Iterator<Item = (L1Index, PhysicalPage<Size4K>, PageEntryBits)> + '_ {
        L1Index::all().filter_map(|i| self.get(i).page_4k().map(|(p, f)| (i, p, f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PhysicalAddress;

    #[test]
    fn pte_4k_leaf() {
        let k4 = PhysicalPage::<Size4K>::from_addr(PhysicalAddress::new(0x5555_0000));
        let e = PtEntry::make_4k(k4, PageEntryBits::new().with_user_access(true));
        let (p, fl) = e.page_4k().unwrap();
        assert_eq!(p.base().as_u32(), 0x5555_0000);
        assert!(fl.present());
        assert!(fl.user_access());
        assert!(!fl.writable());
    }

    #[test]
    fn present_entries_skips_holes() {
        let mut t = PageTable::zeroed();
        let f = PhysicalPage::from_addr(PhysicalAddress::new(0x7000));
        t.set(L1Index::new(3), PtEntry::make_4k(f, PageEntryBits::new_kernel_rw()));
        t.set(L1Index::new(1000), PtEntry::make_4k(f, PageEntryBits::new_kernel_rw()));
        let idx: Vec<usize> = t.present_entries().map(|(i, _, _)| i.as_usize()).collect();
        assert_eq!(idx, [3, 1000]);

        t.zero();
        assert_eq!(t.present_entries().count(), 0);
    }
}
