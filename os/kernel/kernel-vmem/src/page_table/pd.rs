//! # Page Directory (PD / L2)
//!
//! - [`L2Index`]: index type for VA bits `[31:22]`.
//! - [`PdEntry`]: a directory entry pointing at one page table.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 PDEs.
//!
//! 4 MiB pages (`PS=1`) are never created, so a present PDE always points at
//! a page table frame.

use crate::PageEntryBits;
use crate::addresses::{PhysicalPage, Size4K, VirtualAddress};
use crate::page_table::ENTRIES;

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct L2Index(u16);

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned, backed by one frame.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; ENTRIES],
}

impl L2Index {
    #[inline]
    #[must_use]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
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

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << 22)
    }

    /// Iterate all 1024 slots in order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..ENTRIES as u16).map(Self)
    }
}

impl PdEntry {
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

    /// The page table frame this entry points at, if present.
    #[inline]
    #[must_use]
    pub const fn table(self) -> Option<PhysicalPage<Size4K>> {
        if self.is_present() {
            Some(self.0.physical_page())
        } else {
            None
        }
    }

    /// Create a PDE pointing at `table` (`present=1`, `PS=0`).
    #[inline]
    #[must_use]
    pub const fn make_table(table: PhysicalPage<Size4K>, flags: PageEntryBits) -> Self {
        Self(
            flags
                .with_present(true)
                .with_large_page(false)
                .with_physical_page(table),
        )
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PdEntry::zero(); ENTRIES],
        }
    }

    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PdEntry::zero());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: L2Index) -> PdEntry {
        self.entries[i.as_usize()]
    }

    /// Caller must handle any required TLB invalidation when changing active mappings.
    #[inline]
    pub const fn set(&mut self, i: L2Index, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }
}
