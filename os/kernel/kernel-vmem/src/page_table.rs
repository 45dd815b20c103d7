//! # Two-Level Page Tables
//!
//! - [`pd`]: the page directory (L2), 1024 entries each covering 4 MiB.
//! - [`pt`]: the page table (L1), 1024 entries each mapping a 4 KiB page.

pub mod pd;
pub mod pt;

use crate::addresses::VirtualAddress;
use crate::page_table::pd::L2Index;
use crate::page_table::pt::L1Index;

/// Number of entries in either level.
pub const ENTRIES: usize = 1024;

/// Split a virtual address into its directory and table indices.
#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (L2Index, L1Index) {
    (L2Index::from(va), L1Index::from(va))
}
