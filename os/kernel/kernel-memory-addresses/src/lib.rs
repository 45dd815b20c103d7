//! # Virtual and Physical Memory Address Types (IA-32)
//!
//! Strongly typed wrappers for raw 32-bit memory addresses and page bases used
//! in the paging and memory management code.
//!
//! ## Overview
//!
//! The types prevent mixing virtual and physical addresses at compile time
//! while remaining zero-cost wrappers around `u32` values.
//!
//! | Concept | Generic | Description |
//! |----------|----------|-------------|
//! | [`MemoryAddress`] | – | A raw 32-bit address, either physical or virtual. |
//! | [`MemoryPage<S>`] | [`S: PageSize`](PageSize) | A page-aligned base address of a page of size `S`. |
//! | [`MemoryAddressOffset<S>`] | [`S: PageSize`](PageSize) | An offset within a page of size `S`. |
//!
//! These are then wrapped to distinguish between virtual and physical spaces:
//!
//! | Wrapper | Meaning |
//! |----------|----------|
//! | [`VirtualAddress`] / [`VirtualPage<S>`] | Refer to virtual (page-table translated) memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage<S>`] | Refer to physical memory or MMIO regions. |
//!
//! ## Page Sizes
//!
//! Two-level x86 paging knows two granularities:
//!
//! - [`Size4K`] for 4 KiB pages mapped by a page-table entry, and
//! - [`Size4M`] for the 4 MiB region covered by one page-directory entry.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC000_1234);
//!
//! // Split it into a page base and an in-page offset
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32() & (Size4K::SIZE - 1), 0);
//! assert_eq!(page.join(off), va);
//!
//! // The same for physical addresses
//! let pa = PhysicalAddress::new(0x0020_0042);
//! let (pp, po) = pa.split::<Size4K>();
//! assert_eq!(pp.join(po), pa);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

mod memory_address;
mod memory_address_offset;
mod memory_page;
mod page_size;
mod physical_address;
mod physical_page;
mod virtual_address;
mod virtual_page;

pub use crate::memory_address::MemoryAddress;
pub use crate::memory_address_offset::MemoryAddressOffset;
pub use crate::memory_page::MemoryPage;
pub use crate::page_size::{PageSize, Size4K, Size4M};
pub use crate::physical_address::PhysicalAddress;
pub use crate::physical_page::PhysicalPage;
pub use crate::virtual_address::VirtualAddress;
pub use crate::virtual_page::VirtualPage;
