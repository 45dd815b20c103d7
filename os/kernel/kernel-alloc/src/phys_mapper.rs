//! # Identity PhysMapper for the Kernel
//!
//! A [`PhysMapper`] for the 32-bit kernel, whose low physical memory is
//! identity-mapped (`va == pa`) in every address space. Page tables, frame
//! stack pages and heap pages are all reached this way.
//!
//! ## Why is this needed?
//! - Code can only dereference virtual addresses, not physical ones.
//! - The paging code must edit directories and tables of address spaces that
//!   are not active, so it cannot rely on the page-table window alone.
//! - Host tests use a different strategy (a heap buffer posing as RAM), so the
//!   access goes through the trait.
//!
//! ## Example
//! ```rust,no_run
//! use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage};
//! use kernel_vmem::PhysMapper;
//! use kernel_alloc::phys_mapper::IdentityPhysMapper;
//! let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0012_3000));
//! let mapper = IdentityPhysMapper;
//! mapper.table_mut(frame).zero();
//! ```

use kernel_vmem::PhysMapper;
use kernel_vmem::addresses::PhysicalAddress;

/// [`PhysMapper`] for identity-mapped physical memory.
///
/// # Safety
/// - The identity map must cover the referenced physical range (see
///   `kernel_info::memory::IDENTITY_MAP_END`).
/// - The returned reference must only be used for valid, mapped, and writable memory.
#[derive(Debug, Copy, Clone, Default)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = core::ptr::with_exposed_provenance_mut::<T>(pa.as_usize());
        // SAFETY: Caller must ensure the physical address is valid and identity-mapped.
        unsafe { &mut *va }
    }
}
