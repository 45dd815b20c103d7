use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use bitfield_struct::bitfield;

/// A single 32-bit x86 paging entry in its raw bitfield form.
///
/// The same layout is used for page-directory entries (PDE, pointing at a
/// page table) and page-table entries (PTE, mapping a 4 KiB frame).
///
/// ### Bit layout
///
/// | Bits   | Name / Mnemonic | Meaning |
/// |--------|-----------------|----------|
/// | 0      | `P` (present)   | Valid entry if set |
/// | 1      | `RW`            | Writable if set |
/// | 2      | `US`            | User-mode accessible if set |
/// | 3      | `PWT`           | Write-through caching |
/// | 4      | `PCD`           | Disable caching |
/// | 5      | `A`             | Accessed |
/// | 6      | `D`             | Dirty (PTE only) |
/// | 7      | `PS` / `PAT`    | 4 MiB page in a PDE, PAT in a PTE; always 0 here |
/// | 8      | `G`             | Global (PTE only) |
/// | 9–11   | OS avail        | Ignored by hardware |
/// | 12–31  | `addr`          | Physical frame bits [31:12] |
///
/// ### Example
/// ```rust
/// # use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage};
/// # use kernel_vmem::PageEntryBits;
/// let frame = PhysicalPage::from_addr(PhysicalAddress::new(0x0012_3000));
/// let e = PageEntryBits::new_kernel_rw().with_physical_page(frame);
/// assert!(e.present());
/// assert_eq!(e.into_bits(), 0x0012_3003);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0).
    ///
    /// Clear implies a not-present entry; an access then raises a page fault.
    pub present: bool,

    /// Writable (RW, bit 1).
    ///
    /// Set to allow writes; clear for read-only. Supervisor writes ignore it
    /// unless CR0.WP is set.
    pub writable: bool,

    /// User/Supervisor (US, bit 2).
    ///
    /// Set to allow user-mode access; clear restricts to supervisor only.
    /// The effective permission is the intersection of PDE and PTE.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5).
    ///
    /// Set by the CPU on first access through this entry.
    pub accessed: bool,

    /// Dirty (D, bit 6) — **PTE only**.
    ///
    /// Set by the CPU on the first write to the mapped page.
    pub dirty: bool,

    /// Page Size in a PDE / PAT in a PTE (bit 7). 4 MiB pages are not used.
    pub large_page: bool,

    /// Global (G, bit 8) — **PTE only**.
    pub global_translation: bool,

    /// OS-available (bits 9..=11).
    #[bits(3)]
    pub os_available: u8,

    /// Physical frame number (bits 12..=31).
    #[bits(20)]
    frame_number: u32,
}

impl PageEntryBits {
    #[inline]
    #[must_use]
    pub const fn physical_page(&self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(self.frame_number() << 12))
    }

    #[inline]
    pub const fn set_physical_page(&mut self, page: PhysicalPage<Size4K>) {
        self.set_frame_number(page.number());
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage<Size4K>) -> Self {
        self.with_frame_number(page.number())
    }

    /// Present, writable, supervisor-only.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Present, writable, user-accessible.
    #[inline]
    #[must_use]
    pub const fn new_user_rw() -> Self {
        Self::new_kernel_rw().with_user_access(true)
    }

    /// Present with the given privilege and write permission.
    #[inline]
    #[must_use]
    pub const fn for_access(user: bool, writable: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(writable)
            .with_user_access(user)
    }

    /// The subset of flags carried over when a page is duplicated into a
    /// cloned address space: present, writable, user, accessed, dirty.
    #[inline]
    #[must_use]
    pub const fn clone_flags(self) -> Self {
        Self::new()
            .with_present(self.present())
            .with_writable(self.writable())
            .with_user_access(self.user_access())
            .with_accessed(self.accessed())
            .with_dirty(self.dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bit_positions_match_hardware() {
        assert_eq!(PageEntryBits::new().with_present(true).into_bits(), 0x001);
        assert_eq!(PageEntryBits::new().with_writable(true).into_bits(), 0x002);
        assert_eq!(PageEntryBits::new().with_user_access(true).into_bits(), 0x004);
        assert_eq!(PageEntryBits::new().with_accessed(true).into_bits(), 0x020);
        assert_eq!(PageEntryBits::new().with_dirty(true).into_bits(), 0x040);
        assert_eq!(PageEntryBits::new_user_rw().into_bits(), 0x007);
    }

    #[test]
    fn frame_round_trip() {
        let frame = PhysicalPage::from_addr(PhysicalAddress::new(0xFFFF_F000));
        let e = PageEntryBits::new_kernel_rw().with_physical_page(frame);
        assert_eq!(e.physical_page(), frame);
        assert_eq!(e.into_bits(), 0xFFFF_F003);
    }

    #[test]
    fn clone_flags_drop_cache_and_global_bits() {
        let e = PageEntryBits::new_user_rw()
            .with_accessed(true)
            .with_dirty(true)
            .with_global_translation(true)
            .with_cache_disabled(true)
            .with_os_available(5)
            .with_physical_page(PhysicalPage::from_addr(PhysicalAddress::new(0x5000)));
        let c = e.clone_flags();
        assert_eq!(c.into_bits(), 0x67);
    }
}
