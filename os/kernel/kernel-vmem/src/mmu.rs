use crate::address_space::RootPage;
use crate::addresses::{Size4K, VirtualPage};

/// The privileged instructions the paging code needs.
///
/// [`X86Mmu`] issues them on 32-bit x86; host tests record the calls instead.
pub trait Mmu {
    /// Load `root` as the active page directory (CR3). Flushes all
    /// non-global TLB entries.
    ///
    /// # Safety
    /// The directory must map the code, stack and data the caller continues
    /// to use.
    unsafe fn load_root(&mut self, root: RootPage);

    /// Turn on paging (CR0.PG).
    ///
    /// # Safety
    /// A valid directory must already be loaded and must identity-map the
    /// currently executing code.
    unsafe fn enable_paging(&mut self);

    /// Drop the cached translation for `page` from the TLB.
    fn invalidate_page(&mut self, page: VirtualPage<Size4K>);
}

/// [`Mmu`] backed by the real control registers.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[derive(Debug, Default)]
pub struct X86Mmu;

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl X86Mmu {
    /// The linear address of the last page fault (CR2).
    ///
    /// # Safety
    /// Must run at CPL0.
    #[inline]
    #[must_use]
    pub unsafe fn fault_address() -> crate::addresses::VirtualAddress {
        use kernel_registers::LoadRegisterUnsafe;
        unsafe { kernel_registers::cr2::Cr2::load_unsafe() }.fault_address()
    }
}

#[cfg(all(feature = "asm", target_arch = "x86"))]
impl Mmu for X86Mmu {
    unsafe fn load_root(&mut self, root: RootPage) {
        use kernel_registers::StoreRegisterUnsafe;
        unsafe { kernel_registers::cr3::Cr3::from_directory(root, false, false).store_unsafe() }
    }

    unsafe fn enable_paging(&mut self) {
        use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
        unsafe {
            let cr0 = kernel_registers::cr0::Cr0::load_unsafe();
            cr0.with_pg_paging(true).store_unsafe();
        }
    }

    fn invalidate_page(&mut self, page: VirtualPage<Size4K>) {
        // SAFETY: the memory core only runs at CPL0.
        unsafe { kernel_registers::invlpg(page.base().as_u32()) }
    }
}
