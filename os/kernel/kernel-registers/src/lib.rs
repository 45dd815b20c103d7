//! # Typed IA-32 Control Registers
//!
//! Bitfield models of the control registers the memory core touches:
//!
//! - [`cr0::Cr0`] for the paging enable bit,
//! - [`cr2::Cr2`] for the faulting linear address of a page fault,
//! - [`cr3::Cr3`] for the page directory base.
//!
//! The register access instructions are only compiled with the `asm` feature
//! on a 32-bit x86 target; the bit layouts are available everywhere so that
//! they can be built and inspected on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr0")]
pub mod cr0;

#[cfg(feature = "cr2")]
pub mod cr2;

#[cfg(feature = "cr3")]
pub mod cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

/// Invalidate the TLB entry for the page containing `va` (`invlpg`).
///
/// # Safety
/// Must run at CPL0.
#[cfg(all(feature = "asm", target_arch = "x86"))]
#[inline]
pub unsafe fn invlpg(va: u32) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags));
    }
}
