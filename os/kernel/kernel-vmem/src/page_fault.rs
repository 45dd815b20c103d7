//! # Page-Fault Decoding
//!
//! The CPU pushes a 32-bit error code with every `#PF` and stores the faulting
//! linear address in CR2. [`PageFaultError`] decodes the code,
//! [`PageFaultReport`] bundles both with the faulting instruction pointer for
//! logging.

use crate::addresses::VirtualAddress;
use bitfield_struct::bitfield;
use core::fmt;

/// Page-fault error code layout (IA-32).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    /// 1 = protection-key violation.
    pub protection_key: bool, // bit 5

    /// 1 = shadow stack access.
    pub shadow_stack: bool, // bit 6

    #[bits(25)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    /// Whether the fault only means "nothing is mapped here".
    ///
    /// Reserved-bit faults are reported with `present == 1` and never count.
    #[inline]
    #[must_use]
    pub const fn is_absence(&self) -> bool {
        !self.present() && !self.reserved_bit()
    }

    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "Reserved bit set in a paging structure (corrupted page table)"
        } else if !self.present() {
            "Non-present page (page not mapped)"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            if self.user() {
                "User-mode write to protected page"
            } else {
                "Kernel write to read-only page"
            }
        } else if self.user() {
            "User-mode read of supervisor page"
        } else {
            "Read access to protected page"
        }
    }
}

/// Everything known about a single page fault.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFaultReport {
    /// The faulting linear address (CR2).
    pub address: VirtualAddress,
    /// The decoded error code.
    pub error: PageFaultError,
    /// The faulting instruction, when the dispatcher provides it.
    pub instruction_pointer: Option<VirtualAddress>,
}

impl PageFaultReport {
    #[inline]
    #[must_use]
    pub const fn new(address: VirtualAddress, error: PageFaultError) -> Self {
        Self {
            address,
            error,
            instruction_pointer: None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_instruction_pointer(mut self, ip: VirtualAddress) -> Self {
        self.instruction_pointer = Some(ip);
        self
    }
}

impl fmt::Display for PageFaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.error;
        write!(
            f,
            "page fault at {} (err={:#x}): {}",
            self.address,
            e.into_bits(),
            e.explain()
        )?;
        write!(
            f,
            " [{} {} {}",
            if e.present() { "present" } else { "not-present" },
            if e.write() { "write" } else { "read" },
            if e.user() { "user" } else { "supervisor" },
        )?;
        if e.reserved_bit() {
            f.write_str(" reserved-bit")?;
        }
        if e.instruction_fetch() {
            f.write_str(" fetch")?;
        }
        f.write_str("]")?;
        if let Some(ip) = self.instruction_pointer {
            write!(f, " ip={ip}")?;
            if ip == self.address {
                f.write_str(" (executed unpaged memory)")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_bits() {
        let e = PageFaultError::from_bits(0b0_0111);
        assert!(e.present());
        assert!(e.write());
        assert!(e.user());
        assert!(!e.is_absence());
        assert_eq!(e.explain(), "User-mode write to protected page");

        let e = PageFaultError::from_bits(0b0_0010);
        assert!(e.is_absence());
        assert_eq!(e.explain(), "Non-present page (page not mapped)");

        let e = PageFaultError::from_bits(0b0_1001);
        assert!(e.reserved_bit());
        assert!(!e.is_absence());
    }

    #[test]
    fn report_mentions_unpaged_execution() {
        let va = VirtualAddress::new(0x0804_8000);
        let report = PageFaultReport::new(va, PageFaultError::from_bits(0b1_0000))
            .with_instruction_pointer(va);
        let text = report.to_string();
        assert!(text.contains("not-present read supervisor fetch"));
        assert!(text.contains("executed unpaged memory"));
    }
}
