use crate::{MemoryAddressOffset, MemoryPage, PageSize, PhysicalAddress};
use core::fmt;

/// Physical memory page base for size `S`.
///
/// A `PhysicalPage<S>` represents the **page-aligned base** of a physical page
/// of size `S` (`S::SIZE` bytes), i.e. a frame when `S` is [`Size4K`](crate::Size4K).
///
/// ### Invariants
/// - The low `S::SHIFT` bits of the base are always zero (page aligned).
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0081_2345);
/// let pp = pa.page::<Size4K>();
/// assert_eq!(pp.base().as_u32(), 0x0081_2000);
/// assert_eq!(pp.join(pa.offset::<Size4K>()), pa);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize>(pub(crate) MemoryPage<S>);

impl<S: PageSize> PhysicalPage<S> {
    #[inline]
    #[must_use]
    pub const fn from_addr(p: PhysicalAddress) -> Self {
        Self::from_page(MemoryPage::from_addr(p.0))
    }

    #[inline]
    #[must_use]
    pub const fn from_page(p: MemoryPage<S>) -> Self {
        Self(p)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0.base())
    }

    /// Frame number (`base >> S::SHIFT`).
    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0.number()
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: MemoryAddressOffset<S>) -> PhysicalAddress {
        PhysicalAddress(self.0.join(off))
    }

    #[inline]
    #[must_use]
    pub const fn checked_add_pages(self, n: u32) -> Option<Self> {
        match self.0.checked_add_pages(n) {
            Some(p) => Some(Self(p)),
            None => None,
        }
    }
}

impl<S> fmt::Display for PhysicalPage<S>
where
    S: PageSize,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PhysicalPage<{}>(0x{:08X})",
            S::as_str(),
            self.0.base().as_u32()
        )
    }
}

impl<S: PageSize> TryFrom<PhysicalAddress> for PhysicalPage<S> {
    type Error = PhysicalAddress;

    /// Succeeds only for page-aligned addresses; returns the address otherwise.
    #[inline]
    fn try_from(pa: PhysicalAddress) -> Result<Self, PhysicalAddress> {
        if pa.is_aligned::<S>() {
            Ok(pa.page())
        } else {
            Err(pa)
        }
    }
}

impl<S> From<MemoryPage<S>> for PhysicalPage<S>
where
    S: PageSize,
{
    #[inline]
    fn from(p: MemoryPage<S>) -> Self {
        Self(p)
    }
}
