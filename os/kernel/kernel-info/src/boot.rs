//! # Kernel Boot Information

use kernel_memory_addresses::PhysicalAddress;

/// Multiboot memory map type for usable RAM.
pub const MEMORY_AVAILABLE: u32 = 1;

/// One entry of the boot loader's physical memory map.
///
/// Mirrors the multiboot `mmap` entry payload: 64-bit base and length so that
/// regions above 4 GiB can be described (and ignored) by a 32-bit kernel.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryRegion {
    /// Physical base address.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    /// Region type; [`MEMORY_AVAILABLE`] means usable RAM, anything else is
    /// reserved forever.
    pub kind: u32,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: u32) -> Self {
        Self { base, length, kind }
    }

    #[must_use]
    pub const fn usable(base: u64, length: u64) -> Self {
        Self::new(base, length, MEMORY_AVAILABLE)
    }

    #[inline]
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        self.kind == MEMORY_AVAILABLE
    }

    /// Exclusive end, saturating at `u64::MAX`.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }
}

/// What the boot code hands to the memory core.
#[derive(Debug, Copy, Clone)]
pub struct KernelBootInfo<'a> {
    /// First physical address past the kernel image and any boot modules.
    /// Frames below it are never managed.
    pub placement: PhysicalAddress,

    /// The boot loader's memory map.
    pub memory_map: &'a [MemoryRegion],
}

impl KernelBootInfo<'_> {
    /// End (exclusive) of the usable region that contains the placement
    /// address, clipped to 4 GiB. This bounds the early bump allocator.
    #[must_use]
    pub fn placement_region_end(&self) -> Option<u64> {
        let placement = u64::from(self.placement.as_u32());
        self.memory_map
            .iter()
            .filter(|r| r.is_usable())
            .find(|r| r.base <= placement && placement < r.end())
            .map(|r| r.end().min(1 << 32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placement_region_is_found() {
        let map = [
            MemoryRegion::usable(0, 0x9_F000),
            MemoryRegion::new(0x9_F000, 0x6_1000, 2),
            MemoryRegion::usable(0x10_0000, 0x3F0_0000),
        ];
        let info = KernelBootInfo {
            placement: PhysicalAddress::new(0x0012_0000),
            memory_map: &map,
        };
        assert_eq!(info.placement_region_end(), Some(0x400_0000));

        let info = KernelBootInfo {
            placement: PhysicalAddress::new(0x000A_0000),
            memory_map: &map,
        };
        assert_eq!(info.placement_region_end(), None);
    }
}
