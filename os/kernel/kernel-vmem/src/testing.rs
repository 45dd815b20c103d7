//! # Host Test Doubles
//!
//! Stand-ins for physical memory, a frame source and the MMU so that the
//! paging code can run under `cargo test`:
//!
//! - [`TestPhys`]: a boxed array of 4 KiB-aligned frames posing as physical RAM.
//! - [`BumpAlloc`]: hands out the frames of a [`TestPhys`] in order.
//! - [`RecordingMmu`]: records CR3 loads, paging enable and `invlpg` calls.

use crate::address_space::RootPage;
use crate::addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualPage};
use crate::info::PAGE_SIZE;
use crate::{FrameAlloc, Mmu, PhysMapper};
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

/// Physical address of the first simulated frame.
pub const DEFAULT_BASE: u32 = 0x0010_0000;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Simulated physical RAM: `frames` consecutive frames starting at `base`.
///
/// Addresses outside the simulated range panic.
pub struct TestPhys {
    base: u32,
    frames: Box<[UnsafeCell<Frame>]>,
}

// SAFETY: test-only; every access goes through the memory core, which
// serializes its callers.
unsafe impl Sync for TestPhys {}

impl TestPhys {
    /// `n` zeroed frames starting at [`DEFAULT_BASE`].
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        Self::with_frames_at(PhysicalAddress::new(DEFAULT_BASE), n)
    }

    /// `n` zeroed frames starting at `base` (page-aligned).
    #[must_use]
    pub fn with_frames_at(base: PhysicalAddress, n: usize) -> Self {
        assert!(base.is_aligned::<Size4K>(), "unaligned base {base}");
        let frames = (0..n)
            .map(|_| UnsafeCell::new(Frame([0; PAGE_SIZE as usize])))
            .collect();
        Self {
            base: base.as_u32(),
            frames,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    /// First address past the simulated range.
    #[must_use]
    pub fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base + self.len_bytes())
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// The `i`-th simulated frame.
    #[must_use]
    pub fn frame(&self, i: usize) -> PhysicalPage<Size4K> {
        assert!(i < self.frames.len(), "frame {i} out of range");
        PhysicalPage::from_addr(PhysicalAddress::new(self.base + i as u32 * PAGE_SIZE))
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u32() >= self.base && pa.as_u32() - self.base < self.len_bytes()
    }

    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        // SAFETY: test memory, no other reference is live across this call.
        unsafe { *self.phys_to_mut::<u32>(pa) }
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        // SAFETY: as above.
        unsafe { *self.phys_to_mut::<u32>(pa) = value }
    }

    /// A copy of the contents of `page`.
    #[must_use]
    pub fn snapshot(&self, page: PhysicalPage<Size4K>) -> [u8; PAGE_SIZE as usize] {
        *self.frame_bytes_mut(page)
    }

    fn len_bytes(&self) -> u32 {
        self.frames.len() as u32 * PAGE_SIZE
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        assert!(self.contains(pa), "{pa} is outside simulated RAM");
        let off = (pa.as_u32() - self.base) as usize;
        let (index, within) = (off / PAGE_SIZE as usize, off % PAGE_SIZE as usize);
        assert!(
            within + size_of::<T>() <= PAGE_SIZE as usize,
            "{pa} access crosses a frame boundary"
        );
        assert_eq!(within % align_of::<T>(), 0, "{pa} is misaligned");
        let frame = self.frames[index].get().cast::<u8>();
        // SAFETY: in bounds and aligned (checked above).
        unsafe { &mut *frame.add(within).cast::<T>() }
    }
}

/// Hands out the frames of a [`TestPhys`] in ascending order, never reusing
/// one. Freed frames are recorded.
pub struct BumpAlloc {
    next: u32,
    end: u32,
    pub freed: Vec<PhysicalPage<Size4K>>,
}

impl BumpAlloc {
    #[must_use]
    pub fn new(phys: &TestPhys) -> Self {
        Self {
            next: phys.base().as_u32(),
            end: phys.end().as_u32(),
            freed: Vec::new(),
        }
    }

    /// Frames still available.
    #[must_use]
    pub const fn remaining(&self) -> u32 {
        (self.end - self.next) / PAGE_SIZE
    }
}

impl FrameAlloc for BumpAlloc {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        if self.next >= self.end {
            return None;
        }
        let page = PhysicalPage::from_addr(PhysicalAddress::new(self.next));
        self.next += PAGE_SIZE;
        Some(page)
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        self.freed.push(page);
    }
}

/// An [`Mmu`] that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingMmu {
    pub loaded: Vec<RootPage>,
    pub paging_enabled: bool,
    pub invalidated: Vec<VirtualPage<Size4K>>,
}

impl Mmu for RecordingMmu {
    unsafe fn load_root(&mut self, root: RootPage) {
        self.loaded.push(root);
    }

    unsafe fn enable_paging(&mut self) {
        self.paging_enabled = true;
    }

    fn invalidate_page(&mut self, page: VirtualPage<Size4K>) {
        self.invalidated.push(page);
    }
}
