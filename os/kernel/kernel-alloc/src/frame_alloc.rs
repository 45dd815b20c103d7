//! # Physical Frame Allocator
//!
//! A stack of free frame addresses, stored in frames taken from the free pool
//! itself, plus a bump cursor for the time before the stack exists.
//!
//! ## Modes
//!
//! - **Bump** (from [`FrameStack::new`] until [`FrameStack::activate_stack`]):
//!   frames are handed out linearly from the placement boundary up to the bump
//!   limit. Frees are ignored; bump frames hold early boot structures.
//! - **Stack**: O(1) push/pop. The bump cursor is frozen as a high-water mark
//!   and [`FrameStack::map_physical_ram`] registers everything above it.
//!   With [`FrameStackConfig::detect_double_free`] (the default) a free also
//!   scans the stack, which makes it O(free frames).
//!
//! ## Stack pages
//!
//! ```text
//!  top ──► ┌──────────────┐     ┌──────────────┐
//!          │ prev ────────┼───► │ prev = NONE  │
//!          │ len          │     │ len = 1022   │
//!          │ entries[..]  │     │ entries[..]  │
//!          └──────────────┘     └──────────────┘
//! ```
//!
//! When a push finds the top page full, the frame being freed becomes the new
//! top page. When a pop finds the top page empty, that page is handed out and
//! its predecessor becomes the top. Stack pages are reached through the
//! [`PhysMapper`] and are the only frames whose contents this allocator uses.

use kernel_info::boot::MemoryRegion;
use kernel_sync::IrqGuard;
use kernel_vmem::addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::info::PAGE_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper};

/// Free-frame slots per stack page (the page minus its two-word header).
const STACK_PAGE_CAPACITY: usize = (PAGE_SIZE as usize - 8) / 4;

/// `prev` of the bottom stack page.
const NONE: u32 = u32::MAX;

#[repr(C)]
struct StackPage {
    prev: u32,
    len: u32,
    entries: [u32; STACK_PAGE_CAPACITY],
}

const _: () = assert!(size_of::<StackPage>() == PAGE_SIZE as usize);

/// Allocation errors of the [`FrameStack`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    #[error("out of physical memory")]
    OutOfPhysicalMemory,
    #[error("frame {0} is already free")]
    DoubleFree(PhysicalPage<Size4K>),
    #[error("{0} is not frame aligned")]
    Misaligned(PhysicalAddress),
}

/// Which strategy currently serves requests.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FrameMode {
    Bump,
    Stack,
}

/// Runtime knobs of the [`FrameStack`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameStackConfig {
    /// Scan the stack on every free to catch double frees. Frees cost
    /// O(free frames) while this is set; without it they are O(1) and a
    /// repeated free goes unnoticed.
    pub detect_double_free: bool,
    /// Frames at or above this physical address are never registered, and
    /// frees of them are ignored.
    pub limit: u64,
}

impl Default for FrameStackConfig {
    fn default() -> Self {
        Self {
            detect_double_free: true,
            limit: 1 << 32,
        }
    }
}

/// The physical frame allocator.
pub struct FrameStack<'m, M: PhysMapper> {
    mapper: &'m M,
    config: FrameStackConfig,
    placement: PhysicalAddress,
    bump_next: u32,
    bump_limit: u32,
    mode: FrameMode,
    top: Option<PhysicalPage<Size4K>>,
    free: usize,
}

impl<'m, M: PhysMapper> FrameStack<'m, M> {
    /// Create an allocator in bump mode.
    ///
    /// `placement` is rounded up to the next frame; everything below it is
    /// never managed. Bump allocations stop at `bump_limit`.
    pub fn new(
        mapper: &'m M,
        placement: PhysicalAddress,
        bump_limit: PhysicalAddress,
        config: FrameStackConfig,
    ) -> Self {
        let placement = align_up_or_max(placement.as_u32());
        let bump_limit = bump_limit.as_u32() & !(PAGE_SIZE - 1);
        Self {
            mapper,
            config,
            placement: PhysicalAddress::new(placement),
            bump_next: placement,
            bump_limit: bump_limit.max(placement),
            mode: FrameMode::Bump,
            top: None,
            free: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn mode(&self) -> FrameMode {
        self.mode
    }

    /// First managed physical address.
    #[inline]
    #[must_use]
    pub const fn placement(&self) -> PhysicalAddress {
        self.placement
    }

    /// The bump cursor; after activation, the high-water mark of bump mode.
    #[inline]
    #[must_use]
    pub const fn bump_cursor(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.bump_next)
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &FrameStackConfig {
        &self.config
    }

    /// Number of frames the next calls to [`alloc_frame`](Self::alloc_frame)
    /// can still return.
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        match self.mode {
            FrameMode::Bump => ((self.bump_limit - self.bump_next) / PAGE_SIZE) as usize,
            FrameMode::Stack => self.free,
        }
    }

    /// Switch from bump to stack mode. Idempotent.
    pub fn activate_stack(&mut self) {
        if self.mode == FrameMode::Stack {
            return;
        }
        self.mode = FrameMode::Stack;
        log::info!(
            "frame allocator: stack mode, bump high-water mark {}",
            self.bump_cursor()
        );
    }

    /// Hand out one frame and mark it used.
    ///
    /// # Errors
    /// - [`FrameAllocError::OutOfPhysicalMemory`] when no frame is left.
    pub fn alloc_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let _irq = IrqGuard::new();
        match self.mode {
            FrameMode::Bump => self.bump(),
            FrameMode::Stack => self.pop(),
        }
    }

    /// Return a frame to the pool.
    ///
    /// Frames below the placement boundary or at/above
    /// [`FrameStackConfig::limit`], and any frame freed while still in bump
    /// mode, are ignored.
    ///
    /// # Errors
    /// - [`FrameAllocError::Misaligned`] if `frame` is not 4 KiB aligned.
    /// - [`FrameAllocError::DoubleFree`] if the frame is already free (only
    ///   with [`FrameStackConfig::detect_double_free`]).
    pub fn free_frame(&mut self, frame: PhysicalAddress) -> Result<(), FrameAllocError> {
        let page = PhysicalPage::<Size4K>::try_from(frame).map_err(FrameAllocError::Misaligned)?;
        if frame.as_u32() < self.placement.as_u32() {
            log::warn!("ignoring free of boot frame {page}");
            return Ok(());
        }
        if u64::from(frame.as_u32()) >= self.config.limit {
            log::warn!("ignoring free of unmanaged frame {page}");
            return Ok(());
        }
        if self.mode == FrameMode::Bump {
            log::warn!("ignoring free of {page} before the frame stack is active");
            return Ok(());
        }

        let _irq = IrqGuard::new();
        if self.config.detect_double_free && self.is_free(page) {
            return Err(FrameAllocError::DoubleFree(page));
        }
        self.push(page);
        Ok(())
    }

    /// Register every whole frame of the usable regions of `memory_map` as
    /// free and return how many were added.
    ///
    /// Only `type == 1` regions count. Frames below the placement boundary,
    /// below the bump high-water mark, or at/above
    /// [`FrameStackConfig::limit`] are skipped. Switches to stack mode first.
    /// The regions must not overlap.
    pub fn map_physical_ram(&mut self, memory_map: &[MemoryRegion]) -> usize {
        let _irq = IrqGuard::new();
        self.activate_stack();

        let floor = u64::from(self.bump_next.max(self.placement.as_u32()));
        let ceiling = self.config.limit.min(1 << 32);
        let page = u64::from(PAGE_SIZE);

        let mut registered = 0;
        for region in memory_map.iter().filter(|r| r.is_usable()) {
            let start = region.base.max(floor).next_multiple_of(page);
            let end = region.end().min(ceiling) & !(page - 1);
            let mut pa = start;
            while pa < end {
                #[allow(clippy::cast_possible_truncation)]
                let frame = PhysicalPage::from_addr(PhysicalAddress::new(pa as u32));
                self.push(frame);
                registered += 1;
                pa += page;
            }
        }
        log::info!(
            "frame allocator: registered {registered} frames ({} KiB)",
            registered * PAGE_SIZE as usize / 1024
        );
        registered
    }

    fn bump(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        if self.bump_next >= self.bump_limit {
            return Err(FrameAllocError::OutOfPhysicalMemory);
        }
        let frame = PhysicalPage::from_addr(PhysicalAddress::new(self.bump_next));
        self.bump_next += PAGE_SIZE;
        Ok(frame)
    }

    fn pop(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let top = self.top.ok_or(FrameAllocError::OutOfPhysicalMemory)?;
        let stack = self.stack_page(top);
        self.free -= 1;
        if stack.len > 0 {
            stack.len -= 1;
            let pa = stack.entries[stack.len as usize];
            return Ok(PhysicalPage::from_addr(PhysicalAddress::new(pa)));
        }
        self.top = decode_prev(stack.prev);
        Ok(top)
    }

    fn push(&mut self, frame: PhysicalPage<Size4K>) {
        self.free += 1;
        if let Some(top) = self.top {
            let stack = self.stack_page(top);
            if (stack.len as usize) < STACK_PAGE_CAPACITY {
                stack.entries[stack.len as usize] = frame.base().as_u32();
                stack.len += 1;
                return;
            }
        }

        let prev = self.top.map_or(NONE, |p| p.base().as_u32());
        let stack = self.stack_page(frame);
        stack.prev = prev;
        stack.len = 0;
        self.top = Some(frame);
    }

    fn is_free(&self, frame: PhysicalPage<Size4K>) -> bool {
        let needle = frame.base().as_u32();
        let mut cursor = self.top;
        while let Some(page) = cursor {
            if page == frame {
                return true;
            }
            let stack = self.stack_page(page);
            if stack.entries[..stack.len as usize].contains(&needle) {
                return true;
            }
            cursor = decode_prev(stack.prev);
        }
        false
    }

    #[allow(clippy::mut_from_ref)]
    fn stack_page(&self, page: PhysicalPage<Size4K>) -> &'m mut StackPage {
        // SAFETY: stack pages are free frames owned by this allocator; at most
        // one reference to a given stack page is live at a time.
        unsafe { self.mapper.phys_to_mut::<StackPage>(page.base()) }
    }
}

impl<M: PhysMapper> FrameAlloc for FrameStack<'_, M> {
    fn alloc_4k(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.alloc_frame().ok()
    }

    fn free_4k(&mut self, page: PhysicalPage<Size4K>) {
        if let Err(e) = self.free_frame(page.base()) {
            log::error!("frame allocator: {e}");
        }
    }
}

const fn decode_prev(prev: u32) -> Option<PhysicalPage<Size4K>> {
    if prev == NONE {
        None
    } else {
        Some(PhysicalPage::from_addr(PhysicalAddress::new(prev)))
    }
}

const fn align_up_or_max(pa: u32) -> u32 {
    match kernel_vmem::align_up(pa, PAGE_SIZE) {
        Some(v) => v,
        None => u32::MAX & !(PAGE_SIZE - 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_vmem::testing::TestPhys;

    fn stack_over(phys: &TestPhys, config: FrameStackConfig) -> FrameStack<'_, TestPhys> {
        let mut frames = FrameStack::new(phys, phys.base(), phys.base(), config);
        let map = [MemoryRegion::usable(
            u64::from(phys.base().as_u32()),
            u64::from(phys.end().as_u32() - phys.base().as_u32()),
        )];
        frames.map_physical_ram(&map);
        frames
    }

    #[test]
    fn bump_mode_hands_out_ascending_frames() {
        let phys = TestPhys::with_frames(4);
        let mut frames = FrameStack::new(
            &phys,
            phys.base() + 1,
            phys.end(),
            FrameStackConfig::default(),
        );
        assert_eq!(frames.placement(), phys.frame(1).base());
        assert_eq!(frames.free_frames(), 3);
        assert_eq!(frames.alloc_frame(), Ok(phys.frame(1)));
        assert_eq!(frames.alloc_frame(), Ok(phys.frame(2)));
        assert_eq!(frames.alloc_frame(), Ok(phys.frame(3)));
        assert_eq!(
            frames.alloc_frame(),
            Err(FrameAllocError::OutOfPhysicalMemory)
        );

        // Bump frames hold boot structures; freeing them is a no-op.
        assert_eq!(frames.free_frame(phys.frame(2).base()), Ok(()));
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn frames_are_unique_until_freed() {
        let phys = TestPhys::with_frames(64);
        let mut frames = stack_over(&phys, FrameStackConfig::default());
        assert_eq!(frames.mode(), FrameMode::Stack);
        assert_eq!(frames.free_frames(), 64);

        let mut seen = std::collections::BTreeSet::new();
        while let Ok(f) = frames.alloc_frame() {
            assert!(seen.insert(f.base().as_u32()), "{f} handed out twice");
        }
        assert_eq!(seen.len(), 64);
        assert_eq!(frames.free_frames(), 0);

        let f = phys.frame(17);
        frames.free_frame(f.base()).unwrap();
        assert_eq!(frames.alloc_frame(), Ok(f));
    }

    #[test]
    fn stack_spills_into_freed_frames() {
        let phys = TestPhys::with_frames(STACK_PAGE_CAPACITY + 8);
        let mut frames = stack_over(&phys, FrameStackConfig::default());

        // The first registered frame became the bottom stack page and the
        // next CAPACITY frames filled it, so the remainder needed a new page.
        let total = STACK_PAGE_CAPACITY + 8;
        assert_eq!(frames.free_frames(), total);

        let mut count = 0;
        while frames.alloc_frame().is_ok() {
            count += 1;
        }
        assert_eq!(count, total);
    }

    #[test]
    fn double_free_is_detected() {
        let phys = TestPhys::with_frames(8);
        let mut frames = stack_over(&phys, FrameStackConfig::default());
        let a = frames.alloc_frame().unwrap();
        frames.free_frame(a.base()).unwrap();
        assert_eq!(
            frames.free_frame(a.base()),
            Err(FrameAllocError::DoubleFree(a))
        );

        // The bottom stack page itself counts as free too.
        assert_eq!(
            frames.free_frame(phys.frame(0).base()),
            Err(FrameAllocError::DoubleFree(phys.frame(0)))
        );
    }

    #[test]
    fn misaligned_and_boot_frees() {
        let phys = TestPhys::with_frames(8);
        let mut frames = FrameStack::new(
            &phys,
            phys.frame(2).base(),
            phys.frame(2).base(),
            FrameStackConfig::default(),
        );
        frames.activate_stack();
        assert_eq!(
            frames.free_frame(phys.base() + 4),
            Err(FrameAllocError::Misaligned(phys.base() + 4))
        );
        assert_eq!(frames.free_frame(phys.frame(1).base()), Ok(()));
        assert_eq!(frames.free_frames(), 0);
    }

    #[test]
    fn map_physical_ram_respects_boundaries() {
        let phys = TestPhys::with_frames(16);
        let mut frames = FrameStack::new(
            &phys,
            phys.frame(2).base(),
            phys.end(),
            FrameStackConfig {
                limit: u64::from(phys.frame(12).base().as_u32()),
                ..FrameStackConfig::default()
            },
        );
        // Two bump allocations raise the high-water mark to frame 4.
        frames.alloc_frame().unwrap();
        frames.alloc_frame().unwrap();

        let base = u64::from(phys.base().as_u32());
        let map = [
            MemoryRegion::usable(base, 0x3000),
            MemoryRegion::new(base + 0x3000, 0x1000, 2),
            MemoryRegion::usable(base + 0x4000 + 0x800, 0x4000),
            MemoryRegion::usable(base + 0xA000, 0x10_0000),
        ];
        // [4.5, 8.5) yields frames 5..8, [10, ..) yields 10 and 11.
        assert_eq!(frames.map_physical_ram(&map), 5);
        assert_eq!(frames.free_frames(), 5);
    }

    #[test]
    fn frames_above_the_limit_are_never_managed() {
        let phys = TestPhys::with_frames(16);
        let mut frames = FrameStack::new(
            &phys,
            phys.base(),
            phys.base(),
            FrameStackConfig {
                limit: u64::from(phys.frame(8).base().as_u32()),
                ..FrameStackConfig::default()
            },
        );
        let map = [MemoryRegion::usable(
            u64::from(phys.base().as_u32()),
            u64::from(phys.end().as_u32() - phys.base().as_u32()),
        )];
        assert_eq!(frames.map_physical_ram(&map), 8);

        // An MMIO-like frame coming back from a torn-down mapping.
        assert_eq!(frames.free_frame(phys.frame(12).base()), Ok(()));
        assert_eq!(frames.free_frames(), 8);
        while let Ok(f) = frames.alloc_frame() {
            assert!(f < phys.frame(8), "{f} is above the managed limit");
        }
    }

    #[test]
    fn unchecked_frees_skip_the_scan() {
        let phys = TestPhys::with_frames(8);
        let mut frames = stack_over(
            &phys,
            FrameStackConfig {
                detect_double_free: false,
                ..FrameStackConfig::default()
            },
        );
        let a = frames.alloc_frame().unwrap();
        frames.free_frame(a.base()).unwrap();
        assert_eq!(frames.free_frame(a.base()), Ok(()));
        assert_eq!(frames.free_frames(), 9);
    }
}
