//! # Kernel Heap
//!
//! A first-fit allocator over the virtual region `[start, end)`, growable up to
//! `max`. The region is an address-ordered, doubly-linked sequence of blocks;
//! each block starts with a 16-byte header:
//!
//! ```text
//!  +0  tag   hole bit + 31-bit magic
//!  +4  size  whole block, header included, multiple of 16
//!  +8  prev  offset of the previous block, or NONE
//! +12  next  offset of the next block, or NONE
//! +16  payload ...
//! ```
//!
//! Offsets are relative to `start`. Blocks tile the region: the sizes of all
//! blocks sum to `end - start` after every operation, and no two holes are
//! adjacent.
//!
//! The heap never touches memory directly. Every header access and every page
//! it maps or unmaps goes through a [`HeapBacking`], which the
//! [`Vmm`](crate::vmm::Vmm) implements.

use crate::vmm::VmmError;
use bitfield_struct::bitfield;
use kernel_sync::IrqGuard;
use kernel_vmem::PageEntryBits;
use kernel_vmem::addresses::{Size4K, VirtualAddress, VirtualPage};
use kernel_vmem::info::PAGE_SIZE;

/// Block header size in bytes.
pub const HEADER_SIZE: u32 = 16;

/// Allocation granule; every block offset and size is a multiple of it.
pub const GRANULE: u32 = 16;

/// Magic value in every block tag (`"HEAP"`).
pub const BLOCK_MAGIC: u32 = 0x4845_4150;

/// `prev`/`next` of the first/last block.
const NONE: u32 = u32::MAX;

/// What the heap needs from the memory below it.
pub trait HeapBacking {
    /// Back `page` with a fresh frame.
    ///
    /// # Errors
    /// - [`VmmError::OutOfPhysicalMemory`] when no frame is left.
    fn map_heap_page(
        &mut self,
        page: VirtualPage<Size4K>,
        flags: PageEntryBits,
    ) -> Result<(), VmmError>;

    /// Unmap `page` and release its frame.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if the page is not mapped.
    fn release_heap_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), VmmError>;

    /// Read the aligned word at `va`.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if `va` is not mapped.
    fn read_u32(&self, va: VirtualAddress) -> Result<u32, VmmError>;

    /// Write the aligned word at `va`.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if `va` is not mapped.
    fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<(), VmmError>;

    /// Set `len` bytes starting at `va` to `byte`.
    ///
    /// # Errors
    /// - [`VmmError::NotMapped`] if part of the range is not mapped.
    fn fill(&mut self, va: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError>;
}

/// First word of every block header.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct BlockTag {
    /// The block is free.
    pub hole: bool,
    /// [`BLOCK_MAGIC`] for every live header.
    #[bits(31)]
    pub magic: u32,
}

impl BlockTag {
    #[inline]
    #[must_use]
    pub const fn block(hole: bool) -> Self {
        Self::new().with_hole(hole).with_magic(BLOCK_MAGIC)
    }

    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.magic() == BLOCK_MAGIC
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("heap exhausted: {requested} bytes requested, region may not grow past {max}")]
    Exhausted { requested: u32, max: VirtualAddress },
    #[error("corrupted heap block at offset {offset:#x} (tag {tag:#010x})")]
    Corrupted { offset: u32, tag: u32 },
    #[error("{0} was not returned by this heap")]
    ForeignPointer(VirtualAddress),
    #[error("{0} is already free")]
    DoubleFree(VirtualAddress),
    #[error("heap bounds must be page aligned")]
    Unaligned,
    #[error("invalid heap range {start}..{end} (max {max})")]
    InvalidRange {
        start: VirtualAddress,
        end: VirtualAddress,
        max: VirtualAddress,
    },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u32),
    #[error(transparent)]
    Backing(#[from] VmmError),
}

/// One block as seen by [`Heap::blocks`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    /// Offset of the header from the heap start.
    pub offset: u32,
    /// Size including the header.
    pub size: u32,
    pub hole: bool,
}

#[derive(Debug, Copy, Clone)]
struct Header {
    hole: bool,
    size: u32,
    prev: u32,
    next: u32,
}

/// The kernel heap.
#[derive(Debug)]
pub struct Heap {
    start: VirtualAddress,
    end: VirtualAddress,
    max: VirtualAddress,
    min_size: u32,
    supervisor: bool,
    readonly: bool,
    contract: bool,
    used: u32,
    last: u32,
}

impl Heap {
    /// Map `[start, end)` and initialize it as a single hole.
    ///
    /// Pages are user-accessible unless `supervisor` and writable unless
    /// `readonly`. The heap never contracts below its initial size until
    /// [`set_min_size`](Self::set_min_size) says otherwise.
    ///
    /// # Errors
    /// - [`HeapError::Unaligned`] if `start` or `end` is not page aligned.
    /// - [`HeapError::InvalidRange`] unless `start < end <= max`.
    /// - [`HeapError::Backing`] if the initial pages cannot be mapped.
    pub fn create<B: HeapBacking>(
        backing: &mut B,
        start: VirtualAddress,
        end: VirtualAddress,
        max: VirtualAddress,
        supervisor: bool,
        readonly: bool,
    ) -> Result<Self, HeapError> {
        if !start.is_aligned::<Size4K>() || !end.is_aligned::<Size4K>() {
            return Err(HeapError::Unaligned);
        }
        if start.as_u32() >= end.as_u32() || end.as_u32() > max.as_u32() {
            return Err(HeapError::InvalidRange { start, end, max });
        }

        let _irq = IrqGuard::new();
        let flags = PageEntryBits::for_access(!supervisor, !readonly);
        map_pages(backing, flags, start.as_u32(), end.as_u32())?;

        let heap = Self {
            start,
            end,
            max,
            min_size: end.as_u32() - start.as_u32(),
            supervisor,
            readonly,
            contract: true,
            used: 0,
            last: 0,
        };
        heap.write_header(
            backing,
            0,
            Header {
                hole: true,
                size: heap.len(),
                prev: NONE,
                next: NONE,
            },
        )?;
        log::info!("kernel heap at {start}..{end}, may grow to {max}");
        Ok(heap)
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> VirtualAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn max(&self) -> VirtualAddress {
        self.max
    }

    #[inline]
    #[must_use]
    pub const fn min_size(&self) -> u32 {
        self.min_size
    }

    #[inline]
    #[must_use]
    pub const fn is_supervisor(&self) -> bool {
        self.supervisor
    }

    #[inline]
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Payload bytes of all blocks in use.
    #[inline]
    #[must_use]
    pub const fn used_bytes(&self) -> u32 {
        self.used
    }

    /// Lower bound for contraction, rounded up to whole pages and at least
    /// one page. Does not shrink the heap by itself.
    pub fn set_min_size(&mut self, bytes: u32) {
        let ceiling = self.max.as_u32() - self.start.as_u32();
        let rounded = bytes.max(PAGE_SIZE).checked_next_multiple_of(PAGE_SIZE);
        self.min_size = rounded.unwrap_or(ceiling).min(ceiling);
    }

    /// Turn contraction after [`free`](Self::free) on or off.
    pub const fn set_contraction(&mut self, enabled: bool) {
        self.contract = enabled;
    }

    /// Allocate `size` bytes aligned to `align` and return the payload address.
    ///
    /// `align` of 0 means the natural 16-byte alignment. Holes are searched in
    /// address order and the first that fits is used. If none fits, the region
    /// grows at its tail and the search is repeated.
    ///
    /// # Errors
    /// - [`HeapError::InvalidAlignment`] if `align` is not a power of two.
    /// - [`HeapError::Exhausted`] if growing would pass `max`.
    /// - [`HeapError::Corrupted`] if a header on the way fails validation.
    /// - [`HeapError::Backing`] if growth cannot map a page.
    pub fn allocate<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        size: u32,
        align: u32,
    ) -> Result<VirtualAddress, HeapError> {
        if align != 0 && !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(align));
        }
        let align = align.max(GRANULE);
        let exhausted = HeapError::Exhausted {
            requested: size,
            max: self.max,
        };
        let need = size
            .max(1)
            .checked_next_multiple_of(GRANULE)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(exhausted)?;

        let _irq = IrqGuard::new();
        if let Some(ptr) = self.try_fit(backing, need, align)? {
            return Ok(ptr);
        }
        self.grow(backing, size, need, align)?;
        self.try_fit(backing, need, align)?.ok_or(exhausted)
    }

    /// [`allocate`](Self::allocate), then zero the first `size` payload bytes.
    ///
    /// # Errors
    /// - As [`allocate`](Self::allocate).
    pub fn allocate_zeroed<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        size: u32,
        align: u32,
    ) -> Result<VirtualAddress, HeapError> {
        let ptr = self.allocate(backing, size, align)?;
        backing.fill(ptr, size, 0)?;
        Ok(ptr)
    }

    /// Return the block at `ptr` to the heap.
    ///
    /// The block is merged with a following and a preceding hole. A hole that
    /// ends the region gives its whole pages back, down to the minimum size.
    ///
    /// # Errors
    /// - [`HeapError::ForeignPointer`] if `ptr` cannot be a payload address.
    /// - [`HeapError::Corrupted`] if the header fails validation.
    /// - [`HeapError::DoubleFree`] if the block is already a hole.
    pub fn free<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        ptr: VirtualAddress,
    ) -> Result<(), HeapError> {
        let _irq = IrqGuard::new();
        let mut off = self.offset_of(ptr)?;
        let mut block = self.read_header(backing, off)?;
        if block.hole {
            return Err(HeapError::DoubleFree(ptr));
        }

        self.used -= block.size - HEADER_SIZE;
        block.hole = true;
        backing.write_u32(self.va(off), BlockTag::block(true).into_bits())?;

        if block.next != NONE {
            let next = self.read_header(backing, block.next)?;
            if next.hole {
                block.size += next.size;
                block.next = next.next;
                self.relink_prev(backing, next.next, off)?;
            }
        }
        if block.prev != NONE {
            let prev = self.read_header(backing, block.prev)?;
            if prev.hole {
                let merged = Header {
                    size: prev.size + block.size,
                    next: block.next,
                    ..prev
                };
                self.relink_prev(backing, block.next, block.prev)?;
                off = block.prev;
                block = merged;
            }
        }
        self.write_header(backing, off, block)?;

        if self.contract && block.next == NONE {
            self.contract_tail(backing, off, block)?;
        }
        Ok(())
    }

    /// Walk the block list in address order.
    pub fn blocks<'h, B: HeapBacking>(&'h self, backing: &'h B) -> Blocks<'h, B> {
        Blocks {
            heap: self,
            backing,
            next: 0,
        }
    }

    /// Verify the block list: contiguous tiling of `[start, end)`, consistent
    /// back links, valid tags, no adjacent holes, and a matching used count.
    ///
    /// # Errors
    /// - [`HeapError::Corrupted`] at the first offending block.
    pub fn check<B: HeapBacking>(&self, backing: &B) -> Result<(), HeapError> {
        let mut expected = 0u32;
        let mut prev = NONE;
        let mut prev_hole = false;
        let mut used = 0u32;
        let mut off = 0u32;

        while off != NONE {
            let block = self.read_header(backing, off)?;
            if off != expected || block.prev != prev || (block.hole && prev_hole) {
                return Err(self.corrupted(backing, off));
            }
            if !block.hole {
                used += block.size - HEADER_SIZE;
            }
            expected += block.size;
            prev = off;
            prev_hole = block.hole;
            off = block.next;
        }

        if expected != self.len() || prev != self.last || used != self.used {
            return Err(HeapError::Corrupted {
                offset: expected,
                tag: 0,
            });
        }
        Ok(())
    }

    const fn len(&self) -> u32 {
        self.end.as_u32() - self.start.as_u32()
    }

    fn va(&self, off: u32) -> VirtualAddress {
        self.start + off
    }

    const fn page_flags(&self) -> PageEntryBits {
        PageEntryBits::for_access(!self.supervisor, !self.readonly)
    }

    fn offset_of(&self, ptr: VirtualAddress) -> Result<u32, HeapError> {
        let (p, s) = (ptr.as_u32(), self.start.as_u32());
        if p < s + HEADER_SIZE || p >= self.end.as_u32() || !(p - s).is_multiple_of(GRANULE) {
            return Err(HeapError::ForeignPointer(ptr));
        }
        Ok(p - s - HEADER_SIZE)
    }

    fn corrupted<B: HeapBacking>(&self, backing: &B, off: u32) -> HeapError {
        HeapError::Corrupted {
            offset: off,
            tag: backing.read_u32(self.va(off)).unwrap_or(0),
        }
    }

    fn read_header<B: HeapBacking>(&self, backing: &B, off: u32) -> Result<Header, HeapError> {
        let va = self.va(off);
        let tag = BlockTag::from_bits(backing.read_u32(va)?);
        let size = backing.read_u32(va + 4)?;
        let fits = u64::from(off) + u64::from(size) <= u64::from(self.len());
        if !tag.is_valid() || size < HEADER_SIZE || !size.is_multiple_of(GRANULE) || !fits {
            return Err(HeapError::Corrupted {
                offset: off,
                tag: tag.into_bits(),
            });
        }
        Ok(Header {
            hole: tag.hole(),
            size,
            prev: backing.read_u32(va + 8)?,
            next: backing.read_u32(va + 12)?,
        })
    }

    fn write_header<B: HeapBacking>(
        &self,
        backing: &mut B,
        off: u32,
        header: Header,
    ) -> Result<(), HeapError> {
        let va = self.va(off);
        backing.write_u32(va, BlockTag::block(header.hole).into_bits())?;
        backing.write_u32(va + 4, header.size)?;
        backing.write_u32(va + 8, header.prev)?;
        backing.write_u32(va + 12, header.next)?;
        Ok(())
    }

    /// Point the block at `off` back at `prev`; `NONE` makes `prev` the tail.
    fn relink_prev<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        off: u32,
        prev: u32,
    ) -> Result<(), HeapError> {
        if off == NONE {
            self.last = prev;
        } else {
            backing.write_u32(self.va(off) + 8, prev)?;
        }
        Ok(())
    }

    /// Slack needed in front of the block at `off` to align its payload, if
    /// a hole of `size` bytes there can hold `need` bytes.
    fn fit_gap(&self, off: u32, size: u32, need: u32, align: u32) -> Option<u32> {
        let payload = u64::from(self.start.as_u32()) + u64::from(off) + u64::from(HEADER_SIZE);
        let gap = payload.next_multiple_of(u64::from(align)) - payload;
        u32::try_from(gap)
            .ok()
            .filter(|&gap| u64::from(gap) + u64::from(need) <= u64::from(size))
    }

    fn try_fit<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        need: u32,
        align: u32,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let mut off = 0;
        while off != NONE {
            let block = self.read_header(backing, off)?;
            if block.hole
                && let Some(gap) = self.fit_gap(off, block.size, need, align)
            {
                return self.carve(backing, off, block, gap, need).map(Some);
            }
            off = block.next;
        }
        Ok(None)
    }

    /// Turn the hole at `off` into a used block of at least `need` bytes,
    /// `gap` bytes in. The gap stays a hole; a remainder larger than a header
    /// becomes a trailing hole.
    fn carve<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        off: u32,
        hole: Header,
        gap: u32,
        need: u32,
    ) -> Result<VirtualAddress, HeapError> {
        let mut prev = hole.prev;
        let mut block = off;
        if gap > 0 {
            block = off + gap;
            self.write_header(
                backing,
                off,
                Header {
                    hole: true,
                    size: gap,
                    prev: hole.prev,
                    next: block,
                },
            )?;
            prev = off;
        }

        let avail = hole.size - gap;
        let remainder = avail - need;
        let (size, next) = if remainder > HEADER_SIZE {
            let tail = block + need;
            self.write_header(
                backing,
                tail,
                Header {
                    hole: true,
                    size: remainder,
                    prev: block,
                    next: hole.next,
                },
            )?;
            self.relink_prev(backing, hole.next, tail)?;
            (need, tail)
        } else {
            self.relink_prev(backing, hole.next, block)?;
            (avail, hole.next)
        };

        self.write_header(
            backing,
            block,
            Header {
                hole: false,
                size,
                prev,
                next,
            },
        )?;
        self.used += size - HEADER_SIZE;
        Ok(self.va(block + HEADER_SIZE))
    }

    /// Extend the region so that its tail can hold a block of `need` bytes
    /// with the given payload alignment.
    fn grow<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        requested: u32,
        need: u32,
        align: u32,
    ) -> Result<(), HeapError> {
        let tail = self.read_header(backing, self.last)?;
        let hole_off = if tail.hole { self.last } else { self.len() };

        let payload = u64::from(self.start.as_u32()) + u64::from(hole_off) + u64::from(HEADER_SIZE);
        let block_end =
            payload.next_multiple_of(u64::from(align)) - u64::from(HEADER_SIZE) + u64::from(need);
        let new_end = block_end.next_multiple_of(u64::from(PAGE_SIZE));
        let exhausted = HeapError::Exhausted {
            requested,
            max: self.max,
        };
        if new_end > u64::from(self.max.as_u32()) {
            return Err(exhausted);
        }
        let new_end = u32::try_from(new_end).map_err(|_| exhausted)?;

        map_pages(backing, self.page_flags(), self.end.as_u32(), new_end)?;
        let delta = new_end - self.end.as_u32();

        if tail.hole {
            backing.write_u32(self.va(self.last) + 4, tail.size + delta)?;
        } else {
            self.write_header(
                backing,
                hole_off,
                Header {
                    hole: true,
                    size: delta,
                    prev: self.last,
                    next: NONE,
                },
            )?;
            backing.write_u32(self.va(self.last) + 12, hole_off)?;
            self.last = hole_off;
        }

        log::debug!(
            "kernel heap grew by {delta:#x} bytes: {}..{new_end:#010x}",
            self.start
        );
        self.end = VirtualAddress::new(new_end);
        Ok(())
    }

    /// Give the whole pages of the tail hole at `off` back, never going below
    /// the minimum size.
    fn contract_tail<B: HeapBacking>(
        &mut self,
        backing: &mut B,
        off: u32,
        hole: Header,
    ) -> Result<(), HeapError> {
        let start = self.start.as_u32();
        let floor = start + self.min_size;
        let hole_start = start + off;
        let old_end = self.end.as_u32();

        let new_end = if hole_start.is_multiple_of(PAGE_SIZE) && hole_start >= floor {
            // The hole goes away entirely; its predecessor is in use.
            backing.write_u32(self.va(hole.prev) + 12, NONE)?;
            self.last = hole.prev;
            hole_start
        } else {
            let keep = (hole_start + HEADER_SIZE).next_multiple_of(PAGE_SIZE).max(floor);
            if keep >= old_end {
                return Ok(());
            }
            backing.write_u32(self.va(off) + 4, keep - hole_start)?;
            keep
        };

        self.end = VirtualAddress::new(new_end);
        unmap_pages(backing, new_end, old_end)?;
        log::debug!(
            "kernel heap shrank by {:#x} bytes: {}..{}",
            old_end - new_end,
            self.start,
            self.end
        );
        Ok(())
    }
}

/// Iterator returned by [`Heap::blocks`]. Stops after the first corrupted
/// header.
pub struct Blocks<'h, B> {
    heap: &'h Heap,
    backing: &'h B,
    next: u32,
}

impl<B: HeapBacking> Iterator for Blocks<'_, B> {
    type Item = Result<BlockInfo, HeapError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NONE {
            return None;
        }
        let offset = self.next;
        match self.heap.read_header(self.backing, offset) {
            Ok(h) => {
                self.next = h.next;
                Some(Ok(BlockInfo {
                    offset,
                    size: h.size,
                    hole: h.hole,
                }))
            }
            Err(e) => {
                self.next = NONE;
                Some(Err(e))
            }
        }
    }
}

fn map_pages<B: HeapBacking>(
    backing: &mut B,
    flags: PageEntryBits,
    from: u32,
    to: u32,
) -> Result<(), VmmError> {
    let mut va = from;
    while va < to {
        let page = VirtualPage::containing_address(VirtualAddress::new(va));
        if let Err(e) = backing.map_heap_page(page, flags) {
            if unmap_pages(backing, from, va).is_err() {
                log::warn!("could not roll back heap pages {from:#010x}..{va:#010x}");
            }
            return Err(e);
        }
        va += PAGE_SIZE;
    }
    Ok(())
}

fn unmap_pages<B: HeapBacking>(backing: &mut B, from: u32, to: u32) -> Result<(), VmmError> {
    let mut va = from;
    while va < to {
        backing.release_heap_page(VirtualPage::containing_address(VirtualAddress::new(va)))?;
        va += PAGE_SIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const START: u32 = 0xC000_0000;

    /// Heap pages as boxed arrays keyed by page base, with a frame budget.
    #[derive(Default)]
    struct Pages {
        pages: BTreeMap<u32, Box<[u8; PAGE_SIZE as usize]>>,
        flags: Vec<PageEntryBits>,
        budget: Option<usize>,
    }

    impl Pages {
        fn with_budget(frames: usize) -> Self {
            Self {
                budget: Some(frames),
                ..Self::default()
            }
        }

        fn page(&self, va: VirtualAddress) -> Result<(&[u8; 4096], usize), VmmError> {
            let base = va.as_u32() & !(PAGE_SIZE - 1);
            let page = self.pages.get(&base).ok_or(VmmError::NotMapped(va))?;
            Ok((page, (va.as_u32() - base) as usize))
        }

        fn page_mut(&mut self, va: VirtualAddress) -> Result<(&mut [u8; 4096], usize), VmmError> {
            let base = va.as_u32() & !(PAGE_SIZE - 1);
            let page = self.pages.get_mut(&base).ok_or(VmmError::NotMapped(va))?;
            Ok((page, (va.as_u32() - base) as usize))
        }
    }

    impl HeapBacking for Pages {
        fn map_heap_page(
            &mut self,
            page: VirtualPage<Size4K>,
            flags: PageEntryBits,
        ) -> Result<(), VmmError> {
            if let Some(budget) = self.budget.as_mut() {
                if *budget == 0 {
                    return Err(VmmError::OutOfPhysicalMemory);
                }
                *budget -= 1;
            }
            self.pages
                .insert(page.base().as_u32(), Box::new([0; PAGE_SIZE as usize]));
            self.flags.push(flags);
            Ok(())
        }

        fn release_heap_page(&mut self, page: VirtualPage<Size4K>) -> Result<(), VmmError> {
            self.pages
                .remove(&page.base().as_u32())
                .ok_or(VmmError::NotMapped(page.base()))?;
            if let Some(budget) = self.budget.as_mut() {
                *budget += 1;
            }
            Ok(())
        }

        fn read_u32(&self, va: VirtualAddress) -> Result<u32, VmmError> {
            let (page, off) = self.page(va)?;
            let mut word = [0; 4];
            word.copy_from_slice(&page[off..off + 4]);
            Ok(u32::from_le_bytes(word))
        }

        fn write_u32(&mut self, va: VirtualAddress, value: u32) -> Result<(), VmmError> {
            let (page, off) = self.page_mut(va)?;
            page[off..off + 4].copy_from_slice(&value.to_le_bytes());
            Ok(())
        }

        fn fill(&mut self, va: VirtualAddress, len: u32, byte: u8) -> Result<(), VmmError> {
            for i in 0..len {
                let (page, off) = self.page_mut(va + i)?;
                page[off] = byte;
            }
            Ok(())
        }
    }

    fn va(v: u32) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn heap(pages: &mut Pages, initial: u32, max: u32) -> Heap {
        Heap::create(pages, va(START), va(START + initial), va(START + max), true, false).unwrap()
    }

    fn layout(heap: &Heap, pages: &Pages) -> Vec<(u32, u32, bool)> {
        heap.blocks(pages)
            .map(|b| b.map(|b| (b.offset, b.size, b.hole)))
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn create_spans_a_single_hole() {
        let mut pages = Pages::default();
        let heap = heap(&mut pages, 0x4000, 0x10_000);
        assert_eq!(layout(&heap, &pages), [(0, 0x4000, true)]);
        assert_eq!(pages.pages.len(), 4);
        assert_eq!(heap.min_size(), 0x4000);
        assert_eq!(heap.used_bytes(), 0);
        assert!(pages.flags.iter().all(|f| f.writable() && !f.user_access()));
        heap.check(&pages).unwrap();
    }

    #[test]
    fn create_validates_bounds() {
        let mut pages = Pages::default();
        assert_eq!(
            Heap::create(&mut pages, va(START + 8), va(START + 0x1000), va(START + 0x2000), true, false)
                .unwrap_err(),
            HeapError::Unaligned
        );
        assert!(matches!(
            Heap::create(&mut pages, va(START), va(START + 0x2000), va(START + 0x1000), true, false),
            Err(HeapError::InvalidRange { .. })
        ));
        assert!(pages.pages.is_empty());
    }

    #[test]
    fn freed_neighbours_are_reused_first_fit() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);

        let a = heap.allocate(&mut pages, 8, 0).unwrap();
        let b = heap.allocate(&mut pages, 8, 0).unwrap();
        let c = heap.allocate(&mut pages, 8, 0).unwrap();
        assert_eq!(a, va(START + HEADER_SIZE));
        assert_eq!(b, a + 32);
        assert_eq!(c, b + 32);

        heap.free(&mut pages, a).unwrap();
        heap.free(&mut pages, b).unwrap();
        heap.check(&pages).unwrap();
        assert_eq!(layout(&heap, &pages)[0], (0, 64, true));

        let d = heap.allocate(&mut pages, 24, 0).unwrap();
        assert_eq!(d, a);
        heap.check(&pages).unwrap();
    }

    #[test]
    fn free_coalesces_both_sides() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let a = heap.allocate(&mut pages, 100, 0).unwrap();
        let b = heap.allocate(&mut pages, 100, 0).unwrap();
        let c = heap.allocate(&mut pages, 100, 0).unwrap();
        let d = heap.allocate(&mut pages, 100, 0).unwrap();

        heap.free(&mut pages, b).unwrap();
        heap.free(&mut pages, d).unwrap();
        heap.free(&mut pages, c).unwrap();
        heap.check(&pages).unwrap();

        let blocks = layout(&heap, &pages);
        assert_eq!(blocks.len(), 2, "{blocks:?}");
        assert_eq!(blocks[0], (0, 128, false));
        assert_eq!(blocks[1], (128, 0x4000 - 128, true));

        heap.free(&mut pages, a).unwrap();
        assert_eq!(layout(&heap, &pages), [(0, 0x4000, true)]);
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn used_bytes_counts_payload_capacity() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let a = heap.allocate(&mut pages, 8, 0).unwrap();
        let b = heap.allocate(&mut pages, 100, 0).unwrap();
        assert_eq!(heap.used_bytes(), 16 + 112);
        heap.free(&mut pages, a).unwrap();
        assert_eq!(heap.used_bytes(), 112);
        heap.free(&mut pages, b).unwrap();
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn aligned_allocation_leaves_a_leading_hole() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let small = heap.allocate(&mut pages, 8, 0).unwrap();
        let aligned = heap.allocate(&mut pages, 10, 0x1000).unwrap();
        assert!(aligned.is_aligned::<Size4K>());
        assert_eq!(aligned, va(START + 0x1000));

        let blocks = layout(&heap, &pages);
        assert_eq!(blocks[1], (32, 0x1000 - HEADER_SIZE - 32, true));
        heap.check(&pages).unwrap();

        // The leading hole is used by later small requests.
        let next = heap.allocate(&mut pages, 8, 0).unwrap();
        assert_eq!(next, small + 32);
        heap.check(&pages).unwrap();

        assert_eq!(
            heap.allocate(&mut pages, 8, 24),
            Err(HeapError::InvalidAlignment(24))
        );
    }

    #[test]
    fn grows_when_nothing_fits() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x10_000);
        let a = heap.allocate(&mut pages, 0x800, 0).unwrap();
        let big = heap.allocate(&mut pages, 0x2000, 0).unwrap();
        assert_eq!(heap.end(), va(START + 0x3000));
        assert_eq!(pages.pages.len(), 3);
        assert!(big.as_u32() > a.as_u32());
        heap.check(&pages).unwrap();
    }

    #[test]
    fn growth_past_max_is_exhaustion() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x2000);
        assert_eq!(
            heap.allocate(&mut pages, 0x2000, 0),
            Err(HeapError::Exhausted {
                requested: 0x2000,
                max: va(START + 0x2000)
            })
        );
        assert_eq!(heap.end(), va(START + 0x1000));
        heap.check(&pages).unwrap();
    }

    #[test]
    fn last_hole_is_used_exactly_then_exhausted() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x1000);
        let all = heap.allocate(&mut pages, 0x1000 - HEADER_SIZE, 0).unwrap();
        assert_eq!(layout(&heap, &pages), [(0, 0x1000, false)]);
        assert!(matches!(
            heap.allocate(&mut pages, 1, 0),
            Err(HeapError::Exhausted { requested: 1, .. })
        ));
        heap.free(&mut pages, all).unwrap();
        heap.check(&pages).unwrap();
    }

    #[test]
    fn frame_exhaustion_during_growth_leaves_heap_intact() {
        let mut pages = Pages::with_budget(2);
        let mut heap = heap(&mut pages, 0x1000, 0x10_000);
        assert_eq!(
            heap.allocate(&mut pages, 0x3000, 0),
            Err(HeapError::Backing(VmmError::OutOfPhysicalMemory))
        );
        assert_eq!(heap.end(), va(START + 0x1000));
        assert_eq!(pages.pages.len(), 1);
        heap.check(&pages).unwrap();
    }

    #[test]
    fn contraction_stops_at_the_minimum() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x10_000);
        let big = heap.allocate(&mut pages, 0x3000, 0).unwrap();
        assert_eq!(heap.end(), va(START + 0x4000));

        heap.free(&mut pages, big).unwrap();
        assert_eq!(heap.end(), va(START + 0x1000));
        assert_eq!(pages.pages.len(), 1);
        assert_eq!(layout(&heap, &pages), [(0, 0x1000, true)]);
        heap.check(&pages).unwrap();
    }

    #[test]
    fn page_aligned_tail_hole_is_dropped() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x10_000);
        heap.allocate(&mut pages, 0x1000 - HEADER_SIZE, 0).unwrap();
        let second = heap.allocate(&mut pages, 0x1000 - HEADER_SIZE, 0).unwrap();
        assert_eq!(heap.end(), va(START + 0x2000));

        heap.free(&mut pages, second).unwrap();
        assert_eq!(heap.end(), va(START + 0x1000));
        assert_eq!(layout(&heap, &pages), [(0, 0x1000, false)]);
        heap.check(&pages).unwrap();
    }

    #[test]
    fn contraction_can_be_disabled() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x1000, 0x10_000);
        heap.set_contraction(false);
        let big = heap.allocate(&mut pages, 0x3000, 0).unwrap();
        heap.free(&mut pages, big).unwrap();
        assert_eq!(heap.end(), va(START + 0x4000));
        heap.check(&pages).unwrap();
    }

    #[test]
    fn min_size_is_page_rounded() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        heap.set_min_size(0x1800);
        assert_eq!(heap.min_size(), 0x2000);
        heap.set_min_size(0);
        assert_eq!(heap.min_size(), PAGE_SIZE);
        heap.set_min_size(u32::MAX);
        assert_eq!(heap.min_size(), 0x10_000);
    }

    #[test]
    fn bad_frees_are_rejected() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let a = heap.allocate(&mut pages, 8, 0).unwrap();
        let _b = heap.allocate(&mut pages, 8, 0).unwrap();

        heap.free(&mut pages, a).unwrap();
        assert_eq!(heap.free(&mut pages, a), Err(HeapError::DoubleFree(a)));
        assert_eq!(
            heap.free(&mut pages, a + 8),
            Err(HeapError::ForeignPointer(a + 8))
        );
        assert_eq!(
            heap.free(&mut pages, va(0x1000)),
            Err(HeapError::ForeignPointer(va(0x1000)))
        );

        // Well-formed pointer into the trailing hole, no header behind it.
        let inner = va(START + 0x100);
        assert!(matches!(
            heap.free(&mut pages, inner),
            Err(HeapError::Corrupted { offset: 0xF0, .. })
        ));
        heap.check(&pages).unwrap();
    }

    #[test]
    fn smashed_header_is_detected() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let a = heap.allocate(&mut pages, 8, 0).unwrap();
        let b = heap.allocate(&mut pages, 8, 0).unwrap();

        // Overrun a's payload into b's header.
        pages.fill(a, 32, 0xAA).unwrap();
        assert_eq!(
            heap.free(&mut pages, b),
            Err(HeapError::Corrupted {
                offset: 32,
                tag: 0xAAAA_AAAA
            })
        );
        assert!(matches!(
            heap.check(&pages),
            Err(HeapError::Corrupted { offset: 32, .. })
        ));
    }

    #[test]
    fn allocate_zeroed_clears_old_contents() {
        let mut pages = Pages::default();
        let mut heap = heap(&mut pages, 0x4000, 0x10_000);
        let a = heap.allocate(&mut pages, 64, 0).unwrap();
        pages.fill(a, 64, 0x5A).unwrap();
        heap.free(&mut pages, a).unwrap();

        let z = heap.allocate_zeroed(&mut pages, 64, 0).unwrap();
        assert_eq!(z, a);
        for i in 0..16 {
            assert_eq!(pages.read_u32(z + i * 4), Ok(0));
        }
    }

    #[test]
    fn user_and_readonly_flags_reach_the_backing() {
        let mut pages = Pages::default();
        Heap::create(&mut pages, va(START), va(START + 0x1000), va(START + 0x2000), false, true)
            .unwrap();
        let flags = pages.flags[0];
        assert!(flags.user_access());
        assert!(!flags.writable());
    }

    #[test]
    fn block_tag_layout() {
        let tag = BlockTag::block(true);
        assert_eq!(tag.into_bits(), (BLOCK_MAGIC << 1) | 1);
        assert!(tag.is_valid());
        assert!(!BlockTag::from_bits(0).is_valid());
    }
}
