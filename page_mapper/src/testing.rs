//! Host-side test support: a leaked, page-aligned allocation stands in for
//! physical memory, reached through the same [`PhysOffset`] window the
//! kernel uses.

use libx64::{
    address::PhysicalAddr,
    paging::{frame::PhysOffset, Page4Kb},
};

use crate::frame_alloc::RegionAllocator;

/// Pretend RAM starts at 1 MiB, like it does on the machines we boot on.
pub const ARENA_PHYS_BASE: u64 = 0x10_0000;

pub struct Arena {
    pages: usize,
    offset: PhysOffset,
}

impl Arena {
    /// Allocate `pages` of backing memory. The allocation is leaked so
    /// tests can treat translated pointers as `'static`.
    #[must_use]
    pub fn new(pages: usize) -> Self {
        use std::alloc::{alloc_zeroed, Layout};

        let layout = Layout::from_size_align(pages * Page4Kb as usize, Page4Kb as usize)
            .expect("arena layout");
        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null());

        Self {
            pages,
            offset: PhysOffset::new(base as u64 - ARENA_PHYS_BASE),
        }
    }

    #[must_use]
    pub fn phys_offset(&self) -> PhysOffset {
        self.offset
    }

    /// The arena's "physical" `[start, end)` range.
    #[must_use]
    pub fn phys_range(&self) -> (PhysicalAddr, PhysicalAddr) {
        (
            PhysicalAddr::new(ARENA_PHYS_BASE),
            PhysicalAddr::new(ARENA_PHYS_BASE + self.pages as u64 * Page4Kb),
        )
    }

    /// A frame allocator over the whole arena, with no carve-outs.
    #[must_use]
    pub fn allocator(&self) -> RegionAllocator {
        let mut alloc = RegionAllocator::new(
            self.offset,
            PhysicalAddr::null(),
            PhysicalAddr::null(),
            PhysicalAddr::null(),
            PhysicalAddr::null(),
        );
        let (start, end) = self.phys_range();
        alloc.add_region(start, end);
        alloc
    }
}
