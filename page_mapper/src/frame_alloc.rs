use libx64::{
    address::PhysicalAddr,
    paging::{
        frame::{FrameAllocator, FrameError, PhysOffset, PhysicalFrame},
        Page4Kb,
    },
};

pub const MAX_REGIONS: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Region {
    start: PhysicalAddr,
    end: PhysicalAddr,
}

impl Region {
    const EMPTY: Region = Region {
        start: PhysicalAddr::null(),
        end: PhysicalAddr::null(),
    };
}

/// Boot-time physical page allocator over the RAM regions reported by the
/// memory map, minus the kernel image and the boot modules.
///
/// Allocation is two-phase: a bump cursor walks the regions in order, and a
/// LIFO free list threaded through the first 8 bytes of freed pages serves
/// recycling. The free list lives in the pages themselves, so it needs no
/// storage of its own.
pub struct RegionAllocator {
    regions: [Region; MAX_REGIONS],
    num_regions: usize,

    kernel_start: PhysicalAddr,
    kernel_end: PhysicalAddr,
    module_start: PhysicalAddr,
    module_end: PhysicalAddr,

    cur_region: usize,
    cur_addr: PhysicalAddr,

    // Head of the free list; the first 8 bytes of each free page hold the
    // physical address of the next one.
    free_pages: PhysicalAddr,

    offset: PhysOffset,
    sealed: bool,
}

impl RegionAllocator {
    #[must_use]
    pub fn new(
        offset: PhysOffset,
        kernel_start: PhysicalAddr,
        kernel_end: PhysicalAddr,
        module_start: PhysicalAddr,
        module_end: PhysicalAddr,
    ) -> Self {
        Self {
            regions: [Region::EMPTY; MAX_REGIONS],
            num_regions: 0,
            kernel_start: kernel_start.align_down(Page4Kb),
            kernel_end: kernel_end.align_up(Page4Kb),
            module_start: module_start.align_down(Page4Kb),
            module_end: module_end.align_up(Page4Kb),
            cur_region: 0,
            cur_addr: PhysicalAddr::null(),
            free_pages: PhysicalAddr::null(),
            offset,
            sealed: false,
        }
    }

    /// Register an available RAM region, splitting around the kernel image
    /// and the module images.
    ///
    /// # Panics
    ///
    /// Panics when called after the first allocation, or when more than
    /// [`MAX_REGIONS`] survive splitting.
    pub fn add_region(&mut self, start: PhysicalAddr, end: PhysicalAddr) {
        assert!(!self.sealed, "add_region after first allocation");

        let mut start = start.align_up(Page4Kb);
        let mut end = end.align_down(Page4Kb);

        // It's not a good idea to treat 0 as an allocated page.
        if start.is_null() {
            start = start + Page4Kb;
        }

        if start >= self.kernel_start && start < self.kernel_end {
            start = self.kernel_end;
        }
        if end > self.kernel_start && end <= self.kernel_end {
            end = self.kernel_start;
        }
        if self.kernel_start >= start && self.kernel_start < end {
            let (kernel_start, kernel_end) = (self.kernel_start, self.kernel_end);
            self.add_region(start, kernel_start);
            self.add_region(kernel_end, end);
            return;
        }

        if start >= self.module_start && start < self.module_end {
            start = self.module_end;
        }
        if end > self.module_start && end <= self.module_end {
            end = self.module_start;
        }
        if self.module_start >= start && self.module_start < end {
            let (module_start, module_end) = (self.module_start, self.module_end);
            self.add_region(start, module_start);
            self.add_region(module_end, end);
            return;
        }

        if start >= end {
            return;
        }

        assert!(self.num_regions < MAX_REGIONS, "too many memory regions");
        trace!("usable region {:?}..{:?}", start, end);

        self.regions[self.num_regions] = Region { start, end };
        if self.num_regions == 0 {
            self.cur_addr = start;
        }
        self.num_regions += 1;
    }

    /// # Errors
    ///
    /// Errors once every region is exhausted and the free list is empty.
    pub fn allocate(&mut self) -> Result<PhysicalFrame<Page4Kb>, FrameError> {
        self.sealed = true;

        if !self.free_pages.is_null() {
            let result = self.free_pages;
            // SAFETY: the page was handed to `free`, nothing else references it.
            self.free_pages = unsafe { *self.offset.ptr::<PhysicalAddr>(result).as_ptr() };
            return Ok(PhysicalFrame::containing(result));
        }

        if self.cur_region >= self.num_regions {
            return Err(FrameError::Exhausted);
        }

        let result = self.cur_addr;
        self.cur_addr = self.cur_addr + Page4Kb;

        if self.cur_addr == self.regions[self.cur_region].end {
            self.cur_region += 1;
            if self.cur_region < self.num_regions {
                self.cur_addr = self.regions[self.cur_region].start;
            }
        }

        Ok(PhysicalFrame::containing(result))
    }

    /// Push a page onto the free list. The origin of the page is not
    /// validated.
    pub fn free(&mut self, frame: PhysicalFrame<Page4Kb>) {
        // SAFETY: the caller passes ownership of the page back to us.
        unsafe {
            *self.offset.ptr::<PhysicalAddr>(frame.ptr()).as_ptr() = self.free_pages;
        }
        self.free_pages = frame.ptr();
    }

    #[must_use]
    pub fn phys_offset(&self) -> PhysOffset {
        self.offset
    }
}

impl FrameAllocator<Page4Kb> for RegionAllocator {
    fn alloc(&mut self) -> Result<PhysicalFrame<Page4Kb>, FrameError> {
        self.allocate()
    }

    fn dealloc(&mut self, frame: PhysicalFrame<Page4Kb>) {
        self.free(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;
    use std::collections::BTreeSet;
    use std::vec::Vec;

    #[test]
    fn frames_are_disjoint_and_nonzero() {
        let arena = Arena::new(32);
        let mut alloc = arena.allocator();

        let mut seen = BTreeSet::new();
        for _ in 0..32 {
            let frame = alloc.allocate().unwrap().ptr();
            assert!(!frame.is_null());
            assert!(frame.is_aligned(Page4Kb));
            assert!(seen.insert(frame.as_u64()), "frame returned twice");
        }
        assert_eq!(alloc.allocate(), Err(FrameError::Exhausted));
    }

    #[test]
    fn free_list_recycles_lifo() {
        let arena = Arena::new(8);
        let mut alloc = arena.allocator();

        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        alloc.free(a);
        alloc.free(b);

        assert_eq!(alloc.allocate().unwrap(), b);
        assert_eq!(alloc.allocate().unwrap(), a);
    }

    #[test]
    fn kernel_and_module_ranges_are_carved_out() {
        let arena = Arena::new(64);
        let (start, end) = arena.phys_range();
        let kernel = (start + 4 * Page4Kb, start + 8 * Page4Kb);
        let modules = (start + 16 * Page4Kb, start + 20 * Page4Kb);

        let mut alloc = RegionAllocator::new(
            arena.phys_offset(),
            kernel.0,
            kernel.1,
            modules.0,
            modules.1,
        );
        alloc.add_region(start, end);

        let mut frames = Vec::new();
        while let Ok(frame) = alloc.allocate() {
            frames.push(frame.ptr());
        }

        assert_eq!(frames.len(), 64 - 4 - 4);
        for frame in frames {
            assert!(frame < kernel.0 || frame >= kernel.1);
            assert!(frame < modules.0 || frame >= modules.1);
        }
    }

    #[test]
    fn zero_page_is_never_handed_out() {
        let arena = Arena::new(1);
        let mut alloc = RegionAllocator::new(
            arena.phys_offset(),
            PhysicalAddr::null(),
            PhysicalAddr::null(),
            PhysicalAddr::null(),
            PhysicalAddr::null(),
        );
        // A region starting at physical 0 must begin one page later; the
        // bump cursor never touches the page contents.
        alloc.add_region(PhysicalAddr::null(), PhysicalAddr::new(2 * Page4Kb));

        assert_eq!(alloc.allocate().unwrap().ptr().as_u64(), Page4Kb);
    }

    #[test]
    #[should_panic(expected = "add_region after first allocation")]
    fn regions_are_sealed_by_allocation() {
        let arena = Arena::new(4);
        let mut alloc = arena.allocator();
        let _ = alloc.allocate().unwrap();

        let (start, end) = arena.phys_range();
        alloc.add_region(start, end);
    }
}
