use core::ptr::NonNull;

use libx64::{
    address::{PhysicalAddr, VirtualAddr},
    paging::{
        frame::{FrameAllocator, FrameError, PhysOffset},
        Page1Gb, Page4Kb,
    },
};

use crate::tables::{PageAttributes, PageTables, Translation};

/// Base of the high-half window mapping physical memory.
pub const KERNEL_VIRT_START: VirtualAddr = VirtualAddr::new(0xffff_8000_0000_0000);

/// How much physical memory every address space maps into the high half.
pub const KERNEL_WINDOW_SIZE: u64 = 64 * Page1Gb;

/// One task's translation hierarchy. A fresh space maps the kernel window
/// and nothing else; the ELF loader and the stack builder add the rest.
///
/// Spaces are shared by the threads running in them and carry an explicit
/// reference count, manipulated through [`SpaceRef`].
pub struct AddressSpace {
    tables: PageTables,
    kernel: bool,
    refcount: i64,
}

impl AddressSpace {
    /// # Errors
    ///
    /// Errors if the window tables cannot be allocated.
    pub fn new<A>(offset: PhysOffset, kernel: bool, allocator: &mut A) -> Result<Self, FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        let mut tables = PageTables::new(offset, allocator)?;
        tables.map(
            PhysicalAddr::null(),
            PhysicalAddr::new(KERNEL_WINDOW_SIZE),
            KERNEL_VIRT_START,
            KERNEL_VIRT_START + KERNEL_WINDOW_SIZE,
            PageAttributes::default(),
            allocator,
        )?;
        Ok(Self {
            tables,
            kernel,
            refcount: 1,
        })
    }

    #[must_use]
    pub fn table_root(&self) -> PhysicalAddr {
        self.tables.table_root()
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    #[must_use]
    pub fn phys_offset(&self) -> PhysOffset {
        self.tables.phys_offset()
    }
}

/// Counted handle to a slab-allocated [`AddressSpace`].
///
/// Cloning and releasing are explicit: the kernel has no destructor context
/// that could reach the frame allocator, so the caller that observes the
/// count hit zero tears the space down and returns the slab slot.
pub struct SpaceRef {
    ptr: NonNull<AddressSpace>,
}

impl SpaceRef {
    /// # Safety
    ///
    /// `ptr` must point at a live `AddressSpace` whose reference count
    /// already accounts for this handle.
    #[must_use]
    pub unsafe fn from_raw(ptr: NonNull<AddressSpace>) -> Self {
        Self { ptr }
    }

    #[must_use]
    pub fn clone_ref(&self) -> SpaceRef {
        // SAFETY: the handle keeps the space alive; the kernel is
        // scheduler-serialized so the count is never raced.
        unsafe {
            (*self.ptr.as_ptr()).refcount += 1;
        }
        Self { ptr: self.ptr }
    }

    /// Drop this handle. Returns the slab pointer once the last handle is
    /// gone; the caller must release the table frames and the slot.
    #[must_use]
    pub fn release(self) -> Option<NonNull<AddressSpace>> {
        // SAFETY: as in `clone_ref`.
        unsafe {
            let space = self.ptr.as_ptr();
            (*space).refcount -= 1;
            assert!((*space).refcount >= 0);
            ((*space).refcount == 0).then_some(self.ptr)
        }
    }

    #[must_use]
    pub fn table_root(&self) -> PhysicalAddr {
        unsafe { (*self.ptr.as_ptr()).table_root() }
    }

    #[must_use]
    pub fn is_kernel(&self) -> bool {
        unsafe { (*self.ptr.as_ptr()).is_kernel() }
    }

    #[must_use]
    pub fn phys_offset(&self) -> PhysOffset {
        unsafe { (*self.ptr.as_ptr()).phys_offset() }
    }

    /// Map a physical range into this space, as [`PageTables::map`].
    ///
    /// # Errors
    ///
    /// Errors if an intermediate table cannot be allocated.
    pub fn map<A>(
        &self,
        phys_start: PhysicalAddr,
        phys_end: PhysicalAddr,
        virt_start: VirtualAddr,
        virt_end: VirtualAddr,
        attrs: PageAttributes,
        allocator: &mut A,
    ) -> Result<(), FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        // SAFETY: exclusive access is provided by scheduler serialization.
        unsafe {
            (*self.ptr.as_ptr())
                .tables
                .map(phys_start, phys_end, virt_start, virt_end, attrs, allocator)
        }
    }

    #[must_use]
    pub fn translate(&self, virt: VirtualAddr) -> Option<Translation> {
        unsafe { (*self.ptr.as_ptr()).tables.translate(virt) }
    }

    /// Free the table frames of a space whose last handle was just released.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`SpaceRef::release`] returning `Some`, and the
    /// slab slot must still be live.
    pub unsafe fn release_tables<A>(ptr: NonNull<AddressSpace>, allocator: &mut A)
    where
        A: FrameAllocator<Page4Kb>,
    {
        (*ptr.as_ptr()).tables.release(allocator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;
    use std::boxed::Box;

    #[test]
    fn fresh_space_maps_the_kernel_window() {
        let arena = Arena::new(64);
        let mut alloc = arena.allocator();
        let space = AddressSpace::new(arena.phys_offset(), false, &mut alloc).unwrap();

        let translated = space
            .tables
            .translate(KERNEL_VIRT_START + 3 * Page1Gb + 0x1234)
            .unwrap();
        assert_eq!(translated.addr.as_u64(), 3 * Page1Gb + 0x1234);
        assert_eq!(translated.leaf_size, Page1Gb);

        // Nothing below the window.
        assert!(space.tables.translate(VirtualAddr::new(0x40_0000)).is_none());
    }

    #[test]
    fn refcount_releases_exactly_once() {
        let arena = Arena::new(64);
        let mut alloc = arena.allocator();
        let space = AddressSpace::new(arena.phys_offset(), false, &mut alloc).unwrap();
        let slot = Box::leak(Box::new(space));
        let first = unsafe { SpaceRef::from_raw(NonNull::from(slot)) };

        let second = first.clone_ref();
        assert!(first.release().is_none());

        let last = second.release().expect("last handle frees the space");
        unsafe { SpaceRef::release_tables(last, &mut alloc) };

        // Both table frames (root + window PDPT) are back on the free list.
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        assert_ne!(a, b);
    }
}
