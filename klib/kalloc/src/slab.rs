use core::marker::PhantomData;
use core::ptr::NonNull;

use libx64::{
    address::VirtualAddr,
    paging::{
        frame::{FrameAllocator, FrameError, PhysOffset, PhysicalFrame},
        Page4Kb,
    },
};

/// A free slot, threaded on the allocator-wide list through the slot's own
/// storage.
struct FreeSlot {
    next: Option<NonNull<FreeSlot>>,
    prev: Option<NonNull<FreeSlot>>,
}

/// Trails every backing frame; slots fill the space in front of it.
#[repr(C)]
struct Footer {
    num_allocated: usize,
}

const FOOTER_OFFSET: usize = Page4Kb as usize - core::mem::size_of::<Footer>();

/// Fixed-size object allocator. Whole frames are carved into slots of
/// `size_of::<T>()` (at least one free-list link); free slots across all
/// frames share one doubly-linked list, so allocation is a pop and freeing
/// the last object of a frame can unlink its slots and return the frame.
///
/// Slots are raw storage: the caller writes and drops `T` itself. Not
/// thread-safe; kernel execution is scheduler-serialized.
pub struct Slab<T> {
    free: Option<NonNull<FreeSlot>>,
    offset: PhysOffset,
    _m: PhantomData<T>,
}

// The free list is plain memory reached through the physical window; the
// pointers carry no thread affinity.
unsafe impl<T: Send> Send for Slab<T> {}

impl<T> Slab<T> {
    const SLOT_SIZE: usize = {
        let raw = if core::mem::size_of::<T>() < core::mem::size_of::<FreeSlot>() {
            core::mem::size_of::<FreeSlot>()
        } else {
            core::mem::size_of::<T>()
        };
        let align = if core::mem::align_of::<T>() < core::mem::align_of::<FreeSlot>() {
            core::mem::align_of::<FreeSlot>()
        } else {
            core::mem::align_of::<T>()
        };
        (raw + align - 1) & !(align - 1)
    };

    pub const SLOTS_PER_FRAME: usize = FOOTER_OFFSET / Self::SLOT_SIZE;

    #[must_use]
    pub const fn new(offset: PhysOffset) -> Self {
        Self {
            free: None,
            offset,
            _m: PhantomData,
        }
    }

    /// Pop a slot, growing by one frame when the list is empty.
    ///
    /// # Errors
    ///
    /// Errors if a fresh frame is needed and the allocator is out.
    pub fn allocate<A>(&mut self, frames: &mut A) -> Result<NonNull<T>, FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        if self.free.is_none() {
            self.add_frame(frames.alloc()?);
        }

        let slot = match self.free {
            Some(slot) => slot,
            None => unreachable!(),
        };
        self.unlink(slot);

        // SAFETY: the slot belongs to a live backing frame.
        unsafe {
            (*self.footer_of(slot.cast())).num_allocated += 1;
        }
        Ok(slot.cast())
    }

    /// Return a slot. When this empties its frame, every free slot of the
    /// frame is unlinked and the frame goes back to `frames`.
    pub fn free<A>(&mut self, ptr: NonNull<T>, frames: &mut A)
    where
        A: FrameAllocator<Page4Kb>,
    {
        let slot: NonNull<FreeSlot> = ptr.cast();
        self.push(slot);

        let footer = self.footer_of(ptr.cast());
        // SAFETY: ptr came out of `allocate`, so its frame is live.
        unsafe {
            (*footer).num_allocated -= 1;
            if (*footer).num_allocated == 0 {
                self.release_frame(frame_base(slot.cast()), frames);
            }
        }
    }

    fn add_frame(&mut self, frame: PhysicalFrame<Page4Kb>) {
        let base = self.offset.virt(frame.ptr());

        let footer: *mut Footer = (base + FOOTER_OFFSET as u64)
            .ptr::<Footer>()
            .expect("slab frame footer")
            .as_ptr();
        // SAFETY: fresh frame, we own all of it.
        unsafe {
            (*footer).num_allocated = 0;
        }

        for i in 0..Self::SLOTS_PER_FRAME {
            let slot = (base + (i * Self::SLOT_SIZE) as u64)
                .ptr::<FreeSlot>()
                .expect("slab slot");
            self.push(slot);
        }
    }

    fn release_frame<A>(&mut self, base: VirtualAddr, frames: &mut A)
    where
        A: FrameAllocator<Page4Kb>,
    {
        for i in 0..Self::SLOTS_PER_FRAME {
            let slot = (base + (i * Self::SLOT_SIZE) as u64)
                .ptr::<FreeSlot>()
                .expect("slab slot");
            self.unlink(slot);
        }
        frames.dealloc(PhysicalFrame::containing(self.offset.phys(base)));
    }

    fn footer_of(&self, slot: NonNull<u8>) -> *mut Footer {
        (frame_base(slot) + FOOTER_OFFSET as u64)
            .ptr::<Footer>()
            .expect("slab frame footer")
            .as_ptr()
    }

    fn push(&mut self, mut slot: NonNull<FreeSlot>) {
        // SAFETY: the slot storage is free and exclusively ours.
        unsafe {
            *slot.as_mut() = FreeSlot {
                next: self.free,
                prev: None,
            };
            if let Some(mut head) = self.free {
                head.as_mut().prev = Some(slot);
            }
        }
        self.free = Some(slot);
    }

    fn unlink(&mut self, slot: NonNull<FreeSlot>) {
        // SAFETY: slots on the list are valid free storage.
        unsafe {
            let FreeSlot { next, prev } = *slot.as_ptr();
            match prev {
                Some(mut prev) => prev.as_mut().next = next,
                None => self.free = next,
            }
            if let Some(mut next) = next {
                next.as_mut().prev = prev;
            }
        }
    }
}

fn frame_base(slot: NonNull<u8>) -> VirtualAddr {
    VirtualAddr::new(slot.as_ptr() as u64).align_down(Page4Kb)
}
