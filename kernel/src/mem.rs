//! Ownership roots for physical memory: the frame allocator and the slab
//! pools for kernel objects.

use kalloc::Slab;
use kcore::sync::Global;
use libx64::{
    address::VirtualAddr,
    paging::{frame::PhysOffset, Page4Kb},
};
use page_mapper::{AddressSpace, RegionAllocator, SpaceRef, KERNEL_VIRT_START};
use scheduler::{Scheduler, Thread};

pub static FRAME_ALLOCATOR: Global<RegionAllocator> = Global::new();
pub static SPACES: Global<Slab<AddressSpace>> = Global::new();
pub static THREADS: Global<Slab<Thread>> = Global::new();

/// The fixed high-half window: every byte of (the first 64 GiB of)
/// physical memory is visible at `phys + KERNEL_VIRT_START`.
#[must_use]
pub fn kernel_offset() -> PhysOffset {
    PhysOffset::new(KERNEL_VIRT_START.as_u64())
}

/// Install the populated frame allocator and the object pools behind it.
pub fn init(frames: RegionAllocator) {
    let offset = frames.phys_offset();
    FRAME_ALLOCATOR.emplace(frames);
    SPACES.emplace(Slab::new(offset));
    THREADS.emplace(Slab::new(offset));
}

/// Carve the per-CPU syscall stack out of a fresh frame and return the
/// reservation address at its top (space for the scheduler's `CpuState`).
#[must_use]
pub fn alloc_syscall_stack() -> VirtualAddr {
    let mut frames = FRAME_ALLOCATOR.lock();
    let frame = frames.allocate().expect("syscall stack frame");
    frames.phys_offset().virt(frame.ptr()) + Page4Kb - Scheduler::stack_reservation()
}

/// Allocate a fresh address space out of a slab pool and hand back its
/// first reference.
#[must_use]
pub fn create_space(
    kernel: bool,
    frames: &mut RegionAllocator,
    spaces: &mut Slab<AddressSpace>,
) -> SpaceRef {
    let space =
        AddressSpace::new(frames.phys_offset(), kernel, frames).expect("address space tables");

    let slot = spaces.allocate(frames).expect("address space slot");
    // SAFETY: a fresh slab slot; the space starts with one reference,
    // which we return.
    unsafe {
        slot.as_ptr().write(space);
        SpaceRef::from_raw(slot)
    }
}

/// Drop one reference to a space, tearing down its tables and slab slot
/// when it was the last.
pub fn release_address_space(space: SpaceRef) {
    if let Some(last) = space.release() {
        let mut frames = FRAME_ALLOCATOR.lock();
        // SAFETY: `release` returned the final reference.
        unsafe { SpaceRef::release_tables(last, &mut *frames) };
        SPACES.lock().free(last, &mut *frames);
    }
}
