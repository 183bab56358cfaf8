use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, Ordering};

use kalloc::Slab;
use libx64::{
    address::{PhysicalAddr, VirtualAddr},
    paging::{
        frame::{FrameAllocator, FrameError},
        Page4Kb,
    },
    rflags::RFlags,
    segments,
};
use page_mapper::{PageAttributes, SpaceRef};

use crate::queue::{QueueLinks, ThreadQueue};

pub const NUM_PRIORITIES: usize = 3;

/// Top of every task's initial stack.
pub const STACK_BASE: VirtualAddr = VirtualAddr::new(0x7fff_ffff_f000);
pub const STACK_PAGES: u64 = 4;

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct ThreadId(i32);

impl ThreadId {
    #[must_use]
    pub fn new(id: i32) -> Self {
        assert!(id >= 0, "thread ids are non-negative");
        Self(id)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl core::fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Module ids assigned on the command line stay below the dynamic range.
static NEXT_ID: AtomicI32 = AtomicI32::new(32);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Status {
    Starting,
    Runnable,
    Running,
    BlockedReceiving,
    BlockedSending,
}

/// The register set the trap entry saves and restores: the IRET frame plus
/// the registers the kernel does not preserve across a trap.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ThreadState {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,

    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
}

impl ThreadState {
    #[must_use]
    pub const fn zero() -> Self {
        Self {
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
            rax: 0,
            rcx: 0,
            rdx: 0,
            rsi: 0,
            rdi: 0,
            r8: 0,
            r9: 0,
            r10: 0,
            r11: 0,
        }
    }
}

/// Message captured while its sender is parked on a destination's send
/// queue.
#[derive(Clone, Copy)]
pub(crate) struct SendSlot {
    pub sender: i32,
    pub ty: i32,
    pub payload: u64,
}

/// Where a blocked receiver wants its next message. The pointers are
/// user-space addresses and only resolve in the receiver's address space.
#[derive(Clone, Copy)]
pub(crate) struct RecvSlot {
    pub sender: *mut i32,
    pub ty: *mut i32,
    pub payload: *mut u64,
}

impl RecvSlot {
    pub(crate) const fn null() -> Self {
        Self {
            sender: core::ptr::null_mut(),
            ty: core::ptr::null_mut(),
            payload: core::ptr::null_mut(),
        }
    }

    /// # Safety
    ///
    /// The registered pointers must be writable in the current address
    /// space.
    pub(crate) unsafe fn write(self, sender: i32, ty: i32, payload: u64) {
        *self.sender = sender;
        *self.ty = ty;
        *self.payload = payload;
    }
}

// Threads are reached through the scheduler singleton; on this single-CPU
// kernel all access is serialized behind its lock.
unsafe impl Send for Thread {}

pub struct Thread {
    pub(crate) links: QueueLinks,

    pub(crate) id: ThreadId,
    pub(crate) state: ThreadState,
    pub(crate) space: SpaceRef,
    pub(crate) priority: usize,
    pub(crate) status: Status,
    pub(crate) send_queue: ThreadQueue,

    // The next link for the thread id registry.
    pub(crate) next_by_id: Option<NonNull<Thread>>,

    // IPC rendezvous state.
    pub(crate) send_slot: SendSlot,
    pub(crate) recv_slot: RecvSlot,
    pub(crate) notify_pending: bool,
}

impl Thread {
    /// Build a thread in `space`: map [`STACK_PAGES`] writable, NX stack
    /// frames ending at [`STACK_BASE`], a not-present guard page below
    /// them, and copy `init_stack` under the stack top. The thread starts
    /// life as [`Status::Starting`] with interrupts enabled and the
    /// selectors matching the space's privilege.
    ///
    /// # Errors
    ///
    /// Errors if stack frames or the slab slot cannot be allocated.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range priority or an `init_stack` of a page or
    /// more.
    pub fn spawn<A>(
        space: SpaceRef,
        entry: VirtualAddr,
        priority: usize,
        init_stack: &[u8],
        frames: &mut A,
        threads: &mut Slab<Thread>,
    ) -> Result<NonNull<Thread>, FrameError>
    where
        A: FrameAllocator<Page4Kb>,
    {
        assert!(priority < NUM_PRIORITIES);
        assert!((init_stack.len() as u64) < Page4Kb);

        let stack_attrs = PageAttributes::new().set_no_execute(true);
        let mut top_frame = PhysicalAddr::null();
        for i in 0..STACK_PAGES {
            let frame = frames.alloc()?;
            let virt = STACK_BASE - (i + 1) * Page4Kb;
            space.map(
                frame.ptr(),
                frame.ptr() + Page4Kb,
                virt,
                virt + Page4Kb,
                stack_attrs,
                frames,
            )?;
            if i == 0 {
                top_frame = frame.ptr();
            }
        }

        let mut rsp = STACK_BASE;
        if !init_stack.is_empty() {
            rsp = rsp - init_stack.len() as u64;

            let dst = space
                .phys_offset()
                .ptr::<u8>(top_frame + (Page4Kb - init_stack.len() as u64));
            // SAFETY: the top stack frame was allocated and mapped above.
            unsafe {
                core::ptr::copy_nonoverlapping(init_stack.as_ptr(), dst.as_ptr(), init_stack.len());
            }
        }

        let guard = STACK_BASE - (STACK_PAGES + 1) * Page4Kb;
        space.map(
            PhysicalAddr::null(),
            PhysicalAddr::null(),
            guard,
            guard + Page4Kb,
            PageAttributes::new().set_present(false),
            frames,
        )?;

        let (cs, ss) = if space.is_kernel() {
            (segments::kernel_code(), segments::kernel_stack())
        } else {
            (segments::user_code(), segments::user_stack())
        };

        let mut state = ThreadState::zero();
        state.rip = entry.as_u64();
        state.cs = u64::from(cs.bits());
        state.rflags = RFlags::INTERRUPT_ENABLE.bits();
        state.rsp = rsp.as_u64();
        state.ss = u64::from(ss.bits());

        let slot = threads.allocate(frames)?;
        // SAFETY: a fresh slab slot is raw storage for exactly one Thread.
        unsafe {
            slot.as_ptr().write(Thread {
                links: QueueLinks::new(),
                id: ThreadId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                state,
                space,
                priority,
                status: Status::Starting,
                send_queue: ThreadQueue::new(),
                next_by_id: None,
                send_slot: SendSlot {
                    sender: 0,
                    ty: 0,
                    payload: 0,
                },
                recv_slot: RecvSlot::null(),
                notify_pending: false,
            });
        }
        Ok(slot)
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Assign a fixed id, before the thread is started.
    pub fn set_id(&mut self, id: ThreadId) {
        assert_eq!(self.status, Status::Starting);
        self.id = id;
    }

    #[must_use]
    pub fn priority(&self) -> usize {
        self.priority
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    #[must_use]
    pub fn state(&self) -> &ThreadState {
        &self.state
    }

    #[must_use]
    pub fn space(&self) -> &SpaceRef {
        &self.space
    }

    /// Let the task program I/O ports directly: IOPL 3.
    pub fn allow_io(&mut self) {
        self.state.rflags |= RFlags::IOPL_RING3.bits();
    }
}
