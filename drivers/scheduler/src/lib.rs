//! Fixed-priority cooperative scheduling and synchronous IPC.
//!
//! Exactly one thread is ever `Running`; the scheduler is reentered only
//! from trap context. Context switching itself is a two-pointer protocol
//! with the trap entry: [`run_thread`](Scheduler::run_thread) publishes the
//! outgoing state in `previous_thread` and the incoming one in
//! `current_thread`, and the trap exit path materializes the switch on
//! IRET.

#![no_std]

#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

pub mod irq;
mod ipc;
mod queue;
mod thread;

#[cfg(test)]
mod tests;

use core::ptr::NonNull;

use libx64::{
    address::{PhysicalAddr, VirtualAddr},
    paging::Page4Kb,
};

use crate::queue::ThreadQueue;

pub use crate::thread::{
    Status, Thread, ThreadId, ThreadState, NUM_PRIORITIES, STACK_BASE, STACK_PAGES,
};

/// The two words at the top of the syscall stack, shared with the trap
/// entry.
#[repr(C)]
pub struct CpuState {
    pub current_thread: *mut ThreadState,
    pub previous_thread: *mut ThreadState,
}

pub const ID_HASH_SIZE: usize = 16384;

// Single CPU: the scheduler lives behind one global lock and its thread
// pointers never cross an actual thread boundary.
unsafe impl Send for Scheduler {}

pub struct Scheduler {
    cpu: NonNull<CpuState>,

    running: Option<NonNull<Thread>>,
    runnable: [ThreadQueue; NUM_PRIORITIES],

    // Open-hash thread registry chained through `Thread::next_by_id`.
    id_hash: [Option<NonNull<Thread>>; ID_HASH_SIZE],
}

impl Scheduler {
    /// `reservation` is where the [`CpuState`] slot was reserved, at the
    /// very top of the syscall stack.
    ///
    /// # Panics
    ///
    /// Panics unless the reservation sits flush against a page end.
    #[must_use]
    pub fn new(reservation: VirtualAddr) -> Self {
        assert_eq!(
            (reservation.as_u64() + Self::stack_reservation()) % Page4Kb,
            0
        );

        let cpu: NonNull<CpuState> = match reservation.ptr() {
            Some(ptr) => ptr,
            None => panic!("null syscall stack reservation"),
        };
        // SAFETY: the caller reserved this slot for us.
        unsafe {
            cpu.as_ptr().write(CpuState {
                current_thread: core::ptr::null_mut(),
                previous_thread: core::ptr::null_mut(),
            });
        }

        const EMPTY: ThreadQueue = ThreadQueue::new();
        Self {
            cpu,
            running: None,
            runnable: [EMPTY; NUM_PRIORITIES],
            id_hash: [None; ID_HASH_SIZE],
        }
    }

    /// Space to reserve at the top of the syscall stack.
    #[must_use]
    pub const fn stack_reservation() -> u64 {
        core::mem::size_of::<CpuState>() as u64
    }

    #[must_use]
    pub fn cpu_state(&mut self) -> &mut CpuState {
        // SAFETY: the reservation outlives the scheduler.
        unsafe { self.cpu.as_mut() }
    }

    /// The running thread. Every syscall runs on behalf of one.
    #[must_use]
    pub fn current(&self) -> NonNull<Thread> {
        match self.running {
            Some(thread) => thread,
            None => panic!("no running thread"),
        }
    }

    /// Saved state of the running thread, for the initial dispatch.
    #[must_use]
    pub fn current_state_ptr(&self) -> *const ThreadState {
        unsafe { &(*self.current().as_ptr()).state }
    }

    /// Move a `Starting` thread into the run queues and the id registry.
    pub fn start_thread(&mut self, thread: NonNull<Thread>) {
        // SAFETY: thread pointers handed to the scheduler stay live until
        // `exit_current` returns them.
        unsafe {
            let t = thread.as_ptr();
            assert_eq!((*t).status, Status::Starting);
            (*t).status = Status::Runnable;
        }
        self.insert(thread);
        self.enqueue(thread);
    }

    /// Look up a thread by id.
    ///
    /// # Panics
    ///
    /// Panics if no such thread exists; there is nobody to report the error
    /// to.
    #[must_use]
    pub fn find(&self, id: ThreadId) -> NonNull<Thread> {
        let mut cursor = self.id_hash[Self::bucket(id)];
        while let Some(thread) = cursor {
            // SAFETY: registry members are live threads.
            unsafe {
                if (*thread.as_ptr()).id == id {
                    return thread;
                }
                cursor = (*thread.as_ptr()).next_by_id;
            }
        }
        panic!("no thread with id {}", id)
    }

    /// Switch to `thread` on the next trap exit. The outgoing thread is
    /// published as `previous_thread` and, when `requeue` holds, parked as
    /// `Runnable`; blocking callers pass `requeue = false` after recording
    /// their own state.
    pub fn run_thread(&mut self, thread: NonNull<Thread>, requeue: bool) {
        let cpu = self.cpu.as_ptr();

        if let Some(old) = self.running.take() {
            // SAFETY: scheduler-serialized access to live threads.
            unsafe {
                (*cpu).previous_thread = &mut (*old.as_ptr()).state;
                if requeue {
                    (*old.as_ptr()).status = Status::Runnable;
                    self.enqueue(old);
                }
            }
        } else {
            unsafe {
                (*cpu).previous_thread = core::ptr::null_mut();
            }
        }

        unsafe {
            (*thread.as_ptr()).status = Status::Running;
            (*cpu).current_thread = &mut (*thread.as_ptr()).state;
        }
        self.running = Some(thread);

        switch_address_space(unsafe { (*thread.as_ptr()).space.table_root() });
    }

    /// Dispatch the highest-priority runnable thread.
    ///
    /// # Panics
    ///
    /// Panics when nothing is runnable; the idle thread makes that a bug.
    pub fn reschedule(&mut self, requeue: bool) {
        let thread = match self.dequeue() {
            Some(thread) => thread,
            None => panic!("no runnable thread"),
        };
        self.run_thread(thread, requeue);
    }

    /// Retire the running thread and dispatch the next one. The caller owns
    /// the returned thread again: it is off every queue, out of the
    /// registry, and its state will not be saved on trap exit.
    pub fn exit_current(&mut self) -> NonNull<Thread> {
        let thread = self.current();
        self.reschedule(false);

        // SAFETY: as in `run_thread`.
        unsafe {
            // The outgoing state has no owner anymore; trap exit must not
            // write into a retired slot.
            (*self.cpu.as_ptr()).previous_thread = core::ptr::null_mut();
        }

        self.remove(thread);
        unsafe {
            assert!(!(*thread.as_ptr()).links.is_linked());
        }
        thread
    }

    /// Log the running thread, for exception reports.
    pub fn dump(&self) {
        match self.running {
            Some(thread) => unsafe {
                let t = thread.as_ptr();
                error!(
                    "running thread {} rip={:#x} rsp={:#x}",
                    (*t).id,
                    (*t).state.rip,
                    (*t).state.rsp
                );
            },
            None => error!("no running thread"),
        }
    }

    fn bucket(id: ThreadId) -> usize {
        id.as_i32() as usize % ID_HASH_SIZE
    }

    fn insert(&mut self, thread: NonNull<Thread>) {
        let bucket = unsafe { Self::bucket((*thread.as_ptr()).id) };
        unsafe {
            (*thread.as_ptr()).next_by_id = self.id_hash[bucket];
        }
        self.id_hash[bucket] = Some(thread);
    }

    fn remove(&mut self, thread: NonNull<Thread>) {
        let bucket = unsafe { Self::bucket((*thread.as_ptr()).id) };

        let mut cursor: *mut Option<NonNull<Thread>> = &mut self.id_hash[bucket];
        // SAFETY: cursor always points either into the hash table or into a
        // live thread's `next_by_id`.
        unsafe {
            loop {
                match *cursor {
                    Some(entry) if entry == thread => {
                        *cursor = (*thread.as_ptr()).next_by_id;
                        return;
                    }
                    Some(entry) => cursor = &mut (*entry.as_ptr()).next_by_id,
                    None => panic!("thread not found in registry"),
                }
            }
        }
    }

    fn enqueue(&mut self, thread: NonNull<Thread>) {
        let priority = unsafe { (*thread.as_ptr()).priority };
        self.runnable[priority].push_back(thread);
    }

    fn dequeue(&mut self) -> Option<NonNull<Thread>> {
        self.runnable.iter_mut().find_map(ThreadQueue::pop_front)
    }
}

fn switch_address_space(root: PhysicalAddr) {
    #[cfg(target_os = "none")]
    // SAFETY: every address space maps the kernel window, so the kernel
    // keeps running across the switch.
    unsafe {
        libx64::control::set_cr3(root);
    }

    #[cfg(not(target_os = "none"))]
    let _ = root;
}
