use core::ptr::NonNull;

use crate::thread::Thread;

/// Embedded list membership. A thread is on at most one queue at a time:
/// either a run queue or one destination's send queue.
pub(crate) struct QueueLinks {
    next: Option<NonNull<Thread>>,
    prev: Option<NonNull<Thread>>,
    linked: bool,
}

impl QueueLinks {
    pub(crate) const fn new() -> Self {
        Self {
            next: None,
            prev: None,
            linked: false,
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.linked
    }
}

/// FIFO of threads, linked through their embedded [`QueueLinks`]; no
/// storage of its own and no ownership of the members.
pub(crate) struct ThreadQueue {
    head: Option<NonNull<Thread>>,
    tail: Option<NonNull<Thread>>,
}

impl ThreadQueue {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    pub(crate) fn push_back(&mut self, thread: NonNull<Thread>) {
        // SAFETY: queue members are live slab-allocated threads; the
        // scheduler serializes all access.
        unsafe {
            let links = &mut (*thread.as_ptr()).links;
            assert!(!links.linked, "thread is already on a queue");
            links.linked = true;
            links.next = None;
            links.prev = self.tail;

            match self.tail {
                Some(tail) => (*tail.as_ptr()).links.next = Some(thread),
                None => self.head = Some(thread),
            }
            self.tail = Some(thread);
        }
    }

    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Thread>> {
        let thread = self.head?;
        // SAFETY: as in `push_back`.
        unsafe {
            let links = &mut (*thread.as_ptr()).links;
            self.head = links.next;
            match self.head {
                Some(next) => (*next.as_ptr()).links.prev = None,
                None => self.tail = None,
            }
            links.next = None;
            links.prev = None;
            links.linked = false;
        }
        Some(thread)
    }
}
