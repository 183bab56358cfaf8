//! The rendezvous: send, receive, notify.
//!
//! A message is `(sender_id, type, payload)` and moves at most once per
//! send. Senders park FIFO on the destination's send queue; a pending
//! notification is a single bit and beats queued senders on the next
//! receive.

use core::ptr::NonNull;

use crate::thread::{RecvSlot, SendSlot, Status, Thread, ThreadId};
use crate::Scheduler;

impl Scheduler {
    /// Send on behalf of the running thread. If `dest` is blocked
    /// receiving, it becomes the running thread and the message lands
    /// immediately; otherwise the caller parks on `dest`'s send queue.
    ///
    /// # Panics
    ///
    /// Panics if `dest` does not exist.
    pub fn send(&mut self, dest: ThreadId, ty: i32, payload: u64) {
        let src = self.current();
        let dest = self.find(dest);

        // SAFETY: `src` and `dest` are live threads; the kernel is
        // scheduler-serialized.
        unsafe {
            if (*dest.as_ptr()).status == Status::BlockedReceiving {
                self.run_thread(dest, true);

                // This must happen *after* run_thread so the destination's
                // registered pointers resolve in its own address space.
                let slot = (*dest.as_ptr()).recv_slot;
                slot.write((*src.as_ptr()).id.as_i32(), ty, payload);
            } else {
                let s = src.as_ptr();
                (*s).send_slot = SendSlot {
                    sender: (*s).id.as_i32(),
                    ty,
                    payload,
                };
                (*dest.as_ptr()).send_queue.push_back(src);
                (*s).status = Status::BlockedSending;
                self.reschedule(false);
            }
        }
    }

    /// Receive into the given pointers on behalf of the running thread.
    /// Order of service: the pending-notify bit, then queued senders, then
    /// block.
    pub fn receive(&mut self, sender_out: *mut i32, ty_out: *mut i32, payload_out: *mut u64) {
        let cur = self.current();
        let outputs = RecvSlot {
            sender: sender_out,
            ty: ty_out,
            payload: payload_out,
        };

        // SAFETY: as in `send`; the output pointers belong to the running
        // thread and resolve in the current address space.
        unsafe {
            let t = cur.as_ptr();

            if (*t).notify_pending {
                (*t).notify_pending = false;
                outputs.write(0, 0, 0);
                return;
            }

            match (*t).send_queue.pop_front() {
                Some(sender) => {
                    assert_eq!((*sender.as_ptr()).status, Status::BlockedSending);
                    (*sender.as_ptr()).status = Status::Runnable;

                    let slot = (*sender.as_ptr()).send_slot;
                    outputs.write(slot.sender, slot.ty, slot.payload);

                    self.enqueue(sender);
                }
                None => {
                    (*t).recv_slot = outputs;
                    (*t).status = Status::BlockedReceiving;
                    self.reschedule(false);
                }
            }
        }
    }

    /// Like send, but the message is `(0, 0, 0)` and never queues: a
    /// destination that is not receiving just gets its pending bit set, no
    /// matter how often.
    ///
    /// # Panics
    ///
    /// Panics if `dest` does not exist.
    pub fn notify(&mut self, dest: ThreadId) {
        let dest = self.find(dest);
        self.notify_thread(dest);
    }

    /// In-kernel notification path, used by interrupt delivery.
    pub fn notify_from_kernel(&mut self, thread: NonNull<Thread>) {
        self.notify_thread(thread);
    }

    fn notify_thread(&mut self, dest: NonNull<Thread>) {
        // SAFETY: as in `send`.
        unsafe {
            if (*dest.as_ptr()).status == Status::BlockedReceiving {
                self.run_thread(dest, true);

                // After run_thread, for the same reason as in `send`.
                let slot = (*dest.as_ptr()).recv_slot;
                slot.write(0, 0, 0);
            } else {
                (*dest.as_ptr()).notify_pending = true;
            }
        }
    }
}
