//! The numbered syscall surface behind vector 0x80.
//!
//! The number travels in `rax`, arguments in `rdi`, `rsi`, `rdx`. There is
//! no error channel: a bad number or argument is a kernel panic, and the
//! blocking calls simply do not return until their rendezvous completes.

use scheduler::ThreadId;

use crate::{irq, mem, task, trap::TrapFrame};

const SYS_NULL: u64 = 0;
const SYS_WRITE_BYTE: u64 = 1;
const SYS_RESCHEDULE: u64 = 2;
const SYS_EXIT_THREAD: u64 = 3;
const SYS_SEND: u64 = 4;
const SYS_RECEIVE: u64 = 5;
const SYS_NOTIFY: u64 = 6;
const SYS_REQUEST_INTERRUPT: u64 = 7;
const SYS_ACK_INTERRUPT: u64 = 8;

pub fn dispatch(frame: &mut TrapFrame) {
    match frame.rax {
        SYS_NULL => panic!("null system call"),
        SYS_WRITE_BYTE => qemu_logger::write_byte(frame.rdi as u8),
        SYS_RESCHEDULE => task::SCHEDULER.lock().reschedule(true),
        SYS_EXIT_THREAD => exit_thread(),
        SYS_SEND => task::SCHEDULER.lock().send(
            ThreadId::new(frame.rdi as i32),
            frame.rsi as i32,
            frame.rdx,
        ),
        SYS_RECEIVE => task::SCHEDULER.lock().receive(
            frame.rdi as *mut i32,
            frame.rsi as *mut i32,
            frame.rdx as *mut u64,
        ),
        SYS_NOTIFY => task::SCHEDULER.lock().notify(ThreadId::new(frame.rdi as i32)),
        SYS_REQUEST_INTERRUPT => request_interrupt(frame.rdi as u8),
        SYS_ACK_INTERRUPT => irq::INTERRUPTS.lock().acknowledge(frame.rdi as u8),
        number => panic!("unknown system call {}", number),
    }
}

fn request_interrupt(irq_line: u8) {
    let id = {
        let sched = task::SCHEDULER.lock();
        // SAFETY: the current thread is live for the whole syscall.
        unsafe { sched.current().as_ref().id() }
    };
    irq::INTERRUPTS.lock().register(irq_line, id);
}

/// Retire the running thread: drop its interrupt claims, its address-space
/// reference and finally its slab slot. By the time we get here the
/// scheduler already switched to the next thread and will not save the
/// retired state.
fn exit_thread() {
    let thread = task::SCHEDULER.lock().exit_current();

    // SAFETY: `exit_current` transferred ownership of the thread to us;
    // nothing else references it anymore.
    let (id, space) = unsafe {
        let t = thread.as_ptr();
        ((*t).id(), core::ptr::read((*t).space()))
    };

    info!("thread {} exited", id);
    irq::INTERRUPTS.lock().unregister_all(id);
    mem::release_address_space(space);

    let mut frames = mem::FRAME_ALLOCATOR.lock();
    mem::THREADS.lock().free(thread, &mut *frames);
}
