use core::ptr::NonNull;

use kalloc::Slab;
use libx64::{address::VirtualAddr, paging::Page4Kb};
use page_mapper::{
    testing::Arena, AddressSpace, RegionAllocator, SpaceRef,
};
use pic::IrqDevice;
use std::vec::Vec;

use crate::irq::InterruptController;
use crate::{Scheduler, Status, Thread, ThreadId};

struct Fixture {
    arena: Arena,
    frames: RegionAllocator,
    threads: Slab<Thread>,
    spaces: Slab<AddressSpace>,
    sched: Scheduler,
}

fn fixture() -> Fixture {
    let arena = Arena::new(256);
    let mut frames = arena.allocator();

    let stack_frame = frames.allocate().unwrap();
    let reservation =
        arena.phys_offset().virt(stack_frame.ptr()) + Page4Kb - Scheduler::stack_reservation();

    Fixture {
        frames,
        threads: Slab::new(arena.phys_offset()),
        spaces: Slab::new(arena.phys_offset()),
        sched: Scheduler::new(reservation),
        arena,
    }
}

impl Fixture {
    fn spawn(&mut self, priority: usize) -> NonNull<Thread> {
        let space = AddressSpace::new(self.arena.phys_offset(), false, &mut self.frames).unwrap();
        let slot = self.spaces.allocate(&mut self.frames).unwrap();
        unsafe { slot.as_ptr().write(space) };
        // SAFETY: the fresh space starts with one reference, which we hand
        // to the thread.
        let space = unsafe { SpaceRef::from_raw(slot) };

        let thread = Thread::spawn(
            space,
            VirtualAddr::new(0x40_0000),
            priority,
            &[],
            &mut self.frames,
            &mut self.threads,
        )
        .unwrap();
        self.sched.start_thread(thread);
        thread
    }

    fn current_is(&self, thread: NonNull<Thread>) -> bool {
        self.sched.current() == thread
    }
}

fn id_of(thread: NonNull<Thread>) -> ThreadId {
    unsafe { thread.as_ref().id() }
}

fn status_of(thread: NonNull<Thread>) -> Status {
    unsafe { thread.as_ref().status() }
}

#[test]
fn equal_priorities_alternate() {
    let mut fx = fixture();
    let t1 = fx.spawn(0);
    let t2 = fx.spawn(0);
    let t3 = fx.spawn(2);

    fx.sched.reschedule(true);
    assert!(fx.current_is(t1));

    fx.sched.reschedule(true);
    assert!(fx.current_is(t2));

    fx.sched.reschedule(true);
    assert!(fx.current_is(t1));

    // The low-priority thread never ran.
    assert_eq!(status_of(t3), Status::Runnable);
}

#[test]
fn higher_priority_wins() {
    let mut fx = fixture();
    let low = fx.spawn(1);
    fx.sched.reschedule(true);
    assert!(fx.current_is(low));

    let high = fx.spawn(0);
    fx.sched.reschedule(true);
    assert!(fx.current_is(high));
}

#[test]
fn send_to_runnable_destination_blocks_sender() {
    let mut fx = fixture();
    let sender = fx.spawn(0);
    let receiver = fx.spawn(0);
    fx.sched.reschedule(true);
    assert!(fx.current_is(sender));

    fx.sched.send(id_of(receiver), 7, 42);
    assert_eq!(status_of(sender), Status::BlockedSending);
    assert!(fx.current_is(receiver));

    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 0u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);

    assert_eq!((from, ty, payload), (id_of(sender).as_i32(), 7, 42));
    assert_eq!(status_of(sender), Status::Runnable);
}

#[test]
fn send_completes_a_blocked_receive() {
    let mut fx = fixture();
    let receiver = fx.spawn(0);
    let sender = fx.spawn(0);
    fx.sched.reschedule(true);
    assert!(fx.current_is(receiver));

    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 0u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!(status_of(receiver), Status::BlockedReceiving);
    assert!(fx.current_is(sender));

    fx.sched.send(id_of(receiver), 3, 99);

    // Delivery switched to the receiver and filled its outputs exactly once.
    assert!(fx.current_is(receiver));
    assert_eq!((from, ty, payload), (id_of(sender).as_i32(), 3, 99));
    assert_eq!(status_of(sender), Status::Runnable);
}

#[test]
fn queued_senders_are_served_fifo() {
    let mut fx = fixture();
    let s1 = fx.spawn(0);
    let s2 = fx.spawn(0);
    let dest = fx.spawn(0);

    fx.sched.reschedule(true);
    assert!(fx.current_is(s1));
    fx.sched.send(id_of(dest), 1, 10);

    assert!(fx.current_is(s2));
    fx.sched.send(id_of(dest), 2, 20);

    assert!(fx.current_is(dest));
    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 0u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!((from, ty, payload), (id_of(s1).as_i32(), 1, 10));

    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!((from, ty, payload), (id_of(s2).as_i32(), 2, 20));
}

#[test]
fn notifications_coalesce() {
    let mut fx = fixture();
    let notifier = fx.spawn(0);
    let target = fx.spawn(0);
    fx.sched.reschedule(true);
    assert!(fx.current_is(notifier));

    for _ in 0..3 {
        fx.sched.notify(id_of(target));
    }

    fx.sched.reschedule(true);
    assert!(fx.current_is(target));

    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 1u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!((from, ty, payload), (0, 0, 0));

    // The bit was consumed: the next receive blocks.
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!(status_of(target), Status::BlockedReceiving);
}

#[test]
fn pending_notify_beats_queued_senders() {
    let mut fx = fixture();
    let sender = fx.spawn(0);
    let dest = fx.spawn(0);

    fx.sched.reschedule(true);
    assert!(fx.current_is(sender));
    fx.sched.notify(id_of(dest));
    fx.sched.send(id_of(dest), 5, 55);

    assert!(fx.current_is(dest));
    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 1u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!((from, ty, payload), (0, 0, 0));

    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!((from, ty, payload), (id_of(sender).as_i32(), 5, 55));
}

#[test]
fn exited_thread_leaves_the_scheduler() {
    let mut fx = fixture();
    let doomed = fx.spawn(0);
    let survivor = fx.spawn(0);

    fx.sched.reschedule(true);
    assert!(fx.current_is(doomed));

    let retired = fx.sched.exit_current();
    assert_eq!(retired, doomed);
    assert!(fx.current_is(survivor));

    // The retired state must not be written on trap exit.
    assert!(fx.sched.cpu_state().previous_thread.is_null());

    // Mimic the kernel's cleanup: the thread's space reference is released
    // and both slab slots flow back.
    let space = unsafe { core::ptr::read(&(*retired.as_ptr()).space) };
    let last = space.release().expect("only thread of its space");
    unsafe { SpaceRef::release_tables(last, &mut fx.frames) };
    fx.spaces.free(last, &mut fx.frames);
    fx.threads.free(retired, &mut fx.frames);
}

#[test]
#[should_panic(expected = "no thread with id")]
fn retired_ids_do_not_resolve() {
    let mut fx = fixture();
    let doomed = fx.spawn(0);
    let _survivor = fx.spawn(0);

    fx.sched.reschedule(true);
    let id = id_of(doomed);
    let _ = fx.sched.exit_current();

    let _ = fx.sched.find(id);
}

struct FakePic {
    masked: [bool; 16],
    eois: Vec<u8>,
}

impl FakePic {
    fn new() -> Self {
        Self {
            masked: [true; 16],
            eois: Vec::new(),
        }
    }
}

impl IrqDevice for FakePic {
    fn set_masked(&mut self, irq: u8, masked: bool) {
        self.masked[usize::from(irq)] = masked;
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        self.eois.push(irq);
    }
}

#[test]
fn claimed_irq_notifies_the_blocked_driver() {
    let mut fx = fixture();
    let driver = fx.spawn(0);
    let other = fx.spawn(1);
    let mut irqs = InterruptController::new(FakePic::new());

    fx.sched.reschedule(true);
    assert!(fx.current_is(driver));
    irqs.register(1, id_of(driver));
    assert!(!irqs.device().masked[1]);

    let (mut from, mut ty, mut payload) = (-1i32, -1i32, 1u64);
    fx.sched.receive(&mut from, &mut ty, &mut payload);
    assert_eq!(status_of(driver), Status::BlockedReceiving);
    assert!(fx.current_is(other));

    // The keyboard fires.
    irqs.interrupt(1, &mut fx.sched);

    assert!(fx.current_is(driver));
    assert_eq!((from, ty, payload), (0, 0, 0));
    // No EOI yet: the driver acknowledges by syscall once it serviced the
    // device.
    assert!(irqs.device().eois.is_empty());

    irqs.acknowledge(1);
    assert_eq!(irqs.device().eois, [1]);
}

#[test]
fn unclaimed_irqs_are_acknowledged_immediately() {
    let mut fx = fixture();
    let _task = fx.spawn(0);
    fx.sched.reschedule(true);

    let mut irqs = InterruptController::new(FakePic::new());
    irqs.interrupt(5, &mut fx.sched);
    assert_eq!(irqs.device().eois, [5]);
}

#[test]
fn unregister_masks_every_claimed_line() {
    let mut fx = fixture();
    let driver = fx.spawn(0);
    fx.sched.reschedule(true);

    let mut irqs = InterruptController::new(FakePic::new());
    irqs.register(1, id_of(driver));
    irqs.register(12, id_of(driver));
    assert!(!irqs.device().masked[1]);
    assert!(!irqs.device().masked[12]);

    irqs.unregister_all(id_of(driver));
    assert!(irqs.device().masked[1]);
    assert!(irqs.device().masked[12]);
}
