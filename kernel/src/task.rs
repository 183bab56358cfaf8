//! The scheduler singleton and the idle thread.

use kcore::sync::Global;
use libx64::address::VirtualAddr;
use scheduler::{Scheduler, Thread, NUM_PRIORITIES};

use crate::{loader::BootCtx, mem};

pub static SCHEDULER: Global<Scheduler> = Global::new();

extern "C" fn idle_task() -> ! {
    loop {
        libx64::hlt();
    }
}

/// The thread of last resort: lowest priority, ring 0, does nothing but
/// keep `reschedule` total.
pub fn spawn_idle(ctx: &mut BootCtx) {
    let space = mem::create_space(true, ctx.frames, ctx.spaces);

    let thread = Thread::spawn(
        space,
        VirtualAddr::new(idle_task as usize as u64),
        NUM_PRIORITIES - 1,
        &[],
        ctx.frames,
        ctx.threads,
    )
    .expect("idle thread");

    ctx.sched.start_thread(thread);
    info!("idle thread ready");
}
