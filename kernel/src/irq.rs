//! Glue between the 8259 pair and the scheduler-level interrupt
//! controller.

use kcore::sync::Global;
use pic::Chained;
use scheduler::irq::InterruptController;

use crate::task;

pub const PIC_MASTER_VECTOR: u8 = 32;
pub const PIC_SLAVE_VECTOR: u8 = 40;

pub static INTERRUPTS: Global<InterruptController<Chained>> = Global::new();

/// Remap the controllers behind the exception range and start with every
/// line masked; drivers unmask their lines by registering.
pub fn init() {
    // SAFETY: both offsets land inside the IDT's hardware-interrupt range.
    let mut pics = unsafe { Chained::new(PIC_MASTER_VECTOR, PIC_SLAVE_VECTOR) };
    let (master_mask, slave_mask) = pics.init();
    info!("interrupt masks = {:#x}/{:#x}", master_mask, slave_mask);

    INTERRUPTS.emplace(InterruptController::new(pics));
    info!("PIC initialized");
}

/// CPU entry for a vector in the hardware-interrupt range.
pub fn hardware_interrupt(vector: u8) {
    let mut irqs = INTERRUPTS.lock();
    let Some(irq) = irqs.device().translate(vector) else {
        return;
    };

    let mut sched = task::SCHEDULER.lock();
    irqs.interrupt(irq, &mut sched);
}
