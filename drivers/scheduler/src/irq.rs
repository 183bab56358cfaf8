//! Hardware-interrupt delivery to user-mode drivers.
//!
//! A driver claims an IRQ line with the `request_interrupt` system call;
//! from then on the line is unmasked and every interrupt turns into a
//! kernel notification on the driver thread, which must acknowledge the
//! controller itself before the line fires again.

use pic::IrqDevice;

use crate::{Scheduler, ThreadId};

pub const MAX_IRQS: usize = 16;

pub struct InterruptController<P> {
    device: P,
    registrations: [Option<ThreadId>; MAX_IRQS],
}

impl<P: IrqDevice> InterruptController<P> {
    #[must_use]
    pub fn new(device: P) -> Self {
        Self {
            device,
            registrations: [None; MAX_IRQS],
        }
    }

    /// Claim `irq` for `thread` and unmask the line.
    ///
    /// # Panics
    ///
    /// Panics if the line is already claimed.
    pub fn register(&mut self, irq: u8, thread: ThreadId) {
        let slot = &mut self.registrations[usize::from(irq)];
        assert!(slot.is_none(), "irq {} is already claimed", irq);
        *slot = Some(thread);

        self.device.set_masked(irq, false);
    }

    /// Drop every claim `thread` holds, masking the lines again.
    pub fn unregister_all(&mut self, thread: ThreadId) {
        for irq in 0..MAX_IRQS {
            if self.registrations[irq] == Some(thread) {
                self.registrations[irq] = None;
                self.device.set_masked(irq as u8, true);
            }
        }
    }

    /// Signal end-of-interrupt for `irq`.
    pub fn acknowledge(&mut self, irq: u8) {
        self.device.end_of_interrupt(irq);
    }

    /// Hardware entry point, called with the IRQ already translated from
    /// its vector. Claimed lines notify their driver, which acknowledges
    /// later by syscall; unclaimed lines are acknowledged right away.
    pub fn interrupt(&mut self, irq: u8, sched: &mut Scheduler) {
        debug!("IRQ {} received", irq);

        match self.registrations[usize::from(irq)] {
            Some(id) => {
                let thread = sched.find(id);
                sched.notify_from_kernel(thread);
            }
            None => {
                debug!("acknowledging: no handler installed");
                self.device.end_of_interrupt(irq);
            }
        }
    }

    #[must_use]
    pub fn device(&self) -> &P {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut P {
        &mut self.device
    }
}
