//! # Programmable Interrupt Controller
//!
//! Source: <http://www.brokenthorn.com/Resources/OSDevPic.html>
//!
//! ## 8259A Software Port Map
//!
//! Port Address | Description
//! -------------|----------------------------------------------------------------
//! 0x20         | Primary PIC Command and Status Register
//! 0x21         | Primary PIC Interrupt Mask Register and Data Register
//! 0xA0         | Secondary (Slave) PIC Command and Status Register
//! 0xA1         | Secondary (Slave) PIC Interrupt Mask Register and Data Register

#![no_std]

use libx64::port::{RWPort, WPort};

pub const IRQS_PER_CONTROLLER: u8 = 8;

const ICW1_INIT: u8 = 0x10;
const ICW1_ICW4: u8 = 0x01;
const ICW4_8086: u8 = 0x01;

const EOI: u8 = 0x20;

const READ_IRR: u8 = 0x0a;
const READ_ISR: u8 = 0x0b;

/// Seam between the interrupt-dispatch layer and the controller hardware,
/// so dispatch logic can run against a recording fake on the host.
pub trait IrqDevice {
    fn set_masked(&mut self, irq: u8, masked: bool);
    fn end_of_interrupt(&mut self, irq: u8);
}

struct Pic {
    command: RWPort,
    data: RWPort,
    offset: u8,
}

impl Pic {
    const unsafe fn new(command: u16, data: u16, offset: u8) -> Self {
        Self {
            command: RWPort::new(command),
            data: RWPort::new(data),
            offset,
        }
    }

    fn handles_vector(&self, vector: u8) -> bool {
        self.offset <= vector && vector < self.offset + IRQS_PER_CONTROLLER
    }

    fn read_mask(&self) -> u8 {
        unsafe { self.data.read() }
    }

    fn write_mask(&mut self, mask: u8) {
        unsafe { self.data.write(mask) }
    }
}

/// The cascaded pair: the slave controller feeds the master's IRQ 2 line.
pub struct Chained {
    master: Pic,
    slave: Pic,
    wait_port: WPort,
}

impl Chained {
    /// # Safety
    ///
    /// The caller must ensure both vector offsets land inside the IDT range
    /// reserved for hardware interrupts.
    #[must_use]
    pub const unsafe fn new(master_offset: u8, slave_offset: u8) -> Self {
        Self {
            master: Pic::new(0x20, 0x21, master_offset),
            slave: Pic::new(0xa0, 0xa1, slave_offset),
            wait_port: WPort::new(0x80),
        }
    }

    /// Run the remap sequence. Returns the mask pair found on entry; on
    /// exit everything is masked except the cascade line.
    pub fn init(&mut self) -> (u8, u8) {
        let saved = (self.master.read_mask(), self.slave.read_mask());

        self.write_command(ICW1_INIT | ICW1_ICW4);

        // ICW2: vector offsets.
        self.write_data(self.master.offset, self.slave.offset);
        // ICW3: the slave hangs off master IRQ 2 and knows its identity.
        self.write_data(1 << 2, 2);
        self.write_data(ICW4_8086, ICW4_8086);

        self.master.write_mask(!(1 << 2));
        self.slave.write_mask(!0);

        saved
    }

    fn write_command(&mut self, value: u8) {
        unsafe {
            self.master.command.write(value);
            self.io_wait();
            self.slave.command.write(value);
            self.io_wait();
        }
    }

    fn write_data(&mut self, master: u8, slave: u8) {
        unsafe {
            self.master.data.write(master);
            self.io_wait();
            self.slave.data.write(slave);
            self.io_wait();
        }
    }

    // The 8259 needs a moment between initialization words; a write to the
    // POST port burns the required cycles.
    unsafe fn io_wait(&mut self) {
        self.wait_port.write(0);
    }

    /// Map a CPU vector back to an IRQ line, if either controller owns it.
    #[must_use]
    pub fn translate(&self, vector: u8) -> Option<u8> {
        if self.master.handles_vector(vector) {
            Some(vector - self.master.offset)
        } else if self.slave.handles_vector(vector) {
            Some(vector - self.slave.offset + IRQS_PER_CONTROLLER)
        } else {
            None
        }
    }

    /// Combined value of the cascaded interrupt request registers.
    pub fn raised(&mut self) -> u16 {
        self.read_register(READ_IRR)
    }

    /// Combined value of the cascaded in-service registers.
    pub fn servicing(&mut self) -> u16 {
        self.read_register(READ_ISR)
    }

    fn read_register(&mut self, ocw3: u8) -> u16 {
        unsafe {
            self.master.command.write(ocw3);
            self.slave.command.write(ocw3);
            (u16::from(self.slave.command.read()) << 8) | u16::from(self.master.command.read())
        }
    }
}

impl IrqDevice for Chained {
    fn set_masked(&mut self, irq: u8, masked: bool) {
        let (pic, line) = if irq < IRQS_PER_CONTROLLER {
            (&mut self.master, irq)
        } else {
            (&mut self.slave, irq - IRQS_PER_CONTROLLER)
        };

        let mask = pic.read_mask();
        let mask = if masked {
            mask | (1 << line)
        } else {
            mask & !(1 << line)
        };
        pic.write_mask(mask);
    }

    fn end_of_interrupt(&mut self, irq: u8) {
        // Slave first, then always the master (the cascade line needs its
        // own acknowledgement).
        unsafe {
            if irq >= IRQS_PER_CONTROLLER {
                self.slave.command.write(EOI);
            }
            self.master.command.write(EOI);
        }
    }
}
