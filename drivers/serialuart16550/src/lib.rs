#![no_std]

use bitflags::bitflags;

use libx64::port::{RPort, RWPort, WPort};

pub const COM1: u16 = 0x3f8;

bitflags! {
    /// Line status flags
    struct LineStsFlags: u8 {
        const INPUT_FULL = 1;
        // 1 to 4 unknown
        const OUTPUT_EMPTY = 1 << 5;
        // 6 and 7 unknown
    }
}

macro_rules! wait_for {
    ($cond:expr) => {
        #[allow(clippy::semicolon_if_nothing_returned)]
        while (!$cond) {
            core::hint::spin_loop()
        }
    };
}

#[derive(Debug)]
pub struct SerialPort {
    data: RWPort,
    int_en: WPort,
    fifo_ctrl: WPort,
    line_ctrl: WPort,
    modem_ctrl: WPort,
    line_sts: RPort,
}

impl SerialPort {
    /// Creates a new serial port interface on the given I/O port.
    ///
    /// # Safety
    /// This function is unsafe because the caller must ensure that the given base address
    /// really points to a serial port device.
    #[must_use]
    pub const unsafe fn new(base: u16) -> Self {
        Self {
            data: RWPort::new(base),
            int_en: WPort::new(base + 1),
            fifo_ctrl: WPort::new(base + 2),
            line_ctrl: WPort::new(base + 3),
            modem_ctrl: WPort::new(base + 4),
            line_sts: RPort::new(base + 5),
        }
    }

    /// Initializes the serial port to 115200 baud (divisor 1),
    /// [8-N-1](https://en.wikipedia.org/wiki/8-N-1).
    pub fn init(&mut self) {
        unsafe {
            // Disable interrupts
            self.int_en.write(0x00);

            // Enable DLAB and program the divisor (DLL/DLM)
            self.line_ctrl.write(0x80);
            self.data.write(0x01);
            self.int_en.write(0x00);

            // Disable DLAB and set data word length to 8 bits
            self.line_ctrl.write(0x03);

            // Enable FIFO, clear TX/RX queues and
            // set interrupt watermark at 14 bytes
            self.fifo_ctrl.write(0xC7);

            // Mark data terminal ready, signal request to send
            self.modem_ctrl.write(0x03);
        }
    }

    fn line_sts(&mut self) -> LineStsFlags {
        unsafe { LineStsFlags::from_bits_truncate(self.line_sts.read()) }
    }

    /// Sends a byte on the serial port, waiting for the transmit FIFO to
    /// drain first.
    pub fn send_raw(&mut self, data: u8) {
        unsafe {
            wait_for!(self.line_sts().contains(LineStsFlags::OUTPUT_EMPTY));
            self.data.write(data);
        }
    }

    /// Receives a byte on the serial port.
    pub fn receive(&mut self) -> u8 {
        unsafe {
            wait_for!(self.line_sts().contains(LineStsFlags::INPUT_FULL));
            self.data.read()
        }
    }
}

impl core::fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            self.send_raw(byte);
        }
        Ok(())
    }
}
