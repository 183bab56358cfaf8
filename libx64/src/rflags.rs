bitflags::bitflags! {
    pub struct RFlags: u64 {
        const CARRY = 1 << 0;
        const PARITY = 1 << 2;
        const AUX_CARRY = 1 << 4;
        const ZERO = 1 << 6;
        const SIGN = 1 << 7;
        const TRAP = 1 << 8;
        /// Maskable hardware interrupts are delivered.
        const INTERRUPT_ENABLE = 1 << 9;
        const DIRECTION = 1 << 10;
        const OVERFLOW = 1 << 11;
        /// Both IOPL bits set: CPL 3 code may execute in/out/cli/sti.
        const IOPL_RING3 = 3 << 12;
    }
}
