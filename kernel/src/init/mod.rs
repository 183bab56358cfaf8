mod gdt;
mod interrupts;

use libx64::address::VirtualAddr;

/// Build and load the protection tables. `syscall_stack_top` becomes both
/// the ring-0 stack and interrupt stack 1, so every trap lands on the
/// shared syscall stack.
pub fn kinit(syscall_stack_top: VirtualAddr) {
    gdt::load(syscall_stack_top);
    trace!("GDT initialized");

    interrupts::load();
    trace!("IDT initialized");

    info!("protection setup done");
}
