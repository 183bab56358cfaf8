use kcore::sync::Global;
use libx64::{
    idt::{lidt, InterruptDescriptorTable},
    segments, Privilege,
};

use crate::trap;

static IDT: Global<InterruptDescriptorTable> = Global::new();

/// Point every serviced vector at its trap stub: CPU exceptions, the
/// remapped hardware-interrupt range, and the syscall gate (reachable from
/// ring 3). Everything runs on interrupt stack 1.
pub fn load() {
    let mut idt = InterruptDescriptorTable::new();

    for vector in 0..48 {
        install(&mut idt, vector, Privilege::Ring0);
    }
    install(&mut idt, trap::SYSCALL_VECTOR as usize, Privilege::Ring3);

    IDT.emplace(idt);
    lidt(&IDT.lock().lidt_ptr());
}

fn install(idt: &mut InterruptDescriptorTable, vector: usize, dpl: Privilege) {
    let entry = &mut idt[vector];
    entry.set_handler(trap::stub(vector), segments::kernel_code());
    entry.options_mut().set_dpl(dpl);
    entry.options_mut().set_interrupt_stack(1);
}
