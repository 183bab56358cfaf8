use kcore::sync::Global;
use libx64::{
    address::VirtualAddr,
    descriptors::{
        CodeSegmentDescriptor, DataSegmentDescriptor, GdtNull, SystemSegmentDescriptor,
    },
    gdt::{lgdt, GlobalDescriptorTable},
    segments::{self, ltr, set_cs, set_ds, set_es, set_ss, SegmentSelector},
    tss::TaskStateSegment,
};

static TSS: Global<TaskStateSegment> = Global::new();
static GDT: Global<(GlobalDescriptorTable, SegmentSelector)> = Global::new();

/// Assemble the descriptor table and switch the CPU onto it. The TSS
/// carries the syscall stack in both the privilege-0 slot and interrupt
/// stack 1.
pub fn load(syscall_stack_top: VirtualAddr) {
    let mut tss = TaskStateSegment::zero();
    tss.rsp[0] = syscall_stack_top;
    tss.ist[0] = syscall_stack_top;
    TSS.emplace(tss);

    let tss_descriptor = {
        let tss = TSS.lock();
        // SAFETY: the TSS global is emplaced once and never moves.
        SystemSegmentDescriptor::tss(unsafe { &*core::ptr::addr_of!(*tss) })
    };

    let mut gdt = GlobalDescriptorTable::new();
    gdt.add_entry(GdtNull);
    let kernel_code = gdt.add_entry(CodeSegmentDescriptor::kernel_x64());
    let kernel_stack = gdt.add_entry(DataSegmentDescriptor::kernel());
    let user_code = gdt.add_entry(CodeSegmentDescriptor::user_x64());
    let user_stack = gdt.add_entry(DataSegmentDescriptor::user());
    let task_state = gdt.add_entry(tss_descriptor);

    // The selector constants the rest of the kernel hands out must agree
    // with the order entries were pushed in.
    debug_assert_eq!(kernel_code.index(), segments::KERNEL_CODE_INDEX);
    debug_assert_eq!(kernel_stack.index(), segments::KERNEL_STACK_INDEX);
    debug_assert_eq!(user_code.index(), segments::USER_CODE_INDEX);
    debug_assert_eq!(user_stack.index(), segments::USER_STACK_INDEX);
    debug_assert_eq!(task_state.index(), segments::TSS_INDEX);

    GDT.emplace((gdt, task_state));

    let gdt = GDT.lock();
    lgdt(&gdt.0.lgdt_ptr());

    set_cs(segments::kernel_code());
    set_ss(segments::kernel_stack());
    set_ds(SegmentSelector::zero());
    set_es(SegmentSelector::zero());
    ltr(gdt.1);
}
