//! Trap entry and exit.
//!
//! Every installed vector funnels into one assembly stub that pushes the
//! missing error code, the vector number and the registers the kernel does
//! not preserve, then calls [`trap_dispatch`] with the on-stack frame. On
//! the way out the dispatcher settles the context-switch protocol: if a
//! handler changed the scheduler's `current_thread`/`previous_thread`
//! pair, the interrupted register file is saved into the previous thread
//! and the frame is reloaded from the current one, so the final `iretq`
//! lands in whichever thread the scheduler picked.

use core::arch::global_asm;

use libx64::address::VirtualAddr;
use scheduler::ThreadState;

use crate::{irq, syscall, task};

pub const SYSCALL_VECTOR: u64 = 0x80;

/// The register file as laid down by the trap stub: reverse push order,
/// ending with the hardware interrupt frame.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,

    pub vector: u64,
    pub error_code: u64,

    // Pushed by the CPU on delivery.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl TrapFrame {
    fn thread_state(&self) -> ThreadState {
        ThreadState {
            rip: self.rip,
            cs: self.cs,
            rflags: self.rflags,
            rsp: self.rsp,
            ss: self.ss,
            rax: self.rax,
            rcx: self.rcx,
            rdx: self.rdx,
            rsi: self.rsi,
            rdi: self.rdi,
            r8: self.r8,
            r9: self.r9,
            r10: self.r10,
            r11: self.r11,
        }
    }

    fn load_thread_state(&mut self, state: &ThreadState) {
        self.rip = state.rip;
        self.cs = state.cs;
        self.rflags = state.rflags;
        self.rsp = state.rsp;
        self.ss = state.ss;
        self.rax = state.rax;
        self.rcx = state.rcx;
        self.rdx = state.rdx;
        self.rsi = state.rsi;
        self.rdi = state.rdi;
        self.r8 = state.r8;
        self.r9 = state.r9;
        self.r10 = state.r10;
        self.r11 = state.r11;
    }
}

// `scheduler_start` indexes the saved state by offset.
const _: () = {
    assert!(core::mem::offset_of!(ThreadState, rip) == 0);
    assert!(core::mem::offset_of!(ThreadState, ss) == 32);
    assert!(core::mem::offset_of!(ThreadState, rax) == 40);
    assert!(core::mem::offset_of!(ThreadState, rdi) == 72);
    assert!(core::mem::offset_of!(ThreadState, r11) == 104);
};

global_asm!(
    r#"
.macro stub_noerr n
vector_stub_\n:
    push 0
    push \n
    jmp trap_common
.endm

.macro stub_err n
vector_stub_\n:
    push \n
    jmp trap_common
.endm

.section .text

// CPU exceptions. 8, 10-14 and 17 come with an error code already pushed.
stub_noerr 0
stub_noerr 1
stub_noerr 2
stub_noerr 3
stub_noerr 4
stub_noerr 5
stub_noerr 6
stub_noerr 7
stub_err   8
stub_noerr 9
stub_err   10
stub_err   11
stub_err   12
stub_err   13
stub_err   14
stub_noerr 15
stub_noerr 16
stub_err   17
stub_noerr 18
stub_noerr 19
stub_noerr 20
stub_noerr 21
stub_noerr 22
stub_noerr 23
stub_noerr 24
stub_noerr 25
stub_noerr 26
stub_noerr 27
stub_noerr 28
stub_noerr 29
stub_noerr 30
stub_noerr 31

// Hardware interrupt vectors behind the remapped controllers.
stub_noerr 32
stub_noerr 33
stub_noerr 34
stub_noerr 35
stub_noerr 36
stub_noerr 37
stub_noerr 38
stub_noerr 39
stub_noerr 40
stub_noerr 41
stub_noerr 42
stub_noerr 43
stub_noerr 44
stub_noerr 45
stub_noerr 46
stub_noerr 47

// The syscall gate.
stub_noerr 128

trap_common:
    push rax
    push rcx
    push rdx
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11

    cld
    mov rdi, rsp
    call trap_dispatch

    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rdx
    pop rcx
    pop rax

    // Drop vector and error code.
    add rsp, 16
    iretq

// scheduler_start(state: *const ThreadState) -> !
//
// Builds an interrupt frame from the saved state and irets into it; used
// exactly once, to leave boot context for the first thread.
.global scheduler_start
scheduler_start:
    push qword ptr [rdi + 32]
    push qword ptr [rdi + 24]
    push qword ptr [rdi + 16]
    push qword ptr [rdi + 8]
    push qword ptr [rdi + 0]
    mov rax, [rdi + 40]
    mov rcx, [rdi + 48]
    mov rdx, [rdi + 56]
    mov rsi, [rdi + 64]
    mov r8,  [rdi + 80]
    mov r9,  [rdi + 88]
    mov r10, [rdi + 96]
    mov r11, [rdi + 104]
    mov rdi, [rdi + 72]
    iretq

.section .rodata
.balign 8
.global trap_vectors
trap_vectors:
    .quad vector_stub_0
    .quad vector_stub_1
    .quad vector_stub_2
    .quad vector_stub_3
    .quad vector_stub_4
    .quad vector_stub_5
    .quad vector_stub_6
    .quad vector_stub_7
    .quad vector_stub_8
    .quad vector_stub_9
    .quad vector_stub_10
    .quad vector_stub_11
    .quad vector_stub_12
    .quad vector_stub_13
    .quad vector_stub_14
    .quad vector_stub_15
    .quad vector_stub_16
    .quad vector_stub_17
    .quad vector_stub_18
    .quad vector_stub_19
    .quad vector_stub_20
    .quad vector_stub_21
    .quad vector_stub_22
    .quad vector_stub_23
    .quad vector_stub_24
    .quad vector_stub_25
    .quad vector_stub_26
    .quad vector_stub_27
    .quad vector_stub_28
    .quad vector_stub_29
    .quad vector_stub_30
    .quad vector_stub_31
    .quad vector_stub_32
    .quad vector_stub_33
    .quad vector_stub_34
    .quad vector_stub_35
    .quad vector_stub_36
    .quad vector_stub_37
    .quad vector_stub_38
    .quad vector_stub_39
    .quad vector_stub_40
    .quad vector_stub_41
    .quad vector_stub_42
    .quad vector_stub_43
    .quad vector_stub_44
    .quad vector_stub_45
    .quad vector_stub_46
    .quad vector_stub_47
    .quad vector_stub_128
.section .text
"#
);

pub const VECTOR_COUNT: usize = 49;

extern "C" {
    #[allow(improper_ctypes)]
    fn scheduler_start(state: *const ThreadState) -> !;

    #[allow(non_upper_case_globals)]
    static trap_vectors: [usize; VECTOR_COUNT];
}

/// Entry address of the stub serving `vector`.
///
/// # Panics
///
/// Panics for vectors without an installed stub.
#[must_use]
pub fn stub(vector: usize) -> VirtualAddr {
    let index = match vector {
        0..=47 => vector,
        0x80 => VECTOR_COUNT - 1,
        _ => panic!("no trap stub for vector {}", vector),
    };
    // SAFETY: the table is immutable after assembly.
    VirtualAddr::new(unsafe { trap_vectors[index] } as u64)
}

/// Dispatch the first thread and leave boot context for good.
pub fn enter_user_mode() -> ! {
    let state = {
        let mut sched = task::SCHEDULER.lock();
        sched.reschedule(true);
        sched.current_state_ptr()
    };

    info!("dispatching the first thread");
    // SAFETY: the state was fully initialized by `Thread::spawn` and the
    // scheduler lock is released.
    unsafe { scheduler_start(state) }
}

#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    if frame.vector != SYSCALL_VECTOR && !(32..48).contains(&frame.vector) {
        exception(frame);
    }

    let entering_state = task::SCHEDULER.lock().cpu_state().current_thread;

    if frame.vector == SYSCALL_VECTOR {
        syscall::dispatch(frame);
    } else {
        irq::hardware_interrupt(frame.vector as u8);
    }

    // Settle the two-pointer switch protocol before returning to the stub.
    let mut sched = task::SCHEDULER.lock();
    let cpu = sched.cpu_state();
    if !cpu.previous_thread.is_null() {
        // SAFETY: the scheduler published a live (or just-retired but
        // never freed within this trap) thread state.
        unsafe {
            *cpu.previous_thread = frame.thread_state();
        }
        cpu.previous_thread = core::ptr::null_mut();
    }
    if cpu.current_thread != entering_state {
        // SAFETY: `current_thread` always points at the running thread's
        // saved state.
        unsafe {
            frame.load_thread_state(&*cpu.current_thread);
        }
    }
}

fn exception(frame: &TrapFrame) -> ! {
    match frame.vector {
        13 => error!("#GP error={:#x} rip={:#x}", frame.error_code, frame.rip),
        14 => {
            let code = libx64::paging::PageFaultErrorCode::from_bits_truncate(frame.error_code);
            error!(
                "#PF at {:?} ({:?}) rip={:#x}",
                libx64::control::cr2(),
                code,
                frame.rip
            );
        }
        vector => error!(
            "exception {} error={:#x} rip={:#x}",
            vector, frame.error_code, frame.rip
        ),
    }

    task::SCHEDULER.lock().dump();
    libx64::diverging_hlt()
}
