//! Trap entry and dispatch
//!
//! Assembly stubs push a uniform frame and funnel into
//! [`handle_trap`]: CPU exceptions 0-31, remapped PIC IRQs 0x20-0x2f,
//! the `int 0x80` syscall gate, and the `int 0x81` task-teardown gate
//! used by the userland runtime. Kernel-mode faults panic with the
//! register dump; user-mode faults turn into signals. Every return to
//! user mode passes the pending-signal delivery point.

use core::arch::global_asm;

use super::pic;
use crate::signal::{SIGFPE, SIGILL, SIGSEGV};
use crate::task::sched;

/// Registers as pushed by the common stub (pusha order plus
/// segment/vector/error and the CPU iret frame).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    /// Present only on ring transitions.
    pub user_esp: u32,
    pub user_ss: u32,
}

const VEC_SYSCALL: u8 = 0x80;
const VEC_TEARDOWN: u8 = 0x81;

global_asm!(
    r#"
    .macro TRAP_NOERR vec
    .global trap_stub_\vec
    trap_stub_\vec:
        push 0
        push \vec
        jmp trap_common
    .endm

    .macro TRAP_ERR vec
    .global trap_stub_\vec
    trap_stub_\vec:
        push \vec
        jmp trap_common
    .endm

    TRAP_NOERR 0
    TRAP_NOERR 1
    TRAP_NOERR 2
    TRAP_NOERR 3
    TRAP_NOERR 4
    TRAP_NOERR 5
    TRAP_NOERR 6
    TRAP_NOERR 7
    TRAP_ERR   8
    TRAP_NOERR 9
    TRAP_ERR   10
    TRAP_ERR   11
    TRAP_ERR   12
    TRAP_ERR   13
    TRAP_ERR   14
    TRAP_NOERR 15
    TRAP_NOERR 16
    TRAP_ERR   17
    TRAP_NOERR 18
    TRAP_NOERR 19
    TRAP_NOERR 32
    TRAP_NOERR 33
    TRAP_NOERR 34
    TRAP_NOERR 35
    TRAP_NOERR 36
    TRAP_NOERR 37
    TRAP_NOERR 38
    TRAP_NOERR 39
    TRAP_NOERR 40
    TRAP_NOERR 41
    TRAP_NOERR 42
    TRAP_NOERR 43
    TRAP_NOERR 44
    TRAP_NOERR 45
    TRAP_NOERR 46
    TRAP_NOERR 47
    TRAP_NOERR 128
    TRAP_NOERR 129

    trap_common:
        pusha
        mov ax, 0x10
        mov ds, ax
        mov es, ax
        push esp
        call handle_trap
        add esp, 4
        popa
        add esp, 8
        iretd
    "#
);

extern "C" {
    fn trap_stub_0();
    fn trap_stub_1();
    fn trap_stub_2();
    fn trap_stub_3();
    fn trap_stub_4();
    fn trap_stub_5();
    fn trap_stub_6();
    fn trap_stub_7();
    fn trap_stub_8();
    fn trap_stub_9();
    fn trap_stub_10();
    fn trap_stub_11();
    fn trap_stub_12();
    fn trap_stub_13();
    fn trap_stub_14();
    fn trap_stub_15();
    fn trap_stub_16();
    fn trap_stub_17();
    fn trap_stub_18();
    fn trap_stub_19();
    fn trap_stub_32();
    fn trap_stub_33();
    fn trap_stub_34();
    fn trap_stub_35();
    fn trap_stub_36();
    fn trap_stub_37();
    fn trap_stub_38();
    fn trap_stub_39();
    fn trap_stub_40();
    fn trap_stub_41();
    fn trap_stub_42();
    fn trap_stub_43();
    fn trap_stub_44();
    fn trap_stub_45();
    fn trap_stub_46();
    fn trap_stub_47();
    fn trap_stub_128();
    fn trap_stub_129();
}

/// Wire every stub into the IDT.
pub fn install() {
    let stubs: [(u8, unsafe extern "C" fn(), u8); 38] = [
        (0, trap_stub_0, 0),
        (1, trap_stub_1, 0),
        (2, trap_stub_2, 0),
        (3, trap_stub_3, 3),
        (4, trap_stub_4, 3),
        (5, trap_stub_5, 0),
        (6, trap_stub_6, 0),
        (7, trap_stub_7, 0),
        (8, trap_stub_8, 0),
        (9, trap_stub_9, 0),
        (10, trap_stub_10, 0),
        (11, trap_stub_11, 0),
        (12, trap_stub_12, 0),
        (13, trap_stub_13, 0),
        (14, trap_stub_14, 0),
        (15, trap_stub_15, 0),
        (16, trap_stub_16, 0),
        (17, trap_stub_17, 0),
        (18, trap_stub_18, 0),
        (19, trap_stub_19, 0),
        (32, trap_stub_32, 0),
        (33, trap_stub_33, 0),
        (34, trap_stub_34, 0),
        (35, trap_stub_35, 0),
        (36, trap_stub_36, 0),
        (37, trap_stub_37, 0),
        (38, trap_stub_38, 0),
        (39, trap_stub_39, 0),
        (40, trap_stub_40, 0),
        (41, trap_stub_41, 0),
        (42, trap_stub_42, 0),
        (43, trap_stub_43, 0),
        (44, trap_stub_44, 0),
        (45, trap_stub_45, 0),
        (46, trap_stub_46, 0),
        (47, trap_stub_47, 0),
        (VEC_SYSCALL, trap_stub_128, 3),
        (VEC_TEARDOWN, trap_stub_129, 3),
    ];
    for (vector, stub, dpl) in stubs {
        super::idt::set_gate(vector, stub as usize as u32, dpl);
    }
}

fn from_user(frame: &TrapFrame) -> bool {
    frame.cs & 3 != 0
}

fn read_cr2() -> u32 {
    let value: u32;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack));
    }
    value
}

/// Central trap handler, called from the assembly stub.
#[no_mangle]
pub extern "C" fn handle_trap(frame: &mut TrapFrame) {
    match frame.vector as u8 {
        0..=31 => handle_exception(frame),
        32 => {
            crate::time::on_tick(from_user(frame));
            pic::eoi(0);
            preempt(frame);
        }
        33..=47 => {
            // Device IRQs belong to the driver collaborators; keyboard
            // and friends hook in here.
            pic::eoi(frame.vector as u8 - pic::IRQ_BASE);
        }
        VEC_SYSCALL => {
            let nr = frame.eax;
            if nr == crate::syscall::SYS_SIGRETURN {
                super::context::restore_signal_frame(frame);
                return;
            }
            let args = [frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi, frame.ebp];
            frame.eax = crate::syscall::dispatch(nr, args) as u32;
            if nr == crate::syscall::SYS_EXECVE && frame.eax == 0 {
                // The new image enters at its own entry with a fresh
                // stack; rewrite the return frame from the task state.
                let ctx = sched::with_scheduler(|s| {
                    s.task(s.current_pid()).map(|t| t.context)
                });
                if let Some(ctx) = ctx {
                    frame.eip = ctx.eip;
                    frame.user_esp = ctx.esp;
                }
            }
        }
        VEC_TEARDOWN => {
            // Userland runtime finalizers: close descriptors early.
            let _ = crate::process::with_current(|p| {
                for slot in p.files.iter_mut() {
                    *slot = None;
                }
            });
        }
        _ => {}
    }

    if from_user(frame) {
        deliver_signals(frame);
    }
}

fn handle_exception(frame: &mut TrapFrame) {
    if !from_user(frame) {
        panic!(
            "cpu exception {} err={:#x} at {:#x} (eax={:#x} ebx={:#x} ecx={:#x} edx={:#x} \
             esi={:#x} edi={:#x} ebp={:#x} cr2={:#x})",
            frame.vector,
            frame.error,
            frame.eip,
            frame.eax,
            frame.ebx,
            frame.ecx,
            frame.edx,
            frame.esi,
            frame.edi,
            frame.ebp,
            read_cr2(),
        );
    }
    let sig = match frame.vector as u8 {
        0 | 16 | 19 => SIGFPE,
        6 => SIGILL,
        13 | 14 => SIGSEGV,
        _ => SIGSEGV,
    };
    crate::process::raise_current(sig);
}

/// Timer-driven preemption: pick the next task and switch.
fn preempt(_frame: &mut TrapFrame) {
    if let Some(switch) = sched::with_scheduler(|s| s.schedule()) {
        crate::task::perform_switch(switch);
    }
}

/// The return-to-user delivery point.
fn deliver_signals(frame: &mut TrapFrame) {
    use crate::signal::deliver::Disposition;

    let pid = sched::current_pid();
    match crate::process::deliver_signals(pid) {
        Disposition::Handler {
            entry,
            sig,
            old_mask,
            info,
            ..
        } => {
            super::context::push_signal_frame(frame, entry, sig, old_mask, info);
        }
        Disposition::Terminate { .. } => {
            crate::process::notify_parent(pid);
            if let Some(switch) = sched::with_scheduler(|s| s.schedule()) {
                crate::task::perform_switch(switch);
            }
        }
        _ => {}
    }
}
