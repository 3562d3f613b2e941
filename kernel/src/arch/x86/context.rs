//! Context switch and user-mode transitions

use core::arch::{asm, global_asm};

use crate::signal::{SigInfo, SigSet};
use crate::task::sched::Switch;
use crate::task::{sched, TaskContext};

use super::gdt::{USER_CODE, USER_DATA};
use super::interrupts::TrapFrame;

global_asm!(
    r#"
    // switch_context(old: *mut TaskContext, new: *const TaskContext)
    // Saves esp/ebp and a resume eip into *old, then loads *new.
    .global switch_context
    switch_context:
        mov eax, [esp + 4]
        mov edx, [esp + 8]
        mov [eax + 0], esp
        mov [eax + 4], ebp
        mov dword ptr [eax + 8], offset 1f
        mov esp, [edx + 0]
        mov ebp, [edx + 4]
        jmp [edx + 8]
    1:
        ret
    "#
);

extern "C" {
    fn switch_context(old: *mut TaskContext, new: *const TaskContext);
}

/// Perform a scheduler-decided switch. The address space was already
/// loaded by the caller.
pub fn switch_tasks(switch: Switch) {
    let (old_ptr, new_ctx) = sched::with_scheduler(|s| {
        let new_ctx = s.task(switch.to).map(|t| t.context).unwrap_or_default();
        let old_ptr = s
            .task_mut(switch.from)
            .map(|t| &mut t.context as *mut TaskContext)
            .unwrap_or(core::ptr::null_mut());
        (old_ptr, new_ctx)
    });
    if old_ptr.is_null() {
        return;
    }
    unsafe {
        switch_context(old_ptr, &new_ctx);
    }
}

/// First entry to ring 3: build an iret frame and drop privilege.
pub fn enter_user(entry: u32, user_esp: u32) -> ! {
    unsafe {
        asm!(
            "mov ax, {udata:x}",
            "mov ds, ax",
            "mov es, ax",
            "push {udata}",
            "push {esp}",
            "pushfd",
            "or dword ptr [esp], 0x200", // interrupts on in user mode
            "push {ucode}",
            "push {eip}",
            "iretd",
            udata = in(reg) USER_DATA as u32,
            ucode = in(reg) USER_CODE as u32,
            esp = in(reg) user_esp,
            eip = in(reg) entry,
            options(noreturn),
        );
    }
}

/// Size of the signal frame pushed on the user stack: saved context,
/// mask, signal number, and the trampoline return slot.
const SIGFRAME_WORDS: usize = 8;

/// Arrange for the interrupted user context to resume inside a signal
/// handler. The frame holds everything `sigreturn` needs to restore
/// the original flow; the return address is the userland trampoline
/// that issues it.
pub fn push_signal_frame(
    frame: &mut TrapFrame,
    entry: u32,
    sig: i32,
    old_mask: SigSet,
    info: Option<SigInfo>,
) {
    let mut sp = frame.user_esp & !0xf;

    // Saved interrupted context.
    let saved = [
        frame.eip,
        frame.user_esp,
        frame.eax,
        frame.eflags,
        old_mask.0 as u32,
        (old_mask.0 >> 32) as u32,
        info.map(|i| i.code as u32).unwrap_or(0),
        sig as u32,
    ];
    sp -= (SIGFRAME_WORDS * 4) as u32;
    for (i, word) in saved.iter().enumerate() {
        let va = crate::mm::VirtAddr::new(sp + (i * 4) as u32);
        if crate::mm::uaccess::write_bytes(
            crate::mm::paging::current(),
            va,
            &word.to_le_bytes(),
        )
        .is_err()
        {
            // Unwritable stack: the default action for the signal is
            // forced instead.
            crate::process::raise_current(crate::signal::SIGSEGV);
            return;
        }
    }

    // Handler arguments: signum (and the frame address doubles as the
    // sigreturn cookie).
    frame.user_esp = sp;
    frame.eax = sig as u32;
    frame.ebx = sp;
    frame.eip = entry;
}

/// `sigreturn`: read the signal frame back off the user stack, restore
/// the interrupted context, and put the saved signal mask back.
pub fn restore_signal_frame(frame: &mut TrapFrame) {
    let sp = frame.ebx;
    let mut words = [0u32; SIGFRAME_WORDS];
    for (i, word) in words.iter_mut().enumerate() {
        let va = crate::mm::VirtAddr::new(sp + (i * 4) as u32);
        let mut bytes = [0u8; 4];
        if crate::mm::uaccess::read_bytes(crate::mm::paging::current(), va, &mut bytes)
            .is_err()
        {
            crate::process::raise_current(crate::signal::SIGSEGV);
            return;
        }
        *word = u32::from_le_bytes(bytes);
    }
    frame.eip = words[0];
    frame.user_esp = words[1];
    frame.eax = words[2];
    frame.eflags = words[3] | 0x200;
    let mask = SigSet(words[4] as u64 | ((words[5] as u64) << 32)).sanitized();
    let _ = crate::process::with_current(|p| p.signals.blocked = mask);
}
