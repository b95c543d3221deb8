//! x86_64 context switching
//!
//! Voluntary switches only: callee-saved registers plus rsp/rip. The
//! trampoline receives the entry function in r12 and its argument in r13,
//! both planted by `init_context`.

use crate::ctx::MachineContext;
use core::arch::naked_asm;

/// Prepare `ctx` so that the first switch into it calls
/// `entry_fn(entry_arg)` on the stack ending at `stack_top`.
///
/// # Safety
///
/// `ctx` must point to writable `MachineContext` memory and `stack_top`
/// must be the high end of a mapped stack region.
pub unsafe fn init_context(
    ctx: *mut MachineContext,
    stack_top: *mut u8,
    entry_fn: usize,
    entry_arg: usize,
) {
    let ctx = &mut *ctx;
    *ctx = MachineContext::zeroed();

    // System V AMD64: rsp is 16-byte aligned before the trampoline's
    // `call`, so the entry function observes a standard frame.
    ctx.rsp = (stack_top as u64) & !0xF;
    ctx.rip = fiber_entry_trampoline as usize as u64;
    ctx.r12 = entry_fn as u64;
    ctx.r13 = entry_arg as u64;
}

/// First code a fresh fiber executes: call the planted entry function
/// with its planted argument.
///
/// The entry function must never return here (it terminates by switching
/// away), so falling through is a hard fault.
#[unsafe(naked)]
unsafe extern "C" fn fiber_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        "ud2",
    );
}

/// Save the current callee-saved state into `save` and resume `load`.
///
/// Returns (to the caller) when some later switch resumes `save`.
///
/// # Safety
///
/// `save` must be writable; `load` must hold a context produced by
/// `init_context` or a previous save. The stack `load` points into must
/// still be mapped and hold the frames that were live when it was saved.
#[unsafe(naked)]
pub unsafe extern "C" fn context_switch(
    _save: *mut MachineContext,
    _load: *const MachineContext,
) {
    naked_asm!(
        // Store callee-saved state into save (rdi). The resume address
        // is the local label below, which immediately returns to the
        // original caller through the saved rsp.
        "mov [rdi + 0x00], rbx",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], r12",
        "mov [rdi + 0x18], r13",
        "mov [rdi + 0x20], r14",
        "mov [rdi + 0x28], r15",
        "mov [rdi + 0x30], rsp",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        // Load the target context (rsi) and jump to its resume address.
        "mov rbx, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov r12, [rsi + 0x10]",
        "mov r13, [rsi + 0x18]",
        "mov r14, [rsi + 0x20]",
        "mov r15, [rsi + 0x28]",
        "mov rsp, [rsi + 0x30]",
        "mov rax, [rsi + 0x38]",
        "jmp rax",
        "2:",
        "ret",
    );
}

/// Resume `load` without saving the current state.
///
/// Used by the shared-stack trampoline: the switch-stack context is
/// re-initialized on every use, so there is nothing worth saving.
///
/// # Safety
///
/// Same requirements on `load` as `context_switch`. Never returns.
#[unsafe(naked)]
pub unsafe extern "C" fn context_load(_load: *const MachineContext) -> ! {
    naked_asm!(
        "mov rbx, [rdi + 0x00]",
        "mov rbp, [rdi + 0x08]",
        "mov r12, [rdi + 0x10]",
        "mov r13, [rdi + 0x18]",
        "mov r14, [rdi + 0x20]",
        "mov r15, [rdi + 0x28]",
        "mov rsp, [rdi + 0x30]",
        "mov rax, [rdi + 0x38]",
        "jmp rax",
    );
}
