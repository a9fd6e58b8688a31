// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The register-level context switch.
//!
//! This is the only platform-specific piece of the runtime. A context is
//! nothing more than a stack pointer: all callee-saved state lives on the
//! stack it points to, in a fixed-size area directly below the saved
//! position.

use std::arch::naked_asm;
use std::ptr;

/// Bytes reserved on top of each stack for the callee-saved registers
/// that [`swapcontext`] pushes (x86-64 SysV: rbp, rbx, r12-r15).
pub const SPACE_FOR_SAVED_REGISTERS: usize = 48;

/// Saves the current execution context and resumes another one.
///
/// Pushes the callee-saved registers onto the current stack, stores the
/// resulting stack pointer through `saved`, loads the stack pointer from
/// `target`, pops the target's saved registers and returns into it. The
/// call appears to "return" once some other context switches back into
/// `saved`.
///
/// # Safety
/// `saved` must be valid for a write and `target` must point to a stack
/// pointer produced either by a previous `swapcontext` or by
/// [`init_stack`]. The target stack must be live and unused by any other
/// execution.
#[unsafe(naked)]
pub unsafe extern "C" fn swapcontext(_saved: *mut *mut u8, _target: *const *mut u8) {
    naked_asm!(
        // Save callee-saved registers on the current stack and publish
        // the stack pointer through `saved` (rdi).
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        // Adopt the target stack (rsi) and restore its registers.
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        // For a fresh stack this pops the primed entry address; for a
        // suspended one it returns to the caller of its own swapcontext.
        "ret",
    );
}

/// Primes a fresh stack so the first switch into it enters `entry`.
///
/// Writes the entry address into a 16-byte aligned slot near `top` (the
/// SysV ABI requires `rsp ≡ 8 (mod 16)` at function entry, which is what
/// the final `ret` of [`swapcontext`] produces from such a slot) and
/// zeroes the saved-register area below it. Returns the stack pointer to
/// hand to [`swapcontext`] as `target`.
///
/// # Safety
/// `top` must be the 16-byte aligned base of a stack with at least
/// `SPACE_FOR_SAVED_REGISTERS + 16` writable bytes below it.
pub(crate) unsafe fn init_stack(top: *mut u8, entry: unsafe extern "C" fn()) -> *mut u8 {
    debug_assert_eq!(top as usize & 15, 0);
    let entry_slot = top.sub(16);
    (entry_slot as *mut u64).write(entry as usize as u64);
    let sp = entry_slot.sub(SPACE_FOR_SAVED_REGISTERS);
    ptr::write_bytes(sp, 0, SPACE_FOR_SAVED_REGISTERS);
    sp
}
