//! Machine context save/restore.
//!
//! A [`Context`] is the register-save area one fiber swaps with another. The
//! switch routine stores the callee-saved registers of the current thread of
//! execution, publishes the stack pointer, and restores the target's
//! registers; a freshly armed context makes the first switch land in the
//! entry trampoline with a terminated call frame. Caller-saved registers are
//! spilled by the compiler around the `extern "C"` call, so only the
//! callee-saved set is kept here.

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("fiber context switching is implemented for x86_64 and aarch64 only");

#[cfg(target_arch = "x86_64")]
mod imp {
    /// On x86_64 every callee-saved register is parked on the suspended
    /// stack itself; the context only remembers where.
    #[repr(C)]
    pub(crate) struct Context {
        sp: *mut u8,
    }

    core::arch::global_asm!(
        ".text",
        ".balign 16",
        ".globl filament_context_switch",
        ".type filament_context_switch, @function",
        "filament_context_switch:",
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        "ret",
        ".size filament_context_switch, . - filament_context_switch",
    );

    impl Context {
        pub(crate) fn new() -> Self {
            Context {
                sp: std::ptr::null_mut(),
            }
        }

        /// Prepare the context so that the next switch into it `ret`s into
        /// `entry` on the given stack.
        ///
        /// # Safety
        ///
        /// `stack_top` must be the upper end of at least 64 writable bytes of
        /// a stack that stays alive while the context is switchable.
        pub(crate) unsafe fn arm(&mut self, stack_top: *mut u8, entry: extern "C" fn() -> !) {
            let top = (stack_top as usize) & !15;
            let frame = (top - 64) as *mut u64;
            // Zeroed r15, r14, r13, r12, rbx, rbp restored by the first
            // switch; a null rbp terminates frame-pointer walks.
            for slot in 0..6 {
                frame.add(slot).write(0);
            }
            // `ret` target; entered with rsp ≡ 8 (mod 16) like any call.
            frame.add(6).write(entry as usize as u64);
            // Fake return address above the entry frame.
            frame.add(7).write(0);
            self.sp = frame as *mut u8;
        }
    }
}

#[cfg(target_arch = "aarch64")]
mod imp {
    /// aarch64 keeps the full callee-saved set in the context: sp,
    /// x19-x28, fp, lr and the low halves of v8-v15.
    #[repr(C)]
    pub(crate) struct Context {
        sp: u64,
        x: [u64; 12],
        d: [u64; 8],
    }

    core::arch::global_asm!(
        ".text",
        ".balign 16",
        ".globl filament_context_switch",
        ".type filament_context_switch, %function",
        "filament_context_switch:",
        "mov x9, sp",
        "str x9,  [x0]",
        "stp x19, x20, [x0, #8]",
        "stp x21, x22, [x0, #24]",
        "stp x23, x24, [x0, #40]",
        "stp x25, x26, [x0, #56]",
        "stp x27, x28, [x0, #72]",
        "stp x29, x30, [x0, #88]",
        "stp d8,  d9,  [x0, #104]",
        "stp d10, d11, [x0, #120]",
        "stp d12, d13, [x0, #136]",
        "stp d14, d15, [x0, #152]",
        "ldr x9,  [x1]",
        "mov sp, x9",
        "ldp x19, x20, [x1, #8]",
        "ldp x21, x22, [x1, #24]",
        "ldp x23, x24, [x1, #40]",
        "ldp x25, x26, [x1, #56]",
        "ldp x27, x28, [x1, #72]",
        "ldp x29, x30, [x1, #88]",
        "ldp d8,  d9,  [x1, #104]",
        "ldp d10, d11, [x1, #120]",
        "ldp d12, d13, [x1, #136]",
        "ldp d14, d15, [x1, #152]",
        "ret",
        ".size filament_context_switch, . - filament_context_switch",
    );

    impl Context {
        pub(crate) fn new() -> Self {
            Context {
                sp: 0,
                x: [0; 12],
                d: [0; 8],
            }
        }

        /// See the x86_64 twin. The first switch `ret`s through the armed
        /// link register; a zero frame pointer terminates backtraces.
        pub(crate) unsafe fn arm(&mut self, stack_top: *mut u8, entry: extern "C" fn() -> !) {
            *self = Context::new();
            self.sp = (stack_top as u64) & !15;
            self.x[11] = entry as usize as u64; // lr
        }
    }
}

pub(crate) use imp::Context;

extern "C" {
    fn filament_context_switch(save: *mut Context, load: *const Context);
}

/// Swap execution to `load`, saving the current state into `save`.
///
/// # Safety
///
/// `load` must be an armed or previously saved context whose stack is alive;
/// `save` must stay valid until something switches back into it. No lock may
/// be held across the call.
pub(crate) unsafe fn switch(save: *mut Context, load: *const Context) {
    filament_context_switch(save, load);
}
