//! Context switch.
//!
//! Each thread owns a kernel stack; switching threads means saving the
//! System V callee-saved registers plus rflags into the outgoing thread's
//! context and loading the incoming one's. The switch routine hands off
//! to a finish hook that runs on the new stack and completes the
//! bookkeeping, so the first switch into a freshly seeded stack "returns"
//! straight into the thread entry trampoline.

use core::arch::naked_asm;
use core::mem::offset_of;

use alloc::vec;

use super::Thread;
use crate::interrupt;

/// Sentinel at the base (lowest address) of every kernel stack. The
/// stack grows down toward it; the scheduler checks it on every switch.
pub(super) const THREAD_MAGIC: u64 = 0xcd6a_bf4b_cd6a_bf4b;

/// Kernel stack size in 8-byte words (64 KiB).
const KSTACK_WORDS: usize = 2 * 4096;

/// System V ABI callee-saved registers; everything else is saved by the
/// compiler around the call to `switch_threads`.
#[derive(Default, Clone, Debug)]
#[repr(C)]
pub(super) struct Context {
    pub rflags: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
}

/// Seeds a new thread's stack so the first switch into it pops into
/// [`kernel_thread_entry`].
pub(super) fn seed_stack(t: &mut Thread) {
    let mut kstack = vec![0u64; KSTACK_WORDS].into_boxed_slice();
    kstack[0] = THREAD_MAGIC;

    // The entry trampoline is reached by `ret`, so pick the slot for the
    // return address such that rsp ≡ 8 (mod 16) afterwards, as the ABI
    // guarantees at function entry.
    let base = kstack.as_ptr() as usize;
    let mut top = KSTACK_WORDS - 1;
    if (base + top * 8) % 16 != 0 {
        top -= 1;
    }
    kstack[top] = kernel_thread_entry as usize as u64;

    t.context = Context::default();
    t.context.rsp = &kstack[top] as *const u64 as u64;
    t.context.rflags = 0x202;
    t.kstack = Some(kstack);
}

/// Basis of every kernel thread: runs the thread body, then kills the
/// thread if the body returns. We arrive here from the finish hook with
/// interrupts off.
extern "sysv64" fn kernel_thread_entry() {
    let body = super::with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).entry.take()
    })
    .expect("fresh thread without a body");
    interrupt::enable();
    body();
    super::exit_thread();
}

/// Saves the old callee-saved registers and loads the new ones. The next
/// context is a read-only copy, so the asm never touches scheduler state.
/// Finishes by jumping to [`switch_finish_hook`], which runs on the new
/// stack and whose `ret` resumes the incoming thread.
#[unsafe(naked)]
pub(super) unsafe extern "sysv64" fn switch_threads(_prev: *mut Context, _next: *const Context) {
    // prev = rdi, next = rsi
    naked_asm!(
        concat!(
            "
            mov [rdi + {off_rbx}], rbx
            mov rbx, [rsi + {off_rbx}]

            mov [rdi + {off_r12}], r12
            mov r12, [rsi + {off_r12}]

            mov [rdi + {off_r13}], r13
            mov r13, [rsi + {off_r13}]

            mov [rdi + {off_r14}], r14
            mov r14, [rsi + {off_r14}]

            mov [rdi + {off_r15}], r15
            mov r15, [rsi + {off_r15}]

            mov [rdi + {off_rbp}], rbp
            mov rbp, [rsi + {off_rbp}]

            mov [rdi + {off_rsp}], rsp
            mov rsp, [rsi + {off_rsp}]

            // rflags moves through the stack
            pushfq
            pop QWORD PTR [rdi + {off_rflags}]

            push QWORD PTR [rsi + {off_rflags}]
            popfq

            // The return address on the new stack may point anywhere, so
            // the bookkeeping runs as a hook on that stack; its own `ret`
            // resumes the incoming thread.
            jmp {switch_hook}
            "
        ),
        off_rflags = const(offset_of!(Context, rflags)),
        off_rbx = const(offset_of!(Context, rbx)),
        off_r12 = const(offset_of!(Context, r12)),
        off_r13 = const(offset_of!(Context, r13)),
        off_r14 = const(offset_of!(Context, r14)),
        off_r15 = const(offset_of!(Context, r15)),
        off_rbp = const(offset_of!(Context, rbp)),
        off_rsp = const(offset_of!(Context, rsp)),
        switch_hook = sym switch_finish_hook,
    );
}

/// Runs on the incoming thread's stack immediately after the register
/// switch, with interrupts still off.
unsafe extern "sysv64" fn switch_finish_hook() {
    super::schedule_tail();
}
