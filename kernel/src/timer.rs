//! System timer.
//!
//! The timer device itself lives outside this crate; the embedding
//! (hosted runner, tests, or running threads standing in for the
//! hardware) delivers ticks by calling [`interrupt`]. That call is the
//! kernel's single source of asynchrony: it runs the per-tick scheduler
//! accounting in external-handler context and performs the yield the
//! handler requested on the way out.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{interrupt as intr, threads};

/// Timer ticks per second.
pub const TIMER_FREQ: u64 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since the kernel booted.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Delivers one timer interrupt. Must be called with interrupts on,
/// from thread context.
pub fn interrupt() {
    intr::enter_external();
    TICKS.fetch_add(1, Ordering::AcqRel);
    threads::tick();
    if intr::leave_external() {
        threads::yield_now();
    }
}

/// Delivers `n` consecutive timer interrupts.
pub fn advance(n: u64) {
    for _ in 0..n {
        interrupt();
    }
}

pub(crate) fn reset() {
    TICKS.store(0, Ordering::Release);
}
