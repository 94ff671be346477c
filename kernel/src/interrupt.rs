//! Interrupt state.
//!
//! There is a single processor and interrupts are the only source of
//! asynchrony, so disabling them is the lowest-level synchronization
//! primitive: kernel code between interrupts runs without interference.
//! The hardware stubs live outside this crate; what the kernel tracks here
//! is the interrupt level itself, whether we are inside an external
//! handler, and whether that handler asked the running thread to yield on
//! return.

use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Interrupts enabled.
    On,
    /// Interrupts disabled.
    Off,
}

/// The kernel boots with interrupts disabled; `init::bootstrap` enables
/// them once the scheduler is running.
static DISABLED: AtomicBool = AtomicBool::new(true);
static IN_EXTERNAL: AtomicBool = AtomicBool::new(false);
static YIELD_ON_RETURN: AtomicBool = AtomicBool::new(false);

pub fn get_level() -> Level {
    if DISABLED.load(Ordering::Acquire) {
        Level::Off
    } else {
        Level::On
    }
}

/// Disables interrupts and returns the previous level.
pub fn disable() -> Level {
    if DISABLED.swap(true, Ordering::AcqRel) {
        Level::Off
    } else {
        Level::On
    }
}

/// Enables interrupts and returns the previous level.
pub fn enable() -> Level {
    assert!(
        !in_external(),
        "cannot enable interrupts inside an external handler"
    );
    if DISABLED.swap(false, Ordering::AcqRel) {
        Level::Off
    } else {
        Level::On
    }
}

/// Restores a level previously returned by `disable` or `enable`.
pub fn set_level(level: Level) -> Level {
    match level {
        Level::On => enable(),
        Level::Off => disable(),
    }
}

/// True while an external interrupt handler is running.
pub fn in_external() -> bool {
    IN_EXTERNAL.load(Ordering::Acquire)
}

/// Asks the scheduler to switch threads when the current external handler
/// returns. Handlers cannot yield directly.
pub fn yield_on_return() {
    assert!(in_external(), "yield-on-return outside an external handler");
    YIELD_ON_RETURN.store(true, Ordering::Release);
}

/// Enters external-handler context. External interrupts never nest.
pub(crate) fn enter_external() {
    assert_eq!(
        get_level(),
        Level::On,
        "external interrupt delivered with interrupts off"
    );
    assert!(!in_external(), "nested external interrupt");
    disable();
    IN_EXTERNAL.store(true, Ordering::Release);
}

/// Leaves external-handler context, re-enabling interrupts. Returns
/// whether the handler requested a yield.
pub(crate) fn leave_external() -> bool {
    IN_EXTERNAL.store(false, Ordering::Release);
    let wants_yield = YIELD_ON_RETURN.swap(false, Ordering::AcqRel);
    enable();
    wants_yield
}

pub(crate) fn reset() {
    DISABLED.store(true, Ordering::Release);
    IN_EXTERNAL.store(false, Ordering::Release);
    YIELD_ON_RETURN.store(false, Ordering::Release);
}
