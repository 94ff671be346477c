//! Shared harness for kernel tests.
//!
//! The kernel is global state, so tests serialise on a process-wide
//! guard and boot a fresh kernel each. Thread bodies record what they
//! saw into shared traces; the assertions run on the main thread.

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use kernel::init::{self, BootOptions};
use kernel::userprog::load::{install_image, ImageSegment};
use kernel::userprog::program::{self, ProgramBody};

static GUARD: OnceLock<Mutex<()>> = OnceLock::new();

fn serialise() -> MutexGuard<'static, ()> {
    GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Boots a kernel with `options` and runs `test` on the initial thread.
pub fn kernel_test(options: BootOptions, test: impl FnOnce()) {
    let _guard = serialise();
    init::bootstrap(&options);
    test();
}

pub fn default_test(test: impl FnOnce()) {
    kernel_test(BootOptions::default(), test);
}

/// An execution-order trace shared between threads.
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct Trace(Arc<spin::Mutex<Vec<&'static str>>>);

#[allow(dead_code)]
impl Trace {
    pub fn new() -> Trace {
        Trace::default()
    }

    pub fn push(&self, event: &'static str) {
        self.0.lock().push(event);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.0.lock().clone()
    }

    /// Index of `event`, which must have been recorded.
    pub fn index_of(&self, event: &'static str) -> usize {
        self.0
            .lock()
            .iter()
            .position(|&e| e == event)
            .unwrap_or_else(|| panic!("event {:?} never happened", event))
    }
}

/// Registers `body` under `name` and installs a minimal executable
/// image for it: one read-only code page.
#[allow(dead_code)]
pub fn install_program(name: &str, body: ProgramBody) {
    program::register(name, body);
    assert!(
        install_image(
            name,
            &[ImageSegment {
                vaddr: 0x0804_8000,
                data: vec![0x90; 16],
                mem_size: 4096,
                writable: false,
            }],
        ),
        "image install failed for {}",
        name
    );
}
