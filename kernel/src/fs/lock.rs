//! The global filesystem lock.
//!
//! One mutex serialises every call into the file layer. A page fault on
//! a file-backed page can arrive from code that already holds it (a
//! syscall reading file data), so the fault path asks [`held`] before
//! acquiring.

use spin::Mutex;

use crate::threads::sync::Lock;

static FS_LOCK: Mutex<Option<Lock>> = Mutex::new(None);

pub(crate) fn init() {
    *FS_LOCK.lock() = Some(Lock::new());
}

fn the_lock() -> Lock {
    FS_LOCK.lock().expect("filesystem lock not initialised")
}

pub fn acquire() {
    the_lock().acquire();
}

pub fn release() {
    the_lock().release();
}

/// True if the current thread holds the filesystem lock.
pub fn held() -> bool {
    the_lock().held_by_current_thread()
}

/// RAII bracket around the filesystem lock.
pub struct Guard(());

impl Guard {
    pub fn new() -> Guard {
        acquire();
        Guard(())
    }
}

impl Default for Guard {
    fn default() -> Guard {
        Guard::new()
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        release();
    }
}
