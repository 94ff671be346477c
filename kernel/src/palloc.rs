//! User page pool.
//!
//! Frames handed to user pages come from a fixed, page-aligned arena
//! whose size is set on the boot command line (`-ul=N`). Exhaustion here
//! is what drives the frame table into eviction. Kernel structures use
//! the ordinary allocator.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::vec::Vec;

use spin::Mutex;

use crate::vaddr::PGSIZE;

struct Pool {
    base: *mut u8,
    pages: usize,
    free: Vec<usize>,
}

// The raw base pointer is only dereferenced through page handles.
unsafe impl Send for Pool {}

static USER_POOL: Mutex<Option<Pool>> = Mutex::new(None);

fn layout(pages: usize) -> Layout {
    Layout::from_size_align(pages * PGSIZE as usize, PGSIZE as usize)
        .expect("bad user pool geometry")
}

/// (Re)creates the user pool with `pages` page frames.
pub(crate) fn init(pages: usize) {
    assert!(pages > 0);
    let mut pool = USER_POOL.lock();
    if let Some(old) = pool.take() {
        unsafe { dealloc(old.base, layout(old.pages)) };
    }
    let base = unsafe { alloc(layout(pages)) };
    assert!(!base.is_null(), "user pool allocation failed");
    *pool = Some(Pool {
        base,
        pages,
        free: (0..pages).rev().collect(),
    });
}

/// Allocates one page from the user pool, or `None` when it is
/// exhausted.
pub(crate) fn alloc_page() -> Option<*mut u8> {
    let mut pool = USER_POOL.lock();
    let pool = pool.as_mut().expect("user pool not initialised");
    pool.free
        .pop()
        .map(|i| unsafe { pool.base.add(i * PGSIZE as usize) })
}

/// Returns a page to the pool.
pub(crate) fn free_page(page: *mut u8) {
    let mut pool = USER_POOL.lock();
    let pool = pool.as_mut().expect("user pool not initialised");
    let offset = page as usize - pool.base as usize;
    assert_eq!(offset % PGSIZE as usize, 0, "unaligned page freed");
    let index = offset / PGSIZE as usize;
    assert!(index < pool.pages, "page outside the user pool");
    debug_assert!(!pool.free.contains(&index), "double free of user page");
    pool.free.push(index);
}
