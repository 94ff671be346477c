//! Frame table.
//!
//! Three structures cover every frame lent to user pages — a lookup map
//! by kernel address, a FIFO queue the second-chance clock walks, and a
//! pinned count — all guarded by one sleeping lock with a "something
//! changed" condition for allocators stuck behind pinned frames. A
//! frame obtained from [`request_frame`] is born pinned; pinning is what
//! lets a syscall sleep in file I/O aimed at a user buffer without the
//! clock reclaiming it.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;

use spin::Mutex;

use super::page::{self, MappedPage};
use super::swap;
use crate::palloc;
use crate::threads::sync::{Condvar, Lock};
use crate::userprog::pagedir::Pagedir;
use crate::vaddr::PGSIZE;

struct FrameRec {
    mapped: Arc<MappedPage>,
    pagedir: Arc<Pagedir>,
    pinned: bool,
}

struct FrameInner {
    frames: BTreeMap<usize, FrameRec>,
    /// Eviction order; holds every frame in `frames`.
    queue: VecDeque<usize>,
    pinned_count: usize,
}

static SYNC: Mutex<Option<(Lock, Condvar)>> = Mutex::new(None);
static INNER: Mutex<FrameInner> = Mutex::new(FrameInner {
    frames: BTreeMap::new(),
    queue: VecDeque::new(),
    pinned_count: 0,
});

fn handles() -> (Lock, Condvar) {
    SYNC.lock().expect("frame table not initialised")
}

pub(crate) fn init() {
    *SYNC.lock() = Some((Lock::new(), Condvar::new()));
    let mut inner = INNER.lock();
    inner.frames.clear();
    inner.queue.clear();
    inner.pinned_count = 0;
}

/// Obtains a frame for `mapped`, evicting if the user pool is dry. The
/// returned frame is pinned; the caller unpins it once the page is
/// installed.
pub(crate) fn request_frame(mapped: Arc<MappedPage>, pagedir: Arc<Pagedir>) -> usize {
    let (lock, changed) = handles();
    lock.acquire();
    let kpage = loop {
        if let Some(page) = palloc::alloc_page() {
            break page as usize;
        }
        let (total, pinned) = {
            let inner = INNER.lock();
            (inner.frames.len(), inner.pinned_count)
        };
        if pinned >= total {
            // Nothing can be evicted until someone unpins or frees.
            debug_assert_eq!(pinned, total);
            changed.wait(&lock);
        } else if let Some(page) = evict(&lock) {
            break page;
        } else {
            changed.wait(&lock);
        }
    };
    {
        let mut inner = INNER.lock();
        inner.frames.insert(
            kpage,
            FrameRec {
                mapped,
                pagedir,
                pinned: true,
            },
        );
        inner.queue.push_back(kpage);
        inner.pinned_count += 1;
    }
    lock.release();
    kpage
}

/// Second-chance scan. Pinned and recently-accessed frames rotate to
/// the back (losing their accessed bit); the first frame with neither
/// is written out and its storage returned for reuse. `None` if two
/// full passes found nothing.
fn evict(_table_lock: &Lock) -> Option<usize> {
    let passes = INNER.lock().queue.len() * 2;
    for _ in 0..passes {
        let victim = {
            let mut inner = INNER.lock();
            let &kpage = inner.queue.front()?;
            let rec = &inner.frames[&kpage];
            let uaddr = rec.mapped.uaddr;
            if rec.pinned || rec.pagedir.is_accessed(uaddr) {
                rec.pagedir.set_accessed(uaddr, false);
                inner.queue.rotate_left(1);
                None
            } else {
                Some(kpage)
            }
        };
        let Some(kpage) = victim else { continue };

        let (mapped, pagedir) = {
            let inner = INNER.lock();
            let rec = &inner.frames[&kpage];
            (rec.mapped.clone(), rec.pagedir.clone())
        };
        // Unmap first so the owner faults (and then blocks on the
        // eviction lock) instead of racing the write-out.
        pagedir.clear_page(mapped.uaddr);
        mapped.evict_lock.acquire();
        if !page::write_back(&mapped, kpage) {
            let bytes =
                unsafe { core::slice::from_raw_parts(kpage as *const u8, PGSIZE as usize) };
            *mapped.swap_slot.lock() = Some(swap::write(bytes));
        }
        mapped.evict_lock.release();
        {
            let mut inner = INNER.lock();
            let front = inner.queue.pop_front();
            debug_assert_eq!(front, Some(kpage));
            inner.frames.remove(&kpage);
        }
        return Some(kpage);
    }
    None
}

/// Pins the frame at `kpage` against eviction. Returns false if no such
/// frame exists (it was evicted or freed first).
pub(crate) fn pin(kpage: usize) -> bool {
    let (lock, _) = handles();
    lock.acquire();
    let found = {
        let mut inner = INNER.lock();
        match inner.frames.get_mut(&kpage) {
            Some(rec) => {
                if !rec.pinned {
                    rec.pinned = true;
                    inner.pinned_count += 1;
                }
                true
            }
            None => false,
        }
    };
    lock.release();
    found
}

/// Unpins a frame, letting eviction consider it again.
pub(crate) fn unpin(kpage: usize) {
    let (lock, changed) = handles();
    lock.acquire();
    // The spin guard must be gone before signalling: the woken thread
    // may preempt us.
    let unpinned = {
        let mut inner = INNER.lock();
        match inner.frames.get_mut(&kpage) {
            Some(rec) if rec.pinned => {
                rec.pinned = false;
                inner.pinned_count -= 1;
                true
            }
            _ => false,
        }
    };
    if unpinned {
        changed.signal(&lock);
    }
    lock.release();
}

/// Frees a frame and returns its page to the user pool.
pub(crate) fn free_frame(kpage: usize) {
    let (lock, changed) = handles();
    lock.acquire();
    let freed = {
        let mut inner = INNER.lock();
        match inner.frames.remove(&kpage) {
            Some(rec) => {
                inner.queue.retain(|&k| k != kpage);
                if rec.pinned {
                    inner.pinned_count -= 1;
                }
                palloc::free_page(kpage as *mut u8);
                true
            }
            None => false,
        }
    };
    if freed {
        changed.signal(&lock);
    }
    lock.release();
}

/// Releases one user page wholesale: writes it back to its file if it
/// is a dirty mmapped page, frees its frame if resident, and returns
/// any swap slot. Used by segment teardown; serialised against the
/// clock by the table lock and the page's eviction lock.
pub(crate) fn release_page(pagedir: &Arc<Pagedir>, mapped: &MappedPage) {
    let (lock, changed) = handles();
    lock.acquire();
    mapped.evict_lock.acquire();
    if let Some(kpage) = pagedir.get_page(mapped.uaddr) {
        if pagedir.is_dirty(mapped.uaddr) {
            page::write_back(mapped, kpage);
        }
        pagedir.clear_page(mapped.uaddr);
        let freed = {
            let mut inner = INNER.lock();
            match inner.frames.remove(&kpage) {
                Some(rec) => {
                    inner.queue.retain(|&k| k != kpage);
                    if rec.pinned {
                        inner.pinned_count -= 1;
                    }
                    palloc::free_page(kpage as *mut u8);
                    true
                }
                None => false,
            }
        };
        if freed {
            changed.signal(&lock);
        }
    }
    if let Some(slot) = mapped.swap_slot.lock().take() {
        swap::free_slot(slot);
    }
    mapped.evict_lock.release();
    lock.release();
}

/// (total frames, pinned frames), for diagnostics.
pub fn counts() -> (usize, usize) {
    let inner = INNER.lock();
    (inner.frames.len(), inner.pinned_count)
}
