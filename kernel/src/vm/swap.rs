//! Swap table.
//!
//! Evicted anonymous pages go to the block device registered in the
//! swap role, one page per slot of `PGSIZE / SECTOR_SIZE` consecutive
//! sectors. Free slots are tracked as a sorted list of disjoint,
//! maximally merged half-open ranges, so the allocator is a pop from
//! the first range and frees fold neighbours back together.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block::{self, BlockDevice, Role, SECTOR_SIZE};
use crate::threads::sync::Lock;
use crate::vaddr::PGSIZE;

pub const SECTORS_PER_PAGE: u64 = PGSIZE / SECTOR_SIZE as u64;

/// Free slots `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Range {
    start: u32,
    end: u32,
}

struct SwapInner {
    device: Arc<dyn BlockDevice>,
    free: Vec<Range>,
}

static SWAP_LOCK: Mutex<Option<Lock>> = Mutex::new(None);
static INNER: Mutex<Option<SwapInner>> = Mutex::new(None);

fn the_lock() -> Lock {
    SWAP_LOCK.lock().expect("swap not initialised")
}

/// Binds the swap table to the device in the swap role, with one free
/// range spanning the whole device.
pub(crate) fn init() {
    let device = block::by_role(Role::Swap).expect("no swap device registered");
    let slots = (device.sector_count() / SECTORS_PER_PAGE) as u32;
    *INNER.lock() = Some(SwapInner {
        device,
        free: vec![Range {
            start: 0,
            end: slots,
        }],
    });
    *SWAP_LOCK.lock() = Some(Lock::new());
}

/// Writes a page to swap, returning its slot.
///
/// # Panics
/// When the swap device is full: an unevictable page with nowhere to go
/// is unrecoverable.
pub(crate) fn write(page: &[u8]) -> u32 {
    assert_eq!(page.len(), PGSIZE as usize);
    let lock = the_lock();
    lock.acquire();
    let (device, slot) = {
        let mut inner = INNER.lock();
        let inner = inner.as_mut().expect("swap not initialised");
        let first = inner.free.first_mut().unwrap_or_else(|| {
            panic!("swap device is full");
        });
        let slot = first.start;
        first.start += 1;
        if first.start == first.end {
            inner.free.remove(0);
        }
        (inner.device.clone(), slot)
    };
    for i in 0..SECTORS_PER_PAGE {
        let at = i as usize * SECTOR_SIZE;
        device.write_sector(
            slot as u64 * SECTORS_PER_PAGE + i,
            &page[at..at + SECTOR_SIZE],
        );
    }
    lock.release();
    slot
}

/// Reads the page stored in `slot` and frees the slot.
pub(crate) fn retrieve(slot: u32, page: &mut [u8]) {
    assert_eq!(page.len(), PGSIZE as usize);
    let lock = the_lock();
    lock.acquire();
    let device = {
        let inner = INNER.lock();
        inner.as_ref().expect("swap not initialised").device.clone()
    };
    for i in 0..SECTORS_PER_PAGE {
        let at = i as usize * SECTOR_SIZE;
        device.read_sector(
            slot as u64 * SECTORS_PER_PAGE + i,
            &mut page[at..at + SECTOR_SIZE],
        );
    }
    free_slot_inner(slot);
    lock.release();
}

/// Returns `slot` to the free list.
pub(crate) fn free_slot(slot: u32) {
    let lock = the_lock();
    lock.acquire();
    free_slot_inner(slot);
    lock.release();
}

fn free_slot_inner(slot: u32) {
    let mut inner = INNER.lock();
    let free = &mut inner.as_mut().expect("swap not initialised").free;
    insert_free(free, slot);
}

/// Inserts one freed slot, merging with the neighbouring ranges so the
/// list stays sorted, disjoint, and maximally merged.
fn insert_free(free: &mut Vec<Range>, slot: u32) {
    let i = free.partition_point(|r| r.start <= slot);
    debug_assert!(i == 0 || free[i - 1].end <= slot, "slot freed twice");
    let merges_prev = i > 0 && free[i - 1].end == slot;
    let merges_next = i < free.len() && free[i].start == slot + 1;
    match (merges_prev, merges_next) {
        (true, true) => {
            free[i - 1].end = free[i].end;
            free.remove(i);
        }
        (true, false) => free[i - 1].end = slot + 1,
        (false, true) => free[i].start = slot,
        (false, false) => free.insert(
            i,
            Range {
                start: slot,
                end: slot + 1,
            },
        ),
    }
}

/// Checks the free-range invariants: sorted, disjoint, non-empty,
/// maximally merged.
pub fn self_check() {
    let inner = INNER.lock();
    let free = &inner.as_ref().expect("swap not initialised").free;
    for (i, r) in free.iter().enumerate() {
        assert!(r.start < r.end, "empty free range");
        if i > 0 {
            assert!(free[i - 1].end < r.start, "unsorted or unmerged free list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spans(free: &[Range]) -> Vec<(u32, u32)> {
        free.iter().map(|r| (r.start, r.end)).collect()
    }

    #[test]
    fn free_merges_neighbours() {
        // Slots 0..5 in use, the tail free: freeing 2, 1, 3 must fold
        // into the single range [1, 4) next to [5, end).
        let mut free = vec![Range { start: 5, end: 64 }];
        insert_free(&mut free, 2);
        assert_eq!(spans(&free), &[(2, 3), (5, 64)]);
        insert_free(&mut free, 1);
        assert_eq!(spans(&free), &[(1, 3), (5, 64)]);
        insert_free(&mut free, 3);
        assert_eq!(spans(&free), &[(1, 4), (5, 64)]);
        insert_free(&mut free, 4);
        assert_eq!(spans(&free), &[(1, 64)]);
        insert_free(&mut free, 0);
        assert_eq!(spans(&free), &[(0, 64)]);
    }

    #[test]
    fn free_into_gap_between_ranges() {
        let mut free = vec![Range { start: 0, end: 2 }, Range { start: 6, end: 8 }];
        insert_free(&mut free, 4);
        assert_eq!(spans(&free), &[(0, 2), (4, 5), (6, 8)]);
        insert_free(&mut free, 5);
        assert_eq!(spans(&free), &[(0, 2), (4, 8)]);
        insert_free(&mut free, 3);
        assert_eq!(spans(&free), &[(0, 2), (3, 8)]);
        insert_free(&mut free, 2);
        assert_eq!(spans(&free), &[(0, 8)]);
    }
}
