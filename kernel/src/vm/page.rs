//! Supplementary page table.
//!
//! Each process owns one: an ordered collection of segments, each a
//! contiguous user range with one backing policy — file data up to
//! `read_bytes` then zero fill, or pure zero fill — and one writability.
//! Within a segment, every page that has ever been touched has a mapped
//! -page record remembering where its contents live now (resident, in a
//! swap slot, or reproducible from the file). The record's eviction
//! lock serialises faulting the page in against writing it out.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;
use x86_64::VirtAddr;

use super::{frame, Fault};
use crate::fs::{self, lock as fslock};
use crate::threads::sync::Lock;
use crate::userprog::pagedir::Pagedir;
use crate::vaddr::{pg_ofs, pg_round_down, PGSIZE};

/// File backing for a segment: bytes `[0, read_bytes)` come from
/// `file` starting at `offset`; the rest of the segment is zero fill.
#[derive(Clone)]
pub struct FileData {
    pub file: Arc<fs::File>,
    pub offset: u64,
    pub read_bytes: u64,
    pub mmapped: bool,
}

pub struct Segment {
    pub base: VirtAddr,
    pub size: u64,
    pub writable: bool,
    file_data: Mutex<Option<FileData>>,
    /// Pages of this segment that have been touched, by page address.
    mapped: Mutex<BTreeMap<VirtAddr, Arc<MappedPage>>>,
}

impl Segment {
    fn contains(&self, va: VirtAddr) -> bool {
        self.base <= va && va.as_u64() < self.base.as_u64() + self.size
    }

    /// Attaches file backing. Set once, before the segment is used.
    pub fn set_file_data(&self, file: Arc<fs::File>, offset: u64, read_bytes: u64, mmapped: bool) {
        let mut slot = self.file_data.lock();
        debug_assert!(slot.is_none(), "segment file data set twice");
        *slot = Some(FileData {
            file,
            offset,
            read_bytes,
            mmapped,
        });
    }

    pub fn file_data(&self) -> Option<FileData> {
        self.file_data.lock().clone()
    }

    /// Whether the page at `upage` has ever been faulted in.
    pub fn is_touched(&self, upage: VirtAddr) -> bool {
        self.mapped.lock().contains_key(&upage)
    }
}

/// One touched page of a segment.
pub struct MappedPage {
    pub uaddr: VirtAddr,
    pub segment: Weak<Segment>,
    /// Serialises fault-in against evict-out for this page.
    pub evict_lock: Lock,
    /// Swap slot holding the page's bytes while it is neither resident
    /// nor reproducible from its file.
    pub swap_slot: Mutex<Option<u32>>,
}

pub struct SuppPageTable {
    segments: Mutex<Vec<Arc<Segment>>>,
}

impl SuppPageTable {
    #[allow(clippy::new_without_default)]
    pub fn new() -> SuppPageTable {
        SuppPageTable {
            segments: Mutex::new(Vec::new()),
        }
    }

    /// Inserts a segment covering `[base, base + size)`. Fails if the
    /// range overlaps an existing segment.
    pub fn create_segment(&self, base: VirtAddr, writable: bool, size: u64) -> Option<Arc<Segment>> {
        debug_assert_eq!(pg_ofs(base), 0);
        debug_assert!(size > 0 && size % PGSIZE == 0);
        let mut segments = self.segments.lock();
        let end = base.as_u64() + size;
        for existing in segments.iter() {
            let existing_end = existing.base.as_u64() + existing.size;
            if base.as_u64() < existing_end && existing.base.as_u64() < end {
                return None;
            }
        }
        let segment = Arc::new(Segment {
            base,
            size,
            writable,
            file_data: Mutex::new(None),
            mapped: Mutex::new(BTreeMap::new()),
        });
        segments.push(segment.clone());
        Some(segment)
    }

    /// The segment containing `va`, if any. Cost is linear in the
    /// number of segments.
    pub fn lookup(&self, va: VirtAddr) -> Option<Arc<Segment>> {
        self.segments.lock().iter().find(|s| s.contains(va)).cloned()
    }

    /// Tears down one segment: resident pages are written back (if
    /// mmapped and dirty) and their frames freed, swap slots released.
    pub fn free_segment(&self, segment: &Arc<Segment>, pagedir: &Arc<Pagedir>) {
        self.segments.lock().retain(|s| !Arc::ptr_eq(s, segment));
        let pages: Vec<Arc<MappedPage>> = segment.mapped.lock().values().cloned().collect();
        for mapped in pages {
            frame::release_page(pagedir, &mapped);
            mapped.evict_lock.free();
        }
        segment.mapped.lock().clear();
    }

    /// Tears down every segment.
    pub fn free_all(&self, pagedir: &Arc<Pagedir>) {
        loop {
            let segment = match self.segments.lock().first() {
                Some(s) => s.clone(),
                None => break,
            };
            self.free_segment(&segment, pagedir);
        }
    }
}

/// Bytes of the page at `uaddr` that come from the segment's file.
fn page_read_bytes(segment_base: VirtAddr, uaddr: VirtAddr, read_bytes: u64) -> u64 {
    let end = segment_base.as_u64() + read_bytes;
    if uaddr.as_u64() >= end {
        0
    } else {
        (end - uaddr.as_u64()).min(PGSIZE)
    }
}

/// Reads `read` bytes from `file` into the page at `kpage` and zeroes
/// the remainder. Fails on a short read.
fn read_page(kpage: usize, file: &fs::File, read: u64) -> bool {
    let page = unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PGSIZE as usize) };
    let n = file.read(&mut page[..read as usize]);
    if n != read as usize {
        return false;
    }
    page[read as usize..].fill(0);
    true
}

/// The page-fault service: maps the page containing `fault_addr` into a
/// frame, filling it from swap, file, or zeroes.
///
/// The frame is pinned while being filled; unless `keep_pinned`, it is
/// unpinned before returning. Returns the frame's kernel address.
pub(crate) fn map_addr(
    spt: &SuppPageTable,
    pagedir: &Arc<Pagedir>,
    fault_addr: VirtAddr,
    keep_pinned: bool,
) -> Result<usize, Fault> {
    let segment = spt.lookup(fault_addr).ok_or(Fault)?;
    let uaddr = pg_round_down(fault_addr);

    // At most one live mapped-page per (segment, page).
    let mapped = segment
        .mapped
        .lock()
        .entry(uaddr)
        .or_insert_with(|| {
            Arc::new(MappedPage {
                uaddr,
                segment: Arc::downgrade(&segment),
                evict_lock: Lock::new(),
                swap_slot: Mutex::new(None),
            })
        })
        .clone();

    let kpage = frame::request_frame(mapped.clone(), pagedir.clone());

    mapped.evict_lock.acquire();
    let from_swap = mapped.swap_slot.lock().take();
    if let Some(slot) = from_swap {
        let page = unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PGSIZE as usize) };
        super::swap::retrieve(slot, page);
    } else if let Some(file_data) = segment.file_data() {
        let read = page_read_bytes(segment.base, uaddr, file_data.read_bytes);
        // A syscall that faulted while reading file data already holds
        // the filesystem lock; reenter instead of deadlocking.
        let already_held = fslock::held();
        if !already_held {
            fslock::acquire();
        }
        file_data
            .file
            .seek(file_data.offset + (uaddr.as_u64() - segment.base.as_u64()));
        let ok = read_page(kpage, &file_data.file, read);
        if !already_held {
            fslock::release();
        }
        if !ok {
            mapped.evict_lock.release();
            frame::free_frame(kpage);
            return Err(Fault);
        }
    } else {
        let page = unsafe { core::slice::from_raw_parts_mut(kpage as *mut u8, PGSIZE as usize) };
        page.fill(0);
    }

    assert!(
        pagedir.set_page(uaddr, kpage, segment.writable),
        "faulting page was already mapped"
    );
    mapped.evict_lock.release();
    if !keep_pinned {
        frame::unpin(kpage);
    }
    Ok(kpage)
}

/// Writes a resident mmapped page's file-covered bytes back to its
/// file. Returns false when the page has no file to go back to (not
/// mmapped, or wholly past `read_bytes`), in which case the caller
/// sends it to swap instead.
pub(crate) fn write_back(mapped: &MappedPage, kpage: usize) -> bool {
    let Some(segment) = mapped.segment.upgrade() else {
        return false;
    };
    let Some(file_data) = segment.file_data() else {
        return false;
    };
    if !file_data.mmapped {
        return false;
    }
    let n = page_read_bytes(segment.base, mapped.uaddr, file_data.read_bytes);
    if n == 0 {
        return false;
    }
    let already_held = fslock::held();
    if !already_held {
        fslock::acquire();
    }
    file_data
        .file
        .seek(file_data.offset + (mapped.uaddr.as_u64() - segment.base.as_u64()));
    let page = unsafe { core::slice::from_raw_parts(kpage as *const u8, PGSIZE as usize) };
    file_data.file.write(&page[..n as usize]);
    if !already_held {
        fslock::release();
    }
    true
}
