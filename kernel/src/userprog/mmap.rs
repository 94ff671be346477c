//! Memory-mapped files.
//!
//! A mapping is a writable, file-backed segment over a private reopen
//! of the caller's file, so closing the original descriptor never tears
//! the mapping down. Unmapping frees the segment — which writes every
//! dirty resident page in the file's range back — and closes the
//! reopened handle.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use x86_64::VirtAddr;

use super::Process;
use crate::fs::{self, lock as fslock};
use crate::vaddr::{is_user_vaddr, pg_ofs, PGSIZE};
use crate::vm::page::Segment;

pub(crate) struct MmapTable {
    map: BTreeMap<i32, MmapRecord>,
    next: i32,
}

struct MmapRecord {
    segment: Arc<Segment>,
    file: Arc<fs::File>,
}

impl MmapTable {
    pub(crate) fn new() -> MmapTable {
        MmapTable {
            map: BTreeMap::new(),
            next: 0,
        }
    }
}

/// Maps the file open as `fd` at `addr`. Returns the mapping id, or −1
/// if the descriptor, address, file length, or address range is
/// unusable.
pub(crate) fn sys_mmap(process: &Process, fd: i32, addr: VirtAddr) -> i32 {
    if fd == super::syscall::STDIN_FILENO || fd == super::syscall::STDOUT_FILENO {
        return -1;
    }
    if addr.as_u64() == 0 || pg_ofs(addr) != 0 {
        return -1;
    }
    let Some(original) = process.get_file(fd) else {
        return -1;
    };

    let (file, length) = {
        let _fs = fslock::Guard::new();
        let file = original.reopen();
        (Arc::new(file), original.length())
    };
    if length == 0 {
        return -1;
    }
    let pages = length.div_ceil(PGSIZE);
    let size = pages * PGSIZE;
    let end = addr.as_u64().checked_add(size);
    if end.is_none() || !is_user_vaddr(VirtAddr::new(end.unwrap() - 1)) {
        return -1;
    }

    // Overlap with any existing segment fails the whole mapping.
    let Some(segment) = process.spt.create_segment(addr, true, size) else {
        return -1;
    };
    segment.set_file_data(file.clone(), 0, length, true);

    let mut table = process.mmaps.lock();
    let mapid = table.next;
    table.next += 1;
    table.map.insert(mapid, MmapRecord { segment, file });
    mapid
}

/// Unmaps mapping `mapid`. A mapping id the process does not own is
/// silently ignored.
pub(crate) fn sys_munmap(process: &Process, mapid: i32) {
    let record = process.mmaps.lock().map.remove(&mapid);
    if let Some(record) = record {
        unmap(process, record);
    }
}

fn unmap(process: &Process, record: MmapRecord) {
    process.spt.free_segment(&record.segment, &process.pagedir);
    let _fs = fslock::Guard::new();
    drop(record.file);
}

/// Tears down every mapping; used at process exit.
pub(crate) fn remove_all(process: &Arc<Process>) {
    loop {
        let record = {
            let mut table = process.mmaps.lock();
            match table.map.keys().next().copied() {
                Some(id) => table.map.remove(&id),
                None => None,
            }
        };
        match record {
            Some(record) => unmap(process, record),
            None => break,
        }
    }
}
