//! File layer.
//!
//! The filesystem proper is an external collaborator; the kernel core
//! only relies on the operation surface below — create/open/remove on a
//! flat namespace and per-handle read/write/seek/length/deny-write —
//! and serialises every call through the global [`lock`]. This build
//! backs it with RAM-resident inodes.
//!
//! Two deliberate semantics the rest of the kernel depends on:
//! writes never extend a file past the size it was created with, and a
//! removed file stays readable through handles that were already open.

pub mod lock;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::{Mutex, RwLock};

struct Inode {
    data: RwLock<Vec<u8>>,
    /// Open handles that currently deny writes.
    deny_write: AtomicU32,
}

static TABLE: Mutex<BTreeMap<String, Arc<Inode>>> = Mutex::new(BTreeMap::new());

/// Erases every file.
pub fn format() {
    TABLE.lock().clear();
}

/// Creates a file of exactly `initial_size` zero bytes. Fails if the
/// name is empty or taken.
pub fn create(name: &str, initial_size: u64) -> bool {
    if name.is_empty() {
        return false;
    }
    let mut table = TABLE.lock();
    if table.contains_key(name) {
        return false;
    }
    table.insert(
        name.to_string(),
        Arc::new(Inode {
            data: RwLock::new(vec![0u8; initial_size as usize]),
            deny_write: AtomicU32::new(0),
        }),
    );
    true
}

/// Unlinks a file. Open handles keep working.
pub fn remove(name: &str) -> bool {
    TABLE.lock().remove(name).is_some()
}

/// Opens a file, with an independent position starting at zero.
pub fn open(name: &str) -> Option<File> {
    let inode = TABLE.lock().get(name).cloned()?;
    Some(File {
        inode,
        pos: Mutex::new(0),
        denied: AtomicBool::new(false),
    })
}

/// An open file handle.
pub struct File {
    inode: Arc<Inode>,
    pos: Mutex<u64>,
    /// Whether this handle contributes to the inode's deny-write count.
    denied: AtomicBool,
}

impl File {
    /// Reads from the current position, advancing it. Returns the number
    /// of bytes read, which is short only at end of file.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let data = self.inode.data.read();
        let start = (*pos).min(data.len() as u64) as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        *pos += n as u64;
        n
    }

    /// Writes at the current position, advancing it. Never grows the
    /// file: bytes past end of file are dropped. Returns 0 while writes
    /// are denied.
    pub fn write(&self, buf: &[u8]) -> usize {
        if self.inode.deny_write.load(Ordering::Acquire) > 0 {
            return 0;
        }
        let mut pos = self.pos.lock();
        let mut data = self.inode.data.write();
        let len = data.len() as u64;
        if *pos >= len {
            return 0;
        }
        let start = *pos as usize;
        let n = buf.len().min(data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        *pos += n as u64;
        n
    }

    pub fn seek(&self, pos: u64) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> u64 {
        *self.pos.lock()
    }

    pub fn length(&self) -> u64 {
        self.inode.data.read().len() as u64
    }

    /// Denies writes to the underlying file while this handle is open.
    pub fn deny_write(&self) {
        if !self.denied.swap(true, Ordering::AcqRel) {
            self.inode.deny_write.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Re-allows writes previously denied through this handle.
    pub fn allow_write(&self) {
        if self.denied.swap(false, Ordering::AcqRel) {
            self.inode.deny_write.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// A fresh handle on the same file: position zero, no write denial.
    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
            pos: Mutex::new(0),
            denied: AtomicBool::new(false),
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
