//! System call dispatch.
//!
//! A single trap entry dispatches on the call number at the top of the
//! user stack and pulls typed arguments from the words above it. Every
//! pointer coming out of user space runs through the validators: null
//! and kernel addresses are rejected outright, buffers must be covered
//! page-by-page by a resident mapping or a segment, and strings are
//! bounded. Any failure kills the process with the abnormal status.
//!
//! Filesystem calls serialise on the global filesystem lock. Buffers
//! handed to file I/O are faulted in and pinned *before* the lock is
//! taken, so a thread never page-faults while holding it.

use alloc::vec;

use x86_64::VirtAddr;

use super::{mmap, usermem, Process};
use crate::fs::{self, lock as fslock};
use crate::vaddr::{pg_ofs, PGSIZE};
use crate::{console, init};

/// Call numbers, as pushed by user programs.
pub mod nr {
    pub const HALT: u32 = 0;
    pub const EXIT: u32 = 1;
    pub const EXEC: u32 = 2;
    pub const WAIT: u32 = 3;
    pub const CREATE: u32 = 4;
    pub const REMOVE: u32 = 5;
    pub const OPEN: u32 = 6;
    pub const FILESIZE: u32 = 7;
    pub const READ: u32 = 8;
    pub const WRITE: u32 = 9;
    pub const SEEK: u32 = 10;
    pub const TELL: u32 = 11;
    pub const CLOSE: u32 = 12;
    pub const MMAP: u32 = 13;
    pub const MUNMAP: u32 = 14;
}

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;

/// Console writes are split into `putbuf` calls of at most this size.
const CONSOLE_CHUNK: usize = 256;

/// Longest string a syscall will read from user space.
const MAX_STRING: usize = PGSIZE as usize;

/// The system-call trap. `esp` is the user stack pointer at the trap
/// instruction; the call number sits at `[esp]`, arguments above.
pub fn trap(esp: VirtAddr) -> i32 {
    let process = super::current_process();
    process.set_user_esp(esp);
    let nr = arg(&process, esp, 0);
    match nr {
        nr::HALT => init::power_off(),
        nr::EXIT => super::exit(arg(&process, esp, 1) as i32),
        nr::EXEC => {
            let cmd = cstr_arg(&process, esp, 1);
            super::execute(&cmd).map(|pid| pid as i32).unwrap_or(-1)
        }
        nr::WAIT => super::wait(arg(&process, esp, 1)),
        nr::CREATE => {
            let name = cstr_arg(&process, esp, 1);
            let size = arg(&process, esp, 2);
            let _fs = fslock::Guard::new();
            fs::create(&name, size as u64) as i32
        }
        nr::REMOVE => {
            let name = cstr_arg(&process, esp, 1);
            let _fs = fslock::Guard::new();
            fs::remove(&name) as i32
        }
        nr::OPEN => {
            let name = cstr_arg(&process, esp, 1);
            let _fs = fslock::Guard::new();
            match fs::open(&name) {
                Some(file) => process.add_file(file),
                None => -1,
            }
        }
        nr::FILESIZE => match process.get_file(arg(&process, esp, 1) as i32) {
            Some(file) => {
                let _fs = fslock::Guard::new();
                file.length() as i32
            }
            None => -1,
        },
        nr::READ => sys_read(
            &process,
            arg(&process, esp, 1) as i32,
            VirtAddr::new(arg(&process, esp, 2) as u64),
            arg(&process, esp, 3) as usize,
        ),
        nr::WRITE => sys_write(
            &process,
            arg(&process, esp, 1) as i32,
            VirtAddr::new(arg(&process, esp, 2) as u64),
            arg(&process, esp, 3) as usize,
        ),
        nr::SEEK => {
            if let Some(file) = process.get_file(arg(&process, esp, 1) as i32) {
                let pos = arg(&process, esp, 2);
                let _fs = fslock::Guard::new();
                file.seek(pos as u64);
            }
            0
        }
        nr::TELL => match process.get_file(arg(&process, esp, 1) as i32) {
            Some(file) => {
                let _fs = fslock::Guard::new();
                file.tell() as i32
            }
            None => -1,
        },
        nr::CLOSE => {
            if let Some(file) = process.remove_file(arg(&process, esp, 1) as i32) {
                let _fs = fslock::Guard::new();
                drop(file);
            }
            0
        }
        nr::MMAP => mmap::sys_mmap(
            &process,
            arg(&process, esp, 1) as i32,
            VirtAddr::new(arg(&process, esp, 2) as u64),
        ),
        nr::MUNMAP => {
            mmap::sys_munmap(&process, arg(&process, esp, 1) as i32);
            0
        }
        _ => {
            log::debug!("unknown syscall {}", nr);
            super::kill_current()
        }
    }
}

/// Pulls argument word `i` off the user stack, killing the process if
/// the stack is bad.
fn arg(process: &Process, esp: VirtAddr, i: u64) -> u32 {
    match usermem::read_u32(process, esp + 4 * i) {
        Ok(v) => v,
        Err(_) => super::kill_current(),
    }
}

/// Pulls a string argument, validated up to `MAX_STRING` bytes.
fn cstr_arg(process: &Process, esp: VirtAddr, i: u64) -> alloc::string::String {
    let ptr = VirtAddr::new(arg(process, esp, i) as u64);
    match usermem::read_cstr(process, ptr, MAX_STRING) {
        Ok(s) => s,
        Err(_) => super::kill_current(),
    }
}

fn sys_read(process: &Process, fd: i32, buf: VirtAddr, n: usize) -> i32 {
    if usermem::check_range(process, buf, n, true).is_err() {
        super::kill_current();
    }
    if fd == STDIN_FILENO {
        let mut done = 0;
        while done < n {
            match console::input_pop() {
                Some(byte) => {
                    if usermem::copy_to_user(process, buf + done as u64, &[byte]).is_err() {
                        super::kill_current();
                    }
                    done += 1;
                }
                None => break,
            }
        }
        return done as i32;
    }
    if fd == STDOUT_FILENO {
        return -1;
    }
    let Some(file) = process.get_file(fd) else {
        return -1;
    };
    // One page of the buffer at a time: fault it in and pin it first,
    // then take the filesystem lock for the transfer. Pinning before
    // the lock keeps fs-lock holders from faulting; pinning page-wise
    // keeps a big buffer from eating the frame pool.
    let mut done = 0;
    while done < n {
        let at = buf + done as u64;
        let len = ((PGSIZE - pg_ofs(at)) as usize).min(n - done);
        let Ok((pinned, chunks)) = usermem::pin_for_io(process, at, len, true) else {
            super::kill_current()
        };
        let (ptr, len) = chunks[0];
        let read = {
            let _fs = fslock::Guard::new();
            let slice = unsafe { core::slice::from_raw_parts_mut(ptr, len) };
            file.read(slice)
        };
        drop(pinned);
        done += read;
        if read < len {
            break;
        }
    }
    done as i32
}

fn sys_write(process: &Process, fd: i32, buf: VirtAddr, n: usize) -> i32 {
    if usermem::check_range(process, buf, n, false).is_err() {
        super::kill_current();
    }
    if fd == STDOUT_FILENO {
        // Console output goes out in bounded chunks.
        let mut done = 0;
        let mut chunk = vec![0u8; CONSOLE_CHUNK];
        while done < n {
            let len = CONSOLE_CHUNK.min(n - done);
            if usermem::copy_from_user(process, buf + done as u64, &mut chunk[..len]).is_err() {
                super::kill_current();
            }
            console::putbuf(&chunk[..len]);
            done += len;
        }
        return n as i32;
    }
    if fd == STDIN_FILENO {
        return -1;
    }
    let Some(file) = process.get_file(fd) else {
        return -1;
    };
    let mut done = 0;
    while done < n {
        let at = buf + done as u64;
        let len = ((PGSIZE - pg_ofs(at)) as usize).min(n - done);
        let Ok((pinned, chunks)) = usermem::pin_for_io(process, at, len, false) else {
            super::kill_current()
        };
        let (ptr, len) = chunks[0];
        let written = {
            let _fs = fslock::Guard::new();
            let slice = unsafe { core::slice::from_raw_parts(ptr as *const u8, len) };
            file.write(slice)
        };
        drop(pinned);
        done += written;
        if written < len {
            break;
        }
    }
    done as i32
}
