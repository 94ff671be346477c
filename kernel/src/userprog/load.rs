//! Executable loading.
//!
//! Executables are image files: a fixed header followed by segment
//! descriptors and raw segment bytes. The byte-level format parsing of
//! a real object format lives outside the core — what matters here is
//! that loading *produces segment descriptors* that the supplementary
//! page table consumes. Nothing is read into memory eagerly; every
//! page of a loaded segment faults in on first touch.
//!
//! Loading also sets up the stack segment, maps its first page, and
//! lays the command-line arguments out per the process ABI: argument
//! bytes packed downward and NUL-terminated, the stack word-aligned to
//! 8 bytes, a null sentinel, the argv pointers from last to first,
//! argv, argc, and a fake return address of zero.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use x86_64::VirtAddr;

use super::{program, usermem, Process};
use crate::fs::{self, lock as fslock};
use crate::vaddr::{is_user_vaddr, pg_ofs, PGSIZE, PHYS_BASE};
use crate::vm::{growth, page};

/// Size limit in bytes for a command line, about half a page.
pub const ARG_LIMIT: usize = 2048;

const IMAGE_MAGIC: &[u8; 4] = b"MNX1";
const MAX_SEGMENTS: u32 = 64;

/// Header: magic, segment count. Each descriptor: vaddr, file offset,
/// bytes in file, bytes in memory, writable flag, all little-endian
/// 32-bit words.
const HEADER_LEN: usize = 8;
const DESC_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadError {
    Open,
    BadHeader,
    BadSegment,
    Stack,
    Args,
    NoProgram,
}

/// A segment as fed to the image builder.
pub struct ImageSegment {
    pub vaddr: u64,
    /// Initial bytes, read from the image file on fault.
    pub data: Vec<u8>,
    /// Total size in memory; at least `data.len()`, the tail zero-fill.
    pub mem_size: u64,
    pub writable: bool,
}

/// Serialises segments into image-file bytes.
pub fn build_image(segments: &[ImageSegment]) -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(IMAGE_MAGIC);
    image.extend_from_slice(&(segments.len() as u32).to_le_bytes());
    let mut offset = (HEADER_LEN + segments.len() * DESC_LEN) as u32;
    for seg in segments {
        image.extend_from_slice(&(seg.vaddr as u32).to_le_bytes());
        image.extend_from_slice(&offset.to_le_bytes());
        image.extend_from_slice(&(seg.data.len() as u32).to_le_bytes());
        image.extend_from_slice(&(seg.mem_size as u32).to_le_bytes());
        image.extend_from_slice(&(seg.writable as u32).to_le_bytes());
        offset += seg.data.len() as u32;
    }
    for seg in segments {
        image.extend_from_slice(&seg.data);
    }
    image
}

/// Creates `name` in the filesystem holding the image for `segments`.
pub fn install_image(name: &str, segments: &[ImageSegment]) -> bool {
    let image = build_image(segments);
    let _fs = fslock::Guard::new();
    if !fs::create(name, image.len() as u64) {
        return false;
    }
    let file = match fs::open(name) {
        Some(f) => f,
        None => return false,
    };
    file.write(&image) == image.len()
}

#[derive(Clone, Copy)]
struct SegmentDesc {
    vaddr: u32,
    offset: u32,
    file_size: u32,
    mem_size: u32,
    writable: bool,
}

/// Checks that a descriptor names a loadable user segment.
fn validate_segment(desc: &SegmentDesc, file_len: u64) -> bool {
    let vaddr = VirtAddr::new(desc.vaddr as u64);
    if pg_ofs(vaddr) != 0 {
        return false;
    }
    // The segment must be non-empty and the file part must fit in it.
    if desc.mem_size == 0 || desc.mem_size < desc.file_size {
        return false;
    }
    // The file part must point within the image.
    if desc.offset as u64 + desc.file_size as u64 > file_len {
        return false;
    }
    // Start and end inside user space, without wrapping.
    let end = desc.vaddr as u64 + desc.mem_size as u64;
    if !is_user_vaddr(vaddr) || end > PHYS_BASE.as_u64() {
        return false;
    }
    // Mapping page 0 would make null dereferences legal.
    if (desc.vaddr as u64) < PGSIZE {
        return false;
    }
    true
}

fn read_exact(file: &fs::File, buf: &mut [u8]) -> Result<(), LoadError> {
    if file.read(buf) != buf.len() {
        Err(LoadError::BadHeader)
    } else {
        Ok(())
    }
}

fn word(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Loads the executable named by the first token of `cmdline` into
/// `process`: registers its segments with the supplementary page
/// table, denies writes to the image, builds the stack. Returns the
/// program name and the initial stack pointer.
pub(crate) fn load(process: &Process, cmdline: &str) -> Result<(String, VirtAddr), LoadError> {
    let name = cmdline
        .split_whitespace()
        .next()
        .ok_or(LoadError::Open)?
        .to_string();
    if !program::is_registered(&name) {
        log::debug!("load: {}: no such program", name);
        return Err(LoadError::NoProgram);
    }

    // The filesystem lock brackets only the image reads; stack setup
    // below page-faults, and faulting with the lock held would let the
    // evictor's write-back path wait on us while we wait on the frame
    // table.
    {
        let _fs = fslock::Guard::new();
        let file = match fs::open(&name) {
            Some(f) => Arc::new(f),
            None => {
                log::debug!("load: {}: open failed", name);
                return Err(LoadError::Open);
            }
        };
        let file_len = file.length();

        let mut header = [0u8; HEADER_LEN];
        file.seek(0);
        read_exact(&file, &mut header)?;
        if &header[0..4] != IMAGE_MAGIC {
            return Err(LoadError::BadHeader);
        }
        let nsegs = word(&header, 4);
        if nsegs > MAX_SEGMENTS {
            return Err(LoadError::BadHeader);
        }

        let mut descs = vec![0u8; nsegs as usize * DESC_LEN];
        read_exact(&file, &mut descs)?;
        for i in 0..nsegs as usize {
            let at = i * DESC_LEN;
            let desc = SegmentDesc {
                vaddr: word(&descs, at),
                offset: word(&descs, at + 4),
                file_size: word(&descs, at + 8),
                mem_size: word(&descs, at + 12),
                writable: word(&descs, at + 16) != 0,
            };
            if !validate_segment(&desc, file_len) {
                return Err(LoadError::BadSegment);
            }
            let size = (desc.mem_size as u64).div_ceil(PGSIZE) * PGSIZE;
            let segment = process
                .spt
                .create_segment(VirtAddr::new(desc.vaddr as u64), desc.writable, size)
                .ok_or(LoadError::BadSegment)?;
            segment.set_file_data(file.clone(), desc.offset as u64, desc.file_size as u64, false);
        }

        // Writes to a running executable are denied until exit.
        file.deny_write();
        process.set_executable(file);
    }

    if !growth::init_stack(&process.spt) {
        return Err(LoadError::Stack);
    }
    // The first stack page is mapped eagerly; argument setup must not
    // depend on the growth heuristic.
    page::map_addr(&process.spt, &process.pagedir, PHYS_BASE - 1u64, false)
        .map_err(|_| LoadError::Stack)?;

    let esp = write_args(process, cmdline)?;
    Ok((name, esp))
}

/// Lays the command line out on the user stack. Returns the resulting
/// stack pointer, which points at the fake return address.
fn write_args(process: &Process, cmdline: &str) -> Result<VirtAddr, LoadError> {
    let tokens: Vec<&str> = cmdline.split_whitespace().collect();
    debug_assert!(!tokens.is_empty());
    let mut esp = PHYS_BASE;

    // Argument bytes, packed downward, NUL-terminated. Collected
    // addresses end up ordered argv[argc-1] .. argv[0].
    let mut argv_addrs: Vec<u32> = Vec::new();
    for token in tokens.iter().rev() {
        let mut bytes = token.as_bytes().to_vec();
        bytes.push(0);
        esp = esp - bytes.len() as u64;
        process.set_user_esp(esp);
        usermem::copy_to_user(process, esp, &bytes).map_err(|_| LoadError::Args)?;
        argv_addrs.push(esp.as_u64() as u32);
    }

    // Word-align, then the pointer array below it.
    esp = VirtAddr::new(esp.as_u64() & !7);
    let mut push = |esp: &mut VirtAddr, value: u32| -> Result<(), LoadError> {
        *esp = *esp - 4u64;
        process.set_user_esp(*esp);
        usermem::write_u32(process, *esp, value).map_err(|_| LoadError::Args)
    };
    push(&mut esp, 0)?; // argv[argc]
    for &addr in argv_addrs.iter() {
        push(&mut esp, addr)?;
    }
    let argv = esp.as_u64() as u32;
    push(&mut esp, argv)?;
    push(&mut esp, tokens.len() as u32)?;
    push(&mut esp, 0)?; // fake return address
    Ok(esp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_round_trips_through_builder() {
        let image = build_image(&[
            ImageSegment {
                vaddr: 0x8048000,
                data: b"code".to_vec(),
                mem_size: 4096,
                writable: false,
            },
            ImageSegment {
                vaddr: 0x8049000,
                data: b"rw".to_vec(),
                mem_size: 8192,
                writable: true,
            },
        ]);
        assert_eq!(&image[0..4], IMAGE_MAGIC);
        assert_eq!(word(&image, 4), 2);
        // First descriptor.
        assert_eq!(word(&image, 8), 0x8048000);
        let first_offset = word(&image, 12) as usize;
        assert_eq!(word(&image, 16), 4);
        assert_eq!(word(&image, 20), 4096);
        assert_eq!(word(&image, 24), 0);
        assert_eq!(&image[first_offset..first_offset + 4], b"code");
        // Second descriptor's data follows the first's.
        let second_offset = word(&image, 32) as usize;
        assert_eq!(second_offset, first_offset + 4);
        assert_eq!(&image[second_offset..second_offset + 2], b"rw");
        assert_eq!(word(&image, 44), 1);
    }

    #[test]
    fn segment_validation() {
        let len = 4096;
        let good = SegmentDesc {
            vaddr: 0x8048000,
            offset: 64,
            file_size: 100,
            mem_size: 200,
            writable: false,
        };
        assert!(validate_segment(&good, len));
        assert!(!validate_segment(
            &SegmentDesc {
                vaddr: 0x8048010,
                ..good
            },
            len
        ));
        assert!(!validate_segment(&SegmentDesc { mem_size: 0, ..good }, len));
        assert!(!validate_segment(
            &SegmentDesc {
                mem_size: 50,
                ..good
            },
            len
        ));
        assert!(!validate_segment(
            &SegmentDesc {
                offset: 4090,
                ..good
            },
            len
        ));
        assert!(!validate_segment(&SegmentDesc { vaddr: 0, ..good }, len));
        assert!(!validate_segment(
            &SegmentDesc {
                vaddr: 0xbfff_f000,
                mem_size: 0x2000,
                ..good
            },
            len
        ));
    }
}
