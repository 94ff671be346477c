//! Virtual memory: demand paging, eviction through swap and files,
//! mmap, and stack growth, run with a deliberately small user pool so
//! the clock really turns.

mod common;

use x86_64::VirtAddr;

use kernel::init::BootOptions;
use kernel::userprog::program::UserCtx;
use kernel::userprog::{self, EXIT_ABNORMAL};
use kernel::vaddr::PGSIZE;
use kernel::{fs, threads, vm};

const DATA_LEN: usize = 16 * PGSIZE as usize; // twice the test pool

fn pattern(i: usize) -> u8 {
    (i.wrapping_mul(31) ^ (i >> 8)) as u8
}

fn small_pool() -> BootOptions {
    BootOptions {
        user_pages: 8,
        swap_slots: 64,
        ..BootOptions::default()
    }
}

/// Creates `name` holding `len` pattern bytes.
fn install_data_file(name: &str, len: usize) {
    let bytes: Vec<u8> = (0..len).map(pattern).collect();
    assert!(fs::create(name, len as u64));
    let file = fs::open(name).unwrap();
    assert_eq!(file.write(&bytes), len);
}

/// Maps "data", touches every page (evicting most of the pool), then
/// re-reads everything and checks it against the file pattern.
fn mmap_read_body(ctx: &mut UserCtx) -> i32 {
    let name = ctx.esp() - 64u64;
    ctx.write_cstr(name, "data");
    let fd = ctx.sys_open(name);
    if fd < 2 {
        return 1;
    }
    let base = VirtAddr::new(0x2000_0000);
    let id = ctx.sys_mmap(fd, base);
    if id < 0 {
        return 2;
    }
    let pages = DATA_LEN / PGSIZE as usize;
    for page in 0..pages {
        let at = page * PGSIZE as usize + 7;
        let mut byte = [0u8; 1];
        ctx.read_bytes(base + at as u64, &mut byte);
        if byte[0] != pattern(at) {
            return 3;
        }
    }
    // The pool is half this size, so the early pages were evicted;
    // their bytes must come back identical.
    for page in 0..pages {
        for offset in [0usize, 1234, PGSIZE as usize - 1] {
            let at = page * PGSIZE as usize + offset;
            let mut byte = [0u8; 1];
            ctx.read_bytes(base + at as u64, &mut byte);
            if byte[0] != pattern(at) {
                return 4;
            }
        }
    }
    ctx.sys_munmap(id);
    ctx.sys_close(fd);
    0
}

/// Writes a pattern through a mapping (dirtying twice the pool),
/// re-verifies through the mapping, then unmaps.
fn mmap_write_body(ctx: &mut UserCtx) -> i32 {
    let name = ctx.esp() - 64u64;
    ctx.write_cstr(name, "out");
    let fd = ctx.sys_open(name);
    if fd < 2 {
        return 1;
    }
    let base = VirtAddr::new(0x2000_0000);
    let id = ctx.sys_mmap(fd, base);
    if id < 0 {
        return 2;
    }
    for at in (0..DATA_LEN).step_by(64) {
        ctx.write_bytes(base + at as u64, &[pattern(at ^ 0x5a)]);
    }
    for at in (0..DATA_LEN).step_by(64) {
        let mut byte = [0u8; 1];
        ctx.read_bytes(base + at as u64, &mut byte);
        if byte[0] != pattern(at ^ 0x5a) {
            return 3;
        }
    }
    ctx.sys_munmap(id);
    ctx.sys_close(fd);
    0
}

/// Grows the stack across a dozen pages with pushes, then reads every
/// word back; the early pages have been through swap by then.
fn stack_swap_body(ctx: &mut UserCtx) -> i32 {
    let words = 12 * (PGSIZE as u64 / 4);
    let start = ctx.esp();
    for i in 0..words {
        ctx.push_u32(i as u32 ^ 0xa5a5_5a5a);
    }
    for i in 0..words {
        let addr = start - 4 * (i + 1);
        if ctx.read_u32(addr) != i as u32 ^ 0xa5a5_5a5a {
            return 1;
        }
    }
    0
}

/// One push just below the mapped stack page: the classic grow-on-push
/// fault.
fn push_grow_body(ctx: &mut UserCtx) -> i32 {
    // Walk esp down past the eagerly-mapped first page.
    let words = (PGSIZE as u64 / 4) + 8;
    for i in 0..words {
        ctx.push_u32(i as u32);
    }
    if ctx.read_u32(ctx.esp()) != words as u32 - 1 {
        return 1;
    }
    0
}

/// Touches the stack region far below esp; the heuristic must refuse
/// and the kernel must kill us.
fn wild_stack_body(ctx: &mut UserCtx) -> i32 {
    let far = ctx.esp() - 0x1_0000u64;
    ctx.write_u32(far, 1);
    99 // never reached
}

/// Every rejection the mmap validator owes us, then a munmap of an id
/// we never owned (ignored).
fn mmap_reject_body(ctx: &mut UserCtx) -> i32 {
    let name = ctx.esp() - 64u64;
    ctx.write_cstr(name, "data");
    let fd = ctx.sys_open(name);
    if fd < 2 {
        return 1;
    }
    let base = VirtAddr::new(0x3000_0000);
    if ctx.sys_mmap(0, base) != -1 {
        return 2;
    }
    if ctx.sys_mmap(1, base) != -1 {
        return 3;
    }
    if ctx.sys_mmap(fd, VirtAddr::new(0)) != -1 {
        return 4;
    }
    if ctx.sys_mmap(fd, base + 0x123u64) != -1 {
        return 5;
    }
    let id = ctx.sys_mmap(fd, base);
    if id < 0 {
        return 6;
    }
    if ctx.sys_mmap(fd, base) != -1 {
        return 7;
    }
    let empty = ctx.esp() - 96u64;
    ctx.write_cstr(empty, "empty");
    if !ctx.sys_create(empty, 0) {
        return 8;
    }
    let efd = ctx.sys_open(empty);
    if efd < 2 {
        return 9;
    }
    if ctx.sys_mmap(efd, VirtAddr::new(0x4000_0000)) != -1 {
        return 10;
    }
    ctx.sys_munmap(id);
    ctx.sys_munmap(4242);
    0
}

/// Maps a file of PGSIZE + 1 bytes: two pages, the second one byte of
/// file and the rest zero fill.
fn tail_zero_body(ctx: &mut UserCtx) -> i32 {
    let name = ctx.esp() - 64u64;
    ctx.write_cstr(name, "odd");
    let fd = ctx.sys_open(name);
    if fd < 2 {
        return 1;
    }
    let base = VirtAddr::new(0x5000_0000);
    let id = ctx.sys_mmap(fd, base);
    if id < 0 {
        return 2;
    }
    // The zero-fill tail of the second page.
    for offset in [1u64, 100, PGSIZE - 1] {
        let mut byte = [0u8; 1];
        ctx.read_bytes(base + PGSIZE + offset, &mut byte);
        if byte[0] != 0 {
            return 3;
        }
    }
    // Dirty both the in-file byte and the tail.
    ctx.write_bytes(base + PGSIZE, &[0xee]);
    ctx.write_bytes(base + PGSIZE + 500u64, &[0xdd]);
    ctx.sys_munmap(id);
    ctx.sys_close(fd);
    0
}

#[test]
fn evicted_file_pages_read_back_identical() {
    common::kernel_test(small_pool(), || {
        install_data_file("data", DATA_LEN);
        common::install_program("mmread", mmap_read_body);
        let pid = userprog::execute("mmread").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        vm::swap::self_check();
        threads::self_check();
    });
}

#[test]
fn dirty_mmap_pages_reach_the_file() {
    common::kernel_test(small_pool(), || {
        install_data_file("out", DATA_LEN);
        common::install_program("mmwrite", mmap_write_body);
        let pid = userprog::execute("mmwrite").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        // Between eviction write-back and munmap write-back, every
        // dirtied byte must have reached the file.
        let file = fs::open("out").unwrap();
        let mut bytes = vec![0u8; DATA_LEN];
        assert_eq!(file.read(&mut bytes), DATA_LEN);
        for at in (0..DATA_LEN).step_by(64) {
            assert_eq!(bytes[at], pattern(at ^ 0x5a), "offset {}", at);
        }
        vm::swap::self_check();
    });
}

#[test]
fn anonymous_pages_round_trip_through_swap() {
    common::kernel_test(small_pool(), || {
        common::install_program("stacker", stack_swap_body);
        let pid = userprog::execute("stacker").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        // Everything came back; the slots went back to the free list.
        vm::swap::self_check();
        threads::self_check();
    });
}

#[test]
fn stack_grows_under_pushes() {
    common::default_test(|| {
        common::install_program("pusher", push_grow_body);
        let pid = userprog::execute("pusher").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
    });
}

#[test]
fn faults_far_from_esp_kill_the_process() {
    common::default_test(|| {
        common::install_program("wild", wild_stack_body);
        let pid = userprog::execute("wild").expect("exec failed");
        assert_eq!(userprog::wait(pid), EXIT_ABNORMAL);
    });
}

#[test]
fn mmap_validation() {
    common::default_test(|| {
        install_data_file("data", DATA_LEN);
        common::install_program("mmreject", mmap_reject_body);
        let pid = userprog::execute("mmreject").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
    });
}

#[test]
fn mmap_tail_is_zero_and_not_written_back() {
    common::default_test(|| {
        install_data_file("odd", PGSIZE as usize + 1);
        common::install_program("tail", tail_zero_body);
        let pid = userprog::execute("tail").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        let file = fs::open("odd").unwrap();
        assert_eq!(file.length(), PGSIZE + 1);
        file.seek(PGSIZE);
        let mut byte = [0u8; 1];
        assert_eq!(file.read(&mut byte), 1);
        // The in-file byte of the second page came back dirty; the
        // tail had nowhere to go.
        assert_eq!(byte[0], 0xee);
    });
}

#[test]
fn frame_table_drains_after_process_exit() {
    common::kernel_test(small_pool(), || {
        install_data_file("data", DATA_LEN);
        common::install_program("mmread", mmap_read_body);
        let pid = userprog::execute("mmread").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        let (frames, pinned) = vm::frame::counts();
        assert_eq!(pinned, 0);
        assert_eq!(frames, 0, "user frames leaked after exit");
    });
}
