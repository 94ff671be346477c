//! Process lifecycle and system calls, driven through real user
//! address spaces and the syscall trap.

mod common;

use x86_64::VirtAddr;

use kernel::userprog::program::UserCtx;
use kernel::userprog::{self, EXIT_ABNORMAL};
use kernel::{console, threads};

/// Exits with the status given as argv[1].
fn child_body(ctx: &mut UserCtx) -> i32 {
    ctx.arg_strings()
        .get(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

/// Passes a kernel address to write(); the validator must kill us.
fn crasher_body(ctx: &mut UserCtx) -> i32 {
    ctx.sys_write(1, VirtAddr::new(0xc000_0000), 8);
    7 // never reached
}

/// Writes 300 bytes to the console in one call.
fn writer300_body(ctx: &mut UserCtx) -> i32 {
    let buf = ctx.esp() - 400u64;
    let bytes: Vec<u8> = (0..300).map(|i| b'a' + (i % 26) as u8).collect();
    ctx.write_bytes(buf, &bytes);
    if ctx.sys_write(1, buf, 300) != 300 {
        return 1;
    }
    0
}

/// Exercises the whole file descriptor surface; returns the number of
/// the first failing step.
fn filer_body(ctx: &mut UserCtx) -> i32 {
    let name = ctx.esp() - 64u64;
    ctx.write_cstr(name, "scratch");
    if !ctx.sys_create(name, 16) {
        return 1;
    }
    let fd = ctx.sys_open(name);
    if fd < 2 {
        return 2;
    }
    if ctx.sys_filesize(fd) != 16 {
        return 3;
    }
    let buf = ctx.esp() - 128u64;
    ctx.write_bytes(buf, b"abcdefgh");
    if ctx.sys_write(fd, buf, 8) != 8 {
        return 4;
    }
    if ctx.sys_tell(fd) != 8 {
        return 5;
    }
    ctx.sys_seek(fd, 2);
    if ctx.sys_tell(fd) != 2 {
        return 6;
    }
    let rbuf = ctx.esp() - 160u64;
    if ctx.sys_read(fd, rbuf, 6) != 6 {
        return 7;
    }
    let mut got = [0u8; 6];
    ctx.read_bytes(rbuf, &mut got);
    if &got != b"cdefgh" {
        return 8;
    }
    // Writing at end of file must not extend it.
    ctx.sys_seek(fd, 16);
    if ctx.sys_write(fd, buf, 4) != 0 {
        return 9;
    }
    if ctx.sys_filesize(fd) != 16 {
        return 10;
    }
    // Bad descriptors answer -1, not death.
    if ctx.sys_read(7777, rbuf, 1) != -1 {
        return 11;
    }
    if ctx.sys_write(7777, rbuf, 1) != -1 {
        return 12;
    }
    ctx.sys_close(fd);
    if !ctx.sys_remove(name) {
        return 13;
    }
    0
}

/// Reads from stdin and echoes to stdout.
fn reader_body(ctx: &mut UserCtx) -> i32 {
    let buf = ctx.esp() - 64u64;
    let n = ctx.sys_read(0, buf, 32);
    if n <= 0 {
        return 1;
    }
    ctx.sys_write(1, buf, n as u32);
    0
}

/// Checks the argument layout the loader builds.
fn args_body(ctx: &mut UserCtx) -> i32 {
    let (argc, _) = ctx.args();
    if argc != 4 {
        return 1;
    }
    if ctx.arg_strings() != ["args", "alpha", "beta-gamma", "42"] {
        return 2;
    }
    // The fake return address sits at esp.
    if ctx.read_u32(ctx.esp()) != 0 {
        return 3;
    }
    0
}

#[test]
fn exec_wait_round_trip() {
    common::default_test(|| {
        common::install_program("child", child_body);
        let pid = userprog::execute("child 42").expect("exec failed");
        assert_eq!(userprog::wait(pid), 42);
        // A second wait on the same child fails by lookup.
        assert_eq!(userprog::wait(pid), EXIT_ABNORMAL);
        userprog::record_refs_check();
        threads::self_check();
    });
}

#[test]
fn wait_on_a_stranger_fails_immediately() {
    common::default_test(|| {
        assert_eq!(userprog::wait(4242), EXIT_ABNORMAL);
    });
}

#[test]
fn exec_of_a_missing_program_fails() {
    common::default_test(|| {
        assert!(userprog::execute("no-such-binary 1").is_none());
        userprog::record_refs_check();
    });
}

#[test]
fn bad_pointer_kills_with_abnormal_status() {
    common::default_test(|| {
        let output = console::capture();
        common::install_program("crasher", crasher_body);
        let pid = userprog::execute("crasher").expect("exec failed");
        assert_eq!(userprog::wait(pid), EXIT_ABNORMAL);
        let text = String::from_utf8(output.lock().clone()).unwrap();
        assert!(text.contains("crasher: exit(-1)"), "{:?}", text);
    });
}

#[test]
fn console_writes_are_chunked_at_256() {
    common::default_test(|| {
        let output = console::capture();
        common::install_program("writer300", writer300_body);
        let pid = userprog::execute("writer300").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        assert_eq!(console::putbuf_sizes(), [256, 44]);
        let text = output.lock().clone();
        let expected: Vec<u8> = (0..300).map(|i| b'a' + (i % 26) as u8).collect();
        assert!(
            text.windows(expected.len()).any(|w| w == expected),
            "program bytes missing from console"
        );
    });
}

#[test]
fn file_descriptor_surface() {
    common::default_test(|| {
        common::install_program("filer", filer_body);
        let pid = userprog::execute("filer").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
    });
}

#[test]
fn stdin_reaches_user_buffers() {
    common::default_test(|| {
        let output = console::capture();
        for byte in b"hello" {
            assert!(console::input_push(*byte));
        }
        common::install_program("reader", reader_body);
        let pid = userprog::execute("reader").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
        let text = String::from_utf8(output.lock().clone()).unwrap();
        assert!(text.contains("hello"), "{:?}", text);
    });
}

#[test]
fn arguments_follow_the_stack_convention() {
    common::default_test(|| {
        common::install_program("args", args_body);
        let pid = userprog::execute("args alpha beta-gamma 42").expect("exec failed");
        assert_eq!(userprog::wait(pid), 0);
    });
}

#[test]
fn exit_line_names_the_process_and_status() {
    common::default_test(|| {
        let output = console::capture();
        common::install_program("child", child_body);
        let pid = userprog::execute("child 7").expect("exec failed");
        assert_eq!(userprog::wait(pid), 7);
        let text = String::from_utf8(output.lock().clone()).unwrap();
        assert!(text.contains("child: exit(7)\n"), "{:?}", text);
    });
}

#[test]
fn a_process_can_exec_and_wait_for_its_own_child() {
    common::default_test(|| {
        common::install_program("child", child_body);
        common::install_program("parent", parent_body);
        let pid = userprog::execute("parent").expect("exec failed");
        assert_eq!(userprog::wait(pid), 23);
        userprog::record_refs_check();
    });
}

/// Execs "child 23" and exits with the child's status.
fn parent_body(ctx: &mut UserCtx) -> i32 {
    let cmd = ctx.esp() - 64u64;
    ctx.write_cstr(cmd, "child 23");
    let pid = ctx.sys_exec(cmd);
    if pid < 0 {
        return -2;
    }
    ctx.sys_wait(pid)
}
