//! User program bodies.
//!
//! Real user-mode entry (segment reload, iret) lives outside this
//! crate; here a program is a registered function that stands in for
//! the machine code of its executable image. A body runs on the
//! process's thread and touches the world exactly the way user code
//! would: through its user address space (faulting pages in on first
//! touch) and through the system-call trap. If a body returns, its
//! runtime exits with the returned code, like a C runtime calling
//! `exit(main(...))`.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use spin::RwLock;
use x86_64::VirtAddr;

use super::{syscall, usermem};
use crate::vm::Fault;

pub type ProgramBody = fn(&mut UserCtx) -> i32;

static PROGRAMS: RwLock<BTreeMap<String, ProgramBody>> = RwLock::new(BTreeMap::new());

/// Registers (or replaces) the body run for executables named `name`.
pub fn register(name: &str, body: ProgramBody) {
    PROGRAMS.write().insert(name.to_string(), body);
}

pub(crate) fn is_registered(name: &str) -> bool {
    PROGRAMS.read().contains_key(name)
}

pub(crate) fn reset() {
    PROGRAMS.write().clear();
}

/// The user-visible machine state of a running program: its stack
/// pointer, plus accessors that behave like user loads and stores —
/// including being killed for touching memory the process does not
/// own.
pub struct UserCtx {
    esp: VirtAddr,
}

impl UserCtx {
    pub fn esp(&self) -> VirtAddr {
        self.esp
    }

    /// Moves the stack pointer, as the program's own stack arithmetic
    /// would.
    pub fn set_esp(&mut self, esp: VirtAddr) {
        self.esp = esp;
        super::current_process().set_user_esp(esp);
    }

    fn die(&self) -> ! {
        super::kill_current()
    }

    fn check<T>(&self, r: Result<T, Fault>) -> T {
        match r {
            Ok(v) => v,
            Err(Fault) => self.die(),
        }
    }

    pub fn read_u32(&self, va: VirtAddr) -> u32 {
        self.check(usermem::read_u32(&super::current_process(), va))
    }

    pub fn write_u32(&self, va: VirtAddr, value: u32) {
        self.check(usermem::write_u32(&super::current_process(), va, value))
    }

    pub fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) {
        self.check(usermem::copy_from_user(&super::current_process(), va, buf))
    }

    pub fn write_bytes(&self, va: VirtAddr, bytes: &[u8]) {
        self.check(usermem::copy_to_user(&super::current_process(), va, bytes))
    }

    /// Writes a NUL-terminated string into user memory.
    pub fn write_cstr(&self, va: VirtAddr, s: &str) {
        self.write_bytes(va, s.as_bytes());
        self.write_bytes(va + s.len() as u64, &[0]);
    }

    /// A push: decrement esp, then store through it. The store may
    /// fault into stack growth.
    pub fn push_u32(&mut self, value: u32) {
        self.set_esp(self.esp - 4u64);
        self.write_u32(self.esp, value);
    }

    /// Traps into the kernel with `nr` and `args` laid out on the user
    /// stack per the syscall ABI: the number at esp, arguments above
    /// it.
    pub fn syscall(&mut self, nr: u32, args: &[u32]) -> i32 {
        let saved = self.esp;
        for &arg in args.iter().rev() {
            self.push_u32(arg);
        }
        self.push_u32(nr);
        let result = syscall::trap(self.esp);
        self.set_esp(saved);
        result
    }

    pub fn sys_halt(&mut self) -> ! {
        self.syscall(syscall::nr::HALT, &[]);
        unreachable!("halt returned")
    }

    pub fn sys_exit(&mut self, status: i32) -> ! {
        self.syscall(syscall::nr::EXIT, &[status as u32]);
        unreachable!("exit returned")
    }

    pub fn sys_exec(&mut self, cmd: VirtAddr) -> i32 {
        self.syscall(syscall::nr::EXEC, &[cmd.as_u64() as u32])
    }

    pub fn sys_wait(&mut self, pid: i32) -> i32 {
        self.syscall(syscall::nr::WAIT, &[pid as u32])
    }

    pub fn sys_create(&mut self, name: VirtAddr, size: u32) -> bool {
        self.syscall(syscall::nr::CREATE, &[name.as_u64() as u32, size]) != 0
    }

    pub fn sys_remove(&mut self, name: VirtAddr) -> bool {
        self.syscall(syscall::nr::REMOVE, &[name.as_u64() as u32]) != 0
    }

    pub fn sys_open(&mut self, name: VirtAddr) -> i32 {
        self.syscall(syscall::nr::OPEN, &[name.as_u64() as u32])
    }

    pub fn sys_filesize(&mut self, fd: i32) -> i32 {
        self.syscall(syscall::nr::FILESIZE, &[fd as u32])
    }

    pub fn sys_read(&mut self, fd: i32, buf: VirtAddr, n: u32) -> i32 {
        self.syscall(syscall::nr::READ, &[fd as u32, buf.as_u64() as u32, n])
    }

    pub fn sys_write(&mut self, fd: i32, buf: VirtAddr, n: u32) -> i32 {
        self.syscall(syscall::nr::WRITE, &[fd as u32, buf.as_u64() as u32, n])
    }

    pub fn sys_seek(&mut self, fd: i32, pos: u32) {
        self.syscall(syscall::nr::SEEK, &[fd as u32, pos]);
    }

    pub fn sys_tell(&mut self, fd: i32) -> i32 {
        self.syscall(syscall::nr::TELL, &[fd as u32])
    }

    pub fn sys_close(&mut self, fd: i32) {
        self.syscall(syscall::nr::CLOSE, &[fd as u32]);
    }

    pub fn sys_mmap(&mut self, fd: i32, addr: VirtAddr) -> i32 {
        self.syscall(syscall::nr::MMAP, &[fd as u32, addr.as_u64() as u32])
    }

    pub fn sys_munmap(&mut self, mapid: i32) {
        self.syscall(syscall::nr::MUNMAP, &[mapid as u32]);
    }

    /// Reads argc and argv (as user addresses) from the entry stack.
    pub fn args(&self) -> (u32, Vec<VirtAddr>) {
        let argc = self.read_u32(self.esp + 4u64);
        let argv = VirtAddr::new(self.read_u32(self.esp + 8u64) as u64);
        let mut addrs = Vec::new();
        for i in 0..argc {
            addrs.push(VirtAddr::new(self.read_u32(argv + 4 * i as u64) as u64));
        }
        (argc, addrs)
    }

    /// Reads argv strings from the entry stack.
    pub fn arg_strings(&self) -> Vec<String> {
        let process = super::current_process();
        self.args()
            .1
            .into_iter()
            .map(|a| self.check(usermem::read_cstr(&process, a, super::load::ARG_LIMIT)))
            .collect()
    }
}

/// Enters "user mode": runs the registered body for `name` and exits
/// with whatever it returns.
pub(crate) fn enter(name: &str, esp: VirtAddr) -> ! {
    let body = PROGRAMS
        .read()
        .get(name)
        .copied()
        .expect("loader verified registration");
    let mut ctx = UserCtx { esp };
    let code = body(&mut ctx);
    ctx.sys_exit(code)
}
