//! Kernel initialization.
//!
//! Parses the boot command line, brings the subsystems up in dependency
//! order, and turns the caller into the initial thread. `bootstrap` is
//! re-entrant: calling it again resets the whole kernel, which is how
//! the test suite gets a fresh machine per test.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::block::{self, MemDisk, Role};
use crate::vm::swap::SECTORS_PER_PAGE;
use crate::{console, fs, interrupt, kprintln, palloc, threads, timer, userprog, vm};

#[derive(Clone, Debug)]
pub struct BootOptions {
    /// `-mlfqs`: use the multi-level feedback queue scheduler.
    pub mlfqs: bool,
    /// `-q`: power off once the queued commands have run.
    pub quit: bool,
    /// `-f`: format the filesystem on boot.
    pub format: bool,
    /// `-ul=N`: pages in the user memory pool.
    pub user_pages: usize,
    /// Page slots on the swap device.
    pub swap_slots: u64,
}

impl Default for BootOptions {
    fn default() -> BootOptions {
        BootOptions {
            mlfqs: false,
            quit: false,
            // The backing store is volatile, so boot always starts from
            // a formatted filesystem.
            format: true,
            user_pages: 256,
            swap_slots: 256,
        }
    }
}

/// Parses boot command-line tokens into options and the queued `run`
/// commands.
pub fn parse_args<'a>(args: impl IntoIterator<Item = &'a str>) -> (BootOptions, Vec<String>) {
    let mut options = BootOptions::default();
    let mut commands = Vec::new();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg {
            "-mlfqs" => options.mlfqs = true,
            "-q" => options.quit = true,
            "-f" => options.format = true,
            "run" => match args.next() {
                Some(cmd) => commands.push(cmd.to_string()),
                None => log::warn!("run option without a command"),
            },
            _ => {
                if let Some(n) = arg.strip_prefix("-ul=") {
                    match n.parse() {
                        Ok(pages) if pages > 0 => options.user_pages = pages,
                        _ => log::warn!("bad user limit {:?}", n),
                    }
                } else {
                    log::warn!("unknown boot option {:?}", arg);
                }
            }
        }
    }
    (options, commands)
}

/// Brings the kernel up (or back up) and enables interrupts. On
/// return the caller is the running "main" thread with a process
/// descriptor, and the idle thread exists.
pub fn bootstrap(options: &BootOptions) {
    interrupt::reset();
    timer::reset();
    console::reset();

    // The scheduler first: every lock below lives in its arena.
    threads::init(options.mlfqs);

    palloc::init(options.user_pages);
    block::reset();
    block::register(
        Role::Swap,
        Arc::new(MemDisk::new(options.swap_slots * SECTORS_PER_PAGE)),
    );
    vm::swap::init();
    vm::frame::init();

    if options.format {
        fs::format();
    }
    fs::lock::init();

    userprog::init();
    userprog::program::reset();

    threads::start_idle();
    interrupt::enable();
}

/// Runs one queued command to completion and returns its exit status.
pub fn run_command(cmd: &str) -> i32 {
    kprintln!("Executing '{}':", cmd);
    match userprog::execute(cmd) {
        Some(pid) => userprog::wait(pid),
        None => {
            kprintln!("Execution of '{}' failed", cmd);
            -1
        }
    }
}

/// Prints the tick statistics the kernel kept while running.
pub fn print_stats() {
    let stats = threads::stats();
    kprintln!(
        "Timer: {} ticks; Thread: {} idle ticks, {} kernel ticks, {} user ticks",
        timer::ticks(),
        stats.idle_ticks,
        stats.kernel_ticks,
        stats.user_ticks
    );
}

static POWER_OFF: Mutex<Option<fn() -> !>> = Mutex::new(None);

/// Installs the embedding's power-off routine.
pub fn set_power_off(hook: fn() -> !) {
    *POWER_OFF.lock() = Some(hook);
}

/// Powers the machine off.
pub fn power_off() -> ! {
    print_stats();
    let hook = *POWER_OFF.lock();
    match hook {
        Some(hook) => hook(),
        None => {
            log::error!("no power-off hook; spinning");
            loop {
                core::hint::spin_loop();
            }
        }
    }
}
