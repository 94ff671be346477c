//! Process lifecycle.
//!
//! One thread per process. A parent and child meet in a persistent
//! [`WaitRecord`]: it outlives whichever of them dies first, carries the
//! exit status and the wait semaphore, and is freed only when both
//! sides have released their reference (ref count 2 → 0). The same
//! semaphore serialises the exec rendezvous — the parent sleeps on it
//! until the child's loader reports success or failure — and the later
//! `wait`.

pub mod load;
pub mod mmap;
pub mod pagedir;
pub mod program;
pub mod syscall;
pub mod usermem;

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use conquer_once::spin::OnceCell;
use spin::{Mutex, RwLock};
use x86_64::VirtAddr;

use crate::fs::{self, lock as fslock};
use crate::kprintln;
use crate::threads::{self, sync::Semaphore, Tid};
use crate::vm::page::SuppPageTable;
use self::mmap::MmapTable;
use self::pagedir::Pagedir;

pub type Pid = Tid;

/// Exit status of a process terminated by the kernel, and the error
/// sentinel of most syscalls.
pub const EXIT_ABNORMAL: i32 = -1;

/// The parent/child rendezvous cell. Reachable records always have a
/// ref count of 1 or 2; dropping the last reference frees the wait
/// semaphore's slot.
pub struct WaitRecord {
    pid: Mutex<Pid>,
    sema: Semaphore,
    state: Mutex<RecordState>,
}

struct RecordState {
    status: i32,
    refs: u32,
    loaded: bool,
}

impl WaitRecord {
    fn new() -> WaitRecord {
        WaitRecord {
            pid: Mutex::new(0),
            sema: Semaphore::new(0),
            state: Mutex::new(RecordState {
                status: EXIT_ABNORMAL,
                refs: 2,
                loaded: false,
            }),
        }
    }

    fn pid(&self) -> Pid {
        *self.pid.lock()
    }

    fn status(&self) -> i32 {
        self.state.lock().status
    }
}

/// Drops one reference to a record, freeing its semaphore slot when the
/// record becomes unreachable.
fn release_record(record: &Arc<WaitRecord>) {
    let gone = {
        let mut state = record.state.lock();
        debug_assert!(state.refs > 0);
        state.refs -= 1;
        state.refs == 0
    };
    if gone {
        record.sema.free();
    }
}

/// A live process.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    pub pagedir: Arc<Pagedir>,
    pub spt: SuppPageTable,
    files: Mutex<FdTable>,
    children: Mutex<Vec<Arc<WaitRecord>>>,
    record: Arc<WaitRecord>,
    pub(crate) mmaps: Mutex<MmapTable>,
    /// Handle keeping writes to our executable denied while we run.
    executable: Mutex<Option<Arc<fs::File>>>,
    /// The user stack pointer, as of the last trap or simulated push.
    user_esp: Mutex<VirtAddr>,
}

struct FdTable {
    map: BTreeMap<i32, Arc<fs::File>>,
    next: i32,
}

impl Process {
    fn new(pid: Pid, name: &str, record: Arc<WaitRecord>) -> Process {
        Process {
            pid,
            name: name.to_string(),
            pagedir: Arc::new(Pagedir::new()),
            spt: SuppPageTable::new(),
            files: Mutex::new(FdTable {
                map: BTreeMap::new(),
                // 0 and 1 are reserved for stdin and stdout.
                next: 2,
            }),
            children: Mutex::new(Vec::new()),
            record,
            mmaps: Mutex::new(MmapTable::new()),
            executable: Mutex::new(None),
            user_esp: Mutex::new(VirtAddr::zero()),
        }
    }

    /// Files are keyed by small-integer descriptors; the counter only
    /// moves forward.
    pub(crate) fn add_file(&self, file: fs::File) -> i32 {
        let mut table = self.files.lock();
        let fd = table.next;
        table.next += 1;
        table.map.insert(fd, Arc::new(file));
        fd
    }

    pub(crate) fn get_file(&self, fd: i32) -> Option<Arc<fs::File>> {
        self.files.lock().map.get(&fd).cloned()
    }

    pub(crate) fn remove_file(&self, fd: i32) -> Option<Arc<fs::File>> {
        self.files.lock().map.remove(&fd)
    }

    pub(crate) fn user_esp(&self) -> VirtAddr {
        *self.user_esp.lock()
    }

    pub(crate) fn set_user_esp(&self, esp: VirtAddr) {
        *self.user_esp.lock() = esp;
    }

    pub(crate) fn set_executable(&self, file: Arc<fs::File>) {
        *self.executable.lock() = Some(file);
    }
}

static PROCESSES: OnceCell<RwLock<BTreeMap<Pid, Arc<Process>>>> = OnceCell::uninit();

fn table() -> &'static RwLock<BTreeMap<Pid, Arc<Process>>> {
    let _ = PROCESSES.try_init_once(|| RwLock::new(BTreeMap::new()));
    PROCESSES.get().expect("process table init failed")
}

/// Resets the process table and gives the calling (initial) thread a
/// process descriptor so it can exec and wait.
pub(crate) fn init() {
    table().write().clear();
    let pid = threads::current();
    let record = Arc::new(WaitRecord::new());
    *record.pid.lock() = pid;
    record.state.lock().refs = 1; // nobody waits for the initial process
    let process = Arc::new(Process::new(pid, "main", record));
    table().write().insert(pid, process);
    threads::set_current_process(Some(pid));
}

pub(crate) fn by_pid(pid: Pid) -> Option<Arc<Process>> {
    table().read().get(&pid).cloned()
}

/// The process owning the current thread.
///
/// # Panics
/// If the current thread has no process.
pub fn current_process() -> Arc<Process> {
    let pid = threads::current_process_id().expect("thread has no process");
    by_pid(pid).expect("current process vanished")
}

/// Runs `cmdline` as a new process and returns its pid, or `None` if
/// the thread cannot be created or the load fails. Blocks until the
/// child's loader has decided.
pub fn execute(cmdline: &str) -> Option<Pid> {
    // A private copy, so the caller and the loader cannot race on the
    // command string.
    let cmd = cmdline.trim().to_string();
    if cmd.is_empty() || cmd.len() > load::ARG_LIMIT {
        return None;
    }
    let name = cmd.split_whitespace().next()?.to_string();
    let parent = current_process();
    let record = Arc::new(WaitRecord::new());
    parent.children.lock().push(record.clone());

    let child_record = record.clone();
    let tid = threads::spawn(&name, threads::PRI_DEFAULT, move || {
        start_process(cmd, child_record)
    });
    *record.pid.lock() = tid;

    // Rendezvous with the loader.
    record.sema.down();
    if record.state.lock().loaded {
        Some(tid)
    } else {
        parent
            .children
            .lock()
            .retain(|r| !Arc::ptr_eq(r, &record));
        release_record(&record);
        None
    }
}

/// Thread body of a new process: build the address space, load the
/// executable, report to the parent, and enter user code.
fn start_process(cmd: String, record: Arc<WaitRecord>) {
    let pid = threads::current();
    let name = cmd.split_whitespace().next().unwrap_or("?").to_string();
    let process = Arc::new(Process::new(pid, &name, record.clone()));
    table().write().insert(pid, process.clone());
    threads::set_current_process(Some(pid));

    match load::load(&process, &cmd) {
        Ok((program, esp)) => {
            record.state.lock().loaded = true;
            record.sema.up();
            process.set_user_esp(esp);
            program::enter(&program, esp);
        }
        Err(e) => {
            log::debug!("load of {:?} failed: {:?}", name, e);
            record.state.lock().loaded = false;
            record.sema.up();
            exit(EXIT_ABNORMAL);
        }
    }
}

/// Waits for child `pid` to exit and returns its status. Returns the
/// abnormal status immediately if `pid` is not an un-waited child of
/// the caller.
pub fn wait(pid: Pid) -> i32 {
    let process = current_process();
    let record = {
        let children = process.children.lock();
        children.iter().find(|r| r.pid() == pid).cloned()
    };
    let Some(record) = record else {
        return EXIT_ABNORMAL;
    };
    record.sema.down();
    let status = record.status();
    process
        .children
        .lock()
        .retain(|r| !Arc::ptr_eq(r, &record));
    release_record(&record);
    status
}

/// Terminates the current process with `status`. Publishes the status,
/// wakes the parent, releases every resource, prints the exit line, and
/// kills the thread.
pub fn exit(status: i32) -> ! {
    let process = current_process();

    process.record.state.lock().status = status;
    process.record.sema.up();
    release_record(&process.record);

    // Close files: first re-allow writes on our executable, then drop
    // every descriptor.
    {
        let executable = process.executable.lock().take();
        let _fs = fslock::Guard::new();
        if let Some(file) = executable {
            file.allow_write();
        }
        process.files.lock().map.clear();
    }

    // Orphan the children; their records die with the later of us.
    for record in process.children.lock().drain(..) {
        release_record(&record);
    }

    // Tear down the address space: mmap write-back, frames, swap slots.
    mmap::remove_all(&process);
    process.spt.free_all(&process.pagedir);
    process.pagedir.destroy();

    kprintln!("{}: exit({})", process.name, status);

    table().write().remove(&process.pid);
    threads::set_current_process(None);
    threads::exit_thread();
}

/// Kills the current process on behalf of the kernel (bad pointer,
/// unservable fault).
pub(crate) fn kill_current() -> ! {
    exit(EXIT_ABNORMAL)
}

/// Sanity check used by tests: every reachable record's ref count is 1
/// or 2.
pub fn record_refs_check() {
    for process in table().read().values() {
        let own = process.record.state.lock().refs;
        assert!((1..=2).contains(&own), "own record refs {}", own);
        for child in process.children.lock().iter() {
            let refs = child.state.lock().refs;
            assert!((1..=2).contains(&refs), "child record refs {}", refs);
        }
    }
}
