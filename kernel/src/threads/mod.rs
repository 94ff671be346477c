//! Thread core and scheduler.
//!
//! Threads live in an arena keyed by [`Tid`] inside one scheduler cell.
//! Back-references — which lock a thread waits on, which thread holds a
//! lock — are handles into that arena rather than pointers, which keeps
//! the waits-for graph walkable without aliasing games. The cell itself
//! is guarded by the interrupt level: it may only be entered with
//! interrupts off, and never reentrantly (a debug flag enforces this).
//!
//! Two schedulers share the thread core. The default is round-robin over
//! a single priority-ordered ready list with priority donation through
//! locks; `-mlfqs` switches to the multi-level feedback queue scheduler
//! in [`mlfqs`].

pub mod mlfqs;
mod switch;
pub mod sync;

use alloc::borrow::ToOwned;
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use conquer_once::spin::OnceCell;

use crate::fixed_point::Fixed;
use crate::interrupt::{self, Level};
use self::switch::Context;
use self::sync::{CondSlot, LockSlot, SemSlot, Slots};

pub type Tid = u32;

pub const PRI_MIN: i32 = 0;
pub const PRI_DEFAULT: i32 = 31;
pub const PRI_MAX: i32 = 63;

pub const NICE_MIN: i32 = -20;
pub const NICE_MAX: i32 = 20;

/// Timer ticks each thread gets before the tick handler requests a yield.
const TIME_SLICE: u32 = 4;

/// Consecutive schedules of the idle thread before the kernel concludes
/// that every other thread is blocked. The timer is driven by running
/// threads, so once idle is the only runnable thread nothing can ever
/// wake the others.
const IDLE_DEADLOCK_SPINS: u64 = 1 << 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Running,
    Ready,
    Blocked,
    Dying,
}

/// What a blocked thread is waiting on, as a handle into the sync-object
/// arena. Donation and wake-order maintenance walk these edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WaitsFor {
    Nothing,
    Sema(usize),
    Lock(usize),
    Cond(usize),
}

struct Thread {
    tid: Tid,
    name: String,
    status: Status,
    /// Base priority under round-robin; the computed priority under MLFQS.
    priority: i32,
    nice: i32,
    recent_cpu: Fixed,
    /// Locks held, sorted by cached donated priority, highest first.
    held_locks: Vec<usize>,
    blocker: WaitsFor,
    /// Kernel stack; `None` only for the bootstrap thread, which keeps
    /// running on the stack it was born with.
    kstack: Option<Box<[u64]>>,
    context: Context,
    entry: Option<Box<dyn FnOnce() + Send>>,
    /// Owning process, if this thread runs user code.
    process: Option<Tid>,
}

impl Thread {
    fn new(tid: Tid, name: &str, priority: i32) -> Thread {
        Thread {
            tid,
            name: name.to_owned(),
            status: Status::Blocked,
            priority,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            held_locks: Vec::new(),
            blocker: WaitsFor::Nothing,
            kstack: None,
            context: Context::default(),
            entry: None,
            process: None,
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct Stats {
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
}

struct Sched {
    threads: BTreeMap<Tid, Thread>,
    /// Round-robin ready list, ordered by effective priority, FIFO among
    /// equals. Unused under MLFQS.
    ready: VecDeque<Tid>,
    mlfqs: Option<mlfqs::Mlfqs>,
    sems: Slots<SemSlot>,
    locks: Slots<LockSlot>,
    conds: Slots<CondSlot>,
    current: Tid,
    /// Thread picked by `schedule`, consumed by the switch finish hook.
    next: Option<Tid>,
    idle: Option<Tid>,
    initial: Tid,
    next_tid: Tid,
    slice: u32,
    stats: Stats,
}

impl Sched {
    fn new(mlfqs_enabled: bool) -> Sched {
        Sched {
            threads: BTreeMap::new(),
            ready: VecDeque::new(),
            mlfqs: if mlfqs_enabled {
                Some(mlfqs::Mlfqs::new())
            } else {
                None
            },
            sems: Slots::new(),
            locks: Slots::new(),
            conds: Slots::new(),
            current: 0,
            next: None,
            idle: None,
            initial: 0,
            next_tid: 1,
            slice: 0,
            stats: Stats::default(),
        }
    }

    fn allocate_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn thread(&self, tid: Tid) -> &Thread {
        self.threads.get(&tid).expect("no such thread")
    }

    fn thread_mut(&mut self, tid: Tid) -> &mut Thread {
        self.threads.get_mut(&tid).expect("no such thread")
    }

    fn is_idle(&self, tid: Tid) -> bool {
        self.idle == Some(tid)
    }

    /// Effective priority: the base priority, raised by the highest cached
    /// donation among held locks.
    fn effective_priority(&self, tid: Tid) -> i32 {
        let t = self.thread(tid);
        let donated = t
            .held_locks
            .first()
            .map(|&l| self.locks.get(l).priority)
            .unwrap_or(PRI_MIN);
        t.priority.max(donated)
    }

    /// Inserts a ready thread into the ready structure for the active
    /// scheduler.
    fn add_ready(&mut self, tid: Tid) {
        debug_assert_eq!(self.thread(tid).status, Status::Ready);
        if self.mlfqs.is_some() {
            let priority = self.thread(tid).priority;
            debug_assert!((PRI_MIN..=PRI_MAX).contains(&priority));
            self.mlfqs.as_mut().unwrap().ready[priority as usize].push_back(tid);
        } else {
            let priority = self.effective_priority(tid);
            let mut at = self.ready.len();
            for i in 0..self.ready.len() {
                if self.effective_priority(self.ready[i]) < priority {
                    at = i;
                    break;
                }
            }
            self.ready.insert(at, tid);
        }
    }

    /// Removes a thread from whichever ready structure holds it.
    fn remove_ready(&mut self, tid: Tid) {
        if let Some(m) = &mut self.mlfqs {
            for queue in m.ready.iter_mut() {
                if let Some(i) = queue.iter().position(|&t| t == tid) {
                    queue.remove(i);
                    return;
                }
            }
            panic!("ready thread missing from MLFQS queues");
        } else {
            let i = self
                .ready
                .iter()
                .position(|&t| t == tid)
                .expect("ready thread missing from ready list");
            self.ready.remove(i);
        }
    }

    /// Pops the next thread to run, or falls back to idle.
    fn next_thread_to_run(&mut self) -> Tid {
        let popped = if let Some(m) = &mut self.mlfqs {
            let mut found = None;
            for priority in (PRI_MIN..=PRI_MAX).rev() {
                if let Some(tid) = m.ready[priority as usize].pop_front() {
                    found = Some(tid);
                    break;
                }
            }
            found
        } else {
            self.ready.pop_front()
        };
        popped.unwrap_or_else(|| self.idle.expect("no idle thread"))
    }

    /// Priority of the best thread waiting to run, if any.
    fn top_ready_priority(&self) -> Option<i32> {
        if let Some(m) = &self.mlfqs {
            (PRI_MIN..=PRI_MAX)
                .rev()
                .find(|&p| !m.ready[p as usize].is_empty())
        } else {
            self.ready.front().map(|&t| self.effective_priority(t))
        }
    }

    /// Does a ready thread outrank the running one?
    fn preemption_needed(&self) -> bool {
        match self.top_ready_priority() {
            Some(p) => p > self.effective_priority(self.current),
            None => false,
        }
    }

    fn unblock(&mut self, tid: Tid) {
        let t = self.thread_mut(tid);
        assert_eq!(t.status, Status::Blocked, "unblock of a non-blocked thread");
        t.status = Status::Ready;
        t.blocker = WaitsFor::Nothing;
        self.add_ready(tid);
    }

    /// Re-sorts a thread within its current container without telling the
    /// container's owner.
    fn silent_reorder(&mut self, tid: Tid) {
        match self.thread(tid).blocker {
            WaitsFor::Sema(sid) => {
                let waiters = &mut self.sems.get_mut(sid).waiters;
                let i = waiters
                    .iter()
                    .position(|&t| t == tid)
                    .expect("waiter missing from semaphore");
                waiters.remove(i);
                self.sema_waiter_insert(sid, tid);
            }
            _ => panic!("silent reorder outside a semaphore"),
        }
    }

    /// A thread that is not blocked had its priority changed: keep the
    /// ready structure sorted. Preemption is the caller's business once
    /// the state has settled.
    fn thread_update(&mut self, tid: Tid) {
        if tid != self.current && self.thread(tid).status == Status::Ready {
            self.remove_ready(tid);
            self.add_ready(tid);
        }
    }

    /// Propagates a priority change of `tid` to whatever it blocks on.
    ///
    /// Semaphores and condition variables just re-sort their waiters. A
    /// lock additionally refreshes its cached donation and pushes the
    /// change through its holder, which may cascade further down the
    /// waits-for chain.
    fn notify_blocker(&mut self, tid: Tid) {
        match self.thread(tid).blocker {
            WaitsFor::Sema(_) => self.silent_reorder(tid),
            WaitsFor::Lock(lid) => self.lock_waiter_changed(lid, tid),
            WaitsFor::Cond(cid) => self.cond_resort(cid),
            WaitsFor::Nothing => self.thread_update(tid),
        }
    }

    /// Re-files `lid` in `holder`'s held-lock list after the lock's cached
    /// priority changed, cascading if the holder's effective priority
    /// moved.
    fn holder_reinsert_lock(&mut self, holder: Tid, lid: usize) {
        let previous = self.effective_priority(holder);
        let held = &mut self.thread_mut(holder).held_locks;
        let i = held
            .iter()
            .position(|&l| l == lid)
            .expect("lock missing from holder's held list");
        let was_first = i == 0;
        held.remove(i);
        self.thread_add_lock(holder, lid);

        let lock_priority = self.locks.get(lid).priority;
        // Only a change in the holder's effective priority is worth
        // propagating.
        if self.mlfqs.is_none()
            && ((was_first && previous != lock_priority)
                || (!was_first && previous < lock_priority))
        {
            self.notify_blocker(holder);
        }
    }

    /// Inserts `lid` into `tid`'s held-lock list, ordered by cached
    /// priority, highest first, after equals.
    fn thread_add_lock(&mut self, tid: Tid, lid: usize) {
        let priority = self.locks.get(lid).priority;
        let held = &self.thread(tid).held_locks;
        let mut at = held.len();
        for (i, &l) in held.iter().enumerate() {
            if self.locks.get(l).priority < priority {
                at = i;
                break;
            }
        }
        self.thread_mut(tid).held_locks.insert(at, lid);
    }

    fn check_stack_magic(&self, tid: Tid) {
        if let Some(ks) = &self.thread(tid).kstack {
            assert_eq!(
                ks[0],
                switch::THREAD_MAGIC,
                "thread {:?} overflowed its kernel stack",
                self.thread(tid).name
            );
        }
    }

    /// Kernel self-check of the scheduler invariants. Cheap enough to run
    /// from tests at quiescent points.
    fn self_check(&self) {
        let mut seen: BTreeMap<Tid, usize> = BTreeMap::new();
        if let Some(m) = &self.mlfqs {
            for (priority, queue) in m.ready.iter().enumerate() {
                for &tid in queue {
                    *seen.entry(tid).or_default() += 1;
                    assert_eq!(self.thread(tid).priority as usize, priority);
                }
            }
        } else {
            for i in 0..self.ready.len() {
                *seen.entry(self.ready[i]).or_default() += 1;
                if i > 0 {
                    assert!(
                        self.effective_priority(self.ready[i - 1])
                            >= self.effective_priority(self.ready[i]),
                        "ready list out of order"
                    );
                }
            }
        }
        for (&tid, t) in &self.threads {
            assert_eq!(t.tid, tid, "thread keyed under the wrong tid");
            let occurrences = seen.get(&tid).copied().unwrap_or(0);
            match t.status {
                Status::Ready => assert_eq!(
                    occurrences, 1,
                    "ready thread {} in {} ready slots",
                    tid, occurrences
                ),
                _ => assert_eq!(occurrences, 0, "non-ready thread {} queued", tid),
            }
        }
        // Donation runs only under round robin; MLFQS leaves the caches
        // at the floor.
        if self.mlfqs.is_none() {
            for slot in self.locks.iter() {
                let top = self
                    .sems
                    .get(slot.sema)
                    .waiters
                    .first()
                    .map(|&t| self.effective_priority(t))
                    .unwrap_or(PRI_MIN);
                assert_eq!(slot.priority, top, "stale cached lock priority");
            }
        }
    }
}

struct SchedCell {
    inner: UnsafeCell<Sched>,
    borrowed: AtomicBool,
}

// Every access happens with interrupts off on a single processor; the
// borrow flag catches reentry.
unsafe impl Sync for SchedCell {}

static SCHED: OnceCell<SchedCell> = OnceCell::uninit();

struct BorrowGuard(&'static AtomicBool);

impl Drop for BorrowGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs `f` with exclusive access to the scheduler state. Requires
/// interrupts off; must not be entered reentrantly, and the borrow must
/// not be held across a context switch.
fn with_sched<R>(f: impl FnOnce(&mut Sched) -> R) -> R {
    debug_assert_eq!(
        interrupt::get_level(),
        Level::Off,
        "scheduler state touched with interrupts on"
    );
    let cell = SCHED.get().expect("threads::init has not run");
    assert!(
        !cell.borrowed.swap(true, Ordering::Acquire),
        "scheduler state reentered"
    );
    let guard = BorrowGuard(&cell.borrowed);
    let r = f(unsafe { &mut *cell.inner.get() });
    drop(guard);
    r
}

/// Initializes the thread system, transforming the caller into the
/// "main" thread. Interrupts must be off. Safe to call again to reset
/// the whole scheduler; any threads from a previous life are forgotten.
pub(crate) fn init(mlfqs_enabled: bool) {
    assert_eq!(interrupt::get_level(), Level::Off);
    SCHED
        .try_init_once(|| SchedCell {
            inner: UnsafeCell::new(Sched::new(mlfqs_enabled)),
            borrowed: AtomicBool::new(false),
        })
        .ok();
    with_sched(|s| {
        *s = Sched::new(mlfqs_enabled);
        let tid = s.allocate_tid();
        let mut main = Thread::new(tid, "main", PRI_DEFAULT);
        main.status = Status::Running;
        s.threads.insert(tid, main);
        s.current = tid;
        s.initial = tid;
    });
}

/// Creates the idle thread and waits for it to announce itself. Called
/// once interrupts can be enabled.
pub(crate) fn start_idle() {
    let started = sync::Semaphore::new(0);
    spawn("idle", PRI_MIN, move || idle_loop(started));
    started.down();
    started.free();
}

fn idle_loop(started: sync::Semaphore) {
    let old = interrupt::disable();
    with_sched(|s| s.idle = Some(s.current));
    interrupt::set_level(old);
    started.up();

    let mut respins = 0u64;
    loop {
        interrupt::disable();
        block();
        // Only picked again when no other thread is runnable. The timer
        // fires from running threads, so a long run of re-picks means
        // nothing can ever wake the rest of the system.
        respins += 1;
        assert!(
            respins < IDLE_DEADLOCK_SPINS,
            "idle rescheduled {} times: all threads are blocked",
            respins
        );
        interrupt::enable();
        core::hint::spin_loop();
    }
}

/// Creates a new kernel thread running `body` and makes it ready. If the
/// new thread outranks the caller it runs before `spawn` returns.
pub fn spawn(name: &str, priority: i32, body: impl FnOnce() + Send + 'static) -> Tid {
    assert!(
        (PRI_MIN..=PRI_MAX).contains(&priority),
        "priority out of range"
    );
    let old = interrupt::disable();
    let tid = with_sched(|s| {
        let tid = s.allocate_tid();
        let mut t = Thread::new(tid, name, priority);
        t.entry = Some(Box::new(body));
        switch::seed_stack(&mut t);
        t.status = Status::Ready;
        s.threads.insert(tid, t);
        s.add_ready(tid);
        tid
    });
    give_way();
    interrupt::set_level(old);
    tid
}

/// Yields to a ready thread if one outranks the current thread. From an
/// external handler this only requests a yield on return.
pub(crate) fn give_way() {
    let old = interrupt::disable();
    if with_sched(|s| s.preemption_needed()) {
        if interrupt::in_external() {
            interrupt::yield_on_return();
        } else {
            do_yield();
        }
    }
    interrupt::set_level(old);
}

/// Yields the processor. The current thread stays runnable.
pub fn yield_now() {
    assert!(!interrupt::in_external(), "cannot yield from a handler");
    let old = interrupt::disable();
    do_yield();
    interrupt::set_level(old);
}

fn do_yield() {
    with_sched(|s| {
        let cur = s.current;
        if s.is_idle(cur) {
            // Idle never queues; the scheduler falls back to it.
            s.thread_mut(cur).status = Status::Blocked;
        } else {
            s.thread_mut(cur).status = Status::Ready;
            s.add_ready(cur);
        }
    });
    schedule();
}

/// Blocks the current thread until `unblock`. Interrupts must be off.
pub(crate) fn block() {
    assert!(!interrupt::in_external(), "cannot block from a handler");
    assert_eq!(interrupt::get_level(), Level::Off);
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).status = Status::Blocked;
    });
    schedule();
}

/// Deschedules and destroys the current thread. The thread's resources
/// are freed by its successor.
pub fn exit_thread() -> ! {
    assert!(!interrupt::in_external());
    interrupt::disable();
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).status = Status::Dying;
    });
    schedule();
    unreachable!("a dying thread was rescheduled");
}

/// Picks the next thread and switches to it. At entry interrupts are off
/// and the current thread has already left the `Running` state.
fn schedule() {
    debug_assert_eq!(interrupt::get_level(), Level::Off);
    debug_assert!(!interrupt::in_external());
    let switch_pair = with_sched(|s| {
        let cur = s.current;
        debug_assert_ne!(s.thread(cur).status, Status::Running);
        s.check_stack_magic(cur);
        let next = s.next_thread_to_run();
        if next == cur {
            s.thread_mut(cur).status = Status::Running;
            s.slice = 0;
            None
        } else {
            s.next = Some(next);
            let prev: *mut Context = &mut s.thread_mut(cur).context;
            let next_ctx = s.thread(next).context.clone();
            Some((prev, next_ctx))
        }
    });
    if let Some((prev, next_ctx)) = switch_pair {
        unsafe { switch::switch_threads(prev, &next_ctx) };
        // Execution resumes here the next time this thread is picked;
        // the finish hook has already completed the switch on our behalf.
    }
}

/// Completes a switch on the new thread's stack: marks it running,
/// starts a fresh slice, and destroys the predecessor if it was dying.
fn schedule_tail() {
    with_sched(|s| {
        let prev = s.current;
        let next = s.next.take().expect("switch without a chosen thread");
        s.current = next;
        s.slice = 0;
        s.thread_mut(next).status = Status::Running;
        let destroy = match s.threads.get(&prev) {
            Some(t) => t.status == Status::Dying && prev != s.initial,
            None => false,
        };
        if destroy {
            // Dropping the record frees the thread's kernel stack; we are
            // already running on the successor's.
            s.threads.remove(&prev);
        }
    });
}

/// Timer tick bookkeeping. Runs in external-interrupt context.
pub(crate) fn tick() {
    debug_assert!(interrupt::in_external());
    let request_yield = with_sched(|s| {
        let cur = s.current;
        if s.is_idle(cur) {
            s.stats.idle_ticks += 1;
        } else if s.thread(cur).process.is_some() {
            s.stats.user_ticks += 1;
        } else {
            s.stats.kernel_ticks += 1;
        }
        let mut wants_yield = false;
        if s.mlfqs.is_some() {
            s.mlfqs_tick();
            wants_yield = true;
        }
        s.slice += 1;
        if s.slice >= TIME_SLICE {
            wants_yield = true;
        }
        wants_yield
    });
    if request_yield {
        interrupt::yield_on_return();
    }
}

pub fn current() -> Tid {
    let old = interrupt::disable();
    let tid = with_sched(|s| s.current);
    interrupt::set_level(old);
    tid
}

pub fn name() -> String {
    let old = interrupt::disable();
    let name = with_sched(|s| s.thread(s.current).name.clone());
    interrupt::set_level(old);
    name
}

/// Sets the current thread's base priority. Ignored under MLFQS.
pub fn set_priority(priority: i32) {
    let tid = current();
    set_priority_of(tid, priority);
}

/// Sets the base priority of any thread, propagating the change through
/// its blocker and preempting if a ready thread now outranks the runner.
pub fn set_priority_of(tid: Tid, priority: i32) {
    assert!((PRI_MIN..=PRI_MAX).contains(&priority));
    let old = interrupt::disable();
    let changed = with_sched(|s| {
        if s.mlfqs.is_some() || s.thread(tid).priority == priority {
            false
        } else {
            s.thread_mut(tid).priority = priority;
            s.notify_blocker(tid);
            true
        }
    });
    if changed {
        give_way();
    }
    interrupt::set_level(old);
}

/// The current thread's effective priority.
pub fn get_priority() -> i32 {
    let old = interrupt::disable();
    let p = with_sched(|s| s.effective_priority(s.current));
    interrupt::set_level(old);
    p
}

pub fn get_priority_of(tid: Tid) -> i32 {
    let old = interrupt::disable();
    let p = with_sched(|s| s.effective_priority(tid));
    interrupt::set_level(old);
    p
}

/// Sets the current thread's nice value and recomputes its MLFQS
/// priority.
pub fn set_nice(nice: i32) {
    assert!((NICE_MIN..=NICE_MAX).contains(&nice));
    let old = interrupt::disable();
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).nice = nice;
        if s.mlfqs.is_some() {
            s.mlfqs_update_priority(cur);
        }
    });
    give_way();
    interrupt::set_level(old);
}

pub fn get_nice() -> i32 {
    let old = interrupt::disable();
    let nice = with_sched(|s| s.thread(s.current).nice);
    interrupt::set_level(old);
    nice
}

/// 100 times the system load average, rounded to the nearest integer.
pub fn get_load_avg() -> i32 {
    let old = interrupt::disable();
    let avg = with_sched(|s| s.mlfqs.as_ref().map(|m| m.load_avg).unwrap_or(Fixed::ZERO));
    interrupt::set_level(old);
    avg.mul_int(100).round()
}

/// 100 times the current thread's recent CPU usage, rounded to the
/// nearest integer.
pub fn get_recent_cpu() -> i32 {
    let old = interrupt::disable();
    let cpu = with_sched(|s| s.thread(s.current).recent_cpu);
    interrupt::set_level(old);
    cpu.mul_int(100).round()
}

/// Process attached to the current thread, if any.
pub(crate) fn current_process_id() -> Option<Tid> {
    let old = interrupt::disable();
    let pid = with_sched(|s| s.thread(s.current).process);
    interrupt::set_level(old);
    pid
}

pub(crate) fn set_current_process(pid: Option<Tid>) {
    let old = interrupt::disable();
    with_sched(|s| {
        let cur = s.current;
        s.thread_mut(cur).process = pid;
    });
    interrupt::set_level(old);
}

/// Runs the scheduler invariant self-check.
pub fn self_check() {
    let old = interrupt::disable();
    with_sched(|s| s.self_check());
    interrupt::set_level(old);
}

pub fn stats() -> Stats {
    let old = interrupt::disable();
    let stats = with_sched(|s| s.stats);
    interrupt::set_level(old);
    stats
}
