//! Synchronization primitives: semaphores, locks with priority
//! donation, and condition variables.
//!
//! The objects themselves live in slot arenas inside the scheduler cell;
//! the public types are handles. Waiter lists are kept ordered by
//! effective priority (FIFO among equals) so wakeups always go to the
//! highest-priority waiter, and a sleeping thread whose priority changes
//! is re-filed before the next wakeup.

use alloc::vec::Vec;

use super::{with_sched, Sched, Tid, WaitsFor, PRI_MIN};
use crate::interrupt;

pub(super) struct Slots<T> {
    items: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slots<T> {
    pub(super) fn new() -> Slots<T> {
        Slots {
            items: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(super) fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.items[i] = Some(value);
                i
            }
            None => {
                self.items.push(Some(value));
                self.items.len() - 1
            }
        }
    }

    pub(super) fn get(&self, i: usize) -> &T {
        self.items[i].as_ref().expect("stale sync handle")
    }

    pub(super) fn get_mut(&mut self, i: usize) -> &mut T {
        self.items[i].as_mut().expect("stale sync handle")
    }

    pub(super) fn remove(&mut self, i: usize) -> T {
        let value = self.items[i].take().expect("double free of sync handle");
        self.free.push(i);
        value
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|slot| slot.as_ref())
    }
}

pub(super) struct SemSlot {
    pub value: u32,
    /// Blocked threads, ordered by effective priority, highest first.
    pub waiters: Vec<Tid>,
}

pub(super) struct LockSlot {
    pub holder: Option<Tid>,
    /// Cached donation: the top waiter's effective priority, or the
    /// floor when nobody waits.
    pub priority: i32,
    pub sema: usize,
}

pub(super) struct CondSlot {
    /// Per-waiter semaphores, ordered by the waiter's effective priority
    /// at insert time and re-sorted when priorities move.
    pub waiters: Vec<(Tid, usize)>,
}

impl Sched {
    /// Inserts `tid` into a semaphore's waiter list before the first
    /// strictly lower-priority waiter, so equal priorities stay FIFO.
    pub(super) fn sema_waiter_insert(&mut self, sid: usize, tid: Tid) {
        let priority = self.effective_priority(tid);
        let waiters = &self.sems.get(sid).waiters;
        let mut at = waiters.len();
        for (i, &w) in waiters.iter().enumerate() {
            if self.effective_priority(w) < priority {
                at = i;
                break;
            }
        }
        self.sems.get_mut(sid).waiters.insert(at, tid);
    }

    /// Top waiter's effective priority, or the floor.
    fn sema_top_priority(&self, sid: usize) -> i32 {
        self.sems
            .get(sid)
            .waiters
            .first()
            .map(|&t| self.effective_priority(t))
            .unwrap_or(PRI_MIN)
    }

    /// Recomputes a lock's cached donation from its waiters.
    fn lock_refresh_priority(&mut self, lid: usize) {
        let sid = self.locks.get(lid).sema;
        self.locks.get_mut(lid).priority = self.sema_top_priority(sid);
    }

    /// Raises the cached donation to `priority` if that is an increase.
    pub(super) fn lock_try_raise(&mut self, lid: usize, priority: i32) -> bool {
        if self.locks.get(lid).priority < priority {
            self.locks.get_mut(lid).priority = priority;
            true
        } else {
            false
        }
    }

    /// On release: step the cached donation down to the runner-up waiter,
    /// since the top waiter is about to be woken and handed the lock.
    fn lock_step_down_priority(&mut self, lid: usize) {
        let sid = self.locks.get(lid).sema;
        let waiters = &self.sems.get(sid).waiters;
        let next = if waiters.len() <= 1 {
            PRI_MIN
        } else {
            self.effective_priority(waiters[1])
        };
        self.locks.get_mut(lid).priority = next;
    }

    /// A waiter of `lid` changed priority: re-file it, refresh the cached
    /// donation, and push the change through the holder (cascading along
    /// the waits-for chain).
    pub(super) fn lock_waiter_changed(&mut self, lid: usize, tid: Tid) {
        let sid = self.locks.get(lid).sema;
        let waiters = &mut self.sems.get_mut(sid).waiters;
        let i = waiters
            .iter()
            .position(|&t| t == tid)
            .expect("waiter missing from lock");
        waiters.remove(i);
        self.sema_waiter_insert(sid, tid);
        self.lock_refresh_priority(lid);
        if let Some(holder) = self.locks.get(lid).holder {
            self.holder_reinsert_lock(holder, lid);
        }
    }

    /// Re-sorts a condition variable's waiters by current effective
    /// priority; stable, so FIFO survives among equals.
    pub(super) fn cond_resort(&mut self, cid: usize) {
        let mut waiters = core::mem::take(&mut self.conds.get_mut(cid).waiters);
        waiters.sort_by(|a, b| {
            self.effective_priority(b.0)
                .cmp(&self.effective_priority(a.0))
        });
        self.conds.get_mut(cid).waiters = waiters;
    }

    fn cond_waiter_insert(&mut self, cid: usize, tid: Tid, sid: usize) {
        let priority = self.effective_priority(tid);
        let waiters = &self.conds.get(cid).waiters;
        let mut at = waiters.len();
        for (i, &(w, _)) in waiters.iter().enumerate() {
            if self.effective_priority(w) < priority {
                at = i;
                break;
            }
        }
        self.conds.get_mut(cid).waiters.insert(at, (tid, sid));
    }
}

/// Down on a raw semaphore slot. Sleeps while the value is zero.
fn sema_down_id(sid: usize) {
    assert!(!interrupt::in_external(), "semaphore down may sleep");
    let old = interrupt::disable();
    loop {
        let acquired = with_sched(|s| {
            if s.sems.get(sid).value == 0 {
                let cur = s.current;
                s.sema_waiter_insert(sid, cur);
                let t = s.thread_mut(cur);
                if t.blocker == WaitsFor::Nothing {
                    t.blocker = WaitsFor::Sema(sid);
                }
                false
            } else {
                s.sems.get_mut(sid).value -= 1;
                true
            }
        });
        if acquired {
            break;
        }
        super::block();
    }
    interrupt::set_level(old);
}

fn sema_try_down_id(sid: usize) -> bool {
    let old = interrupt::disable();
    let ok = with_sched(|s| {
        if s.sems.get(sid).value > 0 {
            s.sems.get_mut(sid).value -= 1;
            true
        } else {
            false
        }
    });
    interrupt::set_level(old);
    ok
}

/// Up on a raw semaphore slot: wakes the top waiter and lets it preempt
/// immediately if it outranks the running thread.
fn sema_up_id(sid: usize) {
    let old = interrupt::disable();
    with_sched(|s| {
        s.sems.get_mut(sid).value += 1;
        if !s.sems.get(sid).waiters.is_empty() {
            let tid = s.sems.get_mut(sid).waiters.remove(0);
            s.unblock(tid);
        }
    });
    super::give_way();
    interrupt::set_level(old);
}

/// A counting semaphore.
///
/// Handles are plain copies; the slot is reclaimed by an explicit
/// [`Semaphore::free`] (kernel-internal use) or when the scheduler is
/// reinitialized.
#[derive(Clone, Copy, Debug)]
pub struct Semaphore {
    id: usize,
}

impl Semaphore {
    pub fn new(value: u32) -> Semaphore {
        let old = interrupt::disable();
        let id = with_sched(|s| {
            s.sems.insert(SemSlot {
                value,
                waiters: Vec::new(),
            })
        });
        interrupt::set_level(old);
        Semaphore { id }
    }

    /// Waits for the value to become positive, then decrements it.
    pub fn down(&self) {
        sema_down_id(self.id);
    }

    /// Decrements the value only if it is positive. Never sleeps.
    pub fn try_down(&self) -> bool {
        sema_try_down_id(self.id)
    }

    /// Increments the value and wakes the highest-priority waiter.
    pub fn up(&self) {
        sema_up_id(self.id);
    }

    /// Releases the slot. The semaphore must have no waiters.
    pub(crate) fn free(self) {
        let old = interrupt::disable();
        with_sched(|s| {
            debug_assert!(s.sems.get(self.id).waiters.is_empty());
            s.sems.remove(self.id);
        });
        interrupt::set_level(old);
    }
}

/// A mutual-exclusion lock with priority donation.
///
/// A lock is a semaphore of value one plus an owner: the same thread
/// must acquire and release it, and acquisition is not recursive. While
/// contended, the lock caches the highest waiter priority and donates it
/// to the holder.
#[derive(Clone, Copy, Debug)]
pub struct Lock {
    id: usize,
}

impl Lock {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Lock {
        let old = interrupt::disable();
        let id = with_sched(|s| {
            let sema = s.sems.insert(SemSlot {
                value: 1,
                waiters: Vec::new(),
            });
            s.locks.insert(LockSlot {
                holder: None,
                priority: PRI_MIN,
                sema,
            })
        });
        interrupt::set_level(old);
        Lock { id }
    }

    /// Acquires the lock, sleeping until it is available. A blocked
    /// acquirer donates its effective priority to the holder.
    pub fn acquire(&self) {
        assert!(!interrupt::in_external(), "lock acquire may sleep");
        assert!(!self.held_by_current_thread(), "lock is not recursive");
        let old = interrupt::disable();
        if !self.try_acquire() {
            let sid = with_sched(|s| {
                let cur = s.current;
                s.thread_mut(cur).blocker = WaitsFor::Lock(self.id);
                let priority = s.effective_priority(cur);
                if s.mlfqs.is_none() && s.lock_try_raise(self.id, priority) {
                    if let Some(holder) = s.locks.get(self.id).holder {
                        s.holder_reinsert_lock(holder, self.id);
                    }
                }
                s.locks.get(self.id).sema
            });
            sema_down_id(sid);
            with_sched(|s| {
                let cur = s.current;
                s.locks.get_mut(self.id).holder = Some(cur);
                s.thread_add_lock(cur, self.id);
            });
        }
        interrupt::set_level(old);
    }

    /// Acquires the lock only if it is free. Never sleeps and never
    /// donates.
    pub fn try_acquire(&self) -> bool {
        assert!(!self.held_by_current_thread(), "lock is not recursive");
        let old = interrupt::disable();
        let ok = with_sched(|s| {
            let sid = s.locks.get(self.id).sema;
            if s.sems.get(sid).value > 0 {
                s.sems.get_mut(sid).value -= 1;
                let cur = s.current;
                s.locks.get_mut(self.id).holder = Some(cur);
                s.thread_add_lock(cur, self.id);
                true
            } else {
                false
            }
        });
        interrupt::set_level(old);
        ok
    }

    /// Releases the lock, recomputing its cached donation and handing it
    /// to the highest-priority waiter, which may preempt us.
    pub fn release(&self) {
        assert!(
            self.held_by_current_thread(),
            "lock released by a non-owner"
        );
        let old = interrupt::disable();
        let sid = with_sched(|s| {
            let cur = s.current;
            s.locks.get_mut(self.id).holder = None;
            let held = &mut s.thread_mut(cur).held_locks;
            held.retain(|&l| l != self.id);
            s.lock_step_down_priority(self.id);
            s.locks.get(self.id).sema
        });
        sema_up_id(sid);
        interrupt::set_level(old);
    }

    pub fn held_by_current_thread(&self) -> bool {
        let old = interrupt::disable();
        let held = with_sched(|s| s.locks.get(self.id).holder == Some(s.current));
        interrupt::set_level(old);
        held
    }

    /// Releases the lock's slots. Must be free and uncontended.
    pub(crate) fn free(self) {
        let old = interrupt::disable();
        with_sched(|s| {
            let slot = s.locks.remove(self.id);
            debug_assert!(slot.holder.is_none());
            debug_assert!(s.sems.get(slot.sema).waiters.is_empty());
            s.sems.remove(slot.sema);
        });
        interrupt::set_level(old);
    }
}

/// A Mesa-style condition variable.
///
/// Each waiter sleeps on its own semaphore; the list of those semaphores
/// is kept in effective-priority order so `signal` always wakes the most
/// important waiter.
#[derive(Clone, Copy, Debug)]
pub struct Condvar {
    id: usize,
}

impl Condvar {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Condvar {
        let old = interrupt::disable();
        let id = with_sched(|s| s.conds.insert(CondSlot { waiters: Vec::new() }));
        interrupt::set_level(old);
        Condvar { id }
    }

    /// Atomically releases `lock` and waits to be signaled, then
    /// reacquires `lock`. Signal and wakeup are not atomic: callers
    /// recheck their condition in a loop.
    pub fn wait(&self, lock: &Lock) {
        assert!(!interrupt::in_external(), "condvar wait may sleep");
        assert!(lock.held_by_current_thread());
        let old = interrupt::disable();
        let sid = with_sched(|s| {
            let sid = s.sems.insert(SemSlot {
                value: 0,
                waiters: Vec::new(),
            });
            let cur = s.current;
            s.thread_mut(cur).blocker = WaitsFor::Cond(self.id);
            s.cond_waiter_insert(self.id, cur, sid);
            sid
        });
        lock.release();
        sema_down_id(sid);
        lock.acquire();
        with_sched(|s| {
            // A signal that raced ahead of our sleep leaves the tag set;
            // clear it so later waits file us correctly.
            let cur = s.current;
            s.thread_mut(cur).blocker = WaitsFor::Nothing;
            s.sems.remove(sid);
        });
        interrupt::set_level(old);
    }

    /// Wakes the highest-priority waiter, if any. `lock` must be held.
    pub fn signal(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread());
        let old = interrupt::disable();
        let sid = with_sched(|s| {
            let waiters = &mut s.conds.get_mut(self.id).waiters;
            if waiters.is_empty() {
                None
            } else {
                Some(waiters.remove(0).1)
            }
        });
        if let Some(sid) = sid {
            sema_up_id(sid);
        }
        interrupt::set_level(old);
    }

    /// Wakes every waiter.
    pub fn broadcast(&self, lock: &Lock) {
        assert!(lock.held_by_current_thread());
        loop {
            let empty = {
                let old = interrupt::disable();
                let empty = with_sched(|s| s.conds.get(self.id).waiters.is_empty());
                interrupt::set_level(old);
                empty
            };
            if empty {
                break;
            }
            self.signal(lock);
        }
    }
}
