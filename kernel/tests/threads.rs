//! Scheduler, synchronization, and donation behaviour, exercised with
//! really-running threads.

mod common;

use common::Trace;
use kernel::init::BootOptions;
use kernel::threads::{self, sync::Condvar, sync::Lock, sync::Semaphore, PRI_DEFAULT};
use kernel::timer;

#[test]
fn semaphore_ping_pong() {
    common::default_test(|| {
        let ping = Semaphore::new(0);
        let pong = Semaphore::new(0);
        let trace = Trace::new();
        let t = trace.clone();
        threads::spawn("pong", PRI_DEFAULT, move || {
            for _ in 0..10 {
                ping.down();
                t.push("pong");
                pong.up();
            }
        });
        for _ in 0..10 {
            ping.up();
            pong.down();
        }
        assert_eq!(trace.events().len(), 10);
        threads::self_check();
    });
}

#[test]
fn spawn_of_higher_priority_preempts() {
    common::default_test(|| {
        let trace = Trace::new();
        let t = trace.clone();
        threads::spawn("eager", PRI_DEFAULT + 1, move || t.push("ran"));
        // The new thread outranked us, so it already finished.
        assert_eq!(trace.events(), ["ran"]);
    });
}

#[test]
fn semaphore_wakes_highest_priority_first() {
    common::default_test(|| {
        let sema = Semaphore::new(0);
        let trace = Trace::new();
        for (name, priority) in [("low", 10), ("mid", 20), ("high", 30)] {
            let t = trace.clone();
            threads::spawn(name, priority, move || {
                sema.down();
                t.push(name);
            });
        }
        // Drop below the waiters so they run and block on the semaphore.
        threads::set_priority(5);
        for _ in 0..3 {
            sema.up();
        }
        assert_eq!(trace.events(), ["high", "mid", "low"]);
        threads::self_check();
    });
}

#[test]
fn equal_priorities_run_fifo() {
    common::default_test(|| {
        let done = Semaphore::new(0);
        let trace = Trace::new();
        for name in ["first", "second", "third"] {
            let t = trace.clone();
            threads::spawn(name, PRI_DEFAULT - 1, move || {
                t.push(name);
                done.up();
            });
        }
        for _ in 0..3 {
            done.down();
        }
        assert_eq!(trace.events(), ["first", "second", "third"]);
    });
}

#[test]
fn raising_a_sleeping_waiters_priority_reorders_the_wakeups() {
    common::default_test(|| {
        let sema = Semaphore::new(0);
        let trace = Trace::new();
        let mut tids = Vec::new();
        for (name, priority) in [("a", 20), ("b", 25)] {
            let t = trace.clone();
            tids.push(threads::spawn(name, priority, move || {
                sema.down();
                t.push(name);
            }));
        }
        threads::set_priority(5);
        // Both are asleep; "a" currently ranks below "b". Raise it.
        threads::set_priority_of(tids[0], 40);
        sema.up();
        sema.up();
        assert_eq!(trace.events(), ["a", "b"]);
    });
}

#[test]
fn lock_donates_priority_to_holder() {
    common::default_test(|| {
        let lock = Lock::new();
        let trace = Trace::new();
        lock.acquire();
        let t = trace.clone();
        threads::spawn("acquirer", PRI_DEFAULT + 2, move || {
            lock.acquire();
            t.push("got lock");
            lock.release();
        });
        // It preempted us, blocked on the lock, and donated.
        assert!(trace.events().is_empty());
        assert_eq!(threads::get_priority(), PRI_DEFAULT + 2);
        lock.release();
        assert_eq!(trace.events(), ["got lock"]);
        assert_eq!(threads::get_priority(), PRI_DEFAULT);
        threads::self_check();
    });
}

#[test]
fn nested_donation_reaches_the_root_and_hands_off_in_order() {
    common::default_test(|| {
        let lock_a = Lock::new();
        let lock_b = Lock::new();
        let trace = Trace::new();

        threads::set_priority(1);
        lock_a.acquire();

        let t = trace.clone();
        threads::spawn("medium", 2, move || {
            lock_b.acquire();
            t.push("medium blocked on a");
            lock_a.acquire();
            t.push("medium got a");
            lock_a.release();
            lock_b.release();
            t.push("medium done");
        });
        // medium preempted us, took b, and is now blocked on a.
        assert_eq!(threads::get_priority(), 2);

        let t = trace.clone();
        threads::spawn("high", 32, move || {
            lock_b.acquire();
            t.push("high got b");
            lock_b.release();
        });
        // high blocked on b, whose holder is blocked on a: the donation
        // chains down to us.
        assert_eq!(threads::get_priority(), 32);

        lock_a.release();
        // Handoff order: high finishes before medium's tail.
        assert!(trace.index_of("high got b") < trace.index_of("medium done"));
        assert_eq!(threads::get_priority(), 1);
        threads::self_check();
    });
}

#[test]
fn try_acquire_never_blocks_and_never_donates() {
    common::default_test(|| {
        let lock = Lock::new();
        lock.acquire();
        let done = Semaphore::new(0);
        threads::spawn("trier", PRI_DEFAULT + 3, move || {
            assert!(!lock.try_acquire());
            done.up();
        });
        done.down();
        // No donation happened.
        assert_eq!(threads::get_priority(), PRI_DEFAULT);
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    });
}

#[test]
fn condvar_signals_highest_priority_waiter() {
    common::default_test(|| {
        let lock = Lock::new();
        let cond = Condvar::new();
        let trace = Trace::new();
        for (name, priority) in [("cv-low", 10), ("cv-high", 30), ("cv-mid", 20)] {
            let t = trace.clone();
            threads::spawn(name, priority, move || {
                lock.acquire();
                t.push(name);
                cond.wait(&lock);
                t.push(name);
                lock.release();
            });
        }
        threads::set_priority(5);
        // All three have waited once, in priority order.
        assert_eq!(trace.events(), ["cv-high", "cv-mid", "cv-low"]);
        for _ in 0..3 {
            lock.acquire();
            cond.signal(&lock);
            lock.release();
        }
        let events = trace.events();
        assert_eq!(events[3..].to_vec(), ["cv-high", "cv-mid", "cv-low"]);
        threads::self_check();
    });
}

#[test]
fn condvar_broadcast_wakes_everyone() {
    common::default_test(|| {
        let lock = Lock::new();
        let cond = Condvar::new();
        let done = Semaphore::new(0);
        for name in ["b1", "b2", "b3"] {
            threads::spawn(name, PRI_DEFAULT + 1, move || {
                lock.acquire();
                cond.wait(&lock);
                lock.release();
                done.up();
            });
        }
        lock.acquire();
        cond.broadcast(&lock);
        lock.release();
        for _ in 0..3 {
            done.down();
        }
    });
}

#[test]
fn mlfqs_decays_a_compute_bound_thread_and_prefers_fresh_work() {
    let options = BootOptions {
        mlfqs: true,
        ..BootOptions::default()
    };
    common::kernel_test(options, || {
        let done = Semaphore::new(0);
        let trace = Trace::new();
        let t = trace.clone();
        threads::spawn("hog", PRI_DEFAULT, move || {
            threads::set_nice(4);
            let mut lowest = threads::get_priority();
            for _ in 0..(2 * timer::TIMER_FREQ) {
                timer::interrupt();
                lowest = lowest.min(threads::get_priority());
            }
            if lowest < 31 {
                t.push("hog decayed below 31");
            }
            if threads::get_recent_cpu() > 0 {
                t.push("hog accrued cpu");
            }
            if threads::get_load_avg() > 0 {
                t.push("load average rose");
            }
            // A fresh, nice-0 thread must outrank and preempt the hog
            // at the next priority recomputation.
            let t2 = t.clone();
            threads::spawn("fresh", PRI_DEFAULT, move || t2.push("fresh ran"));
            for _ in 0..8 {
                timer::interrupt();
            }
            t.push("hog finished");
            done.up();
        });
        done.down();
        let events = trace.events();
        assert!(events.contains(&"hog decayed below 31"), "{:?}", events);
        assert!(events.contains(&"hog accrued cpu"));
        assert!(events.contains(&"load average rose"));
        assert!(trace.index_of("fresh ran") < trace.index_of("hog finished"));
        threads::self_check();
    });
}

#[test]
fn scheduler_invariants_hold_after_churn() {
    common::default_test(|| {
        let done = Semaphore::new(0);
        for i in 0..8 {
            threads::spawn("churn", 10 + i, move || {
                for _ in 0..5 {
                    threads::yield_now();
                }
                done.up();
            });
        }
        threads::set_priority(5);
        for _ in 0..8 {
            done.down();
        }
        threads::self_check();
    });
}
