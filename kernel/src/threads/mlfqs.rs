//! Multi-level feedback queue scheduler.
//!
//! Active only when the kernel boots with `-mlfqs`. Priorities are not
//! set by threads but computed from an exponentially-decayed measure of
//! recent CPU time and a per-thread nice value; ready threads live in 64
//! FIFO queues, one per priority.

use alloc::collections::VecDeque;
use core::array;
use core::ops::Sub;

use super::{Sched, Status, Tid, PRI_MAX, PRI_MIN};
use crate::fixed_point::Fixed;
use crate::timer;

pub(super) const PRI_NUM: usize = (PRI_MAX - PRI_MIN + 1) as usize;

/// Ticks between whole-table priority recomputations.
const PRIORITY_UPDATE_FREQ: u64 = 4;

pub(super) struct Mlfqs {
    /// Estimated number of threads ready to run over the last minute.
    pub load_avg: Fixed,
    pub ready: [VecDeque<Tid>; PRI_NUM],
}

impl Mlfqs {
    pub(super) fn new() -> Mlfqs {
        Mlfqs {
            load_avg: Fixed::ZERO,
            ready: array::from_fn(|_| VecDeque::new()),
        }
    }
}

/// `load_avg := (59/60)·load_avg + (1/60)·active`.
pub(crate) fn next_load_avg(load_avg: Fixed, active: i32) -> Fixed {
    load_avg
        .mul(Fixed::from_int(59).div_int(60))
        + Fixed::from_int(active).div_int(60)
}

/// `recent_cpu := (2·load_avg / (2·load_avg + 1))·recent_cpu + nice`.
pub(crate) fn decayed_recent_cpu(recent_cpu: Fixed, load_avg: Fixed, nice: i32) -> Fixed {
    let twice = load_avg.mul_int(2);
    twice.div(twice.add_int(1)).mul(recent_cpu).add_int(nice)
}

/// `priority := clamp(PRI_MAX − recent_cpu/4 − 2·nice)`, truncated.
pub(crate) fn priority_for(recent_cpu: Fixed, nice: i32) -> i32 {
    let raw = Fixed::from_int(PRI_MAX)
        .sub_int(nice * 2)
        .sub(recent_cpu.div_int(4))
        .trunc();
    raw.clamp(PRI_MIN, PRI_MAX)
}

impl Sched {
    /// Per-tick MLFQS accounting, in the order the formulas require:
    /// once a second the load average and every thread's recent CPU are
    /// recomputed, then the running thread's recent CPU is charged, then
    /// every fourth tick priorities are recomputed from the result.
    pub(super) fn mlfqs_tick(&mut self) {
        let ticks = timer::ticks();
        let cur = self.current;

        if ticks % timer::TIMER_FREQ == 0 {
            let ready_count: usize = self
                .mlfqs
                .as_ref()
                .unwrap()
                .ready
                .iter()
                .map(|q| q.len())
                .sum();
            let running = if self.is_idle(cur) { 0 } else { 1 };
            let active = running + ready_count as i32;
            let load_avg = {
                let m = self.mlfqs.as_mut().unwrap();
                m.load_avg = next_load_avg(m.load_avg, active);
                m.load_avg
            };
            for t in self.threads.values_mut() {
                t.recent_cpu = decayed_recent_cpu(t.recent_cpu, load_avg, t.nice);
            }
        }

        if !self.is_idle(cur) {
            let t = self.thread_mut(cur);
            t.recent_cpu = t.recent_cpu.add_int(1);
        }

        if ticks % PRIORITY_UPDATE_FREQ == 0 {
            let tids: alloc::vec::Vec<Tid> = self.threads.keys().copied().collect();
            for tid in tids {
                self.mlfqs_update_priority(tid);
            }
        }
    }

    /// Recomputes one thread's priority, re-filing it in the ready
    /// queues if the priority of a ready thread changed.
    pub(super) fn mlfqs_update_priority(&mut self, tid: Tid) {
        let t = self.thread(tid);
        let new = priority_for(t.recent_cpu, t.nice);
        if new != t.priority {
            if self.thread(tid).status == Status::Ready {
                self.remove_ready(tid);
                self.thread_mut(tid).priority = new;
                self.add_ready(tid);
            } else {
                self.thread_mut(tid).priority = new;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_avg_converges_from_below() {
        // One minute with a steady 60 ready threads: the load average
        // climbs toward 60 and never overshoots.
        let mut load_avg = Fixed::ZERO;
        let mut previous = -1;
        for tick in 1..=6000u64 {
            if tick % timer::TIMER_FREQ == 0 {
                load_avg = next_load_avg(load_avg, 60);
                let hundredths = load_avg.mul_int(100).round();
                assert!(hundredths >= previous, "load average dipped");
                assert!((0..=6000).contains(&hundredths));
                previous = hundredths;
            }
        }
        assert!(load_avg.round() >= 38, "one minute reaches ~63% of 60");
    }

    #[test]
    fn recent_cpu_decays_to_nice() {
        // With zero load the decay coefficient collapses, leaving nice.
        let decayed = decayed_recent_cpu(Fixed::from_int(100), Fixed::ZERO, 0);
        assert_eq!(decayed.round(), 0);
        let decayed = decayed_recent_cpu(Fixed::from_int(100), Fixed::ZERO, 5);
        assert_eq!(decayed.round(), 5);
    }

    #[test]
    fn priority_formula() {
        assert_eq!(priority_for(Fixed::ZERO, 0), PRI_MAX);
        assert_eq!(priority_for(Fixed::ZERO, 2), 59);
        assert_eq!(priority_for(Fixed::from_int(8), 0), 61);
        // Clamped at both ends.
        assert_eq!(priority_for(Fixed::from_int(1000), 20), PRI_MIN);
        assert_eq!(priority_for(Fixed::from_int(-1000), -20), PRI_MAX);
    }

    #[test]
    fn compute_bound_thread_decays_below_fresh_priority() {
        // Two simulated seconds of a CPU hog at nice 2, starting from
        // priority 59: by the end it must rank below a fresh thread
        // created at the default priority.
        let mut recent_cpu = Fixed::ZERO;
        let mut load_avg = Fixed::ZERO;
        let nice = 2;
        assert_eq!(priority_for(recent_cpu, nice), 59);
        let mut priority = 59;
        for tick in 1..=(2 * timer::TIMER_FREQ) {
            if tick % timer::TIMER_FREQ == 0 {
                load_avg = next_load_avg(load_avg, 1);
                recent_cpu = decayed_recent_cpu(recent_cpu, load_avg, nice);
            }
            recent_cpu = recent_cpu.add_int(1);
            if tick % PRIORITY_UPDATE_FREQ == 0 {
                priority = priority_for(recent_cpu, nice);
            }
        }
        assert!(priority < 59);
        assert!(priority < priority_for(Fixed::ZERO, 0));
    }
}
