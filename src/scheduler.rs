//! Recording-side scheduling. Priorities are honored strictly: the
//! highest-priority (lowest value) runnable task runs, and tasks of equal
//! priority rotate round-robin. Strict priority scheduling helps surface
//! starvation bugs in the workload.
//!
//! When a task calls sched_yield we temporarily switch to a completely
//! fair mode: every task goes onto a queue and we drain the queue,
//! running each runnable task for a timeslice, before returning to
//! priority scheduling. Tasks calling sched_yield are often spinning on
//! a lock some other task holds, and would deadlock under strict
//! priorities.
//!
//! The scheduler only runs during recording; replay just follows the
//! recorded decisions.
//!
//! A task holds the CPU until it hits a stop of interest, consumes its
//! timeslice (measured in ticks by the hardware counter, which interrupts
//! with TIME_SLICE_SIGNAL), or blocks in the kernel (detected by its
//! desched event). The main entry point is `get_next_task`, called after
//! every recorded event.

use crate::log::LogLevel::LogDebug;
use crate::session::session_inner::SessionInner;
use crate::session::task::{TaskSharedPtr, TaskState};
use crate::ticks::Ticks;
use crate::wait_status::WaitStatus;
use libc::pid_t;
use std::collections::{BTreeSet, VecDeque};
use std::env;

/// Lower integer = higher priority, matching setpriority(2) semantics.
pub type Priority = i32;

/// Ticks don't correspond to wall-clock time, but empirically workloads
/// retire on the order of 25k conditional branches per scheduling-relevant
/// millisecond; this default gives interactive-feeling ~10ms timeslices.
pub const DEFAULT_MAX_TICKS: Ticks = 250_000;

pub struct Scheduler {
    /// Every live task is in exactly one of these two structures:
    /// the priority set normally, the round-robin queue while we're in
    /// fair mode for it.
    task_priority_set: BTreeSet<(Priority, pid_t)>,
    task_round_robin_queue: VecDeque<pid_t>,

    current: Option<pid_t>,
    /// Absolute deadline against the current task's *lifetime* tick
    /// counter (`Task::ticks_total`). The per-event counter is zeroed at
    /// every recorded frame, so basing the deadline on it would grant a
    /// syscall-heavy task a fresh slice at each frame and let it
    /// monopolize the CPU.
    current_timeslice_end: Ticks,

    max_ticks: Ticks,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        let max_ticks = env::var("RETRACE_MAX_TICKS")
            .ok()
            .and_then(|v| v.parse::<Ticks>().ok())
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_MAX_TICKS);
        Scheduler {
            task_priority_set: BTreeSet::new(),
            task_round_robin_queue: VecDeque::new(),
            current: None,
            current_timeslice_end: 0,
            max_ticks,
        }
    }

    pub fn max_ticks(&self) -> Ticks {
        self.max_ticks
    }

    pub fn current(&self) -> Option<pid_t> {
        self.current
    }

    pub fn on_create(&mut self, rec_tid: pid_t, priority: Priority) {
        self.task_priority_set.insert((priority, rec_tid));
    }

    pub fn on_destroy(&mut self, rec_tid: pid_t, priority: Priority) {
        self.task_priority_set.remove(&(priority, rec_tid));
        self.task_round_robin_queue.retain(|t| *t != rec_tid);
        if self.current == Some(rec_tid) {
            self.current = None;
        }
    }

    pub fn update_task_priority(&mut self, rec_tid: pid_t, old: Priority, new: Priority) {
        if self.task_priority_set.remove(&(old, rec_tid)) {
            self.task_priority_set.insert((new, rec_tid));
        }
    }

    /// sched_yield: switch to fair mode until the queue drains.
    pub fn schedule_all_round_robin(&mut self) {
        for (_, tid) in std::mem::take(&mut self.task_priority_set) {
            if !self.task_round_robin_queue.contains(&tid) {
                self.task_round_robin_queue.push_back(tid);
            }
        }
    }

    /// Has the current task used up its tick budget? `ticks_total` is the
    /// task's lifetime counter, not the per-frame one.
    pub fn timeslice_expired(&self, ticks_total: Ticks) -> bool {
        ticks_total >= self.current_timeslice_end
    }

    /// Ticks left in the current slice, for programming the interrupt.
    pub fn interrupt_after(&self, ticks_total: Ticks) -> Ticks {
        self.current_timeslice_end
            .saturating_sub(ticks_total)
            .max(1)
    }

    fn start_new_timeslice(&mut self, ticks_total: Ticks) {
        self.current_timeslice_end = ticks_total + self.max_ticks;
    }

    /// Core policy, separated from task-table plumbing so it can be
    /// exercised directly: pick the next tid from `candidates`
    /// (priority, tid, runnable), preferring the round-robin queue, then
    /// the highest-priority class rotated past `current`.
    fn choose_runnable(
        &mut self,
        current: Option<pid_t>,
        candidates: &[(Priority, pid_t, bool)],
    ) -> Option<pid_t> {
        // Fair mode: first runnable task in queue order wins and leaves
        // the queue; tasks ahead of it stay queued for the next rounds.
        if !self.task_round_robin_queue.is_empty() {
            let runnable: Vec<pid_t> = candidates
                .iter()
                .filter(|(_, _, r)| *r)
                .map(|(_, t, _)| *t)
                .collect();
            for i in 0..self.task_round_robin_queue.len() {
                let tid = self.task_round_robin_queue[i];
                if runnable.contains(&tid) {
                    self.task_round_robin_queue.remove(i);
                    self.task_priority_set.insert((
                        candidates.iter().find(|(_, t, _)| *t == tid).unwrap().0,
                        tid,
                    ));
                    return Some(tid);
                }
            }
            // Queue holds only blocked tasks; fall through to priority
            // scheduling of whatever is left.
        }

        let best_priority = candidates
            .iter()
            .filter(|(_, _, r)| *r)
            .map(|(p, _, _)| *p)
            .min()?;
        let mut class: Vec<pid_t> = candidates
            .iter()
            .filter(|(p, _, r)| *r && *p == best_priority)
            .map(|(_, t, _)| *t)
            .collect();
        class.sort_unstable();
        // Rotate: the task after `current` in tid order, wrapping. A task
        // that just consumed its slice thereby goes to the tail.
        if let Some(cur) = current {
            if let Some(next) = class.iter().find(|t| **t > cur) {
                return Some(*next);
            }
        }
        class.first().cloned()
    }

    /// Decide which task to run next. May block in waitpid(-1) when every
    /// candidate is in the kernel (e.g. all blocked in syscalls); the
    /// desched events guarantee a stop arrives within one kernel
    /// deschedule of any of them.
    pub fn get_next_task(&mut self, inner: &SessionInner) -> Option<TaskSharedPtr> {
        if inner.task_count() == 0 {
            return None;
        }

        // Keep the current task if it's on CPU, runnable and within its
        // timeslice.
        if let Some(cur_tid) = self.current {
            if let Some(t) = inner.find_task(cur_tid) {
                let tb = t.borrow();
                if tb.is_stopped()
                    && !tb.has_exited()
                    && self.task_round_robin_queue.is_empty()
                    && !self.timeslice_expired(tb.ticks_total)
                {
                    drop(tb);
                    return Some(t);
                }
            }
        }

        loop {
            let candidates: Vec<(Priority, pid_t, bool)> = inner
                .tasks()
                .iter()
                .map(|(tid, t)| {
                    let tb = t.borrow();
                    (tb.priority, *tid, tb.is_stopped() && !tb.has_exited())
                })
                .collect();

            if let Some(tid) = self.choose_runnable(self.current, &candidates) {
                let t = inner.find_task(tid).unwrap();
                self.current = Some(tid);
                self.start_new_timeslice(t.borrow().ticks_total);
                log!(LogDebug, "scheduling task {}", tid);
                return Some(t);
            }

            // Nothing schedulable: every live task is running in the
            // kernel. Block until one of them stops.
            if !self.wait_for_any_stop(inner) {
                return None;
            }
        }
    }

    /// Block in waitpid(-1) and deliver the resulting status to its task.
    /// False when there are no children left to wait for.
    fn wait_for_any_stop(&mut self, inner: &SessionInner) -> bool {
        let mut raw_status: i32 = 0;
        let tid = unsafe { libc::waitpid(-1, &mut raw_status, libc::__WALL) };
        if tid < 0 {
            return false;
        }
        let status = WaitStatus::new(raw_status);
        // Map the real tid back to a task. During recording real and
        // recorded tids coincide.
        for t in inner.tasks().values() {
            let mut tb = t.borrow_mut();
            if tb.tid == tid {
                if tb.state == TaskState::Running {
                    tb.did_waitpid(status);
                }
                return true;
            }
        }
        log!(LogDebug, "stray wait status {} for unknown tid {}", status, tid);
        true
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched() -> Scheduler {
        let mut s = Scheduler::new();
        s.max_ticks = 1000;
        s
    }

    #[test]
    fn equal_priority_rotation_is_fair() {
        let mut s = sched();
        let tasks: Vec<pid_t> = vec![100, 200, 300];
        for t in &tasks {
            s.on_create(*t, 0);
        }
        let candidates: Vec<(Priority, pid_t, bool)> =
            tasks.iter().map(|t| (0, *t, true)).collect();

        // Over K preemptions with N equal-priority runnable tasks, each
        // task gets floor(K/N) or ceil(K/N) slices.
        let k = 25;
        let mut counts = std::collections::HashMap::new();
        let mut current = None;
        for _ in 0..k {
            let next = s.choose_runnable(current, &candidates).unwrap();
            *counts.entry(next).or_insert(0usize) += 1;
            current = Some(next);
        }
        let n = tasks.len();
        for t in &tasks {
            let c = counts[t];
            assert!(c == k / n || c == k / n + 1, "task {} got {} slices", t, c);
        }
    }

    #[test]
    fn higher_priority_always_wins() {
        let mut s = sched();
        s.on_create(100, 0);
        s.on_create(200, 1);
        let candidates = vec![(0, 100, true), (1, 200, true)];
        for _ in 0..5 {
            assert_eq!(Some(100), s.choose_runnable(Some(100), &candidates));
        }
        // Once the high-priority task blocks, the lower one runs.
        let candidates = vec![(0, 100, false), (1, 200, true)];
        assert_eq!(Some(200), s.choose_runnable(Some(100), &candidates));
    }

    #[test]
    fn round_robin_queue_drains_in_order() {
        let mut s = sched();
        for t in &[100, 200, 300] {
            s.on_create(*t, 0);
        }
        s.schedule_all_round_robin();
        let candidates = vec![(0, 100, true), (0, 200, true), (0, 300, true)];
        assert_eq!(Some(100), s.choose_runnable(None, &candidates));
        assert_eq!(Some(200), s.choose_runnable(Some(100), &candidates));
        assert_eq!(Some(300), s.choose_runnable(Some(200), &candidates));
        // Queue drained: back to priority scheduling.
        assert!(s.task_round_robin_queue.is_empty());
    }

    #[test]
    fn round_robin_skips_blocked_tasks() {
        let mut s = sched();
        for t in &[100, 200] {
            s.on_create(*t, 0);
        }
        s.schedule_all_round_robin();
        let candidates = vec![(0, 100, false), (0, 200, true)];
        assert_eq!(Some(200), s.choose_runnable(None, &candidates));
        // The blocked task stays queued for later rounds.
        assert!(s.task_round_robin_queue.contains(&100));
    }

    #[test]
    fn timeslice_accounting() {
        let mut s = sched();
        s.start_new_timeslice(500);
        assert!(!s.timeslice_expired(1400));
        assert!(s.timeslice_expired(1500));
        assert_eq!(100, s.interrupt_after(1400));
        assert_eq!(1, s.interrupt_after(9999));
    }

    /// The record loop zeroes a task's per-event counter at every frame
    /// it writes (syscall entries and exits included). That reset must
    /// not re-arm the timeslice: a task issuing a syscall every few
    /// thousand ticks still has to be preempted once its *cumulative*
    /// progress crosses the deadline.
    #[test]
    fn frame_resets_do_not_rearm_timeslice() {
        use crate::session::task::Task;

        let mut s = sched();
        let mut t = Task::new(100, 100, 100, 1, 0);
        s.on_create(t.rec_tid, t.priority);
        s.start_new_timeslice(t.ticks_total);

        // A chatty task: a syscall (two frames) every 300 ticks, far more
        // often than the 1000-tick slice.
        let mut preempted = false;
        for _ in 0..10 {
            t.accumulate_ticks(300);
            if s.timeslice_expired(t.ticks_total) {
                preempted = true;
                break;
            }
            // Entry and exit frames both restart the event counter.
            t.on_frame_recorded();
            t.on_frame_recorded();
            assert_eq!(0, t.ticks);
        }
        assert!(preempted, "frame writes kept extending the timeslice");
        // The deadline fired from cumulative progress, after
        // ceil(1000/300) syscalls.
        assert_eq!(1200, t.ticks_total);
    }
}
