//! Tick counter and timed-wait queue.
//!
//! The teacher's `timeout.rs` implements a wraparound-safe 32-bit virtual
//! time scheme (event times, "frontiers", `adjust_time`) to let a 32-bit
//! tick counter run indefinitely without ambiguity. That complexity earns
//! its keep in a kernel meant to run for months uninterrupted on a 32-bit
//! counter; this specification only requires a monotonic tick source and
//! an ascending-deadline queue (§4.7), so the tick counter here is a
//! plain `u64` (effectively never wraps at any realistic tick rate) and
//! the queue is the binary min-heap from `crate::utils::binary_heap`,
//! reused near verbatim from the teacher.
use arrayvec::ArrayVec;

use crate::{
    task::{Tcb, TaskId},
    utils::binary_heap::{BinaryHeap, BinaryHeapCtx},
};

/// One tick, as passed to [`crate::sched::Kernel::tick`]. The unit (1ms,
/// 1/32768s, ...) is a choice made entirely by the tick source driving
/// `tick()`; the kernel only ever compares tick counts to each other.
pub type Ticks = u64;

struct HeapCtx<'a> {
    tasks: &'a mut [Tcb],
}

impl BinaryHeapCtx<(Ticks, TaskId)> for HeapCtx<'_> {
    fn lt(&mut self, x: &(Ticks, TaskId), y: &(Ticks, TaskId)) -> bool {
        x.0 < y.0
    }

    fn on_move(&mut self, e: &mut (Ticks, TaskId), new_index: usize) {
        self.tasks[e.1.get()].timeout_heap_pos = Some(new_index);
    }
}

/// The ascending-deadline queue of blocked, timed tasks.
pub struct TimeoutQueue<const NT: usize> {
    heap: ArrayVec<(Ticks, TaskId), NT>,
}

impl<const NT: usize> TimeoutQueue<NT> {
    pub const fn new() -> Self {
        Self {
            heap: ArrayVec::new_const(),
        }
    }

    /// Arm a deadline for `task`. Returns `Err(())` if the queue (sized to
    /// at most one entry per task) is somehow already full — this would
    /// indicate `task` already has an armed deadline, a caller bug.
    pub fn arm(&mut self, tasks: &mut [Tcb], task: TaskId, deadline: Ticks) -> Result<(), ()> {
        if self.heap.len() >= NT {
            return Err(());
        }
        self.heap.heap_push((deadline, task), HeapCtx { tasks });
        Ok(())
    }

    /// Cancel `task`'s armed deadline, e.g. because it was woken by its
    /// primary wait condition before timing out.
    pub fn disarm(&mut self, tasks: &mut [Tcb], task: TaskId) {
        if let Some(pos) = tasks[task.get()].timeout_heap_pos.take() {
            self.heap.heap_remove(pos, HeapCtx { tasks });
        }
    }

    /// Pop every task whose deadline is `<= now`, oldest-deadline first.
    pub fn drain_due(&mut self, tasks: &mut [Tcb], now: Ticks) -> TimeoutDrain<'_, NT> {
        TimeoutDrain {
            queue: self,
            tasks,
            now,
        }
    }
}

impl<const NT: usize> Default for TimeoutQueue<NT> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct TimeoutDrain<'a, const NT: usize> {
    queue: &'a mut TimeoutQueue<NT>,
    tasks: &'a mut [Tcb],
    now: Ticks,
}

impl<const NT: usize> Iterator for TimeoutDrain<'_, NT> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let &(deadline, task) = self.queue.heap.first()?;
        if deadline > self.now {
            return None;
        }
        let popped = self.queue.heap.heap_pop(HeapCtx { tasks: self.tasks });
        debug_assert_eq!(popped, Some((deadline, task)));
        self.tasks[task.get()].timeout_heap_pos = None;
        Some(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks(n: usize) -> Vec<Tcb> {
        (0..n).map(|_| Tcb::new(0)).collect()
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut tasks = tasks(4);
        let mut q = TimeoutQueue::<4>::new();
        q.arm(&mut tasks, TaskId::new(0), 30).unwrap();
        q.arm(&mut tasks, TaskId::new(1), 10).unwrap();
        q.arm(&mut tasks, TaskId::new(2), 20).unwrap();

        let due: Vec<_> = q.drain_due(&mut tasks, 25).map(|t| t.get()).collect();
        assert_eq!(due, vec![1, 2]);

        let due: Vec<_> = q.drain_due(&mut tasks, 100).map(|t| t.get()).collect();
        assert_eq!(due, vec![0]);
    }

    #[test]
    fn disarm_cancels_timeout() {
        let mut tasks = tasks(2);
        let mut q = TimeoutQueue::<2>::new();
        q.arm(&mut tasks, TaskId::new(0), 10).unwrap();
        q.disarm(&mut tasks, TaskId::new(0));
        let due: Vec<_> = q.drain_due(&mut tasks, 1000).collect();
        assert!(due.is_empty());
    }
}
