//! The ready queue: one FIFO bucket per priority level, plus a bitmap so
//! the highest non-empty bucket is found without scanning all 256.
//!
//! Grounded on the teacher's `task::readyqueue::BitmapQueue`, which pairs
//! a `PrioBitmap` with one queue per priority level. The teacher's queue
//! is generic over the number of priority levels (`Traits::NUM_TASK_PRIORITY_LEVELS`,
//! chosen per application); this kernel fixes it to the full 8-bit range
//! the specification's TCB priority field allows, trading a little static
//! memory for one less generic parameter threaded through every call site.
use crate::{task::TaskId, utils::{list::{Link, LinkedList}, Bitmap256}};

pub struct ReadyQueue {
    bitmap: Bitmap256,
    buckets: [LinkedList<TaskId>; 256],
}

impl ReadyQueue {
    pub const fn new() -> Self {
        Self {
            bitmap: Bitmap256::new(),
            buckets: [LinkedList::new(); 256],
        }
    }

    /// A ready queue with exactly `idle` already enqueued at
    /// `idle_priority`, for seeding the kernel-installed idle task at
    /// const-construction time (spec.md §3: "the run queue... always
    /// non-empty — the idle thread... is permanently Runnable", §8: "the
    /// idle thread never leaves the run queue").
    pub const fn with_idle(idle_priority: u8, idle: TaskId) -> Self {
        let mut buckets = [LinkedList::new(); 256];
        buckets[idle_priority as usize] = LinkedList::singleton(idle);
        let mut bitmap = Bitmap256::new();
        bitmap.set(idle_priority);
        Self { bitmap, buckets }
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    /// Enqueue `task` (of priority `prio`) at the back of its bucket —
    /// round-robin among equal-priority tasks (§4.2's `yield`/preemption
    /// note).
    pub fn push_back(&mut self, links: &mut [Link<TaskId>], prio: u8, task: TaskId) {
        self.buckets[prio as usize].push_back(links, task);
        self.bitmap.set(prio);
    }

    pub fn remove(&mut self, links: &mut [Link<TaskId>], prio: u8, task: TaskId) {
        self.buckets[prio as usize].remove(links, task);
        if self.buckets[prio as usize].is_empty() {
            self.bitmap.clear(prio);
        }
    }

    /// The priority level of the task that should run next, i.e. the
    /// highest non-empty bucket.
    pub fn highest_priority(&self) -> Option<u8> {
        self.bitmap.find_highest()
    }

    /// Pop the front of the highest-priority non-empty bucket.
    pub fn pop_highest(&mut self, links: &mut [Link<TaskId>]) -> Option<(u8, TaskId)> {
        let prio = self.bitmap.find_highest()?;
        let task = self.buckets[prio as usize].pop_front(links).expect(
            "bitmap reports bucket non-empty but pop_front found nothing — kernel data corrupted",
        );
        if self.buckets[prio as usize].is_empty() {
            self.bitmap.clear(prio);
        }
        Some((prio, task))
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(i: usize) -> TaskId {
        TaskId::new(i)
    }

    #[test]
    fn pops_highest_priority_first() {
        let mut links = vec![Link::default(); 8];
        let mut rq = ReadyQueue::new();
        rq.push_back(&mut links, 3, id(0));
        rq.push_back(&mut links, 9, id(1));
        rq.push_back(&mut links, 5, id(2));
        assert_eq!(rq.pop_highest(&mut links).map(|(p, t)| (p, t.get())), Some((9, 1)));
        assert_eq!(rq.pop_highest(&mut links).map(|(p, t)| (p, t.get())), Some((5, 2)));
        assert_eq!(rq.pop_highest(&mut links).map(|(p, t)| (p, t.get())), Some((3, 0)));
        assert!(rq.is_empty());
    }

    #[test]
    fn round_robins_equal_priority() {
        let mut links = vec![Link::default(); 8];
        let mut rq = ReadyQueue::new();
        rq.push_back(&mut links, 5, id(0));
        rq.push_back(&mut links, 5, id(1));
        let (_, first) = rq.pop_highest(&mut links).unwrap();
        assert_eq!(first.get(), 0);
        // Simulate re-enqueuing the preempted task at the back.
        rq.push_back(&mut links, 5, first);
        let (_, second) = rq.pop_highest(&mut links).unwrap();
        assert_eq!(second.get(), 1);
    }
}
