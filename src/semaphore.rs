//! Counting semaphores (§4.5).
//!
//! Grounded closely on the teacher's `semaphore.rs`: a `value`/`max_value`
//! pair and a wait queue, `poll_core` deciding in one place whether the
//! current value satisfies a wait/try-wait, and `post` (the teacher's
//! `signal`) crediting permits directly to woken tasks one at a time
//! instead of depositing them into `value` and waking everyone to
//! re-check — this is "equivalent to `wake_up_all_conditional` plus
//! `poll_core` per waiter, but (presumably) more efficient", in the
//! teacher's own words.
use crate::{
    error::{Error, Result},
    task::{TaskId, Tcb},
    utils::list::{Link, LinkedList},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SemaphoreId(pub(crate) u16);

impl SemaphoreId {
    pub(crate) fn new(i: usize) -> Self {
        Self(i as u16)
    }
    pub(crate) fn get(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SemaphoreCb {
    pub(crate) value: u32,
    pub(crate) max_value: u32,
}

impl SemaphoreCb {
    pub const fn new(initial: u32, max_value: u32) -> Self {
        Self {
            value: initial,
            max_value,
        }
    }
}

/// Check whether `value` satisfies a wait (i.e. is non-zero) and, if so,
/// consume one permit.
fn poll_core(value: &mut u32) -> bool {
    if *value > 0 {
        *value -= 1;
        true
    } else {
        false
    }
}

/// Non-blocking: consume a permit if available.
pub(crate) fn try_wait(semaphores: &mut [SemaphoreCb], sid: SemaphoreId) -> bool {
    poll_core(&mut semaphores[sid.get()].value)
}

/// Queue `task` to wait for the next permit, priority-ordered.
pub(crate) fn enqueue_waiter(
    tasks: &[Tcb],
    waiters: &mut [LinkedList<TaskId>],
    links: &mut [Link<TaskId>],
    sid: SemaphoreId,
    task: TaskId,
) {
    waiters[sid.get()].insert_by_key_desc(links, task, |t| tasks[t.0 as usize].effective_priority);
}

pub(crate) fn cancel_wait(
    waiters: &mut [LinkedList<TaskId>],
    links: &mut [Link<TaskId>],
    sid: SemaphoreId,
    task: TaskId,
) {
    waiters[sid.get()].remove(links, task);
}

/// Post `count` permits. Credits them directly to waiters (highest
/// priority first) before depositing any remainder into `value`. Returns
/// the tasks that were woken, in wake order.
pub(crate) fn post(
    semaphores: &mut [SemaphoreCb],
    waiters: &mut [LinkedList<TaskId>],
    links: &mut [Link<TaskId>],
    sid: SemaphoreId,
    mut count: u32,
    mut woken: impl FnMut(TaskId),
) -> Result<()> {
    let value = semaphores[sid.get()].value;
    if semaphores[sid.get()].max_value - value < count {
        return Err(Error::Overflow);
    }

    while count > 0 {
        match waiters[sid.get()].pop_front(links) {
            Some(task) => {
                woken(task);
                count -= 1;
            }
            None => {
                semaphores[sid.get()].value = value + count;
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Reset the semaphore's count to zero, as in the teacher's
/// `raw_semaphore_drain`.
pub(crate) fn drain(semaphores: &mut [SemaphoreCb], sid: SemaphoreId) {
    semaphores[sid.get()].value = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_credits_waiters_before_the_counter() {
        let mut tasks = vec![Tcb::new(0), Tcb::new(0)];
        tasks[0].effective_priority = 3;
        tasks[1].effective_priority = 7;
        let mut sems = vec![SemaphoreCb::new(0, 4)];
        let mut waiters = vec![LinkedList::new()];
        let mut links = vec![Link::default(); 2];
        let sid = SemaphoreId::new(0);

        enqueue_waiter(&tasks, &mut waiters, &mut links, sid, TaskId::new(0));
        enqueue_waiter(&tasks, &mut waiters, &mut links, sid, TaskId::new(1));

        let mut woken_order = Vec::new();
        post(&mut sems, &mut waiters, &mut links, sid, 1, |t| {
            woken_order.push(t.get())
        })
        .unwrap();

        assert_eq!(woken_order, vec![1]);
        assert_eq!(sems[0].value, 0);
    }

    #[test]
    fn post_overflow_is_rejected() {
        let mut sems = vec![SemaphoreCb::new(3, 4)];
        let mut waiters: Vec<LinkedList<TaskId>> = vec![LinkedList::new()];
        let mut links: Vec<Link<TaskId>> = vec![];
        let sid = SemaphoreId::new(0);
        assert_eq!(
            post(&mut sems, &mut waiters, &mut links, sid, 2, |_| {}),
            Err(Error::Overflow)
        );
    }

    #[test]
    fn try_wait_consumes_a_permit() {
        let mut sems = vec![SemaphoreCb::new(1, 1)];
        assert!(try_wait(&mut sems, SemaphoreId::new(0)));
        assert!(!try_wait(&mut sems, SemaphoreId::new(0)));
    }
}
