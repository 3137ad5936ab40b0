//! The blocking protocol's shared vocabulary (§4.2, §9).
//!
//! The specification's design notes call for "dispatch on unblock via a
//! tagged variant, not runtime polymorphism" — this is that variant.
//! [`crate::sched::Inner::block`]/`block_until` store one of these in the
//! blocking task's TCB before suspending it; when the task resumes (woken
//! normally, timed out, or interrupted — [`crate::task::UnblockReason`]),
//! [`crate::sched::Inner::finish_wait`] matches on it to run the
//! resource-specific "did I actually get what I was waiting for, and if
//! not, undo the bookkeeping" step — the same role the teacher's
//! `WaitQueue`/object-specific wait payloads play, collapsed here into one
//! enum since every kernel object's wait list shares the same
//! `LinkedList<TaskId>` shape.
use crate::{condvar::CondvarId, mutex::MutexId, semaphore::SemaphoreId, signal::SignalSet, task::TaskId};

/// What a blocked task is waiting for, recorded in its TCB for the
/// duration of the wait.
#[derive(Clone, Copy, Debug)]
pub(crate) enum WaitPayload {
    /// A plain `sleep_for`/`sleep_until` with no associated kernel object;
    /// always resolved by timeout (or interruption), never "satisfied".
    Sleep,
    /// Blocked in `waitAny`/`waitAnyUntil` for any signal in `mask`.
    Signal { mask: SignalSet },
    /// Blocked trying to acquire a mutex.
    Mutex { id: MutexId },
    /// Blocked in a condition variable wait; `mutex` is the lock to
    /// reacquire before the call returns, per §4.4's POSIX-style contract.
    Condvar { id: CondvarId, mutex: MutexId },
    /// Blocked waiting for a semaphore permit.
    Semaphore { id: SemaphoreId },
    /// Blocked in `join`, waiting for `target` to reach `Dormant`.
    Join { target: TaskId },
}
