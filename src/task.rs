//! Task control block.
//!
//! Grounded on the teacher's `task.rs`: the same `TaskSt`-style state
//! machine and the same separation between a task's *base priority*
//! (assigned at creation/`set_priority`) and its *effective priority*
//! (raised by priority inheritance — §4.3), but addressed through a
//! `TaskId` index into the owning [`crate::Kernel`]'s task array instead
//! of a `&'static TaskCb<Traits>`.
use crate::{signal::SignalState, utils::list::Idx};

/// A task's identity: its index into the kernel's task array.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskId(pub(crate) u16);

impl TaskId {
    pub(crate) const fn new(i: usize) -> Self {
        Self(i as u16)
    }
    pub(crate) fn get(self) -> usize {
        self.0 as usize
    }
}

impl Idx for TaskId {
    fn index(self) -> usize {
        self.0 as usize
    }
    fn from_index(i: usize) -> Self {
        Self::new(i)
    }
}

/// A task's run state, mirroring the specification's TCB state field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    /// Never activated, or has exited. Not schedulable.
    Dormant,
    /// On the ready queue, waiting for the processor.
    Ready,
    /// Currently the running task.
    Running,
    /// Blocked on a mutex, condition variable, semaphore, signal wait, or
    /// a plain sleep, with no timeout armed.
    Blocked,
    /// Blocked as above, with an entry in the timed-wait queue.
    BlockedWithTimeout,
}

/// Why a blocked task was (or should be) woken, used by [`crate::wait`] to
/// dispatch the right "finish waiting" logic without runtime polymorphism
/// (matching the specification's "dispatch on unblock via a tagged
/// variant, not dynamic dispatch" design note).
#[derive(Clone, Copy, Debug)]
pub enum UnblockReason {
    /// The wait condition was satisfied normally (woken by a mutex
    /// unlock, a condvar notify, a semaphore post, or a signal).
    Satisfied,
    /// The wait's deadline elapsed first.
    TimedOut,
    /// [`crate::sched::Kernel::interrupt`] was called on this task.
    Interrupted,
}

/// The task control block.
#[derive(Debug, Clone, Copy)]
pub struct Tcb {
    pub(crate) state: TaskState,
    /// Priority assigned at creation or by `set_priority`. `0` is reserved
    /// for the idle task; larger values are more urgent.
    pub(crate) base_priority: u8,
    /// `base_priority`, boosted by priority inheritance from mutexes this
    /// task (transitively) blocks the lock of. Always `>= base_priority`.
    pub(crate) effective_priority: u8,
    /// Head of the singly-linked list of mutexes this task currently owns
    /// (§4.3's "owned mutex list"), threaded through
    /// `MutexCb::next_held_by_owner` in `crate::mutex`.
    pub(crate) first_held_mutex: Option<crate::mutex::MutexId>,
    /// Set while blocked on a mutex, to let priority-inheritance chain
    /// propagation walk "waiter -> mutex it's blocked on -> mutex's
    /// owner -> mutex owner is blocked on -> ..." (§4.3, §9).
    pub(crate) blocked_on_mutex: Option<crate::mutex::MutexId>,
    /// Set by the unblocking side before requesting a context switch;
    /// read by the woken task when it resumes past its blocking call.
    pub(crate) unblock_reason: Option<UnblockReason>,
    /// Per-task pending/waited signal masks (§4.6).
    pub(crate) signal: SignalState,
    /// Position of this task's entry in the kernel's timed-wait heap,
    /// maintained by [`crate::timeout`]'s `on_move` callback so the
    /// heap supports `O(log n)` cancellation.
    pub(crate) timeout_heap_pos: Option<usize>,
    /// Stack pointer saved by the architecture's naked context-switch
    /// handler when this task is switched out, and handed back to it by
    /// [`crate::sched::Kernel::context_switch_hook`] when switched back in
    /// (spec.md §3's "stack pointer" TCB field, §4.2's `switchContext`).
    /// Meaningless while this task is `Running` or `Dormant`.
    pub(crate) sp: usize,
    /// Set by [`crate::sched::Kernel::detach`]; a detached task cannot be
    /// joined (§6).
    pub(crate) detached: bool,
}

impl Tcb {
    pub(crate) const fn new(priority: u8) -> Self {
        Self {
            state: TaskState::Dormant,
            base_priority: priority,
            effective_priority: priority,
            first_held_mutex: None,
            blocked_on_mutex: None,
            unblock_reason: None,
            signal: SignalState::new(),
            timeout_heap_pos: None,
            sp: 0,
            detached: false,
        }
    }
}
