//! The kernel core: task table, dispatch, and the public object API
//! (§4.1, §4.2).
//!
//! Grounded on the teacher's `Kernel<Traits>`/`KernelCfg1`/`State` split: a
//! single value (here a concrete `Kernel<P, NT, NM, NC, NS>` rather than a
//! zero-sized type bound to a generic `Traits`) owns every control block in
//! fixed-size arrays, guarded by one [`KCell`]. Every public method
//! acquires a [`crate::klock::CpuLockGuard`] for its own duration — none of
//! them hold the lock across a call back into application code, matching
//! the teacher's "CPU Lock is never held across a callback" discipline.
pub mod readyqueue;

use core::marker::PhantomData;

use crate::{
    condvar::{self, CondvarId},
    error::{Error, Result},
    klock::{self, KCell},
    mutex::{self, MutexCb, MutexId, Protocol, UnlockOutcome},
    port::Port,
    semaphore::{self, SemaphoreCb, SemaphoreId},
    signal::SignalSet,
    task::{TaskId, TaskState, Tcb, UnblockReason},
    timeout::{Ticks, TimeoutQueue},
    utils::list::{Link, LinkedList},
    wait::WaitPayload,
};
use readyqueue::ReadyQueue;

/// A statically-sized kernel instance.
///
/// `NT`/`NM`/`NC`/`NS` are the task/mutex/condvar/semaphore counts fixed at
/// build time by [`crate::cfg`]; `P` is the architecture port
/// ([`crate::port::Port`]) this instance dispatches context switches
/// through.
pub struct Kernel<P, const NT: usize, const NM: usize, const NC: usize, const NS: usize> {
    inner: KCell<Inner<NT, NM, NC, NS>>,
    _port: PhantomData<fn() -> P>,
}

struct Inner<const NT: usize, const NM: usize, const NC: usize, const NS: usize> {
    tasks: [Tcb; NT],
    /// Shared link storage for the ready queue and every wait list: a task
    /// is a member of at most one list at a time, so one `Link` per task
    /// suffices for all of them (mirrors the teacher's single `TaskCb`
    /// queue-membership invariant).
    task_links: [Link<TaskId>; NT],
    wait_payload: [Option<WaitPayload>; NT],
    ready: ReadyQueue,
    timeout: TimeoutQueue<NT>,
    mutexes: [MutexCb; NM],
    mutex_waiters: [LinkedList<TaskId>; NM],
    condvar_waiters: [LinkedList<TaskId>; NC],
    semaphores: [SemaphoreCb; NS],
    semaphore_waiters: [LinkedList<TaskId>; NS],
    /// Tasks blocked in [`Kernel::join`] on each task index reaching
    /// `Dormant` (§6).
    joiners: [LinkedList<TaskId>; NT],
    current: Option<TaskId>,
    tick: Ticks,
    /// Set by [`Kernel::maybe_switch`] the first time a hardware context
    /// switch is requested since the last one actually ran. Several
    /// logical reschedules can be coalesced into one physical switch (the
    /// pendable interrupt `P::request_context_switch` arms is idempotent),
    /// so `switch_out` must record the task that was *actually still on
    /// the CPU* the first time this round's switch was requested, not
    /// whatever `current` happens to be by the time the handler runs.
    switch_pending: bool,
    switch_out: Option<TaskId>,
}

impl<const NT: usize, const NM: usize, const NC: usize, const NS: usize> Inner<NT, NM, NC, NS> {
    /// Index of the kernel-installed idle task (spec.md §3: "the run
    /// queue... always non-empty — the idle thread (base priority 0) is
    /// permanently Runnable"; §8: "the idle thread never leaves the run
    /// queue"). Reserved as the *last* task index rather than the first so
    /// that application task ids allocated from `0` stay untouched by this
    /// reservation.
    const IDLE: usize = NT - 1;

    const fn new() -> Self {
        Self::with_mutexes([MutexCb::new(Protocol::None, false); NM])
    }

    const fn with_mutexes(mutexes: [MutexCb; NM]) -> Self {
        let mut tasks = [Tcb::new(0); NT];
        // The idle task is permanently `Ready` at priority 0; it is never
        // activated, exited, or terminated through the ordinary task API.
        tasks[Self::IDLE].state = TaskState::Ready;
        Self {
            tasks,
            task_links: [Link { prev: None, next: None }; NT],
            wait_payload: [None; NT],
            ready: ReadyQueue::with_idle(0, TaskId::new(Self::IDLE)),
            timeout: TimeoutQueue::new(),
            mutexes,
            mutex_waiters: [LinkedList::new(); NM],
            condvar_waiters: [LinkedList::new(); NC],
            semaphores: [SemaphoreCb::new(0, 0); NS],
            semaphore_waiters: [LinkedList::new(); NS],
            joiners: [LinkedList::new(); NT],
            current: None,
            tick: 0,
            switch_pending: false,
            switch_out: None,
        }
    }

    /// Take the current task off the ready queue (it must be `Running`)
    /// and install `payload` as what it's now waiting for. Arms a timeout
    /// if `deadline` is given. Does not itself request a context switch;
    /// the caller does that once it's done touching kernel state.
    fn suspend_current(&mut self, payload: WaitPayload, deadline: Option<Ticks>) -> Result<TaskId> {
        let me = self.current.ok_or(Error::Invalid)?;
        self.wait_payload[me.get()] = Some(payload);
        match deadline {
            Some(d) => {
                self.tasks[me.get()].state = TaskState::BlockedWithTimeout;
                self.timeout
                    .arm(&mut self.tasks, me, d)
                    .map_err(|()| Error::Overflow)?;
            }
            None => {
                self.tasks[me.get()].state = TaskState::Blocked;
            }
        }
        Ok(me)
    }

    /// Move `task` from whatever wait list it's on back onto the ready
    /// queue, recording why. Disarms any pending timeout. Does not run
    /// `finish_wait` — the caller must do that before the task is actually
    /// dispatched so that, e.g., a mutex lock that was transferred to it
    /// is reflected before it resumes past its blocking call.
    fn wake(&mut self, task: TaskId, reason: UnblockReason) {
        self.timeout.disarm(&mut self.tasks, task);
        self.tasks[task.get()].unblock_reason = Some(reason);
        self.tasks[task.get()].state = TaskState::Ready;
        let prio = self.tasks[task.get()].effective_priority;
        self.ready.push_back(&mut self.task_links, prio, task);
    }

    /// Resolve `task`'s [`WaitPayload`], undoing any partial
    /// wait-list/priority-inheritance bookkeeping left over from a wait
    /// that ended in a timeout or an interruption rather than success.
    /// Called once, right before a woken task is allowed to run again.
    fn finish_wait(&mut self, task: TaskId) {
        let Some(payload) = self.wait_payload[task.get()].take() else {
            return;
        };
        let reason = self.tasks[task.get()].unblock_reason;
        let abandoned_wait = matches!(reason, Some(UnblockReason::TimedOut | UnblockReason::Interrupted));
        match payload {
            WaitPayload::Sleep | WaitPayload::Signal { .. } => {}
            WaitPayload::Mutex { id } => {
                if abandoned_wait {
                    mutex::cancel_wait(&mut self.tasks, &self.mutexes, &mut self.mutex_waiters, &mut self.ready, &mut self.task_links, id, task);
                }
            }
            WaitPayload::Condvar { id, .. } => {
                if abandoned_wait {
                    condvar::cancel_wait(&mut self.condvar_waiters, &mut self.task_links, id, task);
                }
            }
            WaitPayload::Semaphore { id } => {
                if abandoned_wait {
                    semaphore::cancel_wait(&mut self.semaphore_waiters, &mut self.task_links, id, task);
                }
            }
            WaitPayload::Join { target } => {
                if abandoned_wait {
                    self.joiners[target.get()].remove(&mut self.task_links, task);
                }
            }
        }
    }

    /// Recompute which task should be `Running`. If it differs from
    /// `self.current`, update bookkeeping and report the switch so the
    /// caller can request one from the port.
    fn reschedule(&mut self) -> Option<(Option<TaskId>, TaskId)> {
        let next_prio = self.ready.highest_priority();
        let current_prio = self.current.map(|t| self.tasks[t.get()].effective_priority);
        let should_switch = match (next_prio, self.current) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(np), Some(_)) => Some(np) > current_prio || current_prio.is_none(),
        };
        if !should_switch {
            return None;
        }
        let (_, next) = self.ready.pop_highest(&mut self.task_links)?;
        self.finish_wait(next);
        if let Some(cur) = self.current {
            if self.tasks[cur.get()].state == TaskState::Running {
                self.tasks[cur.get()].state = TaskState::Ready;
                let prio = self.tasks[cur.get()].effective_priority;
                self.ready.push_back(&mut self.task_links, prio, cur);
            }
        }
        self.tasks[next.get()].state = TaskState::Running;
        let outgoing = self.current;
        self.current = Some(next);
        Some((outgoing, next))
    }
}

impl<P: Port, const NT: usize, const NM: usize, const NC: usize, const NS: usize> Kernel<P, NT, NM, NC, NS> {
    pub const fn new() -> Self {
        Self {
            inner: KCell::new(Inner::new()),
            _port: PhantomData,
        }
    }

    /// Build a kernel instance with its mutexes' locking protocols fixed
    /// at compile time by `config` (§10.3's const-fn builder), rather than
    /// defaulting every mutex to [`Protocol::None`].
    pub const fn with_config(config: &crate::cfg::KernelConfig<NM>) -> Self {
        Self {
            inner: KCell::new(Inner::with_mutexes(config.build_mutex_table())),
            _port: PhantomData,
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<NT, NM, NC, NS>, &klock::CpuLockGuard) -> Result<R>) -> Result<R> {
        let guard = klock::lock()?;
        let r = self.inner.with(&guard, |inner| f(inner, &guard));
        drop(guard);
        r
    }

    /// Common tail of every call that may have changed which task should
    /// run: reschedule and, if the running task changed, ask the port to
    /// pend a context switch.
    fn maybe_switch(&self, inner: &mut Inner<NT, NM, NC, NS>) {
        if let Some((outgoing, _)) = inner.reschedule() {
            if !inner.switch_pending {
                inner.switch_out = outgoing;
                inner.switch_pending = true;
            }
            P::request_context_switch();
        }
    }

    /// The currently running task, or `None` before the first task has
    /// been activated.
    pub fn current(&self) -> Option<TaskId> {
        self.with_inner(|inner, _| Ok(inner.current)).unwrap_or(None)
    }

    /// Create (or re-activate, if dormant) `task` at `priority`, giving it
    /// an initial stack pointer computed from `stack`/`entry`/`arg` by the
    /// architecture port (§4.2's `switchContext` contract), and make it
    /// ready to run. Rejects the kernel-reserved idle task index.
    pub fn activate(&self, task: TaskId, priority: u8, stack: &mut [u8], entry: fn(usize) -> !, arg: usize) -> Result<()> {
        if task.get() == Inner::<NT, NM, NC, NS>::IDLE {
            return Err(Error::Invalid);
        }
        let sp = P::initial_stack(stack, entry, arg);
        self.with_inner(|inner, _| {
            if !matches!(inner.tasks[task.get()].state, TaskState::Dormant) {
                return Err(Error::Invalid);
            }
            inner.tasks[task.get()] = Tcb::new(priority);
            inner.tasks[task.get()].sp = sp;
            inner.tasks[task.get()].state = TaskState::Ready;
            inner.ready.push_back(&mut inner.task_links, priority, task);
            self.maybe_switch(inner);
            Ok(())
        })
    }

    /// Voluntarily give up the processor for this tick, letting an
    /// equal-priority task (if any) run next (§4.2's round-robin note).
    pub fn yield_now(&self) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            let prio = inner.tasks[me.get()].effective_priority;
            inner.tasks[me.get()].state = TaskState::Ready;
            inner.ready.push_back(&mut inner.task_links, prio, me);
            inner.current = None;
            self.maybe_switch(inner);
            Ok(())
        })
    }

    /// Block the current task on `payload`, with an optional absolute
    /// tick deadline, and request a context switch. Returns the reason the
    /// task eventually resumed.
    fn block(&self, payload: WaitPayload, deadline: Option<Ticks>) -> Result<UnblockReason> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            let me = inner.suspend_current(payload, deadline)?;
            inner.current = None;
            self.maybe_switch(inner);
            let reason = inner.tasks[me.get()]
                .unblock_reason
                .take()
                .unwrap_or(UnblockReason::Satisfied);
            Ok(reason)
        })
    }

    /// Wake `task` with [`UnblockReason::Satisfied`] and, if it now
    /// outranks the running task, request a context switch.
    fn unblock(&self, inner: &mut Inner<NT, NM, NC, NS>, task: TaskId) {
        inner.wake(task, UnblockReason::Satisfied);
        self.maybe_switch(inner);
    }

    /// Force an early wakeup of a task blocked in any wait (§4.2's
    /// `interrupt` operation). No-op if the task isn't blocked.
    pub fn interrupt(&self, task: TaskId) -> Result<()> {
        self.with_inner(|inner, _| {
            match inner.tasks[task.get()].state {
                TaskState::Blocked | TaskState::BlockedWithTimeout => {
                    inner.wake(task, UnblockReason::Interrupted);
                    self.maybe_switch(inner);
                    Ok(())
                }
                _ => Err(Error::Invalid),
            }
        })
    }

    /// Advance the tick counter by one and wake every task whose deadline
    /// has just elapsed. Intended to be called from a periodic timer ISR.
    pub fn tick(&self) -> Result<()> {
        self.with_inner(|inner, _| {
            inner.tick += 1;
            let now = inner.tick;
            let due: arrayvec::ArrayVec<TaskId, NT> = {
                let mut drain = inner.timeout.drain_due(&mut inner.tasks, now);
                let mut v = arrayvec::ArrayVec::new();
                while let Some(t) = drain.next() {
                    let _ = v.try_push(t);
                }
                v
            };
            for task in due {
                inner.wake(task, UnblockReason::TimedOut);
            }
            self.maybe_switch(inner);
            Ok(())
        })
    }

    /// Called from the architecture's naked context-switch handler
    /// (§[`crate::port`]) with the outgoing task's just-saved stack
    /// pointer. Stores it into the outgoing task's TCB and returns the
    /// incoming task's id and its own stored stack pointer, so the handler
    /// can restore it (spec.md §4.2's `switchContext(oldSp) -> newSp`).
    ///
    /// The kernel's own bookkeeping for *which* task should run was
    /// already decided by the `maybe_switch` call that requested this
    /// handler; `switch_out` records who was actually still running when
    /// that decision was made, since `current` may have moved on through
    /// further logical reschedules by the time the real hardware switch
    /// fires.
    pub fn context_switch_hook(&self, old_sp: usize) -> (TaskId, usize) {
        self.with_inner(|inner, _| {
            if let Some(out) = inner.switch_out.take() {
                inner.tasks[out.get()].sp = old_sp;
            }
            inner.switch_pending = false;
            let incoming = inner.current.unwrap_or_else(|| {
                crate::error::kernel_panic("context switch hook fired with no task selected to run")
            });
            Ok((incoming, inner.tasks[incoming.get()].sp))
        })
        .unwrap_or_else(|_| crate::error::kernel_panic("context switch hook: CPU lock unexpectedly held"))
    }

    // ---- Mutex ------------------------------------------------------

    pub fn mutex_lock(&self, mid: MutexId, deadline: Option<Ticks>) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        let reason = self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            if mutex::try_lock(&mut inner.tasks, &mut inner.mutexes, &inner.mutex_waiters, &mut inner.ready, &mut inner.task_links, mid, me)? {
                return Ok(UnblockReason::Satisfied);
            }
            mutex::enqueue_waiter_and_propagate(
                &mut inner.tasks,
                &mut inner.mutexes,
                &mut inner.mutex_waiters,
                &mut inner.ready,
                &mut inner.task_links,
                mid,
                me,
            )?;
            inner.suspend_current(WaitPayload::Mutex { id: mid }, deadline)?;
            inner.current = None;
            self.maybe_switch(inner);
            Ok(inner.tasks[me.get()].unblock_reason.take().unwrap_or(UnblockReason::Satisfied))
        })?;
        match reason {
            UnblockReason::Satisfied => Ok(()),
            UnblockReason::TimedOut => Err(Error::Timeout),
            UnblockReason::Interrupted => Err(Error::Interrupted),
        }
    }

    pub fn mutex_try_lock(&self, mid: MutexId) -> Result<()> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            if mutex::try_lock(&mut inner.tasks, &mut inner.mutexes, &inner.mutex_waiters, &mut inner.ready, &mut inner.task_links, mid, me)? {
                Ok(())
            } else {
                Err(Error::WouldBlock)
            }
        })
    }

    pub fn mutex_unlock(&self, mid: MutexId) -> Result<()> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            match mutex::unlock(&mut inner.tasks, &mut inner.mutexes, &mut inner.mutex_waiters, &mut inner.ready, &mut inner.task_links, mid, me)? {
                UnlockOutcome::Released => {}
                UnlockOutcome::Transferred(next) => inner.wake(next, UnblockReason::Satisfied),
            }
            self.maybe_switch(inner);
            Ok(())
        })
    }

    // ---- Condition variables -----------------------------------------

    /// Block on `cid` having already released `mutex` (the caller is
    /// expected to have unlocked it just before calling, per §4.4's
    /// POSIX-style contract); reacquires `mutex` before returning, even on
    /// a timed-out or interrupted wait.
    pub fn condvar_wait(&self, cid: CondvarId, mutex: MutexId, deadline: Option<Ticks>) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        // Enqueueing onto the condvar's wait list and suspending the
        // current task must happen under the same critical section: if a
        // notify from an ISR ran between the two, it could wake a task
        // that the ready queue doesn't yet know is no longer `Running`.
        let reason = self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            condvar::enqueue_waiter(&inner.tasks, &mut inner.condvar_waiters, &mut inner.task_links, cid, me);
            inner.suspend_current(WaitPayload::Condvar { id: cid, mutex }, deadline)?;
            inner.current = None;
            self.maybe_switch(inner);
            Ok(inner.tasks[me.get()].unblock_reason.take().unwrap_or(UnblockReason::Satisfied))
        })?;
        self.mutex_lock(mutex, None)?;
        match reason {
            UnblockReason::Satisfied => Ok(()),
            UnblockReason::TimedOut => Err(Error::Timeout),
            UnblockReason::Interrupted => Err(Error::Interrupted),
        }
    }

    pub fn condvar_notify_one(&self, cid: CondvarId) -> Result<()> {
        self.with_inner(|inner, _| {
            if let Some(task) = condvar::wake_one(&mut inner.condvar_waiters, &mut inner.task_links, cid) {
                self.unblock(inner, task);
            }
            Ok(())
        })
    }

    pub fn condvar_notify_all(&self, cid: CondvarId) -> Result<()> {
        self.with_inner(|inner, _| {
            let woken: arrayvec::ArrayVec<TaskId, NT> = {
                let mut drain = condvar::wake_all(&mut inner.condvar_waiters, &mut inner.task_links, cid);
                let mut v = arrayvec::ArrayVec::new();
                while let Some(t) = drain.next() {
                    let _ = v.try_push(t);
                }
                v
            };
            for task in woken {
                inner.wake(task, UnblockReason::Satisfied);
            }
            self.maybe_switch(inner);
            Ok(())
        })
    }

    // ---- Semaphores ---------------------------------------------------

    pub fn semaphore_wait(&self, sid: SemaphoreId, deadline: Option<Ticks>) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        let reason = self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            if semaphore::try_wait(&mut inner.semaphores, sid) {
                return Ok(UnblockReason::Satisfied);
            }
            semaphore::enqueue_waiter(&inner.tasks, &mut inner.semaphore_waiters, &mut inner.task_links, sid, me);
            inner.suspend_current(WaitPayload::Semaphore { id: sid }, deadline)?;
            inner.current = None;
            self.maybe_switch(inner);
            Ok(inner.tasks[me.get()].unblock_reason.take().unwrap_or(UnblockReason::Satisfied))
        })?;
        match reason {
            UnblockReason::Satisfied => Ok(()),
            UnblockReason::TimedOut => Err(Error::Timeout),
            UnblockReason::Interrupted => Err(Error::Interrupted),
        }
    }

    pub fn semaphore_try_wait(&self, sid: SemaphoreId) -> Result<()> {
        self.with_inner(|inner, _| {
            if semaphore::try_wait(&mut inner.semaphores, sid) {
                Ok(())
            } else {
                Err(Error::WouldBlock)
            }
        })
    }

    pub fn semaphore_post(&self, sid: SemaphoreId, count: u32) -> Result<()> {
        self.with_inner(|inner, _| {
            let mut woken_tasks: arrayvec::ArrayVec<TaskId, NT> = arrayvec::ArrayVec::new();
            semaphore::post(&mut inner.semaphores, &mut inner.semaphore_waiters, &mut inner.task_links, sid, count, |t| {
                let _ = woken_tasks.try_push(t);
            })?;
            for task in woken_tasks {
                inner.wake(task, UnblockReason::Satisfied);
            }
            self.maybe_switch(inner);
            Ok(())
        })
    }

    pub fn semaphore_drain(&self, sid: SemaphoreId) -> Result<()> {
        self.with_inner(|inner, _| {
            semaphore::drain(&mut inner.semaphores, sid);
            Ok(())
        })
    }

    // ---- Signals --------------------------------------------------------

    /// Raise `signals` against `task`. If `task` is blocked in
    /// `wait_any`/`wait_any_until` for a mask that intersects, wakes it
    /// immediately with the intersection delivered.
    pub fn signal_raise(&self, task: TaskId, signals: SignalSet) -> Result<()> {
        self.with_inner(|inner, _| {
            let waited_mask = match (&inner.wait_payload[task.get()], inner.tasks[task.get()].state) {
                (Some(WaitPayload::Signal { mask }), TaskState::Blocked | TaskState::BlockedWithTimeout) => Some(*mask),
                _ => None,
            };
            if inner.tasks[task.get()].signal.generate(signals, waited_mask).is_some() {
                inner.wake(task, UnblockReason::Satisfied);
                self.maybe_switch(inner);
            }
            Ok(())
        })
    }

    /// Non-blocking: clear and return any pending bits of `mask` for the
    /// current task.
    pub fn signal_poll(&self, mask: SignalSet) -> Result<Option<SignalSet>> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            Ok(inner.tasks[me.get()].signal.poll(mask))
        })
    }

    /// Block the current task until any signal in `mask` is pending,
    /// returning the delivered subset.
    pub fn signal_wait_any(&self, mask: SignalSet, deadline: Option<Ticks>) -> Result<SignalSet> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            if let Some(hit) = inner.tasks[me.get()].signal.poll(mask) {
                return Ok((UnblockReason::Satisfied, hit));
            }
            inner.suspend_current(WaitPayload::Signal { mask }, deadline)?;
            inner.current = None;
            self.maybe_switch(inner);
            let reason = inner.tasks[me.get()].unblock_reason.take().unwrap_or(UnblockReason::Satisfied);
            let delivered = inner.tasks[me.get()].signal.poll(mask).unwrap_or(SignalSet::empty());
            Ok((reason, delivered))
        })
        .and_then(|(reason, delivered)| match reason {
            UnblockReason::Satisfied => Ok(delivered),
            UnblockReason::TimedOut => Err(Error::Timeout),
            UnblockReason::Interrupted => Err(Error::Interrupted),
        })
    }

    // ---- Sleep ----------------------------------------------------------

    /// Sleep until at least `deadline` (an absolute tick count).
    pub fn sleep_until(&self, deadline: Ticks) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        match self.block(WaitPayload::Sleep, Some(deadline))? {
            UnblockReason::TimedOut => Ok(()),
            UnblockReason::Interrupted => Err(Error::Interrupted),
            UnblockReason::Satisfied => Ok(()),
        }
    }

    /// Sleep for (at least) `ticks` ticks from now.
    ///
    /// Per SPEC_FULL.md §11, the deadline is armed one tick later than the
    /// naive `now + ticks`: a tick that elapses between reading `now` and
    /// arming the timeout must not shorten the sleep below what the caller
    /// asked for.
    pub fn sleep_for(&self, ticks: Ticks) -> Result<()> {
        let now = self.with_inner(|inner, _| Ok(inner.tick))?;
        self.sleep_until(now + ticks + 1)
    }

    /// Exit the current task, abandoning (and marking inconsistent) every
    /// mutex it still owns, and waking anything joined on it.
    pub fn exit(&self) -> Result<()> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            self.retire(inner, me);
            self.maybe_switch(inner);
            Ok(())
        })
    }

    /// Forcibly terminate `task`, wherever it currently sits — `Ready`,
    /// `Running`, or blocked on anything — per §6's "start/join/detach/
    /// terminate" Kernel API surface. A no-op if `task` is already
    /// `Dormant`. Rejects the kernel-reserved idle task.
    pub fn terminate(&self, task: TaskId) -> Result<()> {
        if task.get() == Inner::<NT, NM, NC, NS>::IDLE {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            if matches!(inner.tasks[task.get()].state, TaskState::Dormant) {
                return Ok(());
            }
            self.retire(inner, task);
            self.maybe_switch(inner);
            Ok(())
        })
    }

    /// Pull `task` off whatever it currently occupies — the ready queue,
    /// `current`, or a wait list — abandon its owned mutexes, mark it
    /// `Dormant`, and wake anything blocked in [`join`](Self::join) on it.
    /// Shared tail of [`exit`](Self::exit) (self) and
    /// [`terminate`](Self::terminate) (an arbitrary target).
    fn retire(&self, inner: &mut Inner<NT, NM, NC, NS>, task: TaskId) {
        match inner.tasks[task.get()].state {
            TaskState::Running => inner.current = None,
            TaskState::Ready => {
                let prio = inner.tasks[task.get()].effective_priority;
                inner.ready.remove(&mut inner.task_links, prio, task);
            }
            TaskState::Blocked | TaskState::BlockedWithTimeout => {
                inner.timeout.disarm(&mut inner.tasks, task);
                inner.tasks[task.get()].unblock_reason = Some(UnblockReason::Interrupted);
                inner.finish_wait(task);
            }
            TaskState::Dormant => {}
        }

        let mut woken_tasks: arrayvec::ArrayVec<TaskId, NT> = arrayvec::ArrayVec::new();
        mutex::abandon_owned(
            &mut inner.tasks,
            &mut inner.mutexes,
            &mut inner.mutex_waiters,
            &mut inner.ready,
            &mut inner.task_links,
            task,
            |t| {
                let _ = woken_tasks.try_push(t);
            },
        );
        inner.tasks[task.get()].state = TaskState::Dormant;
        for woken in woken_tasks {
            inner.wake(woken, UnblockReason::Satisfied);
        }

        let mut joined: arrayvec::ArrayVec<TaskId, NT> = arrayvec::ArrayVec::new();
        while let Some(joiner) = inner.joiners[task.get()].pop_front(&mut inner.task_links) {
            let _ = joined.try_push(joiner);
        }
        for joiner in joined {
            inner.wake(joiner, UnblockReason::Satisfied);
        }
    }

    /// Block the current task until `target` reaches `Dormant` (§6's
    /// `join`). Returns immediately if `target` is already dormant.
    /// Rejects a `target` that has been [`detach`](Self::detach)ed or is
    /// the reserved idle task.
    pub fn join(&self, target: TaskId) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        if target.get() == Inner::<NT, NM, NC, NS>::IDLE {
            return Err(Error::Invalid);
        }
        let reason = self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            if inner.tasks[target.get()].detached {
                return Err(Error::Invalid);
            }
            if matches!(inner.tasks[target.get()].state, TaskState::Dormant) {
                return Ok(UnblockReason::Satisfied);
            }
            inner.joiners[target.get()].push_back(&mut inner.task_links, me);
            inner.suspend_current(WaitPayload::Join { target }, None)?;
            inner.current = None;
            self.maybe_switch(inner);
            Ok(inner.tasks[me.get()].unblock_reason.take().unwrap_or(UnblockReason::Satisfied))
        })?;
        match reason {
            UnblockReason::Satisfied | UnblockReason::TimedOut => Ok(()),
            UnblockReason::Interrupted => Err(Error::Interrupted),
        }
    }

    /// Mark `task` detached: once it exits, nothing can subsequently
    /// [`join`](Self::join) it (§6).
    pub fn detach(&self, task: TaskId) -> Result<()> {
        if task.get() == Inner::<NT, NM, NC, NS>::IDLE {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            inner.tasks[task.get()].detached = true;
            Ok(())
        })
    }

    // ---- This-thread priority -----------------------------------------

    /// The current task's base priority (§6).
    pub fn get_priority(&self) -> Result<u8> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            Ok(inner.tasks[me.get()].base_priority)
        })
    }

    /// The current task's effective priority, which may be boosted above
    /// its base priority by priority inheritance or a priority-ceiling
    /// mutex (§6).
    pub fn get_effective_priority(&self) -> Result<u8> {
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            Ok(inner.tasks[me.get()].effective_priority)
        })
    }

    /// Change the current task's base priority. If `always_behind` is set,
    /// the caller is unconditionally requeued at the back of its (new)
    /// priority band, even when the numeric priority didn't drop — grounded
    /// on distortos's `ThisThread::setPriority(priority, alwaysBehind)`
    /// (`examples/original_source/source/threads/ThisThread.cpp:55-58`).
    pub fn set_priority(&self, priority: u8, always_behind: bool) -> Result<()> {
        if P::is_interrupt_context() {
            return Err(Error::Invalid);
        }
        self.with_inner(|inner, _| {
            let me = inner.current.ok_or(Error::Invalid)?;
            inner.tasks[me.get()].base_priority = priority;
            let effective = mutex::recompute_effective_priority(
                &mut inner.tasks,
                &inner.mutexes,
                &inner.mutex_waiters,
                &mut inner.ready,
                &mut inner.task_links,
                me,
            );
            if always_behind {
                inner.tasks[me.get()].state = TaskState::Ready;
                inner.ready.push_back(&mut inner.task_links, effective, me);
                inner.current = None;
            }
            self.maybe_switch(inner);
            Ok(())
        })
    }
}

impl<P: Port, const NT: usize, const NM: usize, const NC: usize, const NS: usize> Default for Kernel<P, NT, NM, NC, NS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static SWITCH_REQUESTS: AtomicUsize = AtomicUsize::new(0);

    /// A port that never actually runs code — it just counts how many
    /// times the kernel asked for a context switch. Exercising a real
    /// blocking wait needs an architecture that can suspend and resume a
    /// call stack, which is exactly what §1's Non-goals exclude from this
    /// crate; these tests stick to the non-blocking paths, the way the
    /// teacher's own `Kernel` unit tests avoid depending on `PortThreading`.
    struct MockPort;
    impl Port for MockPort {
        fn initial_stack(stack: &mut [u8], _entry: fn(usize) -> !, _arg: usize) -> usize {
            // No real register frame: these tests never actually dispatch
            // through a task's entry point, just exercise kernel
            // bookkeeping, so any distinct value threading through
            // `context_switch_hook` is fine.
            stack.as_ptr() as usize
        }
        fn request_context_switch() {
            SWITCH_REQUESTS.fetch_add(1, Ordering::Relaxed);
        }
        fn is_interrupt_context() -> bool {
            false
        }
    }

    type TestKernel = Kernel<MockPort, 4, 2, 2, 2>;

    fn activate(k: &TestKernel, task: TaskId, priority: u8) -> Result<()> {
        let mut stack = [0u8; 64];
        fn entry(_arg: usize) -> ! {
            loop {}
        }
        k.activate(task, priority, &mut stack, entry, 0)
    }

    #[test]
    fn activate_runs_highest_priority_first() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 3).unwrap();
        assert_eq!(k.current(), Some(TaskId::new(0)));
        activate(&k, TaskId::new(1), 7).unwrap();
        // Task 1 outranks task 0, so it preempts.
        assert_eq!(k.current(), Some(TaskId::new(1)));
    }

    #[test]
    fn reactivating_a_non_dormant_task_is_invalid() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        assert_eq!(activate(&k, TaskId::new(0), 1), Err(Error::Invalid));
    }

    #[test]
    fn activating_the_reserved_idle_task_index_is_invalid() {
        let k = TestKernel::new();
        assert_eq!(activate(&k, TaskId::new(3), 1), Err(Error::Invalid));
    }

    #[test]
    fn idle_task_is_runnable_when_everything_else_is_dormant() {
        let k = TestKernel::new();
        // No task has been activated; the idle task was seeded into the
        // ready queue at construction time, so the very next reschedule
        // (triggered here by a tick, which needs no current task) picks
        // it up.
        k.tick().unwrap();
        assert_eq!(k.current(), Some(TaskId::new(3)));
    }

    #[test]
    fn mutex_fast_path_lock_and_unlock() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        let mid = MutexId::new(0);
        k.mutex_lock(mid, None).unwrap();
        assert_eq!(k.mutex_try_lock(MutexId::new(1)), Ok(()));
        k.mutex_unlock(mid).unwrap();
        // Double-unlock is rejected: no longer the owner.
        assert_eq!(k.mutex_unlock(mid), Err(Error::Invalid));
    }

    #[test]
    fn semaphore_try_wait_and_post_roundtrip() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        let sid = SemaphoreId::new(0);
        assert_eq!(k.semaphore_try_wait(sid), Err(Error::WouldBlock));
        k.semaphore_post(sid, 1).unwrap();
        assert_eq!(k.semaphore_try_wait(sid), Ok(()));
    }

    #[test]
    fn signal_poll_is_non_blocking() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        assert_eq!(k.signal_poll(SignalSet::SIG_0), Ok(None));
        k.signal_raise(TaskId::new(0), SignalSet::SIG_0).unwrap();
        assert_eq!(k.signal_poll(SignalSet::SIG_0), Ok(Some(SignalSet::SIG_0)));
    }

    #[test]
    fn tick_advances_without_armed_timeouts() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        k.tick().unwrap();
        k.tick().unwrap();
    }

    #[test]
    fn interrupting_a_ready_task_is_invalid() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 1).unwrap();
        assert_eq!(k.interrupt(TaskId::new(0)), Err(Error::Invalid));
    }

    #[test]
    fn context_switch_hook_stores_outgoing_stack_pointer() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 3).unwrap();
        activate(&k, TaskId::new(1), 7).unwrap();
        // Task 1 preempted task 0; the hook reports task 1 as incoming and
        // would have stashed whatever `old_sp` the (mock) handler passed in
        // against task 0's TCB.
        let (incoming, _new_sp) = k.context_switch_hook(0xDEAD_BEEF);
        assert_eq!(incoming, TaskId::new(1));
    }

    #[test]
    fn get_and_set_priority_reposition_a_ready_peer() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 5).unwrap();
        activate(&k, TaskId::new(1), 5).unwrap();
        // Task 0 is current (activated first among equal priorities);
        // task 1 sits ready at priority 5.
        assert_eq!(k.get_priority(), Ok(5));
        assert_eq!(k.get_effective_priority(), Ok(5));
        k.set_priority(9, false).unwrap();
        assert_eq!(k.get_priority(), Ok(9));
        // Raising the running task's own priority doesn't hand off the
        // processor.
        assert_eq!(k.current(), Some(TaskId::new(0)));
    }

    #[test]
    fn join_wakes_up_once_the_target_exits() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 5).unwrap();
        activate(&k, TaskId::new(1), 1).unwrap();
        // Task 0 is running; task 1 is ready but never gets to run in
        // this single-threaded test harness, so exercise `join` against
        // an already-dormant target instead.
        k.terminate(TaskId::new(1)).unwrap();
        assert_eq!(k.join(TaskId::new(1)), Ok(()));
    }

    #[test]
    fn detaching_a_task_forbids_joining_it() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 5).unwrap();
        k.detach(TaskId::new(0)).unwrap();
        assert_eq!(k.join(TaskId::new(0)), Err(Error::Invalid));
    }

    #[test]
    fn terminate_abandons_owned_mutexes() {
        let k = TestKernel::new();
        activate(&k, TaskId::new(0), 5).unwrap();
        let mid = MutexId::new(0);
        k.mutex_lock(mid, None).unwrap();
        k.terminate(TaskId::new(0)).unwrap();
        // Ownership is released; a fresh task can acquire it.
        activate(&k, TaskId::new(1), 1).unwrap();
        assert_eq!(k.mutex_try_lock(mid), Ok(()));
    }
}
