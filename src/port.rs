//! The architecture port contract.
//!
//! Everything in this module is a trait and documentation, not an
//! implementation: register-level context save/restore, the reset
//! handler, and device/board bring-up are explicitly out of scope (the
//! specification's §1 Non-goals) and belong to a separate
//! architecture-specific crate that implements [`Port`] and supplies the
//! naked interrupt handler described below. This mirrors how the teacher
//! kernel isolates `PortThreading`/`PortInterrupts` from `r3_kernel`
//! proper, and how distortos isolates `architecture/` from `scheduler/`
//! (see `examples/original_source/source/architecture/ARM/ARMv6-M-ARMv7-M/ARMv6-M-ARMv7-M-PendSV_Handler.cpp`).
use crate::task::TaskId;

/// Operations the kernel core needs from the architecture/board layer.
///
/// A port implementation is a zero-sized type (the kernel never holds
/// port *state*, only calls its associated functions) registered with a
/// [`crate::cfg::Kernel`] at configuration time.
pub trait Port {
    /// Compute the initial stack-pointer value for a new task, having
    /// written onto `stack` whatever initial register frame this
    /// architecture's first-dispatch trampoline expects to pop. `entry`
    /// is the task's entry point and `arg` is its single argument.
    ///
    /// No default implementation is provided: the frame layout is
    /// entirely architecture-specific.
    fn initial_stack(stack: &mut [u8], entry: fn(usize) -> !, arg: usize) -> usize;

    /// Request that a context switch happen as soon as it is safe to do
    /// so — typically by pending a low-priority interrupt (Cortex-M's
    /// PendSV, or equivalent). Must be callable from within the
    /// interrupt mask guard (i.e. with interrupts masked) and must be
    /// idempotent: calling it again before the pending switch has run
    /// must not queue a second one.
    ///
    /// The kernel calls this and returns; it never blocks waiting for the
    /// switch to actually happen. The switch itself runs later, from the
    /// naked handler described below, after the interrupt mask guard has
    /// been released.
    fn request_context_switch();

    /// `true` iff the processor is currently executing in an interrupt
    /// context (used to reject blocking calls made from an ISR, per
    /// §4.2's "blocking from an interrupt handler is `Error::Invalid`").
    fn is_interrupt_context() -> bool;
}

/// Contract for the pendable low-priority interrupt handler that performs
/// the actual context switch.
///
/// This handler is `#[naked]` — it cannot have a Rust-level body, since it
/// runs with a partially-unknown register state and must not disturb the
/// interrupted context's registers before they're saved. Its required
/// shape, grounded on distortos's `PendSV_Handler`:
///
/// 1. Save the currently-running task's callee-saved registers onto its
///    own stack (the ones not already saved by the architecture's
///    exception entry sequence), yielding the outgoing stack pointer.
/// 2. Call [`crate::sched::Kernel::context_switch_hook`] with that stack
///    pointer (a normal, safe Rust function — everything before and after
///    this call is the only architecture-specific part). The hook stores
///    it into the outgoing task's TCB (`Tcb::sp`) and returns the incoming
///    task's id and its own stored stack pointer.
/// 3. Load the returned stack pointer and restore the incoming task's
///    callee-saved registers.
/// 4. Return from the exception, resuming the incoming task.
///
/// Throughout, the interrupt mask guard (`crate::klock`) must be held
/// across steps 1-4: this handler *is* the pendable interrupt the guard
/// masks, so entering it already implies exclusive access, but the
/// kernel-side bookkeeping in step 3 still acquires a [`crate::klock::CpuLockGuard`]
/// to keep the invariant checkable independent of the caller.
pub trait NakedContextSwitchHandler {
    /// Marker associated constant documenting which outgoing/incoming
    /// task ids a conforming handler must thread through steps 1-5 above.
    const CONTRACT: fn(Option<TaskId>, TaskId) = |_outgoing, _incoming| {};
}
