//! Signals (§4.6).
//!
//! Grounded on distortos's `SignalsReceiverControlBlock` (`examples/original_source/source/signals/SignalsReceiverControlBlock.cpp`):
//! each task carries a *pending* set and, while blocked in `waitAny`, a
//! *waited* mask; generating a signal ORs it into the pending set and, if
//! it intersects the waiting task's waited mask, wakes the task with the
//! intersection delivered as the wait's result. The teacher kernel has no
//! signal facility (it models only event groups and semaphores), so this
//! module's shape follows distortos directly rather than `r3_kernel`.
use bitflags::bitflags;

bitflags! {
    /// A set of up to 32 distinct signal numbers.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct SignalSet: u32 {
        const SIG_0 = 1 << 0;
        const SIG_1 = 1 << 1;
        const SIG_2 = 1 << 2;
        const SIG_3 = 1 << 3;
        const SIG_4 = 1 << 4;
        const SIG_5 = 1 << 5;
        const SIG_6 = 1 << 6;
        const SIG_7 = 1 << 7;
        #[allow(clippy::eq_op)]
        const ALL = u32::MAX;
    }
}

/// Per-task signal bookkeeping (lives inside [`crate::task::Tcb`]).
#[derive(Debug, Clone, Copy)]
pub struct SignalState {
    pending: SignalSet,
}

impl SignalState {
    pub const fn new() -> Self {
        Self {
            pending: SignalSet::empty(),
        }
    }

    /// OR `signals` into the pending set. Returns the lowest-numbered
    /// signal (if any) that should wake a task currently blocked in
    /// `waitAny`/`waitAnyUntil` for `waited_mask`, per §4.6's "return the
    /// lowest such n and clear it" — any other bits the intersection also
    /// contains stay pending for a later call.
    pub(crate) fn generate(&mut self, signals: SignalSet, waited_mask: Option<SignalSet>) -> Option<SignalSet> {
        self.pending.insert(signals);
        let waited_mask = waited_mask?;
        let hit = lowest_bit(self.pending & waited_mask)?;
        self.pending.remove(hit);
        Some(hit)
    }

    /// Poll (non-blocking): if any of `mask` is already pending, clear and
    /// return only the lowest-numbered one, leaving the rest pending.
    pub(crate) fn poll(&mut self, mask: SignalSet) -> Option<SignalSet> {
        let hit = lowest_bit(self.pending & mask)?;
        self.pending.remove(hit);
        Some(hit)
    }
}

/// The lowest set bit of `set`, or `None` if it's empty.
fn lowest_bit(set: SignalSet) -> Option<SignalSet> {
    if set.is_empty() {
        None
    } else {
        Some(SignalSet::from_bits_retain(1 << set.bits().trailing_zeros()))
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_consumes_matched_bits_only() {
        let mut s = SignalState::new();
        s.generate(SignalSet::SIG_0 | SignalSet::SIG_2, None);
        let got = s.poll(SignalSet::SIG_0 | SignalSet::SIG_1).unwrap();
        assert_eq!(got, SignalSet::SIG_0);
        // SIG_2 remains pending.
        assert_eq!(s.poll(SignalSet::SIG_2), Some(SignalSet::SIG_2));
        assert_eq!(s.poll(SignalSet::ALL), None);
    }

    #[test]
    fn generate_wakes_a_matching_waiter() {
        let mut s = SignalState::new();
        let delivered = s.generate(SignalSet::SIG_3, Some(SignalSet::SIG_3 | SignalSet::SIG_4));
        assert_eq!(delivered, Some(SignalSet::SIG_3));
    }

    #[test]
    fn generate_does_not_wake_non_matching_waiter() {
        let mut s = SignalState::new();
        let delivered = s.generate(SignalSet::SIG_3, Some(SignalSet::SIG_4));
        assert_eq!(delivered, None);
        // but it's still recorded as pending for a later poll/wait
        assert_eq!(s.poll(SignalSet::SIG_3), Some(SignalSet::SIG_3));
    }

    #[test]
    fn waiting_on_two_pending_signals_delivers_only_the_lowest() {
        let mut s = SignalState::new();
        s.generate(SignalSet::SIG_3 | SignalSet::SIG_5, None);
        let mask = SignalSet::SIG_3 | SignalSet::SIG_5;
        assert_eq!(s.poll(mask), Some(SignalSet::SIG_3));
        // SIG_5 is still pending for the next call.
        assert_eq!(s.poll(mask), Some(SignalSet::SIG_5));
        assert_eq!(s.poll(mask), None);
    }
}
