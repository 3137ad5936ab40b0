//! Static configuration (§10.3).
//!
//! The teacher's `cfg.rs`/`cfg/*.rs` build a `CfgBuilder` through a
//! `build!` macro that accumulates tasks/mutexes/event groups/timers into
//! `ComptimeVec`s during const evaluation, because its `Traits` type is
//! chosen by the application and the teacher's object pools, priority
//! level count, and hunk layout are all derived from that one configuration
//! pass. This kernel fixes its object counts directly as `Kernel`'s const
//! generics and creates tasks at runtime via [`crate::sched::Kernel::activate`],
//! so the only thing that still needs to be nailed down *before* the
//! kernel exists — because changing a mutex's locking protocol out from
//! under a queue of waiters that assumed it wouldn't change has no sound
//! meaning — is each mutex's [`crate::mutex::Protocol`]. `KernelConfig` is
//! a minimal const-fn builder for exactly that, in the same declarative
//! style as the teacher's configuration functions but without a macro.
use crate::mutex::{MutexCb, Protocol};

/// One mutex's static configuration.
#[derive(Clone, Copy)]
pub struct MutexConfig {
    protocol: Protocol,
    recursive: bool,
}

impl MutexConfig {
    pub const fn new(protocol: Protocol) -> Self {
        Self {
            protocol,
            recursive: false,
        }
    }

    /// Allow the owner to lock this mutex again without blocking,
    /// incrementing a recursion count instead of the default
    /// non-recursive behavior (§4.3).
    pub const fn recursive(mut self) -> Self {
        self.recursive = true;
        self
    }
}

/// A const-evaluated table of `NM` mutexes' configurations, built up with
/// chained calls and handed to [`crate::sched::Kernel::with_config`].
///
/// ```
/// use embla_kernel::cfg::{KernelConfig, MutexConfig};
/// use embla_kernel::mutex::Protocol;
///
/// const CONFIG: KernelConfig<2> = KernelConfig::new()
///     .mutex(0, MutexConfig::new(Protocol::PriorityInheritance))
///     .mutex(1, MutexConfig::new(Protocol::PriorityProtect { ceiling: 10 }));
/// ```
pub struct KernelConfig<const NM: usize> {
    mutexes: [MutexConfig; NM],
}

impl<const NM: usize> KernelConfig<NM> {
    pub const fn new() -> Self {
        Self {
            mutexes: [MutexConfig::new(Protocol::None); NM],
        }
    }

    /// Set mutex `index`'s configuration. Panics (at compile time, since
    /// this is meant to be called while building a `const`) if `index` is
    /// out of range.
    pub const fn mutex(mut self, index: usize, config: MutexConfig) -> Self {
        self.mutexes[index] = config;
        self
    }

    pub(crate) const fn build_mutex_table(&self) -> [MutexCb; NM] {
        let mut out = [MutexCb::new(Protocol::None, false); NM];
        let mut i = 0;
        while i < NM {
            out[i] = MutexCb::new(self.mutexes[i].protocol, self.mutexes[i].recursive);
            i += 1;
        }
        out
    }
}

impl<const NM: usize> Default for KernelConfig<NM> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_distinct_protocols_per_slot() {
        const CONFIG: KernelConfig<2> = KernelConfig::new()
            .mutex(0, MutexConfig::new(Protocol::PriorityInheritance))
            .mutex(1, MutexConfig::new(Protocol::PriorityProtect { ceiling: 10 }).recursive());

        let table = CONFIG.build_mutex_table();
        assert_eq!(table[0].protocol, Protocol::PriorityInheritance);
        assert!(!table[0].recursive);
        assert_eq!(table[1].protocol, Protocol::PriorityProtect { ceiling: 10 });
        assert!(table[1].recursive);
    }
}
