//! A preemptive, priority-based real-time scheduling kernel core for
//! single-processor microcontrollers.
//!
//! This crate implements the scheduling, synchronization, and timing
//! primitives of a small RTOS — the task control blocks, the ready queue,
//! mutexes (with the `None`/priority-inheritance/priority-ceiling
//! protocols), condition variables, counting semaphores, per-task signals,
//! and the timed-wait machinery that backs `sleep`/timeouts — without
//! committing to any particular architecture. An architecture-specific
//! crate provides the actual context-switch assembly by implementing
//! [`port::Port`] and the naked handler described there; everything else
//! lives here.
//!
//! Start at [`sched::Kernel`], the top-level object that owns every task
//! and kernel object and exposes the public scheduling API.
#![cfg_attr(not(test), no_std)]

pub mod cfg;
pub mod condvar;
pub mod error;
pub mod klock;
pub mod mutex;
pub mod port;
pub mod sched;
pub mod semaphore;
pub mod signal;
pub mod task;
pub mod timeout;
pub(crate) mod utils;
pub(crate) mod wait;

pub use error::{Error, Result};
pub use sched::Kernel;
pub use task::TaskId;
