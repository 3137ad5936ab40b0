//! Interrupt mask guard — the kernel's sole mutual-exclusion primitive.
//!
//! Every operation that reads or mutates scheduler state does so while
//! holding a [`CpuLockGuard`], obtained from [`lock()`]. On a single
//! processor this is sufficient: masking interrupts (and, by extension,
//! suspending the low-priority pendable context-switch interrupt of
//! [`crate::port`]) rules out concurrent access from both other tasks and
//! ISRs.
//!
//! The teacher kernel expresses this with `tokenlock`, giving the borrow
//! checker a compile-time proof that a `CpuLockCell` can only be touched
//! while a matching singleton token is alive. That proof is architecture-
//! trait generic there; here the kernel is a single concrete `Kernel`
//! value, so the same discipline is expressed with a runtime-checked
//! reentrancy flag layered on the `critical-section` crate, which is the
//! idiomatic `no_std` analogue used throughout the rest of the pack
//! (see `other_examples/.../athena-kernel-src-sched.rs.rs`).
use core::{cell::UnsafeCell, marker::PhantomData, sync::atomic::{AtomicBool, Ordering}};

use crate::error::{Error, Result};

static CPU_LOCK_ACTIVE: AtomicBool = AtomicBool::new(false);

/// RAII guard for an active interrupt mask ("CPU Lock").
///
/// Holding one is proof that no other context can be concurrently
/// observing or mutating kernel state. [`KCell::get`]/[`KCell::with`] and
/// friends require a reference to one.
pub struct CpuLockGuard {
    restore: critical_section::RestoreState,
    // Neither `Send` nor `Sync`: a guard only makes sense on the context
    // that acquired it.
    _not_send_sync: PhantomData<*const ()>,
}

/// Acquire the interrupt mask. Returns [`Error::Invalid`] if the calling
/// context already holds one (a logic error in the caller — kernel
/// operations never recursively lock).
pub fn lock() -> Result<CpuLockGuard> {
    // Safety: paired with `critical_section::release` in `Drop`, below.
    let restore = unsafe { critical_section::acquire() };
    if CPU_LOCK_ACTIVE.swap(true, Ordering::Acquire) {
        // Logical reentrancy: unwind the critical section we just took and
        // report the misuse instead of silently nesting.
        unsafe { critical_section::release(restore) };
        return Err(Error::Invalid);
    }
    Ok(CpuLockGuard {
        restore,
        _not_send_sync: PhantomData,
    })
}

/// Like [`lock()`], but for use by code that has already established (by
/// construction) that no lock is active, such as the boot sequence.
///
/// # Safety
/// The caller must guarantee no `CpuLockGuard` is concurrently alive.
pub unsafe fn assume_locked() -> CpuLockGuard {
    let restore = unsafe { critical_section::acquire() };
    CPU_LOCK_ACTIVE.store(true, Ordering::Release);
    CpuLockGuard {
        restore,
        _not_send_sync: PhantomData,
    }
}

pub fn is_locked() -> bool {
    CPU_LOCK_ACTIVE.load(Ordering::Acquire)
}

impl Drop for CpuLockGuard {
    fn drop(&mut self) {
        CPU_LOCK_ACTIVE.store(false, Ordering::Release);
        // Safety: `self.restore` was produced by the matching `acquire()`
        // above and this is the only place it's consumed.
        unsafe { critical_section::release(self.restore) };
    }
}

/// A cell holding kernel state, readable/writable only while the caller
/// presents a [`CpuLockGuard`].
///
/// Unlike `core::cell::Cell`, access is gated by a capability token rather
/// than by runtime borrow tracking, matching the teacher kernel's
/// `CpuLockCell`. Since exactly one `CpuLockGuard` can exist at a time,
/// holding `&CpuLockGuard` is proof of exclusive access.
pub struct KCell<T: ?Sized> {
    inner: UnsafeCell<T>,
}

// Safety: all access to `inner` is mediated by possession of a
// `CpuLockGuard`, and at most one can exist at a time (single processor,
// enforced by `CPU_LOCK_ACTIVE`).
unsafe impl<T: ?Sized> Sync for KCell<T> {}

impl<T> KCell<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: UnsafeCell::new(value),
        }
    }

    pub fn get(&self, _guard: &CpuLockGuard) -> T
    where
        T: Copy,
    {
        unsafe { *self.inner.get() }
    }

    pub fn set(&self, _guard: &CpuLockGuard, value: T) {
        unsafe {
            *self.inner.get() = value;
        }
    }

    pub fn replace(&self, _guard: &CpuLockGuard, value: T) -> T {
        unsafe { core::mem::replace(&mut *self.inner.get(), value) }
    }

    pub fn with<R>(&self, _guard: &CpuLockGuard, f: impl FnOnce(&mut T) -> R) -> R {
        f(unsafe { &mut *self.inner.get() })
    }

    pub fn as_ref<'a>(&'a self, _guard: &'a CpuLockGuard) -> &'a T {
        unsafe { &*self.inner.get() }
    }

    pub fn as_mut<'a>(&'a self, _guard: &'a mut CpuLockGuard) -> &'a mut T {
        unsafe { &mut *self.inner.get() }
    }
}

impl<T: Default> Default for KCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reentrant_lock_is_rejected() {
        let _g = lock().unwrap();
        assert!(matches!(lock(), Err(Error::Invalid)));
    }

    #[test]
    fn lock_unlock_cycles() {
        for _ in 0..4 {
            let g = lock().unwrap();
            drop(g);
        }
        assert!(!is_locked());
    }

    #[test]
    fn kcell_roundtrip() {
        let cell = KCell::new(41u32);
        let g = lock().unwrap();
        cell.with(&g, |v| *v += 1);
        assert_eq!(cell.get(&g), 42);
    }
}
