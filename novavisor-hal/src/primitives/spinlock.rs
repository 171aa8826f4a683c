//! A spinlock whose guard disables interrupts on acquire and restores the
//! saved `RFLAGS.IF` on drop. Every shared-data path in this design
//! (`ptdev_lock`, `ioapic_lock`, per-VM `softirq_dev_lock`) uses this form
//! rather than bare `spin::Mutex`, because a handler that takes an
//! interrupt while holding one of these locks and then tries to take it
//! again from the interrupt context would deadlock.
//!
//! Any code path that suspends (calls into the scheduler's `sleep`) while
//! holding a guard is a bug; nothing in this crate does so, and the type
//! offers no way to leak a guard across a suspension point since it is
//! `!Send` by construction (tied to the executing pCPU's interrupt state).

use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};

/// Reads and clears `RFLAGS.IF`, returning whether interrupts were enabled.
///
/// `cli`/`sti` are CPL0-only; the host running `cargo test` executes this
/// crate in ring 3, so the real sequence is swapped for a software model of
/// the same save/restore contract under `cfg(test)`.
#[cfg(not(test))]
#[inline(always)]
fn local_irq_save() -> bool {
    let flags: u64;
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {flags}",
            "cli",
            flags = out(reg) flags,
            options(nomem, preserves_flags),
        );
    }
    (flags & (1 << 9)) != 0
}

/// Restores `RFLAGS.IF` to `was_enabled`.
#[cfg(not(test))]
#[inline(always)]
fn local_irq_restore(was_enabled: bool) {
    if was_enabled {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

// One IF model per test thread: the default test harness runs each
// `#[test]` on its own OS thread, and a single shared flag would let
// unrelated tests observe each other's save/restore sequence.
#[cfg(test)]
extern crate std;

#[cfg(test)]
std::thread_local! {
    static TEST_IF_MODEL: AtomicBool = const { AtomicBool::new(true) };
}

#[cfg(test)]
fn local_irq_save() -> bool {
    TEST_IF_MODEL.with(|f| f.swap(false, Ordering::SeqCst))
}

#[cfg(test)]
fn local_irq_restore(was_enabled: bool) {
    TEST_IF_MODEL.with(|f| f.store(was_enabled, Ordering::SeqCst));
}

/// A mutual-exclusion lock that also masks interrupts on the executing
/// pCPU for the lifetime of the guard. Wraps [`spin::Mutex`] for the
/// actual exclusion; this type only adds the IRQ save/restore around it.
pub struct IrqSpinLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self { inner: Mutex::new(data) }
    }

    /// Acquires the lock, disabling interrupts first so the critical
    /// section can never be re-entered from an ISR on this pCPU.
    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let was_enabled = local_irq_save();
        let guard = self.inner.lock();
        IrqSpinLockGuard { guard, was_enabled }
    }
}

pub struct IrqSpinLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    was_enabled: bool,
}

impl<'a, T> Deref for IrqSpinLockGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T> DerefMut for IrqSpinLockGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Restores `RFLAGS.IF` after `guard`'s own field drop releases the
/// `spin::Mutex` — field drop order runs after this, so the mutex is
/// still held for the one instruction it takes to read `was_enabled`.
impl<'a, T> Drop for IrqSpinLockGuard<'a, T> {
    fn drop(&mut self) {
        local_irq_restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_grants_exclusive_mutable_access() {
        let lock = IrqSpinLock::new(0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        {
            let guard = lock.lock();
            assert_eq!(*guard, 1);
        }
    }
}
