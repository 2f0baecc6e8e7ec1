//! Kernel spinlocks
//!
//! Interior data structures use `spin::Mutex`. The coarse, named critical
//! sections (environment table, page allocator, swap store, console) use the
//! test-and-set [`SpinLock`] below, which records the holder in debug builds
//! so a re-entry or a cross-CPU unlock trips an assertion instead of a
//! deadlock hunt.
//!
//! The `big-lock` cargo feature routes every named section through one
//! global lock. That mode exists for bring-up only; the fine-grained locks
//! are the shipped configuration.

#![allow(dead_code)]

use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::arch;

/// Owner value meaning "nobody".
const NO_OWNER: i32 = -1;

/// Test-and-set spinlock with debug owner tracking.
pub struct SpinLock {
    locked: AtomicBool,
    name: &'static str,
    /// CPU id of the holder; debug diagnostics only.
    owner: AtomicI32,
}

impl SpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            owner: AtomicI32::new(NO_OWNER),
        }
    }

    /// Acquire, spinning with `pause` until the lock is free.
    pub fn lock(&self) -> SpinGuard<'_> {
        self.lock_as(arch::cpu_id() as i32)
    }

    /// Acquire on behalf of an explicit CPU id.
    pub fn lock_as(&self, cpu: i32) -> SpinGuard<'_> {
        debug_assert!(
            self.owner.load(Ordering::Relaxed) != cpu || !self.locked.load(Ordering::Relaxed),
            "cpu {} re-entered lock '{}'",
            cpu,
            self.name
        );
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            arch::pause();
        }
        self.owner.store(cpu, Ordering::Relaxed);
        SpinGuard { lock: self }
    }

    /// Try once; `None` if held elsewhere.
    pub fn try_lock(&self) -> Option<SpinGuard<'_>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner.store(arch::cpu_id() as i32, Ordering::Relaxed);
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    fn unlock(&self) {
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

/// RAII guard for [`SpinLock`]; releases on drop.
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(feature = "big-lock")]
mod named {
    use super::SpinLock;

    /// Single lock standing in for every named section during bring-up.
    pub static KERNEL_LOCK: SpinLock = SpinLock::new("kernel");

    pub fn env_lock() -> &'static SpinLock {
        &KERNEL_LOCK
    }
    pub fn page_lock() -> &'static SpinLock {
        &KERNEL_LOCK
    }
    pub fn swap_lock() -> &'static SpinLock {
        &KERNEL_LOCK
    }
    pub fn console_lock() -> &'static SpinLock {
        &KERNEL_LOCK
    }
}

#[cfg(not(feature = "big-lock"))]
mod named {
    use super::SpinLock;

    static ENV_LOCK: SpinLock = SpinLock::new("env");
    static PAGE_LOCK: SpinLock = SpinLock::new("pagealloc");
    static SWAP_LOCK: SpinLock = SpinLock::new("swap");
    static CONSOLE_LOCK: SpinLock = SpinLock::new("console");

    pub fn env_lock() -> &'static SpinLock {
        &ENV_LOCK
    }
    pub fn page_lock() -> &'static SpinLock {
        &PAGE_LOCK
    }
    pub fn swap_lock() -> &'static SpinLock {
        &SWAP_LOCK
    }
    pub fn console_lock() -> &'static SpinLock {
        &CONSOLE_LOCK
    }
}

pub use named::*;
