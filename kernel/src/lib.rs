//! Cinnabar kernel library
//!
//! Memory core of a teaching-grade 32-bit x86 multiprocessor kernel:
//! physical frame allocator, two-level page tables, virtual memory areas,
//! demand paging with copy-on-write fork, a disk-backed swapper and a
//! lock-free round-robin scheduler. Boot, trap vectors and device drivers
//! live in the (separate) platform shim; this crate is what they call into.
//!
//! On hosted targets the crate builds against `std` so the whole core runs
//! under the standard test harness, with a host buffer standing in for
//! physical memory and a RAM disk for the swap device.

#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

// On bare metal the kernel heap backs the boot-time allocations (frame
// descriptors, environment table). Hosted builds use the system allocator.
#[cfg(target_os = "none")]
use linked_list_allocator::LockedHeap;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Hand the kernel heap its backing memory.
///
/// # Safety
///
/// `start..start+size` must be unused, writable memory that stays reserved
/// for the heap forever. Must be called exactly once, before any
/// allocation.
#[cfg(target_os = "none")]
pub unsafe fn init_heap(start: *mut u8, size: usize) {
    // SAFETY: forwarded from the caller's contract.
    unsafe { ALLOCATOR.lock().init(start, size) }
}

pub mod arch;
pub mod console;
pub mod env;
pub mod error;
pub mod fault;
pub mod fork;
pub mod kernel;
pub mod klog;
pub mod mm;
pub mod sched;
pub mod swap;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use error::{KernelError, Result};
pub use kernel::{kernel, Kernel};
