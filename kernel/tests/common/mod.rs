//! Shared machinery for the end-to-end scenarios: a simulated machine
//! (host buffer for physical memory, RAM disk for swap) and user-memory
//! access helpers that go through the fault engine the way real touches
//! would.

#![allow(dead_code)]

use cinnabar_kernel::env::{EnvId, EnvStatus, EnvType};
use cinnabar_kernel::fault::{self, FaultCtx, FaultOutcome};
use cinnabar_kernel::mm::frame::Frame;
use cinnabar_kernel::mm::page::PteFlags;
use cinnabar_kernel::mm::{PhysAddr, VirtAddr, PGSIZE};
use cinnabar_kernel::swap::store::MemDisk;
use cinnabar_kernel::Kernel;

/// Build a machine with `nframes` frames of "physical" memory and a swap
/// device of `swap_slots` page slots.
pub fn machine(nframes: usize, swap_slots: u32) -> &'static Kernel {
    let bytes = vec![0u8; nframes * PGSIZE].leak();
    // SAFETY: the leaked buffer lives for the rest of the process.
    let k = unsafe {
        Kernel::new(
            bytes.as_mut_ptr(),
            nframes,
            PhysAddr::new(0),
            Box::new(MemDisk::new(swap_slots * 8)),
        )
    }
    .expect("kernel assembly");
    Box::leak(Box::new(k))
}

/// Allocate a user environment, make it Running and current on `cpu`.
pub fn running_user_env(k: &Kernel, cpu: usize) -> usize {
    let slot = k
        .envs
        .alloc(&k.frames, &k.kern_dir, EnvId::NONE, EnvType::User)
        .expect("environment allocation");
    let env = k.envs.get(slot);
    assert!(env.status.transition(EnvStatus::NotRunnable, EnvStatus::Runnable));
    assert!(env.status.transition(EnvStatus::Runnable, EnvStatus::Running));
    k.cpus.set_current(cpu, Some(slot));
    slot
}

/// Resolve `va` to its backing frame, faulting it in if needed. Pumps the
/// swap machinery while the fault engine asks for more memory.
pub fn fault_in(k: &Kernel, slot: usize, va: u32, write: bool) -> Frame {
    let va = VirtAddr::new(va);
    for _ in 0..256 {
        {
            let body = k.envs.get(slot).body();
            let dir = body.pgdir.expect("directory");
            if let Some(pte) = dir.pte_at(&k.frames, va.page_base()) {
                // A present page satisfies the access unless this is a
                // write against a read-only (copy-on-write) entry.
                if pte.is_present() && (!write || pte.flags().contains(PteFlags::WRITABLE)) {
                    if let Some(frame) = pte.frame() {
                        return frame;
                    }
                }
            }
        }
        let ctx = FaultCtx {
            va,
            kernel_cs: false,
            write,
        };
        match fault::page_fault(&k.frames, &k.envs, &k.swap, slot, &ctx) {
            FaultOutcome::Resolved => {}
            FaultOutcome::Yield => {
                k.yield_for_memory();
            }
            FaultOutcome::Terminated => panic!("environment died touching {va:?}"),
        }
    }
    panic!("no progress faulting in {va:?}");
}

/// Store bytes at a user address, faulting the page in first.
pub fn user_write(k: &Kernel, slot: usize, va: u32, bytes: &[u8]) {
    let frame = fault_in(k, slot, va, true);
    let off = (va as usize) & (PGSIZE - 1);
    k.frames.write_bytes(frame, off, bytes);
}

/// Load bytes from a user address, faulting the page in first.
pub fn user_read(k: &Kernel, slot: usize, va: u32, out: &mut [u8]) {
    let frame = fault_in(k, slot, va, false);
    let off = (va as usize) & (PGSIZE - 1);
    k.frames.read_bytes(frame, off, out);
}

/// Convenience: 32-bit store.
pub fn user_write_u32(k: &Kernel, slot: usize, va: u32, value: u32) {
    user_write(k, slot, va, &value.to_le_bytes());
}

/// Convenience: 32-bit load.
pub fn user_read_u32(k: &Kernel, slot: usize, va: u32) -> u32 {
    let mut word = [0u8; 4];
    user_read(k, slot, va, &mut word);
    u32::from_le_bytes(word)
}
