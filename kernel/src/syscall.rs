//! System calls (memory-related surface)
//!
//! Numbers are stable small integers; the generic convention puts the
//! number in register 0 and up to five arguments in registers 1..5, with
//! the result returned in register 0. Recoverable failures come back as
//! negative integers; a user pointer that fails validation terminates the
//! caller outright.

use alloc::vec::Vec;

use crate::console;
use crate::env::{EnvId, EnvStatus};
use crate::error::{KernelError, Result};
use crate::fault;
use crate::kernel::Kernel;
use crate::mm::page::{PteFlags, RemovedPte};
use crate::mm::vma::{VmaPerm, VmaType};
use crate::mm::{VirtAddr, PGSIZE, USTABDATA, UTOP};

/// Stable syscall numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Cputs = 0,
    Cgetc = 1,
    GetEnvId = 2,
    EnvDestroy = 3,
    VmaCreate = 4,
    VmaDestroy = 5,
    Yield = 6,
    Wait = 7,
    Fork = 8,
}

impl Syscall {
    pub fn from_number(no: u32) -> Option<Self> {
        Some(match no {
            0 => Syscall::Cputs,
            1 => Syscall::Cgetc,
            2 => Syscall::GetEnvId,
            3 => Syscall::EnvDestroy,
            4 => Syscall::VmaCreate,
            5 => Syscall::VmaDestroy,
            6 => Syscall::Yield,
            7 => Syscall::Wait,
            8 => Syscall::Fork,
            _ => return None,
        })
    }
}

/// `vma_create`: force-populate the new region immediately.
pub const VMA_FLAG_POPULATE: u32 = 1;

/// Bad-syscall result for numbers outside the table.
const E_NO_SYS: i32 = -100;

/// Dispatch one system call for the environment current on `cpu`. The
/// calling convention carries up to five arguments; the memory surface
/// uses at most three.
pub fn dispatch(k: &Kernel, cpu: usize, no: u32, a1: u32, a2: u32, a3: u32, _a4: u32, _a5: u32) -> i32 {
    let Some(cur) = k.cpus.current_env(cpu) else {
        return KernelError::BadEnvId { id: 0 }.to_errno();
    };
    let Some(call) = Syscall::from_number(no) else {
        return E_NO_SYS;
    };

    match call {
        Syscall::Cputs => sys_cputs(k, cur, VirtAddr::new(a1), a2),
        Syscall::Cgetc => console::getc() as i32,
        Syscall::GetEnvId => k.envs.get(cur).body().id.0,
        Syscall::EnvDestroy => sys_env_destroy(k, cur, a1 as i32),
        Syscall::VmaCreate => sys_vma_create(k, cur, a1, a2, a3),
        Syscall::VmaDestroy => sys_vma_destroy(k, cur, VirtAddr::new(a1), a2),
        Syscall::Yield => {
            k.yield_cpu(cpu);
            0
        }
        Syscall::Wait => sys_wait(k, cpu, cur, a1 as i32),
        Syscall::Fork => {
            match crate::fork::fork(&k.frames, &k.envs, &k.kern_dir, &k.swap.store, cur) {
                Ok(child) => child.0,
                Err(e) => e.to_errno(),
            }
        }
    }
}

/// Verify that `[va, va+len)` is mapped present and user-accessible
/// (plus writable when `need_write`).
pub fn user_mem_check(
    k: &Kernel,
    slot: usize,
    va: VirtAddr,
    len: u32,
    need_write: bool,
) -> Result<()> {
    let end = va
        .as_u32()
        .checked_add(len)
        .ok_or(KernelError::InvalidMapping { va: va.as_u32() })?;
    if end > UTOP {
        return Err(KernelError::InvalidMapping { va: va.as_u32() });
    }
    let pgdir = k
        .envs
        .get(slot)
        .body()
        .pgdir
        .ok_or(KernelError::InvalidMapping { va: va.as_u32() })?;

    let mut page = va.page_base().as_u32();
    while page < end {
        let pte = pgdir
            .pte_at(&k.frames, VirtAddr::new(page))
            .ok_or(KernelError::InvalidMapping { va: page })?;
        let mut need = PteFlags::PRESENT | PteFlags::USER;
        if need_write {
            need |= PteFlags::WRITABLE;
        }
        if !pte.flags().contains(need) {
            return Err(KernelError::InvalidMapping { va: page });
        }
        page += PGSIZE as u32;
    }
    Ok(())
}

/// Copy bytes out of user memory after a successful check.
fn copy_from_user(k: &Kernel, slot: usize, va: VirtAddr, len: u32) -> Option<Vec<u8>> {
    let pgdir = k.envs.get(slot).body().pgdir?;
    let mut out = Vec::with_capacity(len as usize);
    let mut addr = va.as_u32();
    let end = addr.checked_add(len)?;
    while addr < end {
        let page = VirtAddr::new(addr).page_base();
        let (frame, _) = pgdir.lookup(&k.frames, page)?;
        let off = (addr - page.as_u32()) as usize;
        let take = (PGSIZE - off).min((end - addr) as usize);
        let mut chunk = alloc::vec![0u8; take];
        k.frames.read_bytes(frame, off, &mut chunk);
        out.extend_from_slice(&chunk);
        addr += take as u32;
    }
    Some(out)
}

fn sys_cputs(k: &Kernel, cur: usize, s: VirtAddr, len: u32) -> i32 {
    if user_mem_check(k, cur, s, len, false).is_err() {
        fault::murder(&k.frames, &k.envs, &k.swap, cur, s);
        return KernelError::InvalidMapping { va: s.as_u32() }.to_errno();
    }
    if let Some(bytes) = copy_from_user(k, cur, s, len) {
        console::put_bytes(&bytes);
    }
    0
}

fn sys_env_destroy(k: &Kernel, cur: usize, envid: i32) -> i32 {
    match k.envs.resolve(EnvId(envid), Some(cur), true) {
        Ok(slot) => {
            if slot == cur {
                log::info!("env {:#010x} exiting gracefully", k.envs.get(slot).body().id.0);
            }
            k.envs.destroy(&k.frames, Some(&k.swap.store), slot, Some(cur));
            0
        }
        Err(e) => e.to_errno(),
    }
}

/// Create an anonymous region somewhere in the address space. Returns the
/// chosen base address, or -1 when the request cannot be satisfied.
fn sys_vma_create(k: &Kernel, cur: usize, size: u32, perm: u32, flags: u32) -> i32 {
    let perm = VmaPerm::READ | VmaPerm::from_bits_truncate(perm as u8);
    let base = {
        let mut body = k.envs.get(cur).body();
        let vmas = body.vmas.as_mut().expect("live env has regions");
        match vmas.new_range(size, perm, VmaType::Anon) {
            Ok(idx) => vmas.get(idx).expect("fresh region").base,
            Err(_) => return -1,
        }
    };

    if flags & VMA_FLAG_POPULATE != 0 {
        // Touch every page through the fault engine so the mapping is
        // resident on return.
        let end = base.as_u32() + crate::mm::page_round_up(size);
        let mut page = base.as_u32();
        let mut stalls = 0;
        while page < end {
            let va = VirtAddr::new(page);
            let resident = {
                let body = k.envs.get(cur).body();
                let pgdir = body.pgdir.expect("live env has a directory");
                pgdir.pte_at(&k.frames, va).map_or(false, |p| p.is_present())
            };
            if resident {
                page += PGSIZE as u32;
                stalls = 0;
                continue;
            }
            let ctx = fault::FaultCtx {
                va,
                kernel_cs: false,
                write: perm.contains(VmaPerm::WRITE),
            };
            match fault::page_fault(&k.frames, &k.envs, &k.swap, cur, &ctx) {
                fault::FaultOutcome::Resolved => {
                    page += PGSIZE as u32;
                    stalls = 0;
                }
                fault::FaultOutcome::Yield => {
                    // Let the eviction machinery catch up, then retry the
                    // same page.
                    if !k.yield_for_memory() {
                        stalls += 1;
                        if stalls > 64 {
                            return -1;
                        }
                    }
                }
                fault::FaultOutcome::Terminated => return -1,
            }
        }
    }
    base.as_u32() as i32
}

fn sys_vma_destroy(k: &Kernel, cur: usize, va: VirtAddr, size: u32) -> i32 {
    if size == 0 || va.as_u32() < USTABDATA || va.as_u32() >= UTOP {
        return KernelError::InvalidMapping { va: va.as_u32() }.to_errno();
    }
    let mut body = k.envs.get(cur).body();
    let pgdir = body.pgdir.expect("live env has a directory");
    let vmas = body.vmas.as_mut().expect("live env has regions");
    let res = vmas.unmap(va, size, |page| {
        if let Some(RemovedPte::SwapSlot(slot)) = pgdir.remove(&k.frames, page) {
            k.swap.store.slot_decref(slot);
        }
    });
    match res {
        Ok(()) => 0,
        Err(e) => e.to_errno(),
    }
}

/// Park the caller until the target environment is destroyed. A target
/// that is already gone is not an error; the caller simply resumes.
fn sys_wait(k: &Kernel, cpu: usize, cur: usize, envid: i32) -> i32 {
    match k.envs.resolve(EnvId(envid), Some(cur), false) {
        Ok(target) if target != cur => {
            if k.envs.status(target) == EnvStatus::Dying {
                // The wakeup broadcast already happened; don't park after it.
                return 0;
            }
            let target_id = k.envs.get(target).body().id;
            k.envs.get(cur).body().waiting_for = target_id;
            let env = k.envs.get(cur);
            let parked = env.status.transition(EnvStatus::Running, EnvStatus::Waiting)
                || env.status.transition(EnvStatus::Runnable, EnvStatus::Waiting);
            if parked {
                k.yield_cpu(cpu);
            }
            0
        }
        _ => 0,
    }
}
