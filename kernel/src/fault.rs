//! Page-fault engine
//!
//! Every fault is classified into exactly one kind by a pure function of
//! the faulting address, the privilege of the access, the region list, and
//! the state of the leaf entry. The interesting kinds are serviced (demand
//! allocation, file-backed fill, copy-on-write, swap-in); the rest
//! terminate the environment, and a genuine kernel fault panics.

use crate::env::{EnvStatus, EnvTable};
use crate::mm::frame::{AllocFlags, FrameTable};
use crate::mm::page::PteFlags;
use crate::mm::vma::VmaPerm;
use crate::mm::{VirtAddr, HUGE_PAGE_FRAMES, PGSIZE, USTABDATA, USTACKTOP, UTOP};
use crate::swap::queue::{QueueMode, SwapInTask};
use crate::swap::SwapUnit;

/// Classification of one page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Not actually a fault the engine recognizes.
    None,
    /// Fault on a kernel address from kernel mode.
    Kernel,
    /// User access outside the user-addressable window.
    OutsideUserRange,
    /// No region declared for the address.
    NoVma,
    /// Address falls in a region slot that is not active.
    UnusedVma,
    /// Region exists, leaf entry empty: demand allocation.
    NoPte,
    /// Region exists with a backing buffer: fill from file image.
    FileBacked,
    /// Present read-only leaf under a writable region: copy-on-write.
    Cow,
    /// Non-present leaf carrying a swap encoding: reload from disk.
    Swap,
    /// Present leaf, but the access is not permitted.
    InvalidPermission,
}

/// Raw fault description delivered by the trap layer.
#[derive(Debug, Clone, Copy)]
pub struct FaultCtx {
    pub va: VirtAddr,
    /// Access originated from a kernel code segment.
    pub kernel_cs: bool,
    /// Access was a write.
    pub write: bool,
}

/// What the trap layer does after the engine returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping repaired; resume the environment.
    Resolved,
    /// Progress needs the scheduler (swap pending or memory exhausted).
    Yield,
    /// The faulting environment was destroyed.
    Terminated,
}

/// Classify a fault. Pure over the inputs; mutates nothing.
pub fn classify(ft: &FrameTable, envs: &EnvTable, env_slot: usize, ctx: &FaultCtx) -> FaultKind {
    // Ring-0 faults above the user stack are kernel bugs. Below it they
    // are kernel threads demand-faulting their own mappings.
    if ctx.kernel_cs && ctx.va.as_u32() >= USTACKTOP {
        return FaultKind::Kernel;
    }
    if !ctx.kernel_cs && (ctx.va.as_u32() < USTABDATA || ctx.va.as_u32() >= UTOP) {
        return FaultKind::OutsideUserRange;
    }

    let body = envs.get(env_slot).body();
    let Some(ref vmas) = body.vmas else {
        return FaultKind::NoVma;
    };
    let Some((_, vma)) = vmas.lookup(ctx.va, 0) else {
        return FaultKind::NoVma;
    };
    let writable_vma = vma.perm.contains(VmaPerm::WRITE);
    let backed = vma.backing.is_some();
    let Some(pgdir) = body.pgdir else {
        return FaultKind::NoVma;
    };

    match pgdir.pte_at(ft, ctx.va) {
        Some(pte) if pte.is_present() => {
            if ctx.write && !pte.flags().contains(PteFlags::WRITABLE) && writable_vma {
                FaultKind::Cow
            } else {
                FaultKind::InvalidPermission
            }
        }
        Some(pte) if pte.swap_slot().is_some() => FaultKind::Swap,
        _ if backed => FaultKind::FileBacked,
        _ => FaultKind::NoPte,
    }
}

/// Service a page fault end to end.
pub fn page_fault(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapUnit,
    env_slot: usize,
    ctx: &FaultCtx,
) -> FaultOutcome {
    let kind = classify(ft, envs, env_slot, ctx);
    match kind {
        FaultKind::Kernel => {
            panic!(
                "kernel page fault at {:#010x} ({})",
                ctx.va.as_u32(),
                if ctx.write { "write" } else { "read" }
            );
        }
        FaultKind::OutsideUserRange
        | FaultKind::NoVma
        | FaultKind::UnusedVma
        | FaultKind::InvalidPermission
        | FaultKind::None => {
            log::error!("unserviceable fault ({kind:?}) at {:#010x}", ctx.va.as_u32());
            murder(ft, envs, swap, env_slot, ctx.va)
        }
        FaultKind::NoPte => demand_alloc(ft, envs, swap, env_slot, ctx),
        FaultKind::FileBacked => file_backed_fill(ft, envs, swap, env_slot, ctx),
        FaultKind::Cow => copy_on_write(ft, envs, swap, env_slot, ctx),
        FaultKind::Swap => swap_fault(envs, swap, env_slot, ctx),
    }
}

/// Terminate an environment with a diagnostic dump.
pub fn murder(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapUnit,
    env_slot: usize,
    va: VirtAddr,
) -> FaultOutcome {
    {
        let body = envs.get(env_slot).body();
        log::error!(
            "destroying env {:#010x}: fault at {:#010x}, eip {:#010x}, esp {:#010x}",
            body.id.0,
            va.as_u32(),
            body.tf.eip,
            body.tf.esp
        );
        if let Some(ref vmas) = body.vmas {
            vmas.dump();
        }
    }
    envs.destroy(ft, Some(&swap.store), env_slot, Some(env_slot));
    FaultOutcome::Terminated
}

/// Demand allocation inside a live region with an empty leaf.
///
/// Two frames are reserved up front, the leaf and a possible new page
/// table, so the operation never half-commits. If memory is short the
/// environment goes back to runnable and the CPU yields so eviction can
/// make progress.
fn demand_alloc(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapUnit,
    env_slot: usize,
    ctx: &FaultCtx,
) -> FaultOutcome {
    let pp = ft.alloc(AllocFlags::ZERO);
    let pp2 = ft.alloc(AllocFlags::ZERO);
    let (pp, pp2) = match (pp, pp2) {
        (Some(a), Some(b)) => (a, b),
        (a, b) => {
            for f in [a, b].into_iter().flatten() {
                ft.free(f).expect("fresh frame frees cleanly");
            }
            let env = envs.get(env_slot);
            env.status.transition(EnvStatus::Running, EnvStatus::Runnable);
            return FaultOutcome::Yield;
        }
    };
    ft.free(pp2).expect("probe frame frees cleanly");

    let body = envs.get(env_slot).body();
    let vma = {
        let vmas = body.vmas.as_ref().expect("live env has regions");
        *vmas.lookup(ctx.va, 0).expect("classification saw this region").1
    };
    let pgdir = body.pgdir.expect("live env has a directory");
    drop(body);

    let mut flags = PteFlags::USER;
    if vma.perm.contains(VmaPerm::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    if pgdir.insert(ft, pp, ctx.va.page_base(), flags).is_err() {
        let _ = ft.free(pp);
        log::error!("demand allocation at {:#010x} failed", ctx.va.as_u32());
        return murder(ft, envs, swap, env_slot, ctx.va);
    }
    ft.set_swappable(pp, true);
    FaultOutcome::Resolved
}

/// First touch of a file-backed page: fresh zeroed frame, then copy up to
/// one page from the backing buffer, honouring the region's intra-page
/// start offset and zero-filling everything past the backing's end.
fn file_backed_fill(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapUnit,
    env_slot: usize,
    ctx: &FaultCtx,
) -> FaultOutcome {
    let body = envs.get(env_slot).body();
    let vma = {
        let vmas = body.vmas.as_ref().expect("live env has regions");
        *vmas.lookup(ctx.va, 0).expect("classification saw this region").1
    };
    let pgdir = body.pgdir.expect("live env has a directory");
    drop(body);
    let data = vma.backing.expect("classification saw the backing");

    let Some(frame) = ft.alloc(AllocFlags::ZERO) else {
        log::error!("file-backed fill at {:#010x}: out of memory", ctx.va.as_u32());
        return murder(ft, envs, swap, env_slot, ctx.va);
    };
    let mut flags = PteFlags::USER;
    if vma.perm.contains(VmaPerm::WRITE) {
        flags |= PteFlags::WRITABLE;
    }
    if pgdir.insert(ft, frame, ctx.va.page_base(), flags).is_err() {
        let _ = ft.free(frame);
        return murder(ft, envs, swap, env_slot, ctx.va);
    }

    let page_va = ctx.va.page_base().as_u32();
    let page_index = ((page_va - vma.base.as_u32()) as usize) / PGSIZE;
    let (dst_off, src_off, room) = if page_index == 0 {
        (vma.back_off as usize, 0usize, PGSIZE - vma.back_off as usize)
    } else {
        (0, page_index * PGSIZE - vma.back_off as usize, PGSIZE)
    };
    if src_off < data.len() {
        let len = room.min(data.len() - src_off);
        ft.write_bytes(frame, dst_off, &data[src_off..src_off + len]);
    }
    FaultOutcome::Resolved
}

/// Write hit a shared read-only page.
///
/// A page referenced once is no longer shared: flip the writable bit in
/// place. Otherwise duplicate the page into a fresh frame and install it
/// writable; the displaced reference falls away in the insert.
fn copy_on_write(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapUnit,
    env_slot: usize,
    ctx: &FaultCtx,
) -> FaultOutcome {
    let pgdir = envs.get(env_slot).body().pgdir.expect("live env has a directory");
    let pte = pgdir.pte_at(ft, ctx.va).expect("classification saw the entry");

    if pte.is_huge() {
        let old = pte.frame().expect("present entry has a frame");
        if ft.get_ref(old) <= 1 {
            pgdir.set_writable(ft, ctx.va);
            return FaultOutcome::Resolved;
        }
        let Some(new) = ft.alloc(AllocFlags::HUGE) else {
            log::error!("huge copy-on-write at {:#010x}: out of memory", ctx.va.as_u32());
            return murder(ft, envs, swap, env_slot, ctx.va);
        };
        let flags = PteFlags::WRITABLE | PteFlags::USER | PteFlags::HUGE;
        if pgdir.insert(ft, new, ctx.va.huge_base(), flags).is_err() {
            let _ = ft.free(new);
            return murder(ft, envs, swap, env_slot, ctx.va);
        }
        ft.copy_frames(new, old, HUGE_PAGE_FRAMES);
        return FaultOutcome::Resolved;
    }

    let old = pte.frame().expect("present entry has a frame");
    if ft.get_ref(old) <= 1 {
        pgdir.set_writable(ft, ctx.va);
        return FaultOutcome::Resolved;
    }
    let Some(new) = ft.alloc(AllocFlags::ZERO) else {
        log::error!("copy-on-write at {:#010x}: out of memory", ctx.va.as_u32());
        return murder(ft, envs, swap, env_slot, ctx.va);
    };
    let flags = PteFlags::from_bits_truncate(pte.low_bits() & 0x1F) | PteFlags::WRITABLE;
    if pgdir.insert(ft, new, ctx.va.page_base(), flags).is_err() {
        let _ = ft.free(new);
        return murder(ft, envs, swap, env_slot, ctx.va);
    }
    ft.copy_frames(new, old, 1);
    ft.set_swappable(new, true);
    FaultOutcome::Resolved
}

/// Fault on a swapped-out page: queue the reload and park the environment.
fn swap_fault(envs: &EnvTable, swap: &SwapUnit, env_slot: usize, ctx: &FaultCtx) -> FaultOutcome {
    let task = SwapInTask {
        env_slot: env_slot as u32,
        va: ctx.va.page_base(),
    };
    let env = envs.get(env_slot);
    match swap.request_swap_in(task, QueueMode::NonBlocking) {
        Ok(()) => {
            let parked = env
                .status
                .transition(EnvStatus::Running, EnvStatus::WaitingSwap)
                || env
                    .status
                    .transition(EnvStatus::Runnable, EnvStatus::WaitingSwap);
            if !parked {
                log::debug!("swap fault on env slot {env_slot} in state {:?}", env.status.load());
            }
        }
        Err(_) => {
            // Ring full: stay runnable and fault again later.
            env.status.transition(EnvStatus::Running, EnvStatus::Runnable);
        }
    }
    FaultOutcome::Yield
}
