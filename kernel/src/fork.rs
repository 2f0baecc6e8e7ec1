//! Copy-on-write fork
//!
//! The child is a deep clone of the parent's page directory in which both
//! sides lose write access to every page a writable region covers; the
//! first write on either side goes through the fault engine and gets a
//! private copy. Frames are shared, not copied: each present user entry
//! just gains a reference.

use crate::env::{EnvId, EnvStatus, EnvTable};
use crate::error::{KernelError, Result};
use crate::mm::frame::{AllocFlags, FrameTable};
use crate::mm::page::{PageDir, Pte, PteFlags};
use crate::mm::vma::VmaPerm;
use crate::mm::{VirtAddr, NPTENTRIES, UTOP};
use crate::swap::store::SwapStore;

/// Fork the environment in `parent_slot`. Returns the child's id; the
/// child's syscall return register is zero, so both sides can tell each
/// other apart.
pub fn fork(
    ft: &FrameTable,
    envs: &EnvTable,
    template: &PageDir,
    swap: &SwapStore,
    parent_slot: usize,
) -> Result<EnvId> {
    let (parent_id, parent_ty) = {
        let body = envs.get(parent_slot).body();
        (body.id, body.ty)
    };
    let child_slot = envs.alloc(ft, template, parent_id, parent_ty)?;

    let result = copy_address_space(ft, envs, swap, parent_slot, child_slot);
    if let Err(e) = result {
        envs.free(ft, Some(swap), child_slot);
        return Err(e);
    }

    crate::arch::tlb_flush_all();

    let child_id = envs.get(child_slot).body().id;
    let committed = envs
        .get(child_slot)
        .status
        .transition(EnvStatus::NotRunnable, EnvStatus::Runnable);
    assert!(committed, "fresh fork child must commit runnable");
    Ok(child_id)
}

fn copy_address_space(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: &SwapStore,
    parent_slot: usize,
    child_slot: usize,
) -> Result<()> {
    let parent = envs.get(parent_slot).body();
    let mut child = envs.get(child_slot).body();
    let pdir = parent.pgdir.expect("live parent has a directory");
    let cdir = child.pgdir.expect("fresh child has a directory");

    let vmas = parent.vmas.as_ref().expect("live parent has regions");
    let utop_pdx = VirtAddr::new(UTOP).pdx();

    for pdeno in 0..utop_pdx {
        let pde = pdir.entry(ft, pdeno);
        if !pde.is_present() {
            cdir.write_entry(ft, pdeno, pde);
            continue;
        }

        if pde.is_huge() {
            let frame = pde.frame().expect("present entry has a frame");
            let va = VirtAddr::from_indices(pdeno, 0);
            let writable = vmas
                .lookup(va, 0)
                .map_or(false, |(_, v)| v.perm.contains(VmaPerm::WRITE));
            let shared = if writable {
                Pte(pde.0 & !PteFlags::WRITABLE.bits())
            } else {
                pde
            };
            pdir.write_entry(ft, pdeno, shared);
            cdir.write_entry(ft, pdeno, shared);
            ft.inc_ref(frame);
            continue;
        }

        // Small table: fresh child table, every entry copied, writable
        // user entries downgraded on both sides, every frame shared.
        let ptable = pde.frame().expect("present entry has a frame");
        let ctable = ft.alloc(AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
        ft.inc_ref(ctable);
        cdir.write_entry(
            ft,
            pdeno,
            Pte::new(ctable, PteFlags::from_bits_truncate(pde.low_bits())),
        );

        for pteno in 0..NPTENTRIES {
            // SAFETY: both frames are live page tables; index < 1024.
            let psrc = unsafe { (ft.frame_ptr(ptable) as *mut Pte).add(pteno) };
            let cdst = unsafe { (ft.frame_ptr(ctable) as *mut Pte).add(pteno) };
            // SAFETY: in-bounds slots, see above.
            let mut pte = unsafe { psrc.read() };
            if pte.is_present() && pte.flags().contains(PteFlags::USER) {
                let frame = pte.frame().expect("present entry has a frame");
                let va = VirtAddr::from_indices(pdeno, pteno);
                let writable = vmas
                    .lookup(va, 0)
                    .map_or(false, |(_, v)| v.perm.contains(VmaPerm::WRITE));
                if writable {
                    pte = Pte(pte.0 & !PteFlags::WRITABLE.bits());
                    // SAFETY: in-bounds slot, see above.
                    unsafe { psrc.write(pte) };
                }
                ft.inc_ref(frame);
            } else if let Some(slot) = pte.swap_slot() {
                // The child's copy is one more reference to the slot.
                swap.slot_incref(slot);
            }
            // SAFETY: in-bounds slot, see above.
            unsafe { cdst.write(pte) };
        }
    }

    // The regions transfer verbatim; writable ones are now copy-on-write
    // on both sides.
    let mut cloned = vmas.clone();
    cloned.mark_writable_cow();
    drop(parent);
    let mut parent = envs.get(parent_slot).body();
    parent
        .vmas
        .as_mut()
        .expect("live parent has regions")
        .mark_writable_cow();
    drop(parent);

    *child.vmas.as_mut().expect("fresh child has regions") = cloned;

    // The child returns zero from the fork call.
    child.tf = envs.get(parent_slot).body().tf;
    child.tf.regs.eax = 0;

    // Re-point the recursive self-map at the child's own directory.
    cdir.install_self_map(ft);
    Ok(())
}
