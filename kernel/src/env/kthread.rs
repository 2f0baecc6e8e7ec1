//! Kernel threads
//!
//! A kernel thread is an environment that runs in ring 0 with kernel
//! selectors and its own stack, scheduled cooperatively: it only suspends at
//! its explicit yield points. The swap service loops and the eviction
//! scanner run as kernel threads.
//!
//! The register-level entry trampoline belongs to the (external) trap
//! layer; here the thread gets its environment, its stack region and its
//! entry address.

use super::{EnvId, EnvStatus, EnvTable, EnvType};
use crate::error::Result;
use crate::mm::frame::FrameTable;
use crate::mm::page::PageDir;
use crate::mm::vma::{VmaPerm, VmaType};
use crate::mm::{VirtAddr, KTHREAD_STACK_TOP};

/// Size of the demand-faultable stack region below the fixed stack top.
/// Only the first page is populated eagerly.
const KTHREAD_STACK_REGION: u32 = 0x0800_0000;

/// Create a kernel thread that starts at `entry_addr`.
///
/// The entry address lands in `eip` and, for the benefit of the dispatch
/// trampoline, in `edx`. The thread is committed runnable; the scheduler
/// picks it up on the next sweep.
pub fn create(
    ft: &FrameTable,
    envs: &EnvTable,
    template: &PageDir,
    entry_addr: u32,
) -> Result<usize> {
    let slot = envs.alloc(ft, template, EnvId::NONE, EnvType::KernelThread)?;
    let env = envs.get(slot);
    {
        let mut body = env.body();
        body.tf.eip = entry_addr;
        body.tf.regs.edx = entry_addr;
        let vmas = body.vmas.as_mut().expect("fresh env has a region list");
        vmas.new_region(
            VirtAddr::new(KTHREAD_STACK_TOP - KTHREAD_STACK_REGION),
            KTHREAD_STACK_REGION,
            VmaPerm::READ | VmaPerm::WRITE,
            VmaType::Anon,
        )?;
    }
    let committed = env
        .status
        .transition(EnvStatus::NotRunnable, EnvStatus::Runnable);
    assert!(committed, "fresh kernel thread must commit runnable");
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::FrameTable;
    use crate::mm::{PhysAddr, PGSIZE};

    #[test]
    fn kernel_thread_is_runnable_with_stack_region() {
        let bytes = vec![0u8; 0x400 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let ft = unsafe { FrameTable::new(bytes.as_mut_ptr(), 0x400, PhysAddr::new(0)) };
        let kern = PageDir::new_kernel(&ft).expect("kernel dir");
        let envs = EnvTable::new();

        let slot = create(&ft, &envs, &kern, 0xC0DE_0000).expect("kthread");
        assert_eq!(envs.status(slot), EnvStatus::Runnable);
        let body = envs.get(slot).body();
        assert_eq!(body.tf.eip, 0xC0DE_0000);
        assert_eq!(body.ty, EnvType::KernelThread);
        let vmas = body.vmas.as_ref().expect("regions");
        assert!(vmas
            .lookup(VirtAddr::new(KTHREAD_STACK_TOP - 64), 0)
            .is_some());
    }
}
