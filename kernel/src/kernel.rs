//! Kernel assembly
//!
//! Binds the memory core together: frame table, environment table, CPU
//! records, scheduler, swapper, and the shared kernel directory every
//! address space is cloned from. The boot shim builds one of these over
//! the real physical window and the real disk; the test harness builds
//! them over host buffers.

use alloc::boxed::Box;
use spin::Once;

use crate::env::EnvTable;
use crate::error::Result;
use crate::fault::{self, FaultCtx, FaultOutcome};
use crate::mm::frame::FrameTable;
use crate::mm::page::PageDir;
use crate::mm::PhysAddr;
use crate::sched::{CpuTable, SchedDecision, Scheduler};
use crate::swap::store::SectorStore;
use crate::swap::SwapUnit;

/// The assembled memory core.
pub struct Kernel {
    pub frames: FrameTable,
    pub envs: EnvTable,
    pub cpus: CpuTable,
    pub sched: Scheduler,
    pub swap: SwapUnit,
    pub kern_dir: PageDir,
}

impl Kernel {
    /// Assemble the core over a physical window and a swap device.
    ///
    /// # Safety
    ///
    /// `phys_base` must be valid for reads and writes of
    /// `nframes * PGSIZE` bytes for the lifetime of the kernel.
    pub unsafe fn new(
        phys_base: *mut u8,
        nframes: usize,
        kernel_break: PhysAddr,
        disk: Box<dyn SectorStore + Send>,
    ) -> Result<Self> {
        // SAFETY: forwarded from the caller's contract.
        let frames = unsafe { FrameTable::new(phys_base, nframes, kernel_break) };
        let kern_dir = PageDir::new_kernel(&frames)?;
        log::info!(
            "memory core: {} frames, {} free",
            frames.nframes(),
            frames.free_count()
        );
        Ok(Self {
            frames,
            envs: EnvTable::new(),
            cpus: CpuTable::new(),
            sched: Scheduler::new(),
            swap: SwapUnit::new(disk),
            kern_dir,
        })
    }

    /// Reconsider what `cpu` runs next.
    pub fn yield_cpu(&self, cpu: usize) -> SchedDecision {
        self.sched
            .yield_cpu(&self.frames, &self.envs, Some(&self.swap.store), &self.cpus, cpu)
    }

    /// Service the page fault of the environment current on `cpu`.
    pub fn page_fault(&self, cpu: usize, ctx: &FaultCtx) -> FaultOutcome {
        let cur = self
            .cpus
            .current_env(cpu)
            .expect("page fault with no current environment");
        fault::page_fault(&self.frames, &self.envs, &self.swap, cur, ctx)
    }

    /// Pump the eviction machinery once on behalf of a caller that ran out
    /// of memory. Returns whether any work was done.
    pub fn yield_for_memory(&self) -> bool {
        let mut progress = self.swap.kswapd_step(&self.frames, &self.envs) > 0;
        while self.swap.swapout_service_step(
            &self.frames,
            &self.envs,
            Some(&self.kern_dir),
            &mut || {},
        ) {
            progress = true;
        }
        while self
            .swap
            .swapin_service_step(&self.frames, &self.envs, &mut || {})
        {
            progress = true;
        }
        progress
    }

    /// Launch the swap machinery: mark it running and create its three
    /// kernel threads. The entry addresses are the boot shim's dispatch
    /// trampolines for the corresponding service loops.
    pub fn start_swap_services(
        &self,
        swapout_entry: u32,
        swapin_entry: u32,
        kswapd_entry: u32,
    ) -> Result<()> {
        self.swap.start();
        crate::env::kthread::create(&self.frames, &self.envs, &self.kern_dir, swapout_entry)?;
        crate::env::kthread::create(&self.frames, &self.envs, &self.kern_dir, swapin_entry)?;
        crate::env::kthread::create(&self.frames, &self.envs, &self.kern_dir, kswapd_entry)?;
        Ok(())
    }
}

static KERNEL: Once<Kernel> = Once::new();

/// Install the system-wide kernel instance. Called once by the boot shim.
///
/// # Safety
///
/// Same contract as [`Kernel::new`]; additionally, must be called exactly
/// once before any use of [`kernel`].
pub unsafe fn init(
    phys_base: *mut u8,
    nframes: usize,
    kernel_break: PhysAddr,
    disk: Box<dyn SectorStore + Send>,
) -> &'static Kernel {
    crate::klog::init();
    KERNEL.call_once(|| {
        // SAFETY: forwarded from the caller's contract.
        unsafe { Kernel::new(phys_base, nframes, kernel_break, disk) }
            .expect("memory core assembly cannot fail at boot")
    })
}

/// The system-wide kernel instance.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel not initialized")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PGSIZE;
    use crate::swap::store::MemDisk;

    #[test]
    fn assembly_reports_sane_counts() {
        let bytes = vec![0u8; 0x200 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let k = unsafe {
            Kernel::new(
                bytes.as_mut_ptr(),
                0x200,
                PhysAddr::new(0x10_0000),
                Box::new(MemDisk::new(64 * 8)),
            )
        }
        .expect("assembly");
        assert_eq!(k.frames.nframes(), 0x200);
        assert!(k.frames.free_count() > 0);
        assert_eq!(k.swap.store.nslots(), 64);
        assert!(!k.swap.is_running());
    }
}
