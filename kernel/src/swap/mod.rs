//! Swapper
//!
//! Glue around the three moving parts: the reference-counted slot store,
//! the two bounded rings, and the eviction scanner. Two kernel threads
//! drain the rings; both loop until the shared running flag is cleared,
//! yielding between items. The single-step functions they are built from
//! are public so a deterministic driver (bring-up console, test harness)
//! can pump the queues by hand.

pub mod kswapd;
pub mod queue;
pub mod store;

use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;

use crate::env::{EnvStatus, EnvTable};
use crate::error::KernelError;
use crate::mm::frame::FrameTable;
use crate::mm::page::PageDir;

use self::kswapd::Kswapd;
use self::queue::{QueueMode, SwapInQueue, SwapInTask, SwapOutQueue, SwapQueue};
use self::store::{SectorStore, SwapStore};

/// Frames the scanner examines per service round.
const KSWAPD_BATCH: usize = 64;

/// The assembled swap subsystem.
pub struct SwapUnit {
    pub store: SwapStore,
    pub outq: SwapOutQueue,
    pub inq: SwapInQueue,
    pub kswapd: Kswapd,
    running: AtomicBool,
}

impl SwapUnit {
    pub fn new(disk: Box<dyn SectorStore + Send>) -> Self {
        Self {
            store: SwapStore::new(disk),
            outq: SwapQueue::with_capacity(queue::SWAP_OUT_QUEUE_LEN),
            inq: SwapQueue::with_capacity(queue::SWAP_IN_QUEUE_LEN),
            kswapd: Kswapd::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Allow the service loops to run.
    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    /// Ask the service loops to exit at their next yield point.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue a read-in task for a faulting environment.
    pub fn request_swap_in(&self, task: SwapInTask, mode: QueueMode) -> crate::error::Result<()> {
        self.inq.push(task, mode)
    }

    /// Drain one entry from the swap-out ring. Returns whether an entry
    /// was processed. Frames whose state changed while queued (freed,
    /// re-pinned) are skipped; a full device is logged and the frame
    /// returns to the candidate pool.
    pub fn swapout_service_step(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        kern: Option<&PageDir>,
        yielder: &mut dyn FnMut(),
    ) -> bool {
        let Some(frame) = self.outq.pop() else {
            return false;
        };
        match self.store.swap_out(ft, envs, kern, frame, yielder) {
            Ok(()) => {}
            Err(KernelError::NoRef) | Err(KernelError::Unswappable { .. }) => {
                log::debug!("skipping stale eviction candidate {}", frame.0);
            }
            Err(KernelError::NoFreeSwap) => {
                log::warn!("swap device full; dropping eviction of frame {}", frame.0);
                ft.set_swappable(frame, true);
            }
            Err(e) => panic!("swap-out failed: {e}"),
        }
        true
    }

    /// Drain one entry from the swap-in ring. Returns whether an entry was
    /// processed. Tasks whose environment stopped waiting (destroyed, or
    /// already satisfied) are dropped.
    pub fn swapin_service_step(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        yielder: &mut dyn FnMut(),
    ) -> bool {
        let Some(task) = self.inq.pop() else {
            return false;
        };
        let slot = task.env_slot as usize;
        if envs.status(slot) != EnvStatus::WaitingSwap {
            log::debug!("dropping stale swap-in task for env slot {slot}");
            return true;
        }
        match self.store.swap_in(ft, envs, slot, task.va, yielder) {
            Ok(()) => {}
            Err(KernelError::OutOfMemory) => {
                // The store already parked the environment runnable; it
                // will fault again once memory frees up.
            }
            Err(e) => {
                log::warn!("swap-in for env slot {slot} failed: {e}");
            }
        }
        true
    }

    /// One scanner round: examine a batch of frames and queue candidates.
    pub fn kswapd_step(&self, ft: &FrameTable, envs: &EnvTable) -> usize {
        self.kswapd.scan(ft, envs, &self.outq, KSWAPD_BATCH)
    }

    /// Service loop bodies for the kernel threads. Each drains its ring
    /// while the running flag holds, yielding every iteration.
    pub fn swapout_service(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        kern: Option<&PageDir>,
        yielder: &mut dyn FnMut(),
    ) {
        log::info!("swap-out service running");
        while self.is_running() {
            yielder();
            self.swapout_service_step(ft, envs, kern, yielder);
        }
        log::info!("swap-out service stopped");
    }

    /// Scanner loop body. Yields every batch, but less eagerly when free
    /// frames are critically low and eviction is the only way forward.
    pub fn kswapd_service(&self, ft: &FrameTable, envs: &EnvTable, yielder: &mut dyn FnMut()) {
        log::info!("kswapd running");
        while self.is_running() {
            yielder();
            self.kswapd_step(ft, envs);
            let scarce = ft.free_count() < ft.nframes() / 50;
            if scarce {
                // Keep scanning; memory cannot wait for the next round.
                self.kswapd_step(ft, envs);
            }
        }
        log::info!("kswapd stopped");
    }

    pub fn swapin_service(&self, ft: &FrameTable, envs: &EnvTable, yielder: &mut dyn FnMut()) {
        log::info!("swap-in service running");
        while self.is_running() {
            yielder();
            self.swapin_service_step(ft, envs, yielder);
        }
        log::info!("swap-in service stopped");
    }
}
