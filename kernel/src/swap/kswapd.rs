//! Eviction scanner
//!
//! A clock-style hand sweeps the frame table. A frame survives the round
//! if it was touched since the scanner last saw it (accessed bits are
//! test-and-cleared through the reverse map), if a kernel environment maps
//! it, or if overall memory pressure is below the threshold. Survivor or
//! not, the hand keeps moving; candidates go to the swap-out ring in
//! non-blocking mode and a full ring just means the round ends early.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::env::EnvTable;
use crate::error::KernelError;
use crate::mm::frame::{Frame, FrameTable};
use crate::mm::rmap;

use super::queue::{QueueMode, SwapOutQueue};

/// Default memory-pressure threshold: swap only above this percentage of
/// frames in use.
pub const DEFAULT_PRESSURE_PCT: u32 = 80;

/// Scanner state: clock hand plus the configurable threshold.
pub struct Kswapd {
    hand: AtomicUsize,
    pressure_pct: AtomicU32,
}

impl Default for Kswapd {
    fn default() -> Self {
        Self::new()
    }
}

impl Kswapd {
    pub const fn new() -> Self {
        Self {
            hand: AtomicUsize::new(0),
            pressure_pct: AtomicU32::new(DEFAULT_PRESSURE_PCT),
        }
    }

    /// Change the pressure threshold (percent of frames in use).
    pub fn set_pressure_threshold(&self, pct: u32) {
        self.pressure_pct.store(pct.min(100), Ordering::Relaxed);
    }

    pub fn pressure_threshold(&self) -> u32 {
        self.pressure_pct.load(Ordering::Relaxed)
    }

    /// Whether the system is under enough pressure to evict at all.
    pub fn under_pressure(&self, ft: &FrameTable) -> bool {
        let pct = ft.rss() * 100 / ft.nframes().max(1);
        pct as u32 >= self.pressure_threshold()
    }

    /// Advance the clock hand over up to `budget` frames and enqueue
    /// eviction candidates. Returns how many frames were queued.
    pub fn scan(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        outq: &SwapOutQueue,
        budget: usize,
    ) -> usize {
        if !self.under_pressure(ft) {
            return 0;
        }
        let nframes = ft.nframes();
        let mut queued = 0;

        for _ in 0..budget.min(nframes) {
            let idx = self.hand.fetch_add(1, Ordering::Relaxed) % nframes;
            let frame = Frame(idx as u32);

            if ft.ref_count(frame) == 0 || !ft.is_swappable(frame) || ft.flags(frame).is_pinned()
            {
                continue;
            }
            // Recently used pages get another round.
            if rmap::clear_accessed(envs, ft, frame) {
                continue;
            }
            if rmap::referenced_by_kernel(envs, ft, frame) {
                continue;
            }

            match outq.push(frame, QueueMode::NonBlocking) {
                Ok(()) => {
                    // Off the candidate list until the eviction completes.
                    ft.set_swappable(frame, false);
                    queued += 1;
                }
                Err(KernelError::QueueFull) => break,
                Err(e) => unreachable!("unexpected queue error {e}"),
            }
        }
        queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvId, EnvType};
    use crate::mm::frame::AllocFlags;
    use crate::mm::page::{PageDir, PteFlags};
    use crate::mm::{PhysAddr, VirtAddr, PGSIZE, UTEMP};
    use crate::swap::queue::SwapQueue;

    fn fixture() -> (FrameTable, PageDir, EnvTable) {
        let bytes = vec![0u8; 0x100 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let ft = unsafe { FrameTable::new(bytes.as_mut_ptr(), 0x100, PhysAddr::new(0)) };
        let kern = PageDir::new_kernel(&ft).expect("kernel dir");
        (ft, kern, EnvTable::new())
    }

    fn map_page(ft: &FrameTable, envs: &EnvTable, slot: usize, va: u32) -> Frame {
        let dir = envs.get(slot).body().pgdir.expect("dir");
        let f = ft.alloc(AllocFlags::ZERO).expect("frame");
        dir.insert(ft, f, VirtAddr::new(va), PteFlags::WRITABLE | PteFlags::USER)
            .expect("insert");
        ft.set_swappable(f, true);
        f
    }

    #[test]
    fn no_pressure_means_no_eviction() {
        let (ft, kern, envs) = fixture();
        let slot = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("env");
        map_page(&ft, &envs, slot, UTEMP);

        let kswapd = Kswapd::new();
        let outq: SwapOutQueue = SwapQueue::with_capacity(16);
        assert_eq!(kswapd.scan(&ft, &envs, &outq, ft.nframes()), 0);
        assert!(outq.is_empty());
    }

    #[test]
    fn idle_pages_are_queued_under_pressure() {
        let (ft, kern, envs) = fixture();
        let slot = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("env");
        let frame = map_page(&ft, &envs, slot, UTEMP);

        let kswapd = Kswapd::new();
        kswapd.set_pressure_threshold(0);
        let outq: SwapOutQueue = SwapQueue::with_capacity(16);

        // First pass clears the accessed bit the insert left behind (the
        // hosted build never sets it, so this models the hardware side by
        // setting it explicitly).
        let (_, pte_ptr) = {
            let dir = envs.get(slot).body().pgdir.expect("dir");
            dir.lookup(&ft, VirtAddr::new(UTEMP)).expect("mapping")
        };
        // SAFETY: live leaf slot from lookup.
        unsafe {
            let pte = pte_ptr.read();
            pte_ptr.write(crate::mm::page::Pte(pte.0 | PteFlags::ACCESSED.bits()));
        }

        assert_eq!(kswapd.scan(&ft, &envs, &outq, ft.nframes()), 0, "touched page survives");
        let queued = kswapd.scan(&ft, &envs, &outq, ft.nframes());
        assert_eq!(queued, 1, "cold page must be queued");
        assert_eq!(outq.pop(), Some(frame));
        assert!(!ft.is_swappable(frame), "queued frame must not re-queue");
    }

    #[test]
    fn kernel_mapped_pages_survive() {
        let (ft, kern, envs) = fixture();
        let kt = crate::env::kthread::create(&ft, &envs, &kern, 0x1000).expect("kthread");
        let frame = map_page(&ft, &envs, kt, UTEMP);

        let kswapd = Kswapd::new();
        kswapd.set_pressure_threshold(0);
        let outq: SwapOutQueue = SwapQueue::with_capacity(16);
        kswapd.scan(&ft, &envs, &outq, ft.nframes());
        let mut queued = Vec::new();
        while let Some(f) = outq.pop() {
            queued.push(f);
        }
        assert!(
            !queued.contains(&frame),
            "kernel-held frames must never be eviction candidates"
        );
    }
}
