//! Swap store
//!
//! The backing device is an opaque sector store; one page spans eight
//! contiguous sectors at `slot * 8`. A slot is described by nothing but a
//! reference count equal to the number of page-table entries whose
//! non-present encoding names it. The descriptor array is transient: the
//! device is recreated from scratch at every boot.
//!
//! Eviction order matters and is fixed: the page is written to the device
//! first, then every reference is rewritten to the swap encoding, and only
//! then does the frame's count fall. At no point is a reference dangling.

use core::sync::atomic::{AtomicU8, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use crate::env::{EnvStatus, EnvTable};
use crate::error::{KernelError, Result};
use crate::mm::frame::{AllocFlags, Frame, FrameTable};
use crate::mm::page::{PageDir, Pte, PteFlags};
use crate::mm::rmap::{reverse_pte_lookup, RmapCursor};
use crate::mm::{VirtAddr, PGSIZE};
use crate::sync;

/// Bytes per device sector.
pub const SECTOR_SIZE: usize = 512;
/// Sectors holding one page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// An opaque array of 512-byte sectors. The production device is the IDE
/// disk behind the platform layer; tests use [`MemDisk`].
pub trait SectorStore: Send {
    fn num_sectors(&self) -> u32;
    fn read_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()>;
    fn write_sector(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()>;
}

/// RAM-backed sector store, used for bring-up and by the test harness.
pub struct MemDisk {
    data: Vec<u8>,
}

impl MemDisk {
    pub fn new(num_sectors: u32) -> Self {
        Self {
            data: alloc::vec![0u8; num_sectors as usize * SECTOR_SIZE],
        }
    }
}

impl SectorStore for MemDisk {
    fn num_sectors(&self) -> u32 {
        (self.data.len() / SECTOR_SIZE) as u32
    }

    fn read_sector(&mut self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) -> Result<()> {
        let off = sector as usize * SECTOR_SIZE;
        let src = self
            .data
            .get(off..off + SECTOR_SIZE)
            .ok_or(KernelError::DiskFault { sector })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_sector(&mut self, sector: u32, buf: &[u8; SECTOR_SIZE]) -> Result<()> {
        let off = sector as usize * SECTOR_SIZE;
        let dst = self
            .data
            .get_mut(off..off + SECTOR_SIZE)
            .ok_or(KernelError::DiskFault { sector })?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}

/// Reference-counted page slots over a sector store.
pub struct SwapStore {
    slots: Box<[AtomicU8]>,
    disk: Mutex<Box<dyn SectorStore + Send>>,
}

impl SwapStore {
    pub fn new(disk: Box<dyn SectorStore + Send>) -> Self {
        let nslots = disk.num_sectors() as usize / SECTORS_PER_PAGE;
        let mut slots = Vec::with_capacity(nslots);
        slots.resize_with(nslots, || AtomicU8::new(0));
        log::info!(
            "swap store: {} sectors, {} page slots",
            disk.num_sectors(),
            nslots
        );
        Self {
            slots: slots.into_boxed_slice(),
            disk: Mutex::new(disk),
        }
    }

    pub fn nslots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_ref(&self, slot: u32) -> u8 {
        self.slots[slot as usize].load(Ordering::Acquire)
    }

    /// Slots currently referenced by at least one entry.
    pub fn used_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.load(Ordering::Relaxed) > 0)
            .count()
    }

    pub fn slot_incref(&self, slot: u32) -> u8 {
        let prev = self.slots[slot as usize].fetch_add(1, Ordering::AcqRel);
        assert!(prev < u8::MAX, "swap slot {slot} refcount overflow");
        prev + 1
    }

    pub fn slot_decref(&self, slot: u32) {
        let prev = self.slots[slot as usize].fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "swap slot {slot} refcount underflow");
    }

    fn find_free_slot(&self) -> Option<u32> {
        self.slots
            .iter()
            .position(|s| s.load(Ordering::Acquire) == 0)
            .map(|i| i as u32)
    }

    // -----------------------------------------------------------------
    // Page I/O
    // -----------------------------------------------------------------

    /// Write one frame to a slot, one sector at a time, invoking `yielder`
    /// between device operations. Device failure is unrecoverable.
    fn write_page(&self, ft: &FrameTable, frame: Frame, slot: u32, yielder: &mut dyn FnMut()) {
        let base = slot * SECTORS_PER_PAGE as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_PAGE {
            ft.read_bytes(frame, s * SECTOR_SIZE, &mut buf);
            yielder();
            self.disk
                .lock()
                .write_sector(base + s as u32, &buf)
                .unwrap_or_else(|e| panic!("swap device write failed: {e}"));
        }
    }

    /// Read one slot into a frame, one sector at a time.
    fn read_page(&self, ft: &FrameTable, frame: Frame, slot: u32, yielder: &mut dyn FnMut()) {
        let base = slot * SECTORS_PER_PAGE as u32;
        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..SECTORS_PER_PAGE {
            yielder();
            self.disk
                .lock()
                .read_sector(base + s as u32, &mut buf)
                .unwrap_or_else(|e| panic!("swap device read failed: {e}"));
            ft.write_bytes(frame, s * SECTOR_SIZE, &buf);
        }
    }

    // -----------------------------------------------------------------
    // Eviction and reload
    // -----------------------------------------------------------------

    /// Evict `frame` to the device and rewrite every reference to it.
    ///
    /// With the swap section held: verify the frame is referenced and
    /// swappable, pick a free slot, write the page out, then walk the
    /// reverse map rewriting each entry to the swap encoding (slot gains a
    /// reference, frame loses one). The frame is freed implicitly when its
    /// last reference falls.
    pub fn swap_out(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        kern: Option<&PageDir>,
        frame: Frame,
        yielder: &mut dyn FnMut(),
    ) -> Result<()> {
        let _section = sync::swap_lock().lock();

        if ft.ref_count(frame) == 0 {
            return Err(KernelError::NoRef);
        }
        // The swappable flag gates *candidacy* and is cleared when a frame
        // enters the eviction queue; here only hard pins disqualify.
        if ft.flags(frame).is_pinned() {
            return Err(KernelError::Unswappable { frame: frame.0 });
        }
        let slot = self.find_free_slot().ok_or(KernelError::NoFreeSwap)?;

        self.write_page(ft, frame, slot, yielder);

        let mut cursor = RmapCursor::new();
        let mut rewritten = 0u32;
        while let Some(ptr) = reverse_pte_lookup(envs, ft, frame, &mut cursor, kern) {
            self.slot_incref(slot);
            // SAFETY: the reverse walk hands out live leaf slots; the swap
            // section serializes every rewrite.
            unsafe {
                let old = ptr.as_ptr().read();
                ptr.as_ptr().write(Pte::swapped(slot, old));
            }
            ft.decref(frame);
            rewritten += 1;
        }
        crate::arch::tlb_flush_all();

        if rewritten == 0 {
            log::warn!("evicted frame {} had no table references", frame.0);
        } else {
            log::debug!("frame {} -> swap slot {slot} ({rewritten} refs)", frame.0);
        }
        Ok(())
    }

    /// Bring the page swapped out at `va` back into `env_slot`.
    ///
    /// Allocates a fresh frame (parking the environment runnable again if
    /// memory is exhausted, so it retries by refaulting), reads the page,
    /// drops the slot reference and installs the mapping with the encoded
    /// permission bits. The environment becomes runnable.
    pub fn swap_in(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        env_slot: usize,
        va: VirtAddr,
        yielder: &mut dyn FnMut(),
    ) -> Result<()> {
        let _section = sync::swap_lock().lock();
        let env = envs.get(env_slot);
        let pgdir = env.body().pgdir.ok_or(KernelError::NoRef)?;

        let va = va.page_base();
        let pte = pgdir
            .pte_at(ft, va)
            .ok_or(KernelError::InvalidMapping { va: va.as_u32() })?;
        let slot = pte.swap_slot().ok_or(KernelError::NoRef)?;
        if slot as usize >= self.nslots() || self.slot_ref(slot) == 0 {
            return Err(KernelError::NoRef);
        }

        let Some(frame) = ft.alloc(AllocFlags::empty()) else {
            // Park the environment runnable; it will fault again once the
            // scanner has freed something.
            env.status
                .transition(EnvStatus::WaitingSwap, EnvStatus::Runnable);
            yielder();
            return Err(KernelError::OutOfMemory);
        };

        self.read_page(ft, frame, slot, yielder);
        self.slot_decref(slot);

        let flags = PteFlags::from_bits_truncate(pte.low_bits());
        if let Err(e) = pgdir.insert(ft, frame, va, flags) {
            let _ = ft.free(frame);
            return Err(e);
        }
        ft.set_swappable(frame, true);
        env.status
            .transition(EnvStatus::WaitingSwap, EnvStatus::Runnable);
        log::debug!("swap slot {slot} -> frame {} for env slot {env_slot}", frame.0);
        Ok(())
    }
}
