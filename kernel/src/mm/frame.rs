//! Physical frame allocator
//!
//! One descriptor per 4 KiB frame, a singly-linked free list threaded
//! through the descriptors by index, and a linear-scan contiguous allocator
//! for multi-frame runs (4 MiB huge blocks included). Reference counts are
//! atomic; free-list surgery is serialized by a mutex.
//!
//! The table also owns the base pointer of the linear physical window, so
//! every access to frame contents (zeroing, page copies, swap I/O staging)
//! goes through it. On bare metal the window is the `KERNBASE` map; the test
//! harness hands in a host buffer instead.

use core::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use super::{PhysAddr, EXTPHYSMEM, HUGE_PAGE_FRAMES, IOPHYSMEM, PGSHIFT, PGSIZE};
use crate::error::{KernelError, Result};

bitflags! {
    /// Per-frame state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Frame 0; holds the real-mode IVT and BIOS data.
        const BIOS        = 1 << 0;
        /// Occupied by kernel text/data or boot allocations.
        const KERNEL      = 1 << 1;
        /// Legacy I/O hole; never memory.
        const IO_HOLE     = 1 << 2;
        /// Currently on the free list.
        const FREE        = 1 << 3;
        /// Head of a 1024-frame contiguous block.
        const HUGE        = 1 << 4;
        /// Pinned for reasons other than the above.
        const UNCLAIMABLE = 1 << 5;
        /// Eligible for eviction by the swap scanner.
        const SWAPPABLE   = 1 << 6;
    }
}

impl FrameFlags {
    /// Frames that must never enter the free list or the swap device.
    pub fn is_pinned(self) -> bool {
        self.intersects(
            FrameFlags::BIOS | FrameFlags::KERNEL | FrameFlags::IO_HOLE | FrameFlags::UNCLAIMABLE,
        )
    }
}

bitflags! {
    /// Allocation requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u8 {
        /// Zero the frame contents before returning.
        const ZERO = 1 << 0;
        /// Allocate a 4 MiB-aligned run of 1024 frames.
        const HUGE = 1 << 1;
    }
}

/// Index of a physical frame in the descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Frame(pub u32);

impl Frame {
    pub const fn number(self) -> u32 {
        self.0
    }

    pub const fn pa(self) -> PhysAddr {
        PhysAddr::new(self.0 << PGSHIFT)
    }

    pub const fn from_pa(pa: PhysAddr) -> Self {
        Self(pa.frame_number())
    }

    /// 4 MiB-aligned frame that heads the block containing `self`.
    pub const fn huge_head(self) -> Self {
        Self(self.0 & !(HUGE_PAGE_FRAMES as u32 - 1))
    }
}

/// Per-frame descriptor. The link word is the successor on the free list,
/// biased by one so that zero reads as "not linked".
struct FrameInfo {
    refc: AtomicU16,
    flags: AtomicU8,
    link: AtomicU32,
}

impl FrameInfo {
    const fn new() -> Self {
        Self {
            refc: AtomicU16::new(0),
            flags: AtomicU8::new(0),
            link: AtomicU32::new(0),
        }
    }
}

/// Free-list head, biased by one like the link words.
struct FreeList {
    head: u32,
    count: usize,
}

/// The physical frame table.
pub struct FrameTable {
    frames: Box<[FrameInfo]>,
    free: Mutex<FreeList>,
    /// Virtual address of physical frame 0.
    base: *mut u8,
}

// SAFETY: the descriptor array is all atomics behind a mutex-guarded free
// list, and `base` points at the physical window, which is valid for the
// table's whole lifetime. Frame *contents* are handed out raw; callers
// serialize access through the page-table and swap locks.
unsafe impl Send for FrameTable {}
// SAFETY: see above.
unsafe impl Sync for FrameTable {}

impl FrameTable {
    /// Build the table over `nframes` frames whose contents are reachable at
    /// `base`. Frame 0, the I/O hole, and everything from the start of
    /// extended memory up to `kernel_break` are marked unallocatable and do
    /// not enter the free list.
    ///
    /// # Safety
    ///
    /// `base` must be valid for reads and writes of `nframes * PGSIZE`
    /// bytes for as long as the table lives.
    pub unsafe fn new(base: *mut u8, nframes: usize, kernel_break: PhysAddr) -> Self {
        let mut frames = Vec::with_capacity(nframes);
        frames.resize_with(nframes, FrameInfo::new);
        let table = Self {
            frames: frames.into_boxed_slice(),
            free: Mutex::new(FreeList { head: 0, count: 0 }),
            base,
        };

        let io_first = IOPHYSMEM >> PGSHIFT;
        let io_last = EXTPHYSMEM >> PGSHIFT;
        let break_frame = kernel_break.frame_number().max(io_last);

        let mut free = table.free.lock();
        for i in (0..nframes as u32).rev() {
            let info = &table.frames[i as usize];
            let flags = if i == 0 {
                FrameFlags::BIOS
            } else if (io_first..io_last).contains(&i) {
                FrameFlags::IO_HOLE
            } else if (io_last..break_frame).contains(&i) {
                FrameFlags::KERNEL
            } else {
                FrameFlags::FREE
            };
            info.flags.store(flags.bits(), Ordering::Relaxed);
            info.refc
                .store(u16::from(!flags.contains(FrameFlags::FREE)), Ordering::Relaxed);
            if flags.contains(FrameFlags::FREE) {
                info.link.store(free.head, Ordering::Relaxed);
                free.head = i + 1;
                free.count += 1;
            }
        }
        drop(free);
        table
    }

    pub fn nframes(&self) -> usize {
        self.frames.len()
    }

    /// Frames currently on the free list.
    pub fn free_count(&self) -> usize {
        self.free.lock().count
    }

    /// Resident set size: frames referenced or otherwise not free.
    pub fn rss(&self) -> usize {
        self.frames
            .iter()
            .filter(|f| {
                f.refc.load(Ordering::Relaxed) > 0
                    || !FrameFlags::from_bits_truncate(f.flags.load(Ordering::Relaxed))
                        .contains(FrameFlags::FREE)
            })
            .count()
    }

    // -----------------------------------------------------------------
    // Flags and reference counts
    // -----------------------------------------------------------------

    pub fn flags(&self, frame: Frame) -> FrameFlags {
        FrameFlags::from_bits_truncate(self.info(frame).flags.load(Ordering::Acquire))
    }

    fn set_flag(&self, frame: Frame, flag: FrameFlags) {
        self.info(frame).flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    fn clear_flag(&self, frame: Frame, flag: FrameFlags) {
        self.info(frame).flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    /// Mark or unmark a frame as eligible for swap-out.
    pub fn set_swappable(&self, frame: Frame, yes: bool) {
        if yes {
            self.set_flag(frame, FrameFlags::SWAPPABLE);
        } else {
            self.clear_flag(frame, FrameFlags::SWAPPABLE);
        }
    }

    pub fn is_swappable(&self, frame: Frame) -> bool {
        self.flags(frame).contains(FrameFlags::SWAPPABLE)
    }

    /// Raw reference count of this descriptor.
    pub fn ref_count(&self, frame: Frame) -> u16 {
        self.info(frame).refc.load(Ordering::Acquire)
    }

    /// Logical reference count: body frames of a huge block answer with
    /// their head's count.
    pub fn get_ref(&self, frame: Frame) -> u16 {
        let head = frame.huge_head();
        if head != frame && self.flags(head).contains(FrameFlags::HUGE) {
            self.ref_count(head)
        } else {
            self.ref_count(frame)
        }
    }

    /// Take one reference on a frame.
    pub fn inc_ref(&self, frame: Frame) {
        let prev = self.info(frame).refc.fetch_add(1, Ordering::AcqRel);
        assert!(prev < u16::MAX, "frame {} refcount overflow", frame.0);
    }

    /// Drop one reference; frees the frame when the count hits zero.
    pub fn decref(&self, frame: Frame) {
        let prev = self.info(frame).refc.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "frame {} refcount underflow", frame.0);
        if prev == 1 {
            self.free(frame).expect("freeing an unreferenced frame cannot fail");
        }
    }

    // -----------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------

    /// Allocate one frame, or a huge block when `AllocFlags::HUGE` is set.
    /// Does not touch the reference count; the caller installs references
    /// (usually through a page-table insert). Returns `None` when exhausted.
    pub fn alloc(&self, flags: AllocFlags) -> Option<Frame> {
        if flags.contains(AllocFlags::HUGE) {
            let head = self.alloc_run(HUGE_PAGE_FRAMES, true)?;
            self.set_flag(head, FrameFlags::HUGE);
            if flags.contains(AllocFlags::ZERO) {
                self.zero_frames(head, HUGE_PAGE_FRAMES);
            }
            return Some(head);
        }

        let frame = {
            let mut free = self.free.lock();
            if free.head == 0 {
                return None;
            }
            let frame = Frame(free.head - 1);
            let info = self.info(frame);
            free.head = info.link.swap(0, Ordering::Relaxed);
            free.count -= 1;
            info.flags
                .fetch_and(!FrameFlags::FREE.bits(), Ordering::Relaxed);
            frame
        };
        if flags.contains(AllocFlags::ZERO) {
            self.zero_frames(frame, 1);
        }
        Some(frame)
    }

    /// Allocate `n` physically consecutive frames. Used for runs longer than
    /// one frame but shorter than a huge block.
    pub fn alloc_consecutive(&self, n: usize, flags: AllocFlags) -> Option<Frame> {
        let head = self.alloc_run(n, false)?;
        if flags.contains(AllocFlags::ZERO) {
            self.zero_frames(head, n);
        }
        Some(head)
    }

    /// Linear scan for `n` consecutive free frames, then splice every run
    /// member out of the free list.
    fn alloc_run(&self, n: usize, aligned: bool) -> Option<Frame> {
        if n == 0 || n > self.frames.len() {
            return None;
        }
        let mut free = self.free.lock();

        let mut start = 0usize;
        let mut hits = 0usize;
        let mut found = None;
        for i in 0..self.frames.len() {
            let is_free = FrameFlags::from_bits_truncate(
                self.frames[i].flags.load(Ordering::Relaxed),
            )
            .contains(FrameFlags::FREE);
            if !is_free {
                hits = 0;
                continue;
            }
            if hits == 0 {
                start = i;
                if aligned && start % HUGE_PAGE_FRAMES != 0 {
                    // Only aligned block heads may start a run.
                    continue;
                }
            }
            hits += 1;
            if hits == n {
                found = Some(start);
                break;
            }
        }
        let start = found? as u32;
        let end = start + n as u32;

        // Unlink every member of the run from the free list.
        let mut prev: Option<u32> = None;
        let mut cur = free.head;
        while cur != 0 {
            let idx = cur - 1;
            let next = self.frames[idx as usize].link.load(Ordering::Relaxed);
            if (start..end).contains(&idx) {
                match prev {
                    None => free.head = next,
                    Some(p) => self.frames[p as usize].link.store(next, Ordering::Relaxed),
                }
                self.frames[idx as usize].link.store(0, Ordering::Relaxed);
                self.frames[idx as usize]
                    .flags
                    .fetch_and(!FrameFlags::FREE.bits(), Ordering::Relaxed);
                free.count -= 1;
            } else {
                prev = Some(idx);
            }
            cur = next;
        }
        Some(Frame(start))
    }

    /// Return a frame (or a whole huge block) to the free list.
    ///
    /// Only legal when the reference count is zero; freeing a frame that is
    /// already free reports `DoubleFree`.
    pub fn free(&self, frame: Frame) -> Result<()> {
        let info = self.info(frame);
        if info.refc.load(Ordering::Acquire) != 0 {
            return Err(KernelError::NonZeroRef { frame: frame.0 });
        }
        let flags = self.flags(frame);
        if flags.contains(FrameFlags::FREE) {
            return Err(KernelError::DoubleFree { frame: frame.0 });
        }
        assert!(!flags.is_pinned(), "pinned frame {} on free path", frame.0);

        let run = if flags.contains(FrameFlags::HUGE) {
            self.clear_flag(frame, FrameFlags::HUGE);
            HUGE_PAGE_FRAMES as u32
        } else {
            1
        };

        let mut free = self.free.lock();
        for i in 0..run {
            let f = Frame(frame.0 + i);
            let info = self.info(f);
            info.flags.fetch_or(FrameFlags::FREE.bits(), Ordering::Relaxed);
            info.flags
                .fetch_and(!FrameFlags::SWAPPABLE.bits(), Ordering::Relaxed);
            info.link.store(free.head, Ordering::Relaxed);
            free.head = f.0 + 1;
            free.count += 1;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Frame contents
    // -----------------------------------------------------------------

    /// Pointer to the first byte of `frame` in the physical window.
    pub fn frame_ptr(&self, frame: Frame) -> *mut u8 {
        assert!((frame.0 as usize) < self.frames.len(), "frame {} out of range", frame.0);
        // Window validity is the constructor's contract.
        unsafe { self.base.add(frame.pa().as_usize()) }
    }

    fn zero_frames(&self, frame: Frame, n: usize) {
        // SAFETY: `frame..frame+n` was just carved out of the free list, so
        // nothing else references the bytes.
        unsafe {
            core::ptr::write_bytes(self.frame_ptr(frame), 0, n * PGSIZE);
        }
    }

    /// Copy `PGSIZE * n` bytes from one frame run to another.
    pub fn copy_frames(&self, dst: Frame, src: Frame, n: usize) {
        assert_ne!(dst, src);
        // SAFETY: distinct frames never overlap within the window.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(src),
                self.frame_ptr(dst),
                n * PGSIZE,
            );
        }
    }

    /// Copy bytes into a frame at the given offset.
    pub fn write_bytes(&self, frame: Frame, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= PGSIZE);
        // SAFETY: bounds checked above; content access is serialized by the
        // caller's lock (page tables or swap).
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.frame_ptr(frame).add(offset),
                bytes.len(),
            );
        }
    }

    /// Copy bytes out of a frame at the given offset.
    pub fn read_bytes(&self, frame: Frame, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= PGSIZE);
        // SAFETY: bounds checked above; see `write_bytes`.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.frame_ptr(frame).add(offset),
                out.as_mut_ptr(),
                out.len(),
            );
        }
    }

    fn info(&self, frame: Frame) -> &FrameInfo {
        &self.frames[frame.0 as usize]
    }
}
