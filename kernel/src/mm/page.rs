//! Two-level page tables
//!
//! 1024-entry directory, 4 KiB leaves plus 4 MiB directory-level huge
//! leaves, standard i386 bit layout. A non-present, non-zero entry encodes a
//! swap slot: the stored index is biased by one so an all-zero entry still
//! unambiguously means "never mapped".
//!
//! Entry memory lives inside physical frames, so every operation takes the
//! frame table. Reference counting follows one rule everywhere: a new
//! mapping's frame gains its reference *before* the displaced mapping loses
//! one, which makes re-inserting the same frame at the same slot idempotent.

use bitflags::bitflags;

use super::frame::{AllocFlags, Frame, FrameTable};
use super::{PhysAddr, VirtAddr, NPDENTRIES, PGSHIFT, UVPT};
use crate::arch;
use crate::error::{KernelError, Result};

bitflags! {
    /// i386 PTE/PDE permission and status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        /// Directory entries only: 4 MiB leaf.
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
    }
}

/// Mask of the permission bits preserved across a swap-out.
const SWAP_KEEP_MASK: u32 = 0x1E;
/// All flag bits below the physical address field.
const LOW_MASK: u32 = 0xFFF;

/// One page-table (or page-directory) entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u32);

impl Pte {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn new(frame: Frame, flags: PteFlags) -> Self {
        Self(frame.pa().as_u32() | flags.bits())
    }

    pub const fn is_unused(self) -> bool {
        self.0 == 0
    }

    pub const fn is_present(self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(self) -> bool {
        self.0 & PteFlags::HUGE.bits() != 0
    }

    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & LOW_MASK)
    }

    /// Permission bits below the address field, as raw bits.
    pub const fn low_bits(self) -> u32 {
        self.0 & LOW_MASK
    }

    /// Frame this entry points at; `None` unless present.
    pub fn frame(self) -> Option<Frame> {
        if self.is_present() {
            Some(Frame::from_pa(PhysAddr::new(self.0 & !LOW_MASK)))
        } else {
            None
        }
    }

    /// Encode a swapped-out page: present clear, low permission bits kept,
    /// slot index stored with a +1 bias in the address field.
    pub const fn swapped(slot: u32, prior: Pte) -> Self {
        Self(((slot + 1) << PGSHIFT) | (prior.0 & SWAP_KEEP_MASK))
    }

    /// Swap slot carried by a non-present entry, if any.
    pub fn swap_slot(self) -> Option<u32> {
        if !self.is_present() && self.0 >> PGSHIFT != 0 {
            Some((self.0 >> PGSHIFT) - 1)
        } else {
            None
        }
    }
}

/// What `walk` may create on the way to a missing leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkCreate {
    /// Report absence instead of creating.
    None,
    /// Allocate an intermediate table for a 4 KiB leaf.
    Normal,
    /// Hand back the directory slot itself for a 4 MiB leaf.
    Huge,
}

/// What `remove` tore down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedPte {
    /// A present mapping; the frame reference was dropped.
    Frame(Frame),
    /// A swapped-out encoding; the caller owns the slot reference.
    SwapSlot(u32),
}

/// Handle to a page directory stored in a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDir {
    frame: Frame,
}

impl PageDir {
    /// Build the kernel template directory: linear map of physical memory
    /// at `KERNBASE` in global huge leaves, plus the recursive self-map.
    /// Every address space is later cloned from this.
    pub fn new_kernel(ft: &FrameTable) -> Result<Self> {
        let frame = ft.alloc(AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
        ft.inc_ref(frame);
        let dir = Self { frame };

        let window_pdes = ft.nframes().div_ceil(super::NPTENTRIES);
        let first = VirtAddr::new(super::KERNBASE).pdx();
        for i in 0..window_pdes.min(NPDENTRIES - first) {
            let pa = PhysAddr::new((i * super::PTSIZE) as u32);
            let pde = Pte(pa.as_u32()
                | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::HUGE | PteFlags::GLOBAL)
                    .bits());
            dir.write_entry(ft, first + i, pde);
        }
        dir.install_self_map(ft);
        Ok(dir)
    }

    /// Clone the kernel template for a new address space. The kernel half is
    /// copied verbatim (and never diverges afterwards); the user half of the
    /// template is empty by construction.
    pub fn clone_from(ft: &FrameTable, template: &PageDir) -> Result<Self> {
        let frame = ft.alloc(AllocFlags::empty()).ok_or(KernelError::OutOfMemory)?;
        ft.inc_ref(frame);
        ft.copy_frames(frame, template.frame, 1);
        let dir = Self { frame };
        dir.install_self_map(ft);
        Ok(dir)
    }

    /// Adopt an existing directory frame (used by fork rollback paths).
    pub const fn from_frame(frame: Frame) -> Self {
        Self { frame }
    }

    pub const fn frame(&self) -> Frame {
        self.frame
    }

    pub const fn pa(&self) -> PhysAddr {
        self.frame.pa()
    }

    /// Point the read-only recursive mapping at this directory.
    pub fn install_self_map(&self, ft: &FrameTable) {
        let pde = Pte(self.pa().as_u32() | (PteFlags::PRESENT | PteFlags::USER).bits());
        self.write_entry(ft, VirtAddr::new(UVPT).pdx(), pde);
    }

    // -----------------------------------------------------------------
    // Entry access
    // -----------------------------------------------------------------

    fn entry_ptr(&self, ft: &FrameTable, index: usize) -> *mut Pte {
        debug_assert!(index < NPDENTRIES);
        // Frame pointers are PGSIZE-valid; an entry index stays in bounds.
        unsafe { (ft.frame_ptr(self.frame) as *mut Pte).add(index) }
    }

    /// Read a directory entry by index.
    pub fn entry(&self, ft: &FrameTable, index: usize) -> Pte {
        // SAFETY: in-bounds pointer into the directory frame.
        unsafe { self.entry_ptr(ft, index).read() }
    }

    /// Overwrite a directory entry by index.
    pub fn write_entry(&self, ft: &FrameTable, index: usize, pde: Pte) {
        // SAFETY: in-bounds pointer into the directory frame.
        unsafe { self.entry_ptr(ft, index).write(pde) }
    }

    fn table_ptr(ft: &FrameTable, pde: Pte, index: usize) -> *mut Pte {
        debug_assert!(pde.is_present() && !pde.is_huge());
        let table = pde.frame().expect("present entry has a frame");
        // SAFETY: present non-huge directory entries always point at a
        // table frame owned by this directory.
        unsafe { (ft.frame_ptr(table) as *mut Pte).add(index) }
    }

    /// Walk to the leaf entry for `va`, creating intermediate structure per
    /// `create`. For a huge directory entry (existing or requested) the
    /// returned pointer addresses the directory slot itself.
    pub fn walk(
        &self,
        ft: &FrameTable,
        va: VirtAddr,
        create: WalkCreate,
    ) -> Result<Option<*mut Pte>> {
        let pde_ptr = self.entry_ptr(ft, va.pdx());
        // SAFETY: in-bounds directory slot.
        let pde = unsafe { pde_ptr.read() };

        if pde.is_present() {
            if pde.is_huge() {
                return Ok(Some(pde_ptr));
            }
            return Ok(Some(Self::table_ptr(ft, pde, va.ptx())));
        }

        match create {
            WalkCreate::None => Ok(None),
            WalkCreate::Huge => Ok(Some(pde_ptr)),
            WalkCreate::Normal => {
                let table = ft.alloc(AllocFlags::ZERO).ok_or(KernelError::OutOfMemory)?;
                ft.inc_ref(table);
                let pde = Pte::new(
                    table,
                    PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
                );
                // SAFETY: in-bounds directory slot.
                unsafe { pde_ptr.write(pde) };
                Ok(Some(Self::table_ptr(ft, pde, va.ptx())))
            }
        }
    }

    /// Install a leaf mapping for `frame` at `va`.
    ///
    /// The new frame's reference is taken before any displaced occupant is
    /// released, so inserting the same mapping twice is a no-op for the
    /// reference counts. The TLB entry for `va` is invalidated.
    pub fn insert(&self, ft: &FrameTable, frame: Frame, va: VirtAddr, flags: PteFlags) -> Result<()> {
        debug_assert!(
            va.as_u32() < super::UTOP,
            "leaf operations never touch the shared kernel half"
        );
        if flags.contains(PteFlags::HUGE) {
            let va = va.huge_base();
            let pde_ptr = self.entry_ptr(ft, va.pdx());
            // SAFETY: in-bounds directory slot.
            let old = unsafe { pde_ptr.read() };
            assert!(
                !old.is_present() || old.is_huge(),
                "huge insert over a page table at {va:?}"
            );
            ft.inc_ref(frame);
            // SAFETY: in-bounds directory slot.
            unsafe { pde_ptr.write(Pte::new(frame, flags | PteFlags::PRESENT)) };
            if let Some(prev) = old.frame() {
                ft.decref(prev);
            }
            arch::tlb_invalidate(va.as_u32());
            return Ok(());
        }

        let va = va.page_base();
        let pte_ptr = self
            .walk(ft, va, WalkCreate::Normal)?
            .expect("create walk always yields a slot");
        // SAFETY: walk returned a valid leaf slot.
        let old = unsafe { pte_ptr.read() };
        assert!(!old.is_huge(), "4 KiB insert over a huge mapping at {va:?}");
        ft.inc_ref(frame);
        // SAFETY: walk returned a valid leaf slot.
        unsafe { pte_ptr.write(Pte::new(frame, flags | PteFlags::PRESENT)) };
        if let Some(prev) = old.frame() {
            ft.decref(prev);
        }
        arch::tlb_invalidate(va.as_u32());
        Ok(())
    }

    /// Tear down the mapping at `va`. Removing an absent mapping is a
    /// no-op; a swapped-out encoding is cleared and reported so the caller
    /// can release the slot reference.
    pub fn remove(&self, ft: &FrameTable, va: VirtAddr) -> Option<RemovedPte> {
        debug_assert!(
            va.as_u32() < super::UTOP,
            "leaf operations never touch the shared kernel half"
        );
        let pte_ptr = self
            .walk(ft, va, WalkCreate::None)
            .expect("non-creating walk cannot fail")?;
        // SAFETY: walk returned a valid slot.
        let pte = unsafe { pte_ptr.read() };

        if pte.is_present() {
            let frame = pte.frame().expect("present entry has a frame");
            // SAFETY: walk returned a valid slot.
            unsafe { pte_ptr.write(Pte::empty()) };
            ft.decref(frame);
            arch::tlb_invalidate(va.as_u32());
            return Some(RemovedPte::Frame(frame));
        }
        if let Some(slot) = pte.swap_slot() {
            // SAFETY: walk returned a valid slot.
            unsafe { pte_ptr.write(Pte::empty()) };
            return Some(RemovedPte::SwapSlot(slot));
        }
        None
    }

    /// Find the frame mapped at `va`. Huge mappings are not small pages and
    /// answer `None`; callers that care interrogate the directory entry.
    pub fn lookup(&self, ft: &FrameTable, va: VirtAddr) -> Option<(Frame, *mut Pte)> {
        let pde = self.entry(ft, va.pdx());
        if pde.is_huge() {
            return None;
        }
        let pte_ptr = self.walk(ft, va, WalkCreate::None).expect("non-creating walk")?;
        // SAFETY: walk returned a valid slot.
        let pte = unsafe { pte_ptr.read() };
        pte.frame().map(|f| (f, pte_ptr))
    }

    /// Copy of the leaf entry covering `va` (directory entry for huge
    /// mappings); `None` when nothing is there at all.
    pub fn pte_at(&self, ft: &FrameTable, va: VirtAddr) -> Option<Pte> {
        let ptr = self.walk(ft, va, WalkCreate::None).expect("non-creating walk")?;
        // SAFETY: walk returned a valid slot.
        Some(unsafe { ptr.read() })
    }

    /// Set the writable bit on the existing leaf for `va` (both leaf kinds).
    /// Used when a copy-on-write page turns out to be unshared.
    pub fn set_writable(&self, ft: &FrameTable, va: VirtAddr) {
        if let Some(ptr) = self.walk(ft, va, WalkCreate::None).expect("non-creating walk") {
            // SAFETY: walk returned a valid slot.
            unsafe {
                let pte = ptr.read();
                ptr.write(Pte(pte.0 | PteFlags::WRITABLE.bits()));
            }
            arch::tlb_invalidate(va.as_u32());
        }
    }
}
