//! Virtual memory areas
//!
//! A VMA records the *intent* of a mapping (range, permissions, backing
//! source) independent of which frames currently back it. Each address
//! space owns one fixed table of 128 entries threaded into a sorted doubly
//! linked list by slot index; `0xFF` is the null link.
//!
//! The list itself knows nothing about page tables. `unmap` reports every
//! page leaving the address space through a callback and the environment
//! layer tears the mappings down.

use bitflags::bitflags;

use super::{page_round_down, page_round_up, VirtAddr, PGSIZE, USTABDATA, UTOP};
use crate::error::{KernelError, Result};

/// Capacity of the per-address-space table.
pub const VMA_SLOTS: usize = 128;
/// Null neighbour index.
const NO_INDEX: u8 = 0xFF;

bitflags! {
    /// Access rights requested for a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaPerm: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

/// What fills a region's pages on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaType {
    /// Empty slot.
    Unused,
    /// Zero-filled on demand.
    Anon,
    /// Filled from a backing buffer (ELF segment image).
    Binary,
}

/// One virtual memory area.
#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub ty: VmaType,
    pub base: VirtAddr,
    pub len: u32,
    pub perm: VmaPerm,
    /// Region was writable at fork time and its frames are shared.
    pub cow: bool,
    /// Intra-page offset of the caller's requested start; the backing
    /// buffer maps the range starting at `base + back_off`.
    pub back_off: u32,
    pub backing: Option<&'static [u8]>,
    p_adj: u8,
    n_adj: u8,
}

const UNUSED: Vma = Vma {
    ty: VmaType::Unused,
    base: VirtAddr::new(0),
    len: 0,
    perm: VmaPerm::empty(),
    cow: false,
    back_off: 0,
    backing: None,
    p_adj: NO_INDEX,
    n_adj: NO_INDEX,
};

impl Vma {
    pub fn end(&self) -> u32 {
        self.base.as_u32() + self.len
    }

    pub fn contains(&self, va: VirtAddr) -> bool {
        self.ty != VmaType::Unused && va >= self.base && va.as_u32() < self.end()
    }
}

/// Fixed-capacity sorted region table.
#[derive(Clone)]
pub struct VmaList {
    head: u8,
    occupied: u8,
    slots: [Vma; VMA_SLOTS],
}

impl Default for VmaList {
    fn default() -> Self {
        Self::new()
    }
}

impl VmaList {
    pub const fn new() -> Self {
        Self {
            head: NO_INDEX,
            occupied: 0,
            slots: [UNUSED; VMA_SLOTS],
        }
    }

    pub fn occupied(&self) -> usize {
        self.occupied as usize
    }

    pub fn get(&self, index: u8) -> Option<&Vma> {
        let vma = self.slots.get(index as usize)?;
        (vma.ty != VmaType::Unused).then_some(vma)
    }

    /// Active entries in ascending base order.
    pub fn iter(&self) -> VmaIter<'_> {
        VmaIter {
            list: self,
            next: self.head,
        }
    }

    // -----------------------------------------------------------------
    // Insertion
    // -----------------------------------------------------------------

    /// Declare a region. `va` is rounded down and `len` up to page
    /// boundaries; the intra-page offset of `va` is preserved for
    /// file-backed fills. Coalesces with an adjacent entry of identical
    /// type and permissions when neither side carries a backing buffer.
    pub fn new_region(&mut self, va: VirtAddr, len: u32, perm: VmaPerm, ty: VmaType) -> Result<u8> {
        if len == 0 || ty == VmaType::Unused {
            return Err(KernelError::InvalidMapping { va: va.as_u32() });
        }
        let off = va.page_offset();
        let base = page_round_down(va.as_u32());
        let end = va
            .as_u32()
            .checked_add(len)
            .map(page_round_up)
            .ok_or(KernelError::Overlap { va: va.as_u32(), len })?;
        let rlen = end - base;

        // Reject intersections with any active entry.
        for (_, vma) in self.iter() {
            if base < vma.end() && end > vma.base.as_u32() {
                return Err(KernelError::Overlap { va: va.as_u32(), len });
            }
        }

        // Locate neighbours in the sorted order.
        let mut prev = NO_INDEX;
        let mut next = self.head;
        while next != NO_INDEX && self.slots[next as usize].base.as_u32() < base {
            prev = next;
            next = self.slots[next as usize].n_adj;
        }

        let joins_prev = prev != NO_INDEX && {
            let p = &self.slots[prev as usize];
            p.end() == base && p.ty == ty && p.perm == perm && p.backing.is_none() && !p.cow
        };
        let joins_next = next != NO_INDEX && {
            let n = &self.slots[next as usize];
            n.base.as_u32() == end && n.ty == ty && n.perm == perm && n.backing.is_none() && !n.cow
        };

        match (joins_prev, joins_next) {
            (true, true) => {
                // Bridge: previous entry absorbs the gap and the successor.
                let next_len = self.slots[next as usize].len;
                self.slots[prev as usize].len += rlen + next_len;
                self.unlink(next);
                self.slots[next as usize] = UNUSED;
                self.occupied -= 1;
                Ok(prev)
            }
            (true, false) => {
                self.slots[prev as usize].len += rlen;
                Ok(prev)
            }
            (false, true) => {
                let n = &mut self.slots[next as usize];
                n.base = VirtAddr::new(base);
                n.len += rlen;
                Ok(next)
            }
            (false, false) => {
                let idx = self.free_slot().ok_or(KernelError::NoSpace)?;
                self.slots[idx as usize] = Vma {
                    ty,
                    base: VirtAddr::new(base),
                    len: rlen,
                    perm,
                    cow: false,
                    back_off: off,
                    backing: None,
                    p_adj: NO_INDEX,
                    n_adj: NO_INDEX,
                };
                self.link_after(prev, idx);
                self.occupied += 1;
                Ok(idx)
            }
        }
    }

    /// Place a region of `len` bytes in the lowest gap above the user-data
    /// floor that accommodates it.
    pub fn new_range(&mut self, len: u32, perm: VmaPerm, ty: VmaType) -> Result<u8> {
        if len == 0 {
            return Err(KernelError::NoSpace);
        }
        let rlen = page_round_up(len);
        let mut candidate = USTABDATA;
        for (_, vma) in self.iter() {
            if vma.end() <= candidate {
                continue;
            }
            if candidate as u64 + rlen as u64 <= vma.base.as_u32() as u64 {
                break;
            }
            candidate = vma.end();
        }
        if candidate.checked_add(rlen).is_none() || candidate + rlen > UTOP {
            return Err(KernelError::NoSpace);
        }
        self.new_region(VirtAddr::new(candidate), rlen, perm, ty)
    }

    /// Flag every writable entry copy-on-write. Applied to both lists of a
    /// fork once the shared frames have been downgraded to read-only.
    pub fn mark_writable_cow(&mut self) {
        let mut idx = self.head;
        while idx != NO_INDEX {
            let v = &mut self.slots[idx as usize];
            if v.perm.contains(VmaPerm::WRITE) {
                v.cow = true;
            }
            idx = v.n_adj;
        }
    }

    /// Attach a read-only fill source to an entry.
    pub fn set_backing(&mut self, index: u8, data: &'static [u8]) -> Result<()> {
        match self.slots.get_mut(index as usize) {
            Some(vma) if vma.ty != VmaType::Unused => {
                vma.backing = Some(data);
                Ok(())
            }
            _ => Err(KernelError::InvalidMapping { va: 0 }),
        }
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// First entry overlapping `[va, va+len)`; `len == 0` is a point query.
    /// Never returns an `Unused` entry.
    pub fn lookup(&self, va: VirtAddr, len: u32) -> Option<(u8, &Vma)> {
        let start = va.as_u32();
        let end = start.saturating_add(len.max(1));
        self.iter()
            .find(|(_, vma)| start < vma.end() && end > vma.base.as_u32())
    }

    // -----------------------------------------------------------------
    // Unmap
    // -----------------------------------------------------------------

    /// Remove `[va, va+len)` (page-rounded outward) from the declared
    /// regions. Every page of the removed portions is reported through
    /// `on_page` so the caller can tear down its translation.
    pub fn unmap(
        &mut self,
        va: VirtAddr,
        len: u32,
        mut on_page: impl FnMut(VirtAddr),
    ) -> Result<()> {
        if len == 0 {
            return Err(KernelError::InvalidMapping { va: va.as_u32() });
        }
        let rva = page_round_down(va.as_u32());
        let rend = va
            .as_u32()
            .checked_add(len)
            .map(page_round_up)
            .ok_or(KernelError::InvalidMapping { va: va.as_u32() })?;

        let mut cur = self.head;
        while cur != NO_INDEX {
            let next_link = self.slots[cur as usize].n_adj;
            let (base, end) = {
                let v = &self.slots[cur as usize];
                (v.base.as_u32(), v.end())
            };
            if base >= rend {
                break;
            }
            if end <= rva {
                cur = next_link;
                continue;
            }

            if rva <= base && end <= rend {
                // Full cover: entry disappears.
                Self::report_pages(base, end, &mut on_page);
                self.unlink(cur);
                self.slots[cur as usize] = UNUSED;
                self.occupied -= 1;
            } else if rva <= base {
                // Head cover: shrink from the front.
                Self::report_pages(base, rend, &mut on_page);
                let delta = rend - base;
                let v = &mut self.slots[cur as usize];
                v.base = VirtAddr::new(rend);
                v.len -= delta;
                Self::cut_backing_front(v, delta);
            } else if end <= rend {
                // Tail cover: shrink from the back.
                Self::report_pages(rva, end, &mut on_page);
                let v = &mut self.slots[cur as usize];
                v.len = rva - base;
                Self::cut_backing_back(v);
            } else {
                // Middle cover: split into two entries.
                let idx = self.free_slot().ok_or(KernelError::NoSpace)?;
                Self::report_pages(rva, rend, &mut on_page);
                let mut tail = self.slots[cur as usize];
                {
                    let v = &mut self.slots[cur as usize];
                    v.len = rva - base;
                    Self::cut_backing_back(v);
                }
                tail.base = VirtAddr::new(rend);
                tail.len = end - rend;
                Self::cut_backing_front(&mut tail, rend - base);
                tail.p_adj = NO_INDEX;
                tail.n_adj = NO_INDEX;
                self.slots[idx as usize] = tail;
                self.link_after(cur, idx);
                self.occupied += 1;
            }
            cur = next_link;
        }
        Ok(())
    }

    fn report_pages(from: u32, to: u32, on_page: &mut impl FnMut(VirtAddr)) {
        let mut page = from;
        while page < to {
            on_page(VirtAddr::new(page));
            page += PGSIZE as u32;
        }
    }

    /// Drop the part of the backing that mapped below the new base after the
    /// front of the region moved up by `delta` bytes.
    fn cut_backing_front(vma: &mut Vma, delta: u32) {
        if let Some(data) = vma.backing {
            let cut = (delta.saturating_sub(vma.back_off)) as usize;
            vma.backing = Some(if cut >= data.len() { &[] } else { &data[cut..] });
        }
        vma.back_off = vma.back_off.saturating_sub(delta);
    }

    /// Truncate the backing to the bytes still mapping inside the region.
    fn cut_backing_back(vma: &mut Vma) {
        if let Some(data) = vma.backing {
            let keep = (vma.len.saturating_sub(vma.back_off)) as usize;
            vma.backing = Some(&data[..keep.min(data.len())]);
        }
    }

    // -----------------------------------------------------------------
    // List plumbing
    // -----------------------------------------------------------------

    fn free_slot(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|v| v.ty == VmaType::Unused)
            .map(|i| i as u8)
    }

    fn link_after(&mut self, prev: u8, idx: u8) {
        if prev == NO_INDEX {
            let old_head = self.head;
            self.slots[idx as usize].p_adj = NO_INDEX;
            self.slots[idx as usize].n_adj = old_head;
            if old_head != NO_INDEX {
                self.slots[old_head as usize].p_adj = idx;
            }
            self.head = idx;
        } else {
            let next = self.slots[prev as usize].n_adj;
            self.slots[idx as usize].p_adj = prev;
            self.slots[idx as usize].n_adj = next;
            self.slots[prev as usize].n_adj = idx;
            if next != NO_INDEX {
                self.slots[next as usize].p_adj = idx;
            }
        }
    }

    fn unlink(&mut self, idx: u8) {
        let (p, n) = {
            let v = &self.slots[idx as usize];
            (v.p_adj, v.n_adj)
        };
        if p == NO_INDEX {
            self.head = n;
        } else {
            self.slots[p as usize].n_adj = n;
        }
        if n != NO_INDEX {
            self.slots[n as usize].p_adj = p;
        }
    }

    /// Log the active entries.
    pub fn dump(&self) {
        for (idx, vma) in self.iter() {
            log::debug!(
                "vma[{idx}] {:#010x}..{:#010x} {:?} {:?}{}",
                vma.base.as_u32(),
                vma.end(),
                vma.perm,
                vma.ty,
                if vma.backing.is_some() { " backed" } else { "" }
            );
        }
    }
}

/// Iterator over active entries in ascending base order.
pub struct VmaIter<'a> {
    list: &'a VmaList,
    next: u8,
}

impl<'a> Iterator for VmaIter<'a> {
    type Item = (u8, &'a Vma);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NO_INDEX {
            return None;
        }
        let idx = self.next;
        let vma = &self.list.slots[idx as usize];
        self.next = vma.n_adj;
        Some((idx, vma))
    }
}
