//! Reverse page-table lookup
//!
//! Enumerates every leaf entry, across all live address spaces, that maps a
//! given physical frame. This is what makes eviction possible: before a
//! frame leaves memory, every reference to it must be rewritten, and those
//! references can live anywhere.
//!
//! The walk is a resumable cursor, not a coroutine: callers drive it to
//! completion, and it resets itself once exhausted. Free and dying
//! environments are skipped, huge mappings are not supported on this path,
//! and the scan stops at the kernel split. The shared kernel directory can
//! be appended to the walk explicitly.

use core::ptr::NonNull;

use super::frame::{Frame, FrameTable};
use super::page::{PageDir, Pte};
use super::{VirtAddr, NPDENTRIES, NPTENTRIES, UTOP};
use crate::env::{EnvStatus, EnvTable, NENV};

/// Resumable position: environment slot, directory index, table index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RmapCursor {
    env: u32,
    pde: u16,
    pte: u16,
}

impl RmapCursor {
    pub const fn new() -> Self {
        Self {
            env: 0,
            pde: 0,
            pte: 0,
        }
    }
}

/// Advance the cursor to the next leaf entry mapping `frame` and return a
/// pointer to it. Returns `None` when the walk completes, resetting the
/// cursor for reuse. Pass `kern` to extend the walk into the shared kernel
/// directory after all environments.
pub fn reverse_pte_lookup(
    envs: &EnvTable,
    ft: &FrameTable,
    frame: Frame,
    cursor: &mut RmapCursor,
    kern: Option<&PageDir>,
) -> Option<NonNull<Pte>> {
    while (cursor.env as usize) < NENV {
        let env = envs.get(cursor.env as usize);
        let live = !matches!(env.status.load(), EnvStatus::Free | EnvStatus::Dying);
        let dir = if live { env.body().pgdir } else { None };

        if let Some(dir) = dir {
            if let Some(hit) = walk_dir(ft, &dir, frame, &mut cursor.pde, &mut cursor.pte) {
                return Some(hit);
            }
        }
        cursor.pde = 0;
        cursor.pte = 0;
        cursor.env += 1;
    }

    if let Some(dir) = kern {
        if let Some(hit) = walk_dir(ft, dir, frame, &mut cursor.pde, &mut cursor.pte) {
            return Some(hit);
        }
    }

    *cursor = RmapCursor::new();
    None
}

/// Clear the accessed bit in every entry mapping `frame`. Returns whether
/// any entry had it set, i.e. the page was touched since the last pass.
pub fn clear_accessed(envs: &EnvTable, ft: &FrameTable, frame: Frame) -> bool {
    use super::page::PteFlags;

    let mut cursor = RmapCursor::new();
    let mut was_accessed = false;
    while let Some(ptr) = reverse_pte_lookup(envs, ft, frame, &mut cursor, None) {
        // SAFETY: the walk hands out live leaf slots.
        unsafe {
            let pte = ptr.as_ptr().read();
            if pte.0 & PteFlags::ACCESSED.bits() != 0 {
                was_accessed = true;
                ptr.as_ptr().write(Pte(pte.0 & !PteFlags::ACCESSED.bits()));
            }
        }
    }
    was_accessed
}

/// Whether any kernel-type environment maps `frame`. Such frames are not
/// eviction candidates.
pub fn referenced_by_kernel(envs: &EnvTable, ft: &FrameTable, frame: Frame) -> bool {
    for (_, env) in envs.slots() {
        if matches!(env.status.load(), EnvStatus::Free | EnvStatus::Dying) {
            continue;
        }
        let body = env.body();
        if !body.ty.is_kernel() {
            continue;
        }
        let Some(dir) = body.pgdir else { continue };
        drop(body);
        let (mut pde, mut pte) = (0u16, 0u16);
        if walk_dir(ft, &dir, frame, &mut pde, &mut pte).is_some() {
            return true;
        }
    }
    false
}

/// Scan one directory from the cursor position. Leaves the sub-cursors
/// just past a hit so the caller can resume.
fn walk_dir(
    ft: &FrameTable,
    dir: &PageDir,
    frame: Frame,
    pde_i: &mut u16,
    pte_i: &mut u16,
) -> Option<NonNull<Pte>> {
    while (*pde_i as usize) < NPDENTRIES {
        let pdeno = *pde_i as usize;
        if VirtAddr::from_indices(pdeno, 0).as_u32() >= UTOP {
            return None;
        }
        let pde = dir.entry(ft, pdeno);
        if !pde.is_present() || pde.is_huge() {
            *pte_i = 0;
            *pde_i += 1;
            continue;
        }
        let table = pde.frame().expect("present entry has a frame");
        while (*pte_i as usize) < NPTENTRIES {
            let idx = *pte_i as usize;
            *pte_i += 1;
            // SAFETY: `table` is a live page-table frame; `idx` < 1024.
            let ptr = unsafe { (ft.frame_ptr(table) as *mut Pte).add(idx) };
            // SAFETY: valid in-bounds slot, see above.
            let pte = unsafe { ptr.read() };
            if pte.is_present() && pte.frame() == Some(frame) {
                return NonNull::new(ptr);
            }
        }
        *pte_i = 0;
        *pde_i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvId, EnvType};
    use crate::mm::frame::AllocFlags;
    use crate::mm::page::PteFlags;
    use crate::mm::{PhysAddr, PGSIZE, UTEMP};

    fn fixture() -> (FrameTable, PageDir, EnvTable) {
        let bytes = vec![0u8; 0x400 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let ft = unsafe { FrameTable::new(bytes.as_mut_ptr(), 0x400, PhysAddr::new(0)) };
        let kern = PageDir::new_kernel(&ft).expect("kernel dir");
        (ft, kern, EnvTable::new())
    }

    fn drain(
        envs: &EnvTable,
        ft: &FrameTable,
        frame: Frame,
        kern: Option<&PageDir>,
    ) -> Vec<NonNull<Pte>> {
        let mut cursor = RmapCursor::new();
        let mut hits = Vec::new();
        while let Some(p) = reverse_pte_lookup(envs, ft, frame, &mut cursor, kern) {
            hits.push(p);
            assert!(hits.len() <= 64, "runaway reverse walk");
        }
        assert_eq!(cursor, RmapCursor::new(), "exhausted walk must reset");
        hits
    }

    #[test]
    fn finds_every_mapping_exactly_once() {
        let (ft, kern, envs) = fixture();
        let a = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("a");
        let b = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("b");
        let shared = ft.alloc(AllocFlags::ZERO).expect("frame");

        let dir_a = envs.get(a).body().pgdir.expect("dir");
        let dir_b = envs.get(b).body().pgdir.expect("dir");
        let flags = PteFlags::WRITABLE | PteFlags::USER;
        dir_a.insert(&ft, shared, VirtAddr::new(UTEMP), flags).expect("map");
        dir_a
            .insert(&ft, shared, VirtAddr::new(UTEMP + 0x5000), flags)
            .expect("map alias");
        dir_b.insert(&ft, shared, VirtAddr::new(UTEMP), flags).expect("map b");
        assert_eq!(ft.ref_count(shared), 3);

        let hits = drain(&envs, &ft, shared, None);
        assert_eq!(hits.len(), 3, "three mappings, three hits");
        let mut unique = hits.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3, "each slot reported exactly once");
    }

    #[test]
    fn skips_dying_environments() {
        let (ft, kern, envs) = fixture();
        let a = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("a");
        let frame = ft.alloc(AllocFlags::ZERO).expect("frame");
        let dir = envs.get(a).body().pgdir.expect("dir");
        dir.insert(&ft, frame, VirtAddr::new(UTEMP), PteFlags::USER)
            .expect("map");

        let env = envs.get(a);
        assert!(env.status.transition(EnvStatus::NotRunnable, EnvStatus::Runnable));
        assert!(env.status.transition(EnvStatus::Runnable, EnvStatus::Dying));

        assert!(drain(&envs, &ft, frame, None).is_empty());
    }

    #[test]
    fn kernel_directory_is_opt_in() {
        let (ft, kern, envs) = fixture();
        let frame = ft.alloc(AllocFlags::ZERO).expect("frame");
        kern.insert(&ft, frame, VirtAddr::new(0x0D00_0000), PteFlags::WRITABLE)
            .expect("kernel map");

        assert!(drain(&envs, &ft, frame, None).is_empty());
        assert_eq!(drain(&envs, &ft, frame, Some(&kern)).len(), 1);
    }

    #[test]
    fn walk_is_resumable_midway() {
        let (ft, kern, envs) = fixture();
        let a = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("a");
        let frame = ft.alloc(AllocFlags::ZERO).expect("frame");
        let dir = envs.get(a).body().pgdir.expect("dir");
        dir.insert(&ft, frame, VirtAddr::new(UTEMP), PteFlags::USER).expect("map");
        dir.insert(&ft, frame, VirtAddr::new(0x0900_0000), PteFlags::USER)
            .expect("map far away");

        let mut cursor = RmapCursor::new();
        let first = reverse_pte_lookup(&envs, &ft, frame, &mut cursor, None);
        assert!(first.is_some());
        assert_ne!(cursor, RmapCursor::new(), "cursor must record progress");
        let second = reverse_pte_lookup(&envs, &ft, frame, &mut cursor, None);
        assert!(second.is_some());
        assert_ne!(first, second);
        assert!(reverse_pte_lookup(&envs, &ft, frame, &mut cursor, None).is_none());
    }
}
