//! Memory subsystem end-to-end scenarios: free-list accounting, huge
//! allocation geometry, the swap round-trip, and demand paging under
//! memory pressure.

mod common;

use cinnabar_kernel::fault::{self, FaultCtx, FaultOutcome};
use cinnabar_kernel::mm::frame::AllocFlags;
use cinnabar_kernel::mm::page::PteFlags;
use cinnabar_kernel::mm::vma::{VmaPerm, VmaType};
use cinnabar_kernel::mm::{VirtAddr, HUGE_PAGE_FRAMES, PGSIZE};

use common::*;

#[test]
fn free_list_accounting() {
    let k = machine(0x200, 16);
    let before = k.frames.free_count();

    let frames: Vec<_> = (0..3)
        .map(|_| k.frames.alloc(AllocFlags::empty()).expect("allocation"))
        .collect();
    assert_eq!(k.frames.free_count(), before - 3);
    for f in frames {
        k.frames.free(f).expect("free");
    }
    assert_eq!(k.frames.free_count(), before, "alloc/free must balance");
}

#[test]
fn huge_allocation_geometry() {
    let k = machine(3 * HUGE_PAGE_FRAMES, 16);
    let before = k.frames.free_count();

    let huge = k.frames.alloc(AllocFlags::HUGE).expect("huge block");
    let regular = k.frames.alloc(AllocFlags::empty()).expect("regular frame");

    let h = huge.pa().as_u32() as u64;
    let r = regular.pa().as_u32() as u64;
    assert_eq!(h % (HUGE_PAGE_FRAMES * PGSIZE) as u64, 0, "block must be 4 MiB aligned");
    assert!(
        r < h || r - h >= (HUGE_PAGE_FRAMES * PGSIZE) as u64,
        "regular frame {r:#x} inside huge block at {h:#x}"
    );

    k.frames.free(huge).expect("huge free");
    assert_eq!(
        k.frames.free_count(),
        before - 1,
        "freeing the block must return exactly 1024 frames"
    );
    k.frames.free(regular).expect("regular free");
    assert_eq!(k.frames.free_count(), before);
}

#[test]
fn swap_round_trip_preserves_contents() {
    let k = machine(0x200, 16);
    let slot = running_user_env(k, 0);
    let va = 0x0D00_0000;

    {
        let mut body = k.envs.get(slot).body();
        body.vmas
            .as_mut()
            .expect("regions")
            .new_region(
                VirtAddr::new(va),
                PGSIZE as u32,
                VmaPerm::READ | VmaPerm::WRITE,
                VmaType::Anon,
            )
            .expect("region");
    }
    user_write_u32(k, slot, va, 0xDEAD_BEEF);

    // Evict the page directly.
    let frame = {
        let body = k.envs.get(slot).body();
        let dir = body.pgdir.expect("dir");
        dir.lookup(&k.frames, VirtAddr::new(va)).expect("mapped").0
    };
    k.swap
        .store
        .swap_out(&k.frames, &k.envs, None, frame, &mut || {})
        .expect("swap out");

    let pte = {
        let body = k.envs.get(slot).body();
        body.pgdir.expect("dir").pte_at(&k.frames, VirtAddr::new(va)).expect("pte")
    };
    assert!(!pte.is_present(), "present bit must clear on eviction");
    assert!(pte.0 >> 12 != 0, "encoded slot index must be non-zero");
    assert!(pte.swap_slot().is_some());

    // Touch the page again: the fault engine queues the reload, the
    // service thread performs it.
    let ctx = FaultCtx {
        va: VirtAddr::new(va),
        kernel_cs: false,
        write: false,
    };
    assert_eq!(
        fault::page_fault(&k.frames, &k.envs, &k.swap, slot, &ctx),
        FaultOutcome::Yield
    );
    assert!(k.swap.swapin_service_step(&k.frames, &k.envs, &mut || {}));

    assert_eq!(user_read_u32(k, slot, va), 0xDEAD_BEEF);
    let restored = {
        let body = k.envs.get(slot).body();
        body.pgdir.expect("dir").pte_at(&k.frames, VirtAddr::new(va)).expect("pte")
    };
    assert!(restored.flags().contains(PteFlags::WRITABLE | PteFlags::USER));
}

#[test]
fn demand_paging_under_pressure_swaps_transparently() {
    // 2 MiB of simulated RAM, a 4 MiB working set and an 8 MiB swap
    // device: the write pass cannot fit in memory and must evict.
    let k = machine(0x200, 0x800);
    k.swap.kswapd.set_pressure_threshold(50);
    let slot = running_user_env(k, 0);

    let region_len = 4 * 1024 * 1024u32;
    let base = {
        let mut body = k.envs.get(slot).body();
        let vmas = body.vmas.as_mut().expect("regions");
        let idx = vmas
            .new_range(region_len, VmaPerm::READ | VmaPerm::WRITE, VmaType::Anon)
            .expect("region");
        vmas.get(idx).expect("entry").base
    };

    // Write every page.
    let mut page = base.as_u32();
    while page < base.as_u32() + region_len {
        user_write(k, slot, page, &[0xD0; 4]);
        user_write(k, slot, page + 37, &[0xD0]);
        page += PGSIZE as u32;
    }
    assert!(
        k.swap.store.used_slots() > 0,
        "a 4 MiB working set over 2 MiB of memory must have swapped"
    );

    // Read every page back at offset 37.
    let mut page = base.as_u32();
    let mut byte = [0u8; 1];
    while page < base.as_u32() + region_len {
        user_read(k, slot, page + 37, &mut byte);
        assert_eq!(byte[0], 0xD0, "lost a write at {page:#010x}");
        page += PGSIZE as u32;
    }
}

#[test]
fn rss_reflects_eviction() {
    let k = machine(0x200, 64);
    let slot = running_user_env(k, 0);
    {
        let mut body = k.envs.get(slot).body();
        body.vmas
            .as_mut()
            .expect("regions")
            .new_region(
                VirtAddr::new(0x0100_0000),
                8 * PGSIZE as u32,
                VmaPerm::READ | VmaPerm::WRITE,
                VmaType::Anon,
            )
            .expect("region");
    }
    for i in 0..8u32 {
        user_write_u32(k, slot, 0x0100_0000 + i * PGSIZE as u32, i);
    }
    let rss_before = k.frames.rss();

    let frame = {
        let body = k.envs.get(slot).body();
        body.pgdir
            .expect("dir")
            .lookup(&k.frames, VirtAddr::new(0x0100_0000))
            .expect("mapped")
            .0
    };
    k.swap
        .store
        .swap_out(&k.frames, &k.envs, None, frame, &mut || {})
        .expect("swap out");
    assert_eq!(k.frames.rss(), rss_before - 1, "eviction must shrink the resident set");
}
