//! Out-of-memory killer
//!
//! Last resort when the swap device cannot absorb any more pressure: kill
//! the environment whose death frees the most physical memory, i.e. the one
//! with the most non-shared resident pages.

use super::{EnvStatus, EnvTable};
use crate::mm::frame::FrameTable;
use crate::mm::{VirtAddr, NPTENTRIES, UTOP};
use crate::swap::store::SwapStore;

/// Non-shared resident pages of one environment.
pub fn env_rss(ft: &FrameTable, envs: &EnvTable, slot: usize) -> usize {
    let body = envs.get(slot).body();
    let Some(pgdir) = body.pgdir else {
        return 0;
    };
    let mut rss = 0;
    for pdeno in 0..VirtAddr::new(UTOP).pdx() {
        let pde = pgdir.entry(ft, pdeno);
        if !pde.is_present() || pde.is_huge() {
            continue;
        }
        for pteno in 0..NPTENTRIES {
            let va = VirtAddr::from_indices(pdeno, pteno);
            if let Some((frame, _)) = pgdir.lookup(ft, va) {
                // Shared pages keep living in the other space; only count
                // pages whose only reference is ours.
                if ft.get_ref(frame) == 1 {
                    rss += 1;
                }
            }
        }
    }
    rss
}

/// Environment whose destruction reclaims the most memory.
pub fn find_max_rss_env(ft: &FrameTable, envs: &EnvTable) -> Option<usize> {
    let mut best = None;
    let mut best_rss = 0;
    for (slot, env) in envs.slots() {
        match env.status.load() {
            EnvStatus::Free | EnvStatus::Dying => continue,
            _ => {}
        }
        if env.body().ty.is_kernel() {
            continue;
        }
        let rss = env_rss(ft, envs, slot);
        if rss >= best_rss && rss > 0 {
            best_rss = rss;
            best = Some(slot);
        }
    }
    best
}

/// Kill the fattest environment. Returns the destroyed slot, if any.
pub fn oom_kill(
    ft: &FrameTable,
    envs: &EnvTable,
    swap: Option<&SwapStore>,
    cur_slot: Option<usize>,
) -> Option<usize> {
    let victim = find_max_rss_env(ft, envs)?;
    log::warn!("out of memory: killing env slot {victim}");
    envs.destroy(ft, swap, victim, cur_slot);
    Some(victim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvId, EnvType};
    use crate::mm::frame::AllocFlags;
    use crate::mm::page::{PageDir, PteFlags};
    use crate::mm::{PhysAddr, PGSIZE, UTEMP};

    fn fixture() -> (FrameTable, PageDir, EnvTable) {
        let bytes = vec![0u8; 0x400 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let ft = unsafe { FrameTable::new(bytes.as_mut_ptr(), 0x400, PhysAddr::new(0)) };
        let kern = PageDir::new_kernel(&ft).expect("kernel dir");
        (ft, kern, EnvTable::new())
    }

    fn populate(ft: &FrameTable, envs: &EnvTable, slot: usize, pages: u32) {
        let dir = envs.get(slot).body().pgdir.expect("dir");
        for i in 0..pages {
            let f = ft.alloc(AllocFlags::ZERO).expect("frame");
            dir.insert(
                ft,
                f,
                VirtAddr::new(UTEMP + i * PGSIZE as u32),
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .expect("insert");
        }
    }

    #[test]
    fn killer_picks_the_fattest_environment() {
        let (ft, kern, envs) = fixture();
        let small = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("small");
        let big = envs.alloc(&ft, &kern, EnvId::NONE, EnvType::User).expect("big");
        populate(&ft, &envs, small, 2);
        populate(&ft, &envs, big, 8);

        assert_eq!(env_rss(&ft, &envs, small), 2);
        assert_eq!(env_rss(&ft, &envs, big), 8);
        assert_eq!(find_max_rss_env(&ft, &envs), Some(big));

        let killed = oom_kill(&ft, &envs, None, None).expect("victim found");
        assert_eq!(killed, big);
        assert_eq!(envs.status(big), crate::env::EnvStatus::Free);
    }

    #[test]
    fn kernel_threads_are_never_victims() {
        let (ft, kern, envs) = fixture();
        let kt = crate::env::kthread::create(&ft, &envs, &kern, 0x1000).expect("kthread");
        populate(&ft, &envs, kt, 4);
        assert_eq!(find_max_rss_env(&ft, &envs), None);
    }
}
