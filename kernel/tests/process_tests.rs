//! Process lifecycle scenarios: copy-on-write fork, wait/destroy
//! coordination, and the memory syscall surface.

mod common;

use cinnabar_kernel::env::{EnvId, EnvStatus};
use cinnabar_kernel::mm::vma::{VmaPerm, VmaType};
use cinnabar_kernel::mm::{VirtAddr, PGSIZE};
use cinnabar_kernel::syscall::{self, Syscall};

use common::*;

fn dispatch(k: &cinnabar_kernel::Kernel, cpu: usize, call: Syscall, a1: u32, a2: u32, a3: u32) -> i32 {
    syscall::dispatch(k, cpu, call as u32, a1, a2, a3, 0, 0)
}

#[test]
fn cow_fork_keeps_writes_private() {
    let k = machine(0x400, 64);
    let parent = running_user_env(k, 0);
    let va = 0x0040_0000;

    {
        let mut body = k.envs.get(parent).body();
        body.vmas
            .as_mut()
            .expect("regions")
            .new_region(
                VirtAddr::new(va),
                4 * PGSIZE as u32,
                VmaPerm::READ | VmaPerm::WRITE,
                VmaType::Anon,
            )
            .expect("region");
    }
    user_write_u32(k, parent, va, 0xDEAD_BEEF);

    let child_id = dispatch(k, 0, Syscall::Fork, 0, 0, 0);
    assert!(child_id > 0, "fork must return the child id, got {child_id}");
    let child = EnvId(child_id).envx();
    assert_eq!(k.envs.status(child), EnvStatus::Runnable);
    assert_eq!(k.envs.get(child).body().tf.regs.eax, 0, "child returns zero");

    // Both spaces initially resolve the address to the same frame.
    let pframe = fault_in(k, parent, va, false);
    let cframe = fault_in(k, child, va, false);
    assert_eq!(pframe, cframe, "before any write the frame is shared");

    // Child writes its own value.
    user_write_u32(k, child, va, 0xCAFE_BABE);

    assert_eq!(user_read_u32(k, parent, va), 0xDEAD_BEEF, "parent value intact");
    assert_eq!(user_read_u32(k, child, va), 0xCAFE_BABE, "child sees its write");

    let pframe = fault_in(k, parent, va, false);
    let cframe = fault_in(k, child, va, false);
    assert_ne!(pframe, cframe, "after the write the frames must differ");
}

#[test]
fn wait_parks_until_target_dies() {
    let k = machine(0x200, 16);
    let waiter = running_user_env(k, 0);
    let target = running_user_env(k, 1);
    let target_id = k.envs.get(target).body().id;

    assert_eq!(dispatch(k, 0, Syscall::Wait, target_id.0 as u32, 0, 0), 0);
    assert_eq!(k.envs.status(waiter), EnvStatus::Waiting);

    // Target exits; the waiter wakes.
    assert_eq!(dispatch(k, 1, Syscall::EnvDestroy, 0, 0, 0), 0);
    assert_eq!(k.envs.status(target), EnvStatus::Free);
    assert_eq!(k.envs.status(waiter), EnvStatus::Runnable);
}

#[test]
fn wait_on_stale_id_resumes_immediately() {
    let k = machine(0x200, 16);
    let waiter = running_user_env(k, 0);
    let victim = running_user_env(k, 1);
    let victim_id = k.envs.get(victim).body().id;
    k.envs.destroy(&k.frames, Some(&k.swap.store), victim, Some(victim));

    assert_eq!(dispatch(k, 0, Syscall::Wait, victim_id.0 as u32, 0, 0), 0);
    assert_eq!(
        k.envs.status(waiter),
        EnvStatus::Running,
        "stale target must not park the caller"
    );
}

#[test]
fn vma_create_destroy_roundtrip() {
    let k = machine(0x200, 16);
    let slot = running_user_env(k, 0);

    let shape = |k: &cinnabar_kernel::Kernel| -> Vec<(u32, u32)> {
        let body = k.envs.get(slot).body();
        body.vmas
            .as_ref()
            .expect("regions")
            .iter()
            .map(|(_, v)| (v.base.as_u32(), v.len))
            .collect()
    };
    let before = shape(k);

    let size = 8 * PGSIZE as u32;
    let base = dispatch(k, 0, Syscall::VmaCreate, size, VmaPerm::WRITE.bits() as u32, 0);
    assert!(base > 0, "creation must return the base address");
    assert_ne!(shape(k), before);

    assert_eq!(dispatch(k, 0, Syscall::VmaDestroy, base as u32, size, 0), 0);
    assert_eq!(shape(k), before, "destroy must restore the region list");
}

#[test]
fn vma_create_populate_makes_pages_resident() {
    let k = machine(0x200, 64);
    let slot = running_user_env(k, 0);

    let size = 4 * PGSIZE as u32;
    let base = dispatch(
        k,
        0,
        Syscall::VmaCreate,
        size,
        VmaPerm::WRITE.bits() as u32,
        syscall::VMA_FLAG_POPULATE,
    );
    assert!(base > 0);

    let body = k.envs.get(slot).body();
    let dir = body.pgdir.expect("dir");
    for i in 0..4u32 {
        let va = VirtAddr::new(base as u32 + i * PGSIZE as u32);
        assert!(
            dir.lookup(&k.frames, va).is_some(),
            "populated page {i} must be resident"
        );
    }
}

#[test]
fn env_destroy_rejects_foreign_environments() {
    let k = machine(0x200, 16);
    let _me = running_user_env(k, 0);
    let stranger = running_user_env(k, 1);
    let stranger_id = k.envs.get(stranger).body().id;

    // Not the caller and not a child: permission denied.
    assert!(dispatch(k, 0, Syscall::EnvDestroy, stranger_id.0 as u32, 0, 0) < 0);
    assert_ne!(k.envs.status(stranger), EnvStatus::Free);
}

#[test]
fn getenvid_and_bad_numbers() {
    let k = machine(0x200, 16);
    let slot = running_user_env(k, 0);
    let id = k.envs.get(slot).body().id.0;
    assert_eq!(dispatch(k, 0, Syscall::GetEnvId, 0, 0, 0), id);
    assert!(
        syscall::dispatch(k, 0, 0xFFFF, 0, 0, 0, 0, 0) < 0,
        "unknown numbers are errors"
    );
}

#[test]
fn forked_child_inherits_the_region_list() {
    let k = machine(0x400, 16);
    let parent = running_user_env(k, 0);
    {
        let mut body = k.envs.get(parent).body();
        let vmas = body.vmas.as_mut().expect("regions");
        vmas.new_region(
            VirtAddr::new(0x0100_0000),
            2 * PGSIZE as u32,
            VmaPerm::READ,
            VmaType::Anon,
        )
        .expect("ro region");
        vmas.new_region(
            VirtAddr::new(0x0200_0000),
            PGSIZE as u32,
            VmaPerm::READ | VmaPerm::WRITE,
            VmaType::Anon,
        )
        .expect("rw region");
    }

    let child = EnvId(dispatch(k, 0, Syscall::Fork, 0, 0, 0)).envx();
    let body = k.envs.get(child).body();
    let vmas = body.vmas.as_ref().expect("regions");
    let ro = vmas.lookup(VirtAddr::new(0x0100_0000), 0).expect("ro copied").1;
    let rw = vmas.lookup(VirtAddr::new(0x0200_0000), 0).expect("rw copied").1;
    assert!(!ro.cow, "read-only regions need no copy-on-write");
    assert!(rw.cow, "writable regions become copy-on-write");
}
