//! Trap glue
//!
//! The assembly vectors, IDT and frame push/pop live outside this crate.
//! What arrives here is an already-normalized event; these shims route it
//! to the fault engine, the syscall table or the scheduler and tell the
//! trap layer how to leave the kernel.

use crate::env::FL_IF;
use crate::fault::{FaultCtx, FaultOutcome};
use crate::kernel::Kernel;
use crate::mm::VirtAddr;
use crate::sched::SchedDecision;
use crate::syscall;

/// A normalized trap event.
#[derive(Debug, Clone, Copy)]
pub enum Trap {
    /// Page fault: faulting address (cr2) and the hardware error code.
    PageFault { addr: u32, err: u32 },
    /// System call: number plus the five-register argument block.
    Syscall {
        no: u32,
        a1: u32,
        a2: u32,
        a3: u32,
        a4: u32,
        a5: u32,
    },
    /// Periodic timer interrupt.
    Timer,
}

/// How to leave the kernel after the trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReturn {
    /// Pop the saved frame of the interrupted environment.
    Resume,
    /// Context-switch per the scheduler's decision.
    Schedule(SchedDecision),
}

/// Page-fault error code bits (Intel SDM): present, write, user.
const PF_ERR_WRITE: u32 = 1 << 1;
const PF_ERR_USER: u32 = 1 << 2;

/// Handle one trap on `cpu`.
pub fn handle(k: &Kernel, cpu: usize, trap: Trap) -> TrapReturn {
    match trap {
        Trap::PageFault { addr, err } => {
            let ctx = FaultCtx {
                va: VirtAddr::new(addr),
                kernel_cs: err & PF_ERR_USER == 0,
                write: err & PF_ERR_WRITE != 0,
            };
            match k.page_fault(cpu, &ctx) {
                FaultOutcome::Resolved => TrapReturn::Resume,
                FaultOutcome::Yield | FaultOutcome::Terminated => {
                    TrapReturn::Schedule(k.yield_cpu(cpu))
                }
            }
        }
        Trap::Syscall {
            no,
            a1,
            a2,
            a3,
            a4,
            a5,
        } => {
            let ret = syscall::dispatch(k, cpu, no, a1, a2, a3, a4, a5);
            // The result travels back in register 0 of the saved frame.
            if let Some(cur) = k.cpus.current_env(cpu) {
                k.envs.get(cur).body().tf.regs.eax = ret as u32;
            }
            TrapReturn::Resume
        }
        Trap::Timer => TrapReturn::Schedule(k.yield_cpu(cpu)),
    }
}

/// Sanity check on a frame about to be popped into user mode.
pub fn assert_user_frame(tf: &crate::env::TrapFrame) {
    debug_assert_ne!(tf.eflags & FL_IF, 0, "user frame must re-enable interrupts");
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    use crate::env::{EnvId, EnvStatus, EnvType};
    use crate::mm::vma::{VmaPerm, VmaType};
    use crate::mm::{PhysAddr, PGSIZE, UTEMP};
    use crate::swap::store::MemDisk;

    fn fixture() -> &'static Kernel {
        let bytes = vec![0u8; 0x400 * PGSIZE].leak();
        // SAFETY: leaked buffer lives forever.
        let k = unsafe {
            Kernel::new(
                bytes.as_mut_ptr(),
                0x400,
                PhysAddr::new(0),
                Box::new(MemDisk::new(64 * 8)),
            )
        }
        .expect("assembly");
        Box::leak(Box::new(k))
    }

    fn running_user_env(k: &Kernel, cpu: usize) -> usize {
        let slot = k
            .envs
            .alloc(&k.frames, &k.kern_dir, EnvId::NONE, EnvType::User)
            .expect("env");
        let env = k.envs.get(slot);
        assert!(env.status.transition(EnvStatus::NotRunnable, EnvStatus::Runnable));
        assert!(env.status.transition(EnvStatus::Runnable, EnvStatus::Running));
        k.cpus.set_current(cpu, Some(slot));
        slot
    }

    #[test]
    fn demand_fault_resumes_after_repair() {
        let k = fixture();
        let slot = running_user_env(k, 0);
        k.envs
            .get(slot)
            .body()
            .vmas
            .as_mut()
            .expect("regions")
            .new_region(
                VirtAddr::new(UTEMP),
                PGSIZE as u32,
                VmaPerm::READ | VmaPerm::WRITE,
                VmaType::Anon,
            )
            .expect("region");

        let ret = handle(
            k,
            0,
            Trap::PageFault {
                addr: UTEMP + 0x40,
                err: PF_ERR_USER | PF_ERR_WRITE,
            },
        );
        assert_eq!(ret, TrapReturn::Resume);
        let dir = k.envs.get(slot).body().pgdir.expect("dir");
        assert!(dir.lookup(&k.frames, VirtAddr::new(UTEMP)).is_some());
    }

    #[test]
    fn wild_fault_schedules_away() {
        let k = fixture();
        let slot = running_user_env(k, 0);
        let ret = handle(
            k,
            0,
            Trap::PageFault {
                addr: 0x0900_0000,
                err: PF_ERR_USER,
            },
        );
        assert!(matches!(ret, TrapReturn::Schedule(_)));
        assert_eq!(k.envs.status(slot), EnvStatus::Free, "wild fault kills the env");
    }

    #[test]
    fn syscall_result_lands_in_register_zero() {
        let k = fixture();
        let slot = running_user_env(k, 0);
        let id = k.envs.get(slot).body().id.0;

        let ret = handle(
            k,
            0,
            Trap::Syscall {
                no: syscall::Syscall::GetEnvId as u32,
                a1: 0,
                a2: 0,
                a3: 0,
                a4: 0,
                a5: 0,
            },
        );
        assert_eq!(ret, TrapReturn::Resume);
        assert_eq!(k.envs.get(slot).body().tf.regs.eax, id as u32);
    }

    #[test]
    fn timer_tick_reschedules() {
        let k = fixture();
        let _slot = running_user_env(k, 0);
        assert!(matches!(handle(k, 0, Trap::Timer), TrapReturn::Schedule(_)));
    }
}
