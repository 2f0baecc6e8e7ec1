//! Round-robin scheduler
//!
//! CPUs cooperate without a big kernel lock: a global atomically-incremented
//! cursor picks the sweep origin, and each CPU claims an environment by
//! compare-and-set on its status word. The CAS is the whole mutual-exclusion
//! story; no environment can be Running on two CPUs at once.
//!
//! Time slices are debited in timestamp-counter cycles. The actual context
//! switch (address-space load and register pop) is the trap layer's job;
//! the scheduler only hands back a decision.

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::arch;
use crate::env::{EnvStatus, EnvTable, NENV};
use crate::mm::frame::FrameTable;
use crate::swap::store::SwapStore;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Cycle budget of one scheduling slice.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub const MAX_TIME_SLICE: u64 = 10_000_000;
/// Hosted builds pair a small budget with the simulated timestamp counter
/// so a slice spans a few ticks.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub const MAX_TIME_SLICE: u64 = 60_000;

/// State of one CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuStatus {
    Unused = 0,
    Started = 1,
    Halted = 2,
}

/// Per-CPU record: status, current environment, slice bookkeeping.
pub struct Cpu {
    status: AtomicU32,
    /// Slot of the running environment, -1 when idle.
    cur_env: AtomicI32,
    last_tsc: AtomicU64,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            status: AtomicU32::new(CpuStatus::Unused as u32),
            cur_env: AtomicI32::new(-1),
            last_tsc: AtomicU64::new(0),
        }
    }
}

/// Fixed table of per-CPU records.
pub struct CpuTable {
    cpus: [Cpu; NCPU],
}

impl Default for CpuTable {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuTable {
    pub const fn new() -> Self {
        Self {
            cpus: [const { Cpu::new() }; NCPU],
        }
    }

    pub fn mark_started(&self, cpu: usize) {
        self.cpus[cpu].status.store(CpuStatus::Started as u32, Ordering::SeqCst);
    }

    pub fn status(&self, cpu: usize) -> CpuStatus {
        match self.cpus[cpu].status.load(Ordering::SeqCst) {
            0 => CpuStatus::Unused,
            1 => CpuStatus::Started,
            _ => CpuStatus::Halted,
        }
    }

    /// Environment currently owned by `cpu`.
    pub fn current_env(&self, cpu: usize) -> Option<usize> {
        let v = self.cpus[cpu].cur_env.load(Ordering::SeqCst);
        (v >= 0).then_some(v as usize)
    }

    pub fn set_current(&self, cpu: usize, env: Option<usize>) {
        let v = env.map_or(-1, |e| e as i32);
        self.cpus[cpu].cur_env.store(v, Ordering::SeqCst);
    }

    fn record_tick(&self, cpu: usize, now: u64) -> u64 {
        now.wrapping_sub(self.cpus[cpu].last_tsc.swap(now, Ordering::SeqCst))
    }
}

/// What the trap layer should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedDecision {
    /// Resume this environment (load its directory, pop its frame).
    Run(usize),
    /// Nothing runnable; idle until the next interrupt.
    Halt,
}

/// Shared scheduler state: just the round-robin cursor.
pub struct Scheduler {
    cursor: AtomicU64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            cursor: AtomicU64::new(0),
        }
    }

    /// Reconsider what `cpu` should run.
    ///
    /// Debits the current environment's slice by the cycles elapsed since
    /// the last tick and re-runs it while budget remains. Otherwise the
    /// environment is released (CAS Running -> Runnable), one full sweep in
    /// cursor order claims the next runnable, and failing all that the CPU
    /// tries to win its old environment back before halting.
    pub fn yield_cpu(
        &self,
        ft: &FrameTable,
        envs: &EnvTable,
        swap: Option<&SwapStore>,
        cpus: &CpuTable,
        cpu: usize,
    ) -> SchedDecision {
        let elapsed = cpus.record_tick(cpu, arch::read_tsc());

        let prior = cpus.current_env(cpu);
        if let Some(cur) = prior {
            let env = envs.get(cur);
            if env.status.load() == EnvStatus::Dying {
                // A remote destroy marked it; finish the job here.
                cpus.set_current(cpu, None);
                envs.free(ft, swap, cur);
            } else {
                let mut body = env.body();
                if env.status.load() == EnvStatus::Running && body.remain_slice > elapsed {
                    body.remain_slice -= elapsed;
                    return SchedDecision::Run(cur);
                }
                body.remain_slice = MAX_TIME_SLICE;
                drop(body);
                env.status.transition(EnvStatus::Running, EnvStatus::Runnable);
            }
        }

        let start = self.cursor.fetch_add(1, Ordering::SeqCst) as usize;
        for i in 0..NENV {
            let slot = (start + i) % NENV;
            if envs
                .get(slot)
                .status
                .transition(EnvStatus::Runnable, EnvStatus::Running)
            {
                let mut body = envs.get(slot).body();
                body.cpunum = cpu as i32;
                body.runs += 1;
                drop(body);
                cpus.set_current(cpu, Some(slot));
                return SchedDecision::Run(slot);
            }
        }

        // Sweep came up empty; try to win the prior environment back.
        if let Some(cur) = prior {
            if envs
                .get(cur)
                .status
                .transition(EnvStatus::Runnable, EnvStatus::Running)
            {
                return SchedDecision::Run(cur);
            }
        }

        cpus.set_current(cpu, None);
        cpus.cpus[cpu].status.store(CpuStatus::Halted as u32, Ordering::SeqCst);
        SchedDecision::Halt
    }
}
