//! Environments
//!
//! An environment is the unit of isolation: a page directory, a region
//! list, a saved register frame and a scheduling status. User environments,
//! kernel environments and kernel threads all live in one fixed table of
//! 1024 slots whose ids carry a per-slot generation stamp so stale handles
//! are detected.
//!
//! The status word is the only field that transitions under contention; it
//! moves exclusively by compare-and-set, and debug builds refuse transitions
//! outside the legal set. Everything else sits behind a per-slot mutex.

pub mod elf;
pub mod kthread;
pub mod oom;

use core::sync::atomic::{AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::{Mutex, MutexGuard};

use crate::error::{KernelError, Result};
use crate::mm::frame::{AllocFlags, FrameTable};
use crate::mm::page::{PageDir, PteFlags, RemovedPte};
use crate::mm::vma::VmaList;
use crate::mm::{VirtAddr, KTHREAD_STACK_TOP, NPTENTRIES, PGSIZE, USTACKTOP, UTOP};
use crate::swap::store::SwapStore;
use crate::sync;

/// Number of environment slots.
pub const NENV: usize = 1024;
/// log2(NENV); the id's index field width.
pub const LOG2NENV: u32 = 10;
/// First bit of the generation stamp.
pub const ENVGENSHIFT: u32 = 12;

/// Kernel text segment selector.
pub const GD_KT: u16 = 0x08;
/// Kernel data segment selector.
pub const GD_KD: u16 = 0x10;
/// User text segment selector (RPL 3 applied at use).
pub const GD_UT: u16 = 0x18;
/// User data segment selector (RPL 3 applied at use).
pub const GD_UD: u16 = 0x20;
/// eflags interrupt-enable bit.
pub const FL_IF: u32 = 0x200;

/// Generation-tagged environment id.
///
/// Bit 31 is zero for valid ids, bits 0..10 index the table, bits 12..31
/// hold the slot's generation. Zero means "the current environment" at
/// syscall boundaries; negative values are error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvId(pub i32);

impl EnvId {
    pub const NONE: EnvId = EnvId(0);

    pub const fn envx(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_current(self) -> bool {
        self.0 == 0
    }

    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

/// Kind of environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvType {
    User,
    KernelEnv,
    KernelThread,
}

impl EnvType {
    pub fn is_kernel(self) -> bool {
        matches!(self, EnvType::KernelEnv | EnvType::KernelThread)
    }
}

/// Scheduling status of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EnvStatus {
    Free = 0,
    Dying = 1,
    Runnable = 2,
    Running = 3,
    Waiting = 4,
    WaitingSwap = 5,
    NotRunnable = 6,
}

impl EnvStatus {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => EnvStatus::Free,
            1 => EnvStatus::Dying,
            2 => EnvStatus::Runnable,
            3 => EnvStatus::Running,
            4 => EnvStatus::Waiting,
            5 => EnvStatus::WaitingSwap,
            6 => EnvStatus::NotRunnable,
            _ => unreachable!("corrupt status word"),
        }
    }
}

/// Status word mutated only by compare-and-set with full barriers.
pub struct StatusCell(AtomicU32);

impl StatusCell {
    const fn new() -> Self {
        Self(AtomicU32::new(EnvStatus::Free as u32))
    }

    pub fn load(&self) -> EnvStatus {
        EnvStatus::from_u32(self.0.load(Ordering::SeqCst))
    }

    /// Attempt `from -> to`; true on success. Debug builds refuse
    /// transitions outside the legal set.
    pub fn transition(&self, from: EnvStatus, to: EnvStatus) -> bool {
        debug_assert!(
            Self::legal(from, to),
            "illegal status transition {from:?} -> {to:?}"
        );
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Unconditional drop to `Free`; only the slot-release path uses it.
    fn set_free(&self) {
        self.0.store(EnvStatus::Free as u32, Ordering::SeqCst);
    }

    fn legal(from: EnvStatus, to: EnvStatus) -> bool {
        use EnvStatus::*;
        matches!(
            (from, to),
            (Free, NotRunnable)
                | (NotRunnable, Runnable)
                | (Runnable, Running)
                | (Running, Runnable)
                | (Running, Dying)
                | (Runnable, Dying)
                | (Running, Waiting)
                | (Runnable, Waiting)
                | (Running, WaitingSwap)
                | (Runnable, WaitingSwap)
                | (Waiting, Runnable)
                | (WaitingSwap, Runnable)
        )
    }
}

/// Callee-visible register block pushed by the trap entry.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Saved register frame of a suspended environment.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct TrapFrame {
    pub regs: PushRegs,
    pub es: u16,
    pub padding1: u16,
    pub ds: u16,
    pub padding2: u16,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u16,
    pub padding3: u16,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u16,
    pub padding4: u16,
}

/// Mutable body of an environment, guarded by the slot mutex.
pub struct EnvBody {
    pub id: EnvId,
    pub parent: EnvId,
    pub ty: EnvType,
    pub tf: TrapFrame,
    /// CPU currently running this environment, -1 if none.
    pub cpunum: i32,
    pub runs: u32,
    /// Cycles left in the current time slice.
    pub remain_slice: u64,
    pub waiting_for: EnvId,
    pub pgdir: Option<PageDir>,
    pub vmas: Option<Box<VmaList>>,
}

impl EnvBody {
    fn empty() -> Self {
        Self {
            id: EnvId::NONE,
            parent: EnvId::NONE,
            ty: EnvType::User,
            tf: TrapFrame::default(),
            cpunum: -1,
            runs: 0,
            remain_slice: 0,
            waiting_for: EnvId::NONE,
            pgdir: None,
            vmas: None,
        }
    }
}

/// One table slot.
pub struct Env {
    pub status: StatusCell,
    body: Mutex<EnvBody>,
}

impl Env {
    fn new() -> Self {
        Self {
            status: StatusCell::new(),
            body: Mutex::new(EnvBody::empty()),
        }
    }

    pub fn body(&self) -> MutexGuard<'_, EnvBody> {
        self.body.lock()
    }
}

/// What `destroy` did with the victim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The environment was freed on the spot.
    Freed,
    /// The victim runs on another CPU; it was marked `Dying` and will free
    /// itself on its next trap into the kernel.
    MarkedDying,
}

/// The environment table.
pub struct EnvTable {
    envs: Box<[Env]>,
    free: Mutex<Vec<u16>>,
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvTable {
    pub fn new() -> Self {
        let mut envs = Vec::with_capacity(NENV);
        envs.resize_with(NENV, Env::new);
        // Popping from the back must yield slot 0 first.
        let free = (0..NENV as u16).rev().collect();
        Self {
            envs: envs.into_boxed_slice(),
            free: Mutex::new(free),
        }
    }

    pub fn get(&self, slot: usize) -> &Env {
        &self.envs[slot]
    }

    pub fn status(&self, slot: usize) -> EnvStatus {
        self.envs[slot].status.load()
    }

    /// Iterate over all slots.
    pub fn slots(&self) -> impl Iterator<Item = (usize, &Env)> {
        self.envs.iter().enumerate().map(|(i, e)| (i, e))
    }

    /// Resolve an id to a live slot. Id zero resolves to `cur_slot`. With
    /// `checkperm`, the target must be the caller or an immediate child.
    pub fn resolve(&self, id: EnvId, cur_slot: Option<usize>, checkperm: bool) -> Result<usize> {
        if id.is_current() {
            return cur_slot.ok_or(KernelError::BadEnvId { id: 0 });
        }
        let slot = id.envx();
        let env = &self.envs[slot];
        if env.status.load() == EnvStatus::Free || env.body().id != id {
            return Err(KernelError::BadEnvId { id: id.0 });
        }
        if checkperm {
            let cur = cur_slot.ok_or(KernelError::BadEnvId { id: id.0 })?;
            if cur != slot {
                let cur_id = self.envs[cur].body().id;
                if self.envs[slot].body().parent != cur_id {
                    return Err(KernelError::BadEnvId { id: id.0 });
                }
            }
        }
        Ok(slot)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Allocate and initialize a fresh environment. The directory is cloned
    /// from the kernel template; the region list starts empty; registers
    /// are set up for the requested type. Rolls everything back on failure.
    pub fn alloc(
        &self,
        ft: &FrameTable,
        template: &PageDir,
        parent: EnvId,
        ty: EnvType,
    ) -> Result<usize> {
        let _section = sync::env_lock().lock();

        let slot = self.free.lock().pop().ok_or(KernelError::NoFreeEnv)? as usize;
        let env = &self.envs[slot];

        let pgdir = match PageDir::clone_from(ft, template) {
            Ok(d) => d,
            Err(e) => {
                self.free.lock().push(slot as u16);
                return Err(e);
            }
        };

        let mut body = env.body();
        // Compose a generation-tagged id from the slot's previous id.
        let mut generation = (body.id.0 + (1 << ENVGENSHIFT)) & !(NENV as i32 - 1);
        if generation <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        body.id = EnvId(generation | slot as i32);
        body.parent = parent;
        body.ty = ty;
        body.tf = TrapFrame::default();
        body.cpunum = -1;
        body.runs = 0;
        body.remain_slice = crate::sched::MAX_TIME_SLICE;
        body.waiting_for = EnvId::NONE;
        body.pgdir = Some(pgdir);
        body.vmas = Some(Box::new(VmaList::new()));

        match ty {
            EnvType::User => {
                body.tf.ds = GD_UD | 3;
                body.tf.es = GD_UD | 3;
                body.tf.ss = GD_UD | 3;
                body.tf.cs = GD_UT | 3;
                body.tf.eflags |= FL_IF;
                body.tf.esp = USTACKTOP;
            }
            EnvType::KernelEnv | EnvType::KernelThread => {
                body.tf.ds = GD_KD;
                body.tf.es = GD_KD;
                body.tf.ss = GD_KD;
                body.tf.cs = GD_KT;
                body.tf.esp = KTHREAD_STACK_TOP;
                // One page of stack so the first dispatch has footing.
                let stack = match ft.alloc(AllocFlags::ZERO) {
                    Some(f) => f,
                    None => {
                        Self::release_address_space(ft, None, &mut body);
                        drop(body);
                        self.free.lock().push(slot as u16);
                        return Err(KernelError::OutOfMemory);
                    }
                };
                let stack_va = VirtAddr::new(KTHREAD_STACK_TOP - PGSIZE as u32);
                if let Err(e) = pgdir.insert(ft, stack, stack_va, PteFlags::WRITABLE) {
                    let _ = ft.free(stack);
                    Self::release_address_space(ft, None, &mut body);
                    drop(body);
                    self.free.lock().push(slot as u16);
                    return Err(e);
                }
            }
        }
        drop(body);

        if !env.status.transition(EnvStatus::Free, EnvStatus::NotRunnable) {
            panic!("allocated slot {slot} was not free");
        }
        log::info!("new env {:#010x} in slot {slot} ({ty:?})", self.envs[slot].body().id.0);
        Ok(slot)
    }

    /// Release every frame the user half of an address space holds: region
    /// list first (backing pointers die with it), then leaves, then tables,
    /// then the directory itself.
    fn release_address_space(ft: &FrameTable, swap: Option<&SwapStore>, body: &mut EnvBody) {
        body.vmas = None;

        let Some(pgdir) = body.pgdir.take() else {
            return;
        };
        let utop_pdx = VirtAddr::new(UTOP).pdx();
        for pdeno in 0..utop_pdx {
            let pde = pgdir.entry(ft, pdeno);
            if !pde.is_present() {
                continue;
            }
            if pde.is_huge() {
                let huge = pde.frame().expect("present entry has a frame");
                ft.decref(huge);
                continue;
            }
            let table = pde.frame().expect("present entry has a frame");
            for pteno in 0..NPTENTRIES {
                let va = VirtAddr::from_indices(pdeno, pteno);
                match pgdir.remove(ft, va) {
                    Some(RemovedPte::SwapSlot(slot)) => {
                        if let Some(store) = swap {
                            store.slot_decref(slot);
                        }
                    }
                    Some(RemovedPte::Frame(_)) | None => {}
                }
            }
            ft.decref(table);
        }
        ft.decref(pgdir.frame());
    }

    /// Free an environment: tear down its address space and return the slot
    /// to the free list. The generation-carrying id survives in the slot.
    pub fn free(&self, ft: &FrameTable, swap: Option<&SwapStore>, slot: usize) {
        let _section = sync::env_lock().lock();
        let env = &self.envs[slot];
        let mut body = env.body();
        log::info!("free env {:#010x}", body.id.0);

        Self::release_address_space(ft, swap, &mut body);
        let id = body.id;
        *body = EnvBody::empty();
        body.id = id;
        drop(body);

        env.status.set_free();
        self.free.lock().push(slot as u16);
    }

    /// Destroy an environment. Environments waiting on the victim wake up;
    /// a victim running on another CPU is marked `Dying` and finishes
    /// freeing itself on its next trap.
    pub fn destroy(
        &self,
        ft: &FrameTable,
        swap: Option<&SwapStore>,
        slot: usize,
        cur_slot: Option<usize>,
    ) -> DestroyOutcome {
        let victim_id = self.envs[slot].body().id;

        for (i, env) in self.slots() {
            if i == slot || env.status.load() != EnvStatus::Waiting {
                continue;
            }
            let mut body = env.body();
            if body.waiting_for == victim_id {
                body.waiting_for = EnvId::NONE;
                drop(body);
                env.status.transition(EnvStatus::Waiting, EnvStatus::Runnable);
            }
        }

        if cur_slot != Some(slot)
            && self.envs[slot]
                .status
                .transition(EnvStatus::Running, EnvStatus::Dying)
        {
            return DestroyOutcome::MarkedDying;
        }

        self.free(ft, swap, slot);
        DestroyOutcome::Freed
    }
}
