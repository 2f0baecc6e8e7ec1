//! Kernel error types
//!
//! One crate-wide error enum instead of string literals. Recoverable errors
//! travel outward as `Result`; structural violations (double free, disk
//! fault on the swap store) panic at the detection site.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame, page table, or environment-slot allocation failed.
    OutOfMemory,
    /// Environment id refers to a freed slot or a foreign environment.
    BadEnvId { id: i32 },
    /// No free environment slot left.
    NoFreeEnv,
    /// Virtual range does not correspond to an active mapping.
    InvalidMapping { va: u32 },
    /// New region would intersect an existing one.
    Overlap { va: u32, len: u32 },
    /// No gap large enough in the address space (or region table full).
    NoSpace,
    /// Freeing a frame that still has references.
    NonZeroRef { frame: u32 },
    /// Freeing a frame that is already on the free list.
    DoubleFree { frame: u32 },
    /// Swap slot or frame has no references where one is required.
    NoRef,
    /// Every swap slot on the backing device is taken.
    NoFreeSwap,
    /// Frame is pinned (kernel, BIOS, I/O hole) or not marked swappable.
    Unswappable { frame: u32 },
    /// Non-blocking queue insertion found the ring full.
    QueueFull,
    /// Swap device read/write failed.
    DiskFault { sector: u32 },
    /// Binary image is not a loadable ELF.
    BadElf,
}

impl KernelError {
    /// Negative integer form used at the syscall boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            KernelError::OutOfMemory => -1,
            KernelError::BadEnvId { .. } => -2,
            KernelError::NoFreeEnv => -3,
            KernelError::InvalidMapping { .. } => -4,
            KernelError::Overlap { .. } => -5,
            KernelError::NoSpace => -6,
            KernelError::NonZeroRef { .. } => -7,
            KernelError::DoubleFree { .. } => -8,
            KernelError::NoRef => -9,
            KernelError::NoFreeSwap => -10,
            KernelError::Unswappable { .. } => -11,
            KernelError::QueueFull => -12,
            KernelError::DiskFault { .. } => -13,
            KernelError::BadElf => -14,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => write!(f, "out of memory"),
            KernelError::BadEnvId { id } => write!(f, "bad environment id {id:#x}"),
            KernelError::NoFreeEnv => write!(f, "no free environment slot"),
            KernelError::InvalidMapping { va } => write!(f, "no mapping at {va:#010x}"),
            KernelError::Overlap { va, len } => {
                write!(f, "region {va:#010x}+{len:#x} overlaps an existing one")
            }
            KernelError::NoSpace => write!(f, "no space for new region"),
            KernelError::NonZeroRef { frame } => {
                write!(f, "frame {frame} freed with live references")
            }
            KernelError::DoubleFree { frame } => write!(f, "frame {frame} freed twice"),
            KernelError::NoRef => write!(f, "no reference where one is required"),
            KernelError::NoFreeSwap => write!(f, "swap device full"),
            KernelError::Unswappable { frame } => write!(f, "frame {frame} is not swappable"),
            KernelError::QueueFull => write!(f, "swap queue full"),
            KernelError::DiskFault { sector } => write!(f, "disk fault at sector {sector}"),
            KernelError::BadElf => write!(f, "invalid ELF image"),
        }
    }
}

/// Kernel-wide result alias.
pub type Result<T> = core::result::Result<T, KernelError>;
