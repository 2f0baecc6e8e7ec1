//! Hardware seam for the memory core
//!
//! Everything the memory subsystem needs from the CPU goes through this
//! module: timestamp counter, TLB maintenance, address-space switch, and the
//! idle halt. On `x86` bare-metal builds these are the real instructions; on
//! hosted builds they are deterministic fallbacks so the core is testable
//! under the standard harness. Trap vectors, the APIC and the PIC live
//! outside this crate.

#![allow(dead_code)]

/// Local CPU identifier as delivered by the platform layer.
///
/// The bootstrap processor is 0. The hosted fallback hands every thread of
/// the test harness its own id so lock-owner diagnostics stay meaningful.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn cpu_id() -> usize {
    0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn cpu_id() -> usize {
    use core::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static ID: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    /// Read the timestamp counter.
    pub fn read_tsc() -> u64 {
        let lo: u32;
        let hi: u32;
        // SAFETY: rdtsc has no memory operands and no side effects beyond
        // writing eax/edx.
        unsafe {
            core::arch::asm!("rdtsc", out("eax") lo, out("edx") hi, options(nomem, nostack));
        }
        ((hi as u64) << 32) | lo as u64
    }

    /// Invalidate the TLB entry covering `va`.
    pub fn tlb_invalidate(va: u32) {
        // SAFETY: invlpg only drops a translation cache entry.
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack));
        }
    }

    /// Flush the entire TLB by reloading cr3.
    pub fn tlb_flush_all() {
        // SAFETY: re-writing the current cr3 value flushes non-global
        // translations and changes no mappings.
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }

    /// Switch to the page directory at physical address `pa`.
    ///
    /// # Safety
    ///
    /// `pa` must be the physical address of a valid page directory whose
    /// kernel half maps the currently executing code.
    pub unsafe fn lcr3(pa: u32) {
        // SAFETY: forwarded to the caller's contract.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) pa, options(nostack));
        }
    }

    /// Hint the core that it is spinning on a lock.
    pub fn pause() {
        core::hint::spin_loop();
    }

    /// Enable interrupts and halt until the next one arrives.
    pub fn idle_halt() {
        // SAFETY: sti;hlt is the canonical idle sequence; control returns
        // at the next interrupt.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nostack));
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    use core::sync::atomic::{AtomicU64, Ordering};

    /// Step of the simulated timestamp counter per read. Sized so that a
    /// scheduling slice spans a handful of timer ticks.
    pub const TSC_STEP: u64 = 20_000;

    static FAKE_TSC: AtomicU64 = AtomicU64::new(0);

    /// Monotonic counter standing in for rdtsc.
    pub fn read_tsc() -> u64 {
        FAKE_TSC.fetch_add(TSC_STEP, Ordering::Relaxed)
    }

    pub fn tlb_invalidate(_va: u32) {}

    pub fn tlb_flush_all() {}

    /// Hosted stand-in for the address-space switch.
    ///
    /// # Safety
    ///
    /// No-op; kept unsafe so call sites read the same on every target.
    pub unsafe fn lcr3(_pa: u32) {}

    pub fn pause() {
        core::hint::spin_loop();
    }

    pub fn idle_halt() {
        core::hint::spin_loop();
    }
}

pub use imp::*;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tsc_is_monotonic() {
        let a = read_tsc();
        let b = read_tsc();
        assert!(b > a, "simulated timestamp counter must advance");
    }
}
