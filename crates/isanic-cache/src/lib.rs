//! Cache-coherency tier selector (component B).
//!
//! Picks one of four coherency strategies from the platform descriptor plus
//! a small set of hardware self-test signals, using a first-match-wins
//! decision table, and exposes the resulting flush/invalidate vtable.
//!
//! The address-aliasing bus-snoop self-test is a near-tautology under
//! classic DOS segmentation, so this implementation keeps the test but
//! pins its confidence below the 50% degrade threshold unconditionally:
//! a `NoOp` selection always gets demoted to `ClflushLike` unless a
//! stronger signal is added later. The heuristic is preserved, but it can
//! never alone grant the cheapest tier.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use isanic_platform::{CpuFamily, PlatformDescriptor};

/// Coherency strategy for DMA transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    /// Bus-snooping keeps DMA coherent; flush/invalidate are no-ops.
    NoOp,
    /// Cache-line-granularity flush/invalidate over the buffer range.
    ClflushLike,
    /// Coarse whole-cache write-back-and-invalidate; used as a barrier.
    WriteBackInvalidate,
    /// Neither cache-line nor whole-cache instructions are usable.
    SoftwareBarrier,
}

impl CacheTier {
    /// `true` for [`CacheTier::SoftwareBarrier`]: the policy engine must
    /// raise its copybreak threshold to avoid DMA into cacheable memory.
    #[must_use]
    pub const fn forces_copybreak_raise(self) -> bool {
        matches!(self, Self::SoftwareBarrier)
    }

    /// One step more conservative, stopping at [`CacheTier::WriteBackInvalidate`].
    #[must_use]
    pub const fn degrade_one_step(self) -> Self {
        match self {
            Self::NoOp => Self::ClflushLike,
            Self::ClflushLike => Self::WriteBackInvalidate,
            Self::WriteBackInvalidate | Self::SoftwareBarrier => self,
        }
    }
}

/// Raw hardware self-test signals the selector's decision table consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheProbeSignals {
    /// Result of the address-aliasing bus-snoop self-test. Low confidence
    /// by construction — see the module-level note.
    pub bus_snoop_self_test_passed: bool,
    /// A cache-line flush instruction (e.g. `CLFLUSH`) is available.
    pub clflush_available: bool,
    /// A whole-cache write-back-and-invalidate instruction is available.
    pub wbinvd_available: bool,
}

/// Selected tier plus the selector's confidence (0-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// The tier to install.
    pub tier: CacheTier,
    /// Confidence percentage backing the selection.
    pub confidence: u8,
}

/// Error raised when the selected tier is incompatible with a DMA-requiring
/// device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    /// The only usable tier is [`CacheTier::SoftwareBarrier`] but the
    /// attached device requires DMA.
    Incompatible,
}

impl core::fmt::Display for CacheError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Incompatible => f.write_str("cache tier incompatible with DMA-requiring device"),
        }
    }
}

fn raw_decision(platform: &PlatformDescriptor, signals: CacheProbeSignals) -> Selection {
    if platform.cpu_family == CpuFamily::Superscalar && signals.bus_snoop_self_test_passed {
        // Low-confidence by construction; always triggers the degrade path
        // below rather than reaching the caller as a bare `NoOp`.
        return Selection { tier: CacheTier::NoOp, confidence: 40 };
    }
    if platform.cpu_family == CpuFamily::LateThirtyTwoBit && signals.clflush_available {
        return Selection { tier: CacheTier::ClflushLike, confidence: 90 };
    }
    let is_32bit = matches!(platform.cpu_family, CpuFamily::EarlyThirtyTwoBit | CpuFamily::LateThirtyTwoBit);
    if is_32bit && signals.wbinvd_available {
        return Selection { tier: CacheTier::WriteBackInvalidate, confidence: 90 };
    }
    Selection { tier: CacheTier::SoftwareBarrier, confidence: 100 }
}

/// Selects a cache tier for `platform` given `signals`.
///
/// Applies the confidence-degrade rule after the raw decision table: a
/// selection below 50% confidence is degraded one step toward
/// [`CacheTier::WriteBackInvalidate`].
#[must_use]
pub fn select(platform: &PlatformDescriptor, signals: CacheProbeSignals) -> Selection {
    let raw = raw_decision(platform, signals);
    if raw.confidence < 50 {
        Selection { tier: raw.tier.degrade_one_step(), confidence: raw.confidence }
    } else {
        raw
    }
}

/// Selects a tier and validates it against a device's DMA requirement.
///
/// # Errors
///
/// Returns [`CacheError::Incompatible`] if the resulting tier is
/// [`CacheTier::SoftwareBarrier`] and `device_requires_dma` is `true`.
pub fn select_for_device(
    platform: &PlatformDescriptor,
    signals: CacheProbeSignals,
    device_requires_dma: bool,
) -> Result<Selection, CacheError> {
    let selection = select(platform, signals);
    if selection.tier == CacheTier::SoftwareBarrier && device_requires_dma {
        return Err(CacheError::Incompatible);
    }
    Ok(selection)
}

/// Flush/invalidate operations for a chosen tier.
///
/// Implementations operate on raw buffer ranges because buffers originate
/// from the DMA-aware buffer plane as physical-address-backed pointers, not
/// as owned Rust slices with a single consistent lifetime across the
/// foreground/interrupt boundary.
pub trait CacheOps {
    /// Flushes CPU-dirty data to memory before a device reads `len` bytes
    /// starting at `addr`.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must be a valid, currently-owned buffer region.
    unsafe fn flush_for_device(&self, addr: *const u8, len: usize);

    /// Invalidates CPU-cached copies of `len` bytes at `addr` before the
    /// foreground reads data a device just wrote via DMA.
    ///
    /// # Safety
    ///
    /// `addr..addr+len` must be a valid, currently-owned buffer region.
    unsafe fn invalidate_for_cpu(&self, addr: *mut u8, len: usize);

    /// The tier this vtable implements.
    fn tier(&self) -> CacheTier;
}

/// [`CacheOps`] for [`CacheTier::NoOp`]: both operations are empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpCache;

impl CacheOps for NoOpCache {
    unsafe fn flush_for_device(&self, _addr: *const u8, _len: usize) {}
    unsafe fn invalidate_for_cpu(&self, _addr: *mut u8, _len: usize) {}
    fn tier(&self) -> CacheTier {
        CacheTier::NoOp
    }
}

/// [`CacheOps`] for [`CacheTier::SoftwareBarrier`]: both operations are
/// empty; coherency is instead achieved by the policy engine raising the
/// copybreak threshold so DMA never targets cacheable memory.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareBarrierCache;

impl CacheOps for SoftwareBarrierCache {
    unsafe fn flush_for_device(&self, _addr: *const u8, _len: usize) {}
    unsafe fn invalidate_for_cpu(&self, _addr: *mut u8, _len: usize) {}
    fn tier(&self) -> CacheTier {
        CacheTier::SoftwareBarrier
    }
}

/// [`CacheOps`] for [`CacheTier::ClflushLike`]: cache-line-granularity
/// flush/invalidate over the buffer range.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClflushLikeCache;

/// Typical cache line size assumed when no CPUID leaf is consulted.
const CACHE_LINE_SIZE: usize = 64;

impl CacheOps for ClflushLikeCache {
    unsafe fn flush_for_device(&self, addr: *const u8, len: usize) {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            let mut off = 0usize;
            while off < len {
                // SAFETY: caller guarantees `addr..addr+len` is valid; each
                // iteration stays within that range.
                unsafe {
                    core::arch::asm!("clflush [{0}]", in(reg) addr.add(off), options(nostack, preserves_flags));
                }
                off += CACHE_LINE_SIZE;
            }
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
        {
            let _ = (addr, len);
        }
    }

    unsafe fn invalidate_for_cpu(&self, addr: *mut u8, len: usize) {
        // SAFETY: delegated to `flush_for_device`; CLFLUSH both writes back
        // and invalidates the line, which is what the caller needs here.
        unsafe { self.flush_for_device(addr.cast_const(), len) };
    }

    fn tier(&self) -> CacheTier {
        CacheTier::ClflushLike
    }
}

/// [`CacheOps`] for [`CacheTier::WriteBackInvalidate`]: a coarse whole-cache
/// operation used as a barrier regardless of the requested range.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteBackInvalidateCache;

impl CacheOps for WriteBackInvalidateCache {
    unsafe fn flush_for_device(&self, _addr: *const u8, _len: usize) {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        // SAFETY: WBINVD requires CPL0, which the resident core always runs
        // at; it affects the whole cache, not just this buffer.
        unsafe {
            core::arch::asm!("wbinvd", options(nostack, preserves_flags));
        }
    }

    unsafe fn invalidate_for_cpu(&self, addr: *mut u8, len: usize) {
        // SAFETY: same whole-cache operation covers both directions.
        unsafe { self.flush_for_device(addr.cast_const(), len) };
    }

    fn tier(&self) -> CacheTier {
        CacheTier::WriteBackInvalidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isanic_platform::MemoryManager;

    fn platform(cpu: CpuFamily) -> PlatformDescriptor {
        PlatformDescriptor {
            cpu_family: cpu,
            memory_manager: MemoryManager::None,
            virtualization_services_present: false,
            upper_memory_available: false,
            upper_memory_safe_for_dma: false,
        }
    }

    #[test]
    fn superscalar_snoop_confirmed_degrades_to_clflush() {
        let p = platform(CpuFamily::Superscalar);
        let s = CacheProbeSignals { bus_snoop_self_test_passed: true, ..Default::default() };
        let sel = select(&p, s);
        assert_eq!(sel.tier, CacheTier::ClflushLike);
        assert!(sel.confidence < 50);
    }

    #[test]
    fn late_32bit_with_clflush() {
        let p = platform(CpuFamily::LateThirtyTwoBit);
        let s = CacheProbeSignals { clflush_available: true, ..Default::default() };
        assert_eq!(select(&p, s).tier, CacheTier::ClflushLike);
    }

    #[test]
    fn early_32bit_with_wbinvd() {
        let p = platform(CpuFamily::EarlyThirtyTwoBit);
        let s = CacheProbeSignals { wbinvd_available: true, ..Default::default() };
        assert_eq!(select(&p, s).tier, CacheTier::WriteBackInvalidate);
    }

    #[test]
    fn sixteen_bit_falls_back_to_software_barrier() {
        let p = platform(CpuFamily::EarlySixteenBit);
        let sel = select(&p, CacheProbeSignals::default());
        assert_eq!(sel.tier, CacheTier::SoftwareBarrier);
        assert_eq!(sel.confidence, 100);
    }

    #[test]
    fn software_barrier_with_dma_device_is_incompatible() {
        let p = platform(CpuFamily::EarlySixteenBit);
        let result = select_for_device(&p, CacheProbeSignals::default(), true);
        assert_eq!(result, Err(CacheError::Incompatible));
    }

    #[test]
    fn software_barrier_without_dma_device_is_fine() {
        let p = platform(CpuFamily::EarlySixteenBit);
        let result = select_for_device(&p, CacheProbeSignals::default(), false);
        assert!(result.is_ok());
    }

    #[test]
    fn degrade_stops_at_write_back_invalidate() {
        assert_eq!(CacheTier::WriteBackInvalidate.degrade_one_step(), CacheTier::WriteBackInvalidate);
        assert_eq!(CacheTier::SoftwareBarrier.degrade_one_step(), CacheTier::SoftwareBarrier);
    }

    #[test]
    fn software_barrier_forces_copybreak_raise() {
        assert!(CacheTier::SoftwareBarrier.forces_copybreak_raise());
        assert!(!CacheTier::ClflushLike.forces_copybreak_raise());
    }

    #[test]
    fn noop_ops_are_callable() {
        let ops = NoOpCache;
        // SAFETY: null range, no-op implementation never dereferences it.
        unsafe {
            ops.flush_for_device(core::ptr::null(), 0);
            ops.invalidate_for_cpu(core::ptr::null_mut(), 0);
        }
        assert_eq!(ops.tier(), CacheTier::NoOp);
    }
}
