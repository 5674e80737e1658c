//! Platform probe (component A).
//!
//! Classifies the host into a [`PlatformDescriptor`]: a CPU family tag, a
//! memory-manager tag, and the handful of booleans everything downstream
//! (the cache tier selector, the DMA policy engine, the buffer plane) reads.
//! The descriptor is written exactly once and is immutable thereafter.
//!
//! The actual flag-bit-flip CPU tests and `INT 2Fh` memory-manager queries
//! are real-mode-only operations, so the classification logic is split from
//! the raw probing: [`PlatformQuery`] is the seam a caller supplies (the
//! real x86 implementation on the resident target, a fixed fake in tests),
//! and [`classify`] is the pure decision-table logic that has to get the
//! priority order right.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use core::sync::atomic::{AtomicBool, Ordering};

use isanic_core::sync::Racy;

/// CPU family tag, from least to most capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuFamily {
    /// 8086/8088-class: no 286+ flag bits settable.
    EarlySixteenBit,
    /// 286-class: protected mode available, no 386+ `AC` flag.
    ProtectedSixteenBit,
    /// 386/early-486-class: `AC` flag togglable, no `CPUID`.
    EarlyThirtyTwoBit,
    /// 486-class with `CPUID` (family nibble 4).
    LateThirtyTwoBit,
    /// Pentium-class or later (family nibble ≥ 5): dual-issue or better.
    Superscalar,
}

/// Memory-manager tag. Variants are listed in the priority order
/// [`classify`] matches them in — first match wins, exactly like the cache
/// tier selector's decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryManager {
    /// No memory manager detected.
    None,
    /// XMS (extended memory, HMA) only.
    HighMemoryOnly,
    /// EMS (paged expanded memory) only.
    EmsPaged,
    /// Both XMS and EMS present.
    CombinedPaged,
    /// A DPMI host or other protected-mode environment is present.
    HostedProtected,
    /// Virtual DMA Services are present (can translate and lock regions).
    VdsEnabled,
}

/// Immutable platform classification, probed once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformDescriptor {
    /// CPU family tag.
    pub cpu_family: CpuFamily,
    /// Memory-manager tag.
    pub memory_manager: MemoryManager,
    /// Virtual DMA Services (or equivalent) are present.
    pub virtualization_services_present: bool,
    /// XMS and/or EMS is available (upper/paged memory exists at all).
    pub upper_memory_available: bool,
    /// Upper memory is *worth attempting* for DMA.
    ///
    /// This is never a blanket safety grant. It only means virtualization
    /// services exist that could, in principle, lock a region and return a
    /// sub-16 MiB physical address; the buffer plane still verifies every
    /// individual allocation before calling it DMA-safe. When this is
    /// `false`, the plane does not even attempt upper memory for DMA
    /// candidates.
    pub upper_memory_safe_for_dma: bool,
}

impl PlatformDescriptor {
    /// The most conservative descriptor: pure real mode, no upper memory,
    /// no virtualization services. Used when the probe cannot determine
    /// anything with confidence; unknown configurations map to the most
    /// conservative tag.
    #[must_use]
    pub const fn conservative() -> Self {
        Self {
            cpu_family: CpuFamily::EarlySixteenBit,
            memory_manager: MemoryManager::None,
            virtualization_services_present: false,
            upper_memory_available: false,
            upper_memory_safe_for_dma: false,
        }
    }
}

/// Raw signals a platform query collects before classification.
///
/// Each field corresponds to one real-mode-only test; keeping them as
/// plain booleans/options (rather than doing the classification inline)
/// is what makes [`classify`] host-testable without real hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeSignals {
    /// `FLAGS` bits 12-15 are settable (distinguishes 8086 from 286+).
    pub flags_286_or_better: bool,
    /// The `AC` (alignment check) flag in `EFLAGS` is togglable
    /// (distinguishes pre-386 from 386+).
    pub flags_386_or_better: bool,
    /// The `ID` flag in `EFLAGS` is togglable, i.e. `CPUID` is available.
    pub cpuid_available: bool,
    /// `CPUID` family nibble, when [`cpuid_available`](Self::cpuid_available)
    /// is `true`.
    pub cpuid_family: Option<u8>,
    /// XMS driver detected (`INT 2Fh AX=4300h`).
    pub xms_present: bool,
    /// EMS driver detected (`INT 67h AH=40h` / `INT 2Fh AX=4100h`).
    pub ems_present: bool,
    /// A DPMI host or hosted protected-mode environment is present.
    pub dpmi_present: bool,
    /// Virtual DMA Services are present (`INT 2Fh AX=8102h`).
    pub vds_present: bool,
}

/// Supplies raw platform signals. The resident build implements this over
/// real flag-bit-flip tests and `INT 2Fh`; tests implement it over a fixed
/// fake.
pub trait PlatformQuery {
    /// Collects the raw signals this platform exposes.
    fn signals(&self) -> ProbeSignals;
}

fn classify_cpu(s: &ProbeSignals) -> CpuFamily {
    if !s.flags_286_or_better {
        return CpuFamily::EarlySixteenBit;
    }
    if !s.flags_386_or_better {
        return CpuFamily::ProtectedSixteenBit;
    }
    if !s.cpuid_available {
        return CpuFamily::EarlyThirtyTwoBit;
    }
    match s.cpuid_family {
        Some(family) if family >= 5 => CpuFamily::Superscalar,
        _ => CpuFamily::LateThirtyTwoBit,
    }
}

fn classify_memory_manager(s: &ProbeSignals) -> MemoryManager {
    if s.vds_present {
        MemoryManager::VdsEnabled
    } else if s.dpmi_present {
        MemoryManager::HostedProtected
    } else if s.xms_present && s.ems_present {
        MemoryManager::CombinedPaged
    } else if s.ems_present {
        MemoryManager::EmsPaged
    } else if s.xms_present {
        MemoryManager::HighMemoryOnly
    } else {
        MemoryManager::None
    }
}

/// Classifies raw probe signals into a [`PlatformDescriptor`].
///
/// Total: every possible `ProbeSignals` value maps to a descriptor, so
/// there are no observable probe failures.
#[must_use]
pub fn classify(signals: ProbeSignals) -> PlatformDescriptor {
    let cpu_family = classify_cpu(&signals);
    let memory_manager = classify_memory_manager(&signals);
    let upper_memory_available = signals.xms_present || signals.ems_present;
    PlatformDescriptor {
        cpu_family,
        memory_manager,
        virtualization_services_present: signals.vds_present,
        upper_memory_available,
        upper_memory_safe_for_dma: signals.vds_present,
    }
}

/// Probes the platform via `query` and classifies the result.
#[must_use]
pub fn probe(query: &impl PlatformQuery) -> PlatformDescriptor {
    classify(query.signals())
}

// ---------------------------------------------------------------------------
// Process-wide, write-once cache
// ---------------------------------------------------------------------------

static DESCRIPTOR: Racy<Option<PlatformDescriptor>> = Racy::new(None);
static WRITTEN: AtomicBool = AtomicBool::new(false);

/// Probes once and caches the result; subsequent calls return the cached
/// descriptor without re-probing. The descriptor is process-wide and
/// written exactly once.
///
/// # Panics
///
/// Never panics; if called concurrently with itself from an interrupt
/// context (which must not happen — the probe is load-time-only) the
/// second writer would race. Callers are responsible for only invoking
/// this from the foreground load path.
pub fn probe_once(query: &impl PlatformQuery) -> PlatformDescriptor {
    if !WRITTEN.load(Ordering::Acquire) {
        let descriptor = probe(query);
        // SAFETY: load-time only, single writer by construction (the
        // dispatcher installs itself after this call completes).
        unsafe {
            *DESCRIPTOR.get() = Some(descriptor);
        }
        WRITTEN.store(true, Ordering::Release);
    }
    // SAFETY: WRITTEN is only set after the descriptor is populated.
    unsafe { (*DESCRIPTOR.get()).expect("probe_once: descriptor written") }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTHING: ProbeSignals = ProbeSignals {
        flags_286_or_better: false,
        flags_386_or_better: false,
        cpuid_available: false,
        cpuid_family: None,
        xms_present: false,
        ems_present: false,
        dpmi_present: false,
        vds_present: false,
    };

    #[test]
    fn earliest_cpu_maps_conservative() {
        let d = classify(NOTHING);
        assert_eq!(d, PlatformDescriptor::conservative());
    }

    #[test]
    fn cpu_286_without_386_flag() {
        let s = ProbeSignals { flags_286_or_better: true, ..NOTHING };
        assert_eq!(classify_cpu(&s), CpuFamily::ProtectedSixteenBit);
    }

    #[test]
    fn cpu_386_without_cpuid() {
        let s = ProbeSignals {
            flags_286_or_better: true,
            flags_386_or_better: true,
            ..NOTHING
        };
        assert_eq!(classify_cpu(&s), CpuFamily::EarlyThirtyTwoBit);
    }

    #[test]
    fn cpu_486_with_cpuid_family_4() {
        let s = ProbeSignals {
            flags_286_or_better: true,
            flags_386_or_better: true,
            cpuid_available: true,
            cpuid_family: Some(4),
            ..NOTHING
        };
        assert_eq!(classify_cpu(&s), CpuFamily::LateThirtyTwoBit);
    }

    #[test]
    fn cpu_pentium_is_superscalar() {
        let s = ProbeSignals {
            flags_286_or_better: true,
            flags_386_or_better: true,
            cpuid_available: true,
            cpuid_family: Some(5),
            ..NOTHING
        };
        assert_eq!(classify_cpu(&s), CpuFamily::Superscalar);
    }

    #[test]
    fn memory_manager_priority_vds_wins() {
        let s = ProbeSignals {
            vds_present: true,
            dpmi_present: true,
            xms_present: true,
            ems_present: true,
            ..NOTHING
        };
        assert_eq!(classify_memory_manager(&s), MemoryManager::VdsEnabled);
    }

    #[test]
    fn memory_manager_combined_paged() {
        let s = ProbeSignals { xms_present: true, ems_present: true, ..NOTHING };
        assert_eq!(classify_memory_manager(&s), MemoryManager::CombinedPaged);
    }

    #[test]
    fn upper_memory_safety_follows_vds_only() {
        let s = ProbeSignals { xms_present: true, ems_present: true, ..NOTHING };
        let d = classify(s);
        assert!(d.upper_memory_available);
        assert!(!d.upper_memory_safe_for_dma);
    }

    struct FakeQuery(ProbeSignals);
    impl PlatformQuery for FakeQuery {
        fn signals(&self) -> ProbeSignals {
            self.0
        }
    }

    #[test]
    fn probe_once_caches_first_result() {
        // Note: this test shares process-global state with any other test
        // that calls `probe_once`; it only asserts internal consistency of
        // a single call sequence, not cross-test isolation.
        let first = probe_once(&FakeQuery(NOTHING));
        let second = probe_once(&FakeQuery(ProbeSignals { vds_present: true, ..NOTHING }));
        assert_eq!(first, second);
    }
}
