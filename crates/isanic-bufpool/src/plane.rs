//! Buffer categories, size classes, placement, and the plane-level API.

use isanic_core::addr::PhysAddr;

use crate::slab::SlabCore;

/// What a buffer is allowed to be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCategory {
    /// Physically contiguous, below the 16 MiB ISA DMA ceiling, eligible to
    /// be programmed directly into a device descriptor.
    DmaSafe,
    /// Ordinary memory a driver bounces packet data through; never handed
    /// to a device register.
    CopyOnly,
    /// Small fixed allocations for descriptor bookkeeping, not packet data.
    Metadata,
}

/// One of the four fixed slab sizes every pool is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 256 bytes.
    Small,
    /// 512 bytes.
    Medium,
    /// 1536 bytes (one Ethernet MTU frame).
    Large,
    /// 2048 bytes.
    Jumbo,
}

impl SizeClass {
    /// Byte size of this class.
    #[must_use]
    pub const fn bytes(self) -> usize {
        match self {
            SizeClass::Small => 256,
            SizeClass::Medium => 512,
            SizeClass::Large => 1536,
            SizeClass::Jumbo => 2048,
        }
    }

    /// Smallest class that fits `len` bytes, or `None` if `len` exceeds the
    /// largest class.
    #[must_use]
    pub fn for_len(len: usize) -> Option<Self> {
        [SizeClass::Small, SizeClass::Medium, SizeClass::Large, SizeClass::Jumbo]
            .into_iter()
            .find(|class| len <= class.bytes())
    }
}

/// Errors the buffer plane can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The requested length doesn't fit any size class.
    OversizedRequest,
    /// Every placement candidate for a DMA-safe pool failed the ceiling
    /// check or was refused by virtualization services.
    NoDmaSafeMemory,
    /// A handle named a pool/slot this plane didn't hand out.
    InvalidHandle,
    /// A free call targeted a slot that is not currently checked out.
    DoubleFree,
    /// A copy-only or metadata pool had no free slot left. DMA-safe pool
    /// exhaustion is reported as [`BufferError::NoDmaSafeMemory`] instead,
    /// since that name already carries the DMA-specific meaning callers
    /// need to distinguish from an ordinary capacity limit.
    PoolExhausted,
}

/// A candidate physical region a DMA-safe pool might be built on top of.
///
/// Conventional memory (below 1 MiB) never needs a lock and always passes
/// the 16 MiB ceiling check. An upper-memory candidate needs
/// [`VdsLock::lock`] to resolve to a real physical address before it can be
/// verified.
#[derive(Debug, Clone, Copy)]
pub struct PlacementCandidate {
    /// Requested (or, for conventional memory, actual) base address.
    pub base: PhysAddr,
    /// Whether this candidate must go through a VDS lock to be usable.
    pub needs_lock: bool,
}

/// Virtualization-services lock/unlock, the seam that lets pool placement
/// be tested without real INT 2Fh calls.
pub trait VdsLock {
    /// Attempts to lock `len` bytes near `requested`. Returns the physical
    /// address VDS actually resolved, or `None` if the lock was refused.
    fn lock(&mut self, requested: PhysAddr, len: u32) -> Option<PhysAddr>;
    /// Releases a region previously returned by `lock`.
    fn unlock(&mut self, base: PhysAddr, len: u32);
}

/// Walks `candidates` in order, conventional-first, verifying each against
/// the DMA ceiling and releasing any locked-but-unusable region before
/// moving to the next.
pub fn place_dma_safe(
    candidates: &[PlacementCandidate],
    len: u32,
    vds: &mut impl VdsLock,
) -> Result<PhysAddr, BufferError> {
    for candidate in candidates {
        if candidate.needs_lock {
            if let Some(resolved) = vds.lock(candidate.base, len) {
                if resolved.region_below_dma_ceiling(len) {
                    return Ok(resolved);
                }
                vds.unlock(resolved, len);
            }
        } else if candidate.base.region_below_dma_ceiling(len) {
            return Ok(candidate.base);
        }
    }
    Err(BufferError::NoDmaSafeMemory)
}

const SMALL_SLOTS: usize = 64;
const MEDIUM_SLOTS: usize = 32;
const LARGE_SLOTS: usize = 16;
const JUMBO_SLOTS: usize = 8;

/// Opaque reference to a checked-out buffer. Carries no data of its own
/// beyond which pool and slot it came from; meaningless outside the
/// [`BufferPlane`] that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    category: BufferCategory,
    class: SizeClass,
    slot: u16,
}

impl BufferHandle {
    /// Size class this handle was allocated from.
    #[must_use]
    pub const fn size_class(&self) -> SizeClass {
        self.class
    }

    /// Category this handle was allocated from.
    #[must_use]
    pub const fn category(&self) -> BufferCategory {
        self.category
    }
}

/// How many of a size class's slots a load-time sizing puts into service,
/// relative to the built-in capacity ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSizing {
    /// Half of capacity.
    Small,
    /// Full capacity (default).
    Standard,
    /// Full capacity; alias of `Standard` kept distinct so callers can
    /// name "as many buffers as this build supports" explicitly.
    Large,
}

impl PoolSizing {
    fn scale(self, capacity: usize) -> usize {
        match self {
            PoolSizing::Small => capacity / 2,
            PoolSizing::Standard | PoolSizing::Large => capacity,
        }
    }
}

struct DmaPools {
    small: SlabCore<SMALL_SLOTS, 256>,
    medium: SlabCore<MEDIUM_SLOTS, 512>,
    large: SlabCore<LARGE_SLOTS, 1536>,
    jumbo: SlabCore<JUMBO_SLOTS, 2048>,
    small_base: PhysAddr,
    medium_base: PhysAddr,
    large_base: PhysAddr,
    jumbo_base: PhysAddr,
}

struct PlainPools {
    small: SlabCore<SMALL_SLOTS, 256>,
    medium: SlabCore<MEDIUM_SLOTS, 512>,
    large: SlabCore<LARGE_SLOTS, 1536>,
    jumbo: SlabCore<JUMBO_SLOTS, 2048>,
}

impl PlainPools {
    fn new(sizing: PoolSizing) -> Self {
        Self {
            small: SlabCore::new(sizing.scale(SMALL_SLOTS)),
            medium: SlabCore::new(sizing.scale(MEDIUM_SLOTS)),
            large: SlabCore::new(sizing.scale(LARGE_SLOTS)),
            jumbo: SlabCore::new(sizing.scale(JUMBO_SLOTS)),
        }
    }
}

/// The three-category, four-size-class buffer plane.
///
/// Every pool is built once, at [`BufferPlane::build`] time; `alloc_*` and
/// `free` thereafter only pop or push a free-list slot, so the hot path
/// never searches for placement and never blocks.
pub struct BufferPlane {
    dma: DmaPools,
    copy: PlainPools,
    meta: PlainPools,
}

impl BufferPlane {
    /// Builds every pool. `dma_candidates` supplies, per size class, the
    /// ordered placement candidates for that class's DMA-safe pool (see
    /// [`place_dma_safe`]); `copy` and `meta` pools never fail to place, so
    /// they only need a sizing.
    pub fn build(
        sizing: PoolSizing,
        dma_candidates: DmaCandidatesBySize,
        vds: &mut impl VdsLock,
    ) -> Result<Self, BufferError> {
        let small_base = place_dma_safe(dma_candidates.small, 256, vds)?;
        let medium_base = place_dma_safe(dma_candidates.medium, 512, vds)?;
        let large_base = place_dma_safe(dma_candidates.large, 1536, vds)?;
        let jumbo_base = place_dma_safe(dma_candidates.jumbo, 2048, vds)?;
        Ok(Self {
            dma: DmaPools {
                small: SlabCore::new(sizing.scale(SMALL_SLOTS)),
                medium: SlabCore::new(sizing.scale(MEDIUM_SLOTS)),
                large: SlabCore::new(sizing.scale(LARGE_SLOTS)),
                jumbo: SlabCore::new(sizing.scale(JUMBO_SLOTS)),
                small_base,
                medium_base,
                large_base,
                jumbo_base,
            },
            copy: PlainPools::new(sizing),
            meta: PlainPools::new(sizing),
        })
    }

    /// Allocates a DMA-safe buffer able to hold `len` bytes.
    pub fn alloc_dma(&mut self, len: usize) -> Result<BufferHandle, BufferError> {
        let class = SizeClass::for_len(len).ok_or(BufferError::OversizedRequest)?;
        let slot = match class {
            SizeClass::Small => self.dma.small.alloc(),
            SizeClass::Medium => self.dma.medium.alloc(),
            SizeClass::Large => self.dma.large.alloc(),
            SizeClass::Jumbo => self.dma.jumbo.alloc(),
        }
        .ok_or(BufferError::NoDmaSafeMemory)?;
        Ok(BufferHandle { category: BufferCategory::DmaSafe, class, slot })
    }

    /// Allocates a copy-only buffer able to hold `len` bytes.
    pub fn alloc_copy(&mut self, len: usize) -> Result<BufferHandle, BufferError> {
        let class = SizeClass::for_len(len).ok_or(BufferError::OversizedRequest)?;
        let slot = match class {
            SizeClass::Small => self.copy.small.alloc(),
            SizeClass::Medium => self.copy.medium.alloc(),
            SizeClass::Large => self.copy.large.alloc(),
            SizeClass::Jumbo => self.copy.jumbo.alloc(),
        }
        .ok_or(BufferError::PoolExhausted)?;
        Ok(BufferHandle { category: BufferCategory::CopyOnly, class, slot })
    }

    /// Allocates a metadata buffer able to hold `len` bytes.
    pub fn alloc_meta(&mut self, len: usize) -> Result<BufferHandle, BufferError> {
        let class = SizeClass::for_len(len).ok_or(BufferError::OversizedRequest)?;
        let slot = match class {
            SizeClass::Small => self.meta.small.alloc(),
            SizeClass::Medium => self.meta.medium.alloc(),
            SizeClass::Large => self.meta.large.alloc(),
            SizeClass::Jumbo => self.meta.jumbo.alloc(),
        }
        .ok_or(BufferError::PoolExhausted)?;
        Ok(BufferHandle { category: BufferCategory::Metadata, class, slot })
    }

    /// Returns `handle` to its pool. Invalid or already-free handles are
    /// reported, not panicked on; callers in interrupt context should log
    /// and drop the error rather than propagate it.
    pub fn free(&mut self, handle: BufferHandle) -> Result<(), BufferError> {
        let result = match (handle.category, handle.class) {
            (BufferCategory::DmaSafe, SizeClass::Small) => self.dma.small.free(handle.slot),
            (BufferCategory::DmaSafe, SizeClass::Medium) => self.dma.medium.free(handle.slot),
            (BufferCategory::DmaSafe, SizeClass::Large) => self.dma.large.free(handle.slot),
            (BufferCategory::DmaSafe, SizeClass::Jumbo) => self.dma.jumbo.free(handle.slot),
            (BufferCategory::CopyOnly, SizeClass::Small) => self.copy.small.free(handle.slot),
            (BufferCategory::CopyOnly, SizeClass::Medium) => self.copy.medium.free(handle.slot),
            (BufferCategory::CopyOnly, SizeClass::Large) => self.copy.large.free(handle.slot),
            (BufferCategory::CopyOnly, SizeClass::Jumbo) => self.copy.jumbo.free(handle.slot),
            (BufferCategory::Metadata, SizeClass::Small) => self.meta.small.free(handle.slot),
            (BufferCategory::Metadata, SizeClass::Medium) => self.meta.medium.free(handle.slot),
            (BufferCategory::Metadata, SizeClass::Large) => self.meta.large.free(handle.slot),
            (BufferCategory::Metadata, SizeClass::Jumbo) => self.meta.jumbo.free(handle.slot),
        };
        result.map_err(|_| BufferError::DoubleFree)
    }

    /// Physical address of a checked-out DMA-safe buffer, or `None` for
    /// copy-only/metadata handles (which have no device-visible address).
    #[must_use]
    pub fn physical_address_of(&self, handle: BufferHandle) -> Option<PhysAddr> {
        if handle.category != BufferCategory::DmaSafe {
            return None;
        }
        let (base, bytes) = match handle.class {
            SizeClass::Small => (self.dma.small_base, SlabCore::<SMALL_SLOTS, 256>::slot_offset(handle.slot)),
            SizeClass::Medium => (self.dma.medium_base, SlabCore::<MEDIUM_SLOTS, 512>::slot_offset(handle.slot)),
            SizeClass::Large => (self.dma.large_base, SlabCore::<LARGE_SLOTS, 1536>::slot_offset(handle.slot)),
            SizeClass::Jumbo => (self.dma.jumbo_base, SlabCore::<JUMBO_SLOTS, 2048>::slot_offset(handle.slot)),
        };
        Some(PhysAddr::new(base.as_u32() + bytes))
    }

    /// Writable bytes backing a checked-out buffer.
    #[must_use]
    pub fn buffer_mut(&mut self, handle: BufferHandle) -> Option<&mut [u8]> {
        match (handle.category, handle.class) {
            (BufferCategory::DmaSafe, SizeClass::Small) => self.dma.small.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::DmaSafe, SizeClass::Medium) => self.dma.medium.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::DmaSafe, SizeClass::Large) => self.dma.large.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::DmaSafe, SizeClass::Jumbo) => self.dma.jumbo.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::CopyOnly, SizeClass::Small) => self.copy.small.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::CopyOnly, SizeClass::Medium) => self.copy.medium.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::CopyOnly, SizeClass::Large) => self.copy.large.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::CopyOnly, SizeClass::Jumbo) => self.copy.jumbo.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::Metadata, SizeClass::Small) => self.meta.small.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::Metadata, SizeClass::Medium) => self.meta.medium.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::Metadata, SizeClass::Large) => self.meta.large.slot_mut(handle.slot).map(|b| &mut b[..]),
            (BufferCategory::Metadata, SizeClass::Jumbo) => self.meta.jumbo.slot_mut(handle.slot).map(|b| &mut b[..]),
        }
    }

    /// Health score for one pool. Pools degrade independently, so there is
    /// no single plane-wide score.
    #[must_use]
    pub fn health_score(&self, category: BufferCategory, class: SizeClass) -> i8 {
        match (category, class) {
            (BufferCategory::DmaSafe, SizeClass::Small) => self.dma.small.health_score(),
            (BufferCategory::DmaSafe, SizeClass::Medium) => self.dma.medium.health_score(),
            (BufferCategory::DmaSafe, SizeClass::Large) => self.dma.large.health_score(),
            (BufferCategory::DmaSafe, SizeClass::Jumbo) => self.dma.jumbo.health_score(),
            (BufferCategory::CopyOnly, SizeClass::Small) => self.copy.small.health_score(),
            (BufferCategory::CopyOnly, SizeClass::Medium) => self.copy.medium.health_score(),
            (BufferCategory::CopyOnly, SizeClass::Large) => self.copy.large.health_score(),
            (BufferCategory::CopyOnly, SizeClass::Jumbo) => self.copy.jumbo.health_score(),
            (BufferCategory::Metadata, SizeClass::Small) => self.meta.small.health_score(),
            (BufferCategory::Metadata, SizeClass::Medium) => self.meta.medium.health_score(),
            (BufferCategory::Metadata, SizeClass::Large) => self.meta.large.health_score(),
            (BufferCategory::Metadata, SizeClass::Jumbo) => self.meta.jumbo.health_score(),
        }
    }

    /// Lifetime counters for one pool.
    #[must_use]
    pub fn stats(&self, category: BufferCategory, class: SizeClass) -> crate::slab::PoolStats {
        match (category, class) {
            (BufferCategory::DmaSafe, SizeClass::Small) => self.dma.small.stats(),
            (BufferCategory::DmaSafe, SizeClass::Medium) => self.dma.medium.stats(),
            (BufferCategory::DmaSafe, SizeClass::Large) => self.dma.large.stats(),
            (BufferCategory::DmaSafe, SizeClass::Jumbo) => self.dma.jumbo.stats(),
            (BufferCategory::CopyOnly, SizeClass::Small) => self.copy.small.stats(),
            (BufferCategory::CopyOnly, SizeClass::Medium) => self.copy.medium.stats(),
            (BufferCategory::CopyOnly, SizeClass::Large) => self.copy.large.stats(),
            (BufferCategory::CopyOnly, SizeClass::Jumbo) => self.copy.jumbo.stats(),
            (BufferCategory::Metadata, SizeClass::Small) => self.meta.small.stats(),
            (BufferCategory::Metadata, SizeClass::Medium) => self.meta.medium.stats(),
            (BufferCategory::Metadata, SizeClass::Large) => self.meta.large.stats(),
            (BufferCategory::Metadata, SizeClass::Jumbo) => self.meta.jumbo.stats(),
        }
    }
}

/// Per-size-class placement candidates, handed to [`BufferPlane::build`].
pub struct DmaCandidatesBySize<'a> {
    /// Candidates for the 256-byte pool.
    pub small: &'a [PlacementCandidate],
    /// Candidates for the 512-byte pool.
    pub medium: &'a [PlacementCandidate],
    /// Candidates for the 1536-byte pool.
    pub large: &'a [PlacementCandidate],
    /// Candidates for the 2048-byte pool.
    pub jumbo: &'a [PlacementCandidate],
}
