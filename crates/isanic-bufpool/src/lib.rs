//! DMA-aware buffer plane.
//!
//! Three buffer categories (DMA-safe, copy-only, metadata) across four
//! fixed size classes each. Every pool is a fixed-capacity arena built once
//! at load time; [`plane::BufferPlane`] only ever pops and pushes slot
//! indices afterward, so allocation and free are non-blocking and
//! allocation-free in the interrupt path.
//!
//! The free list is a stack of slot indices rather than a linked list
//! threaded through buffer headers: there is no pointer graph to corrupt,
//! and double-free detection is an O(1) bitmap check instead of a list
//! walk.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod plane;
pub mod slab;

pub use plane::{
    BufferCategory, BufferError, BufferHandle, BufferPlane, DmaCandidatesBySize, PlacementCandidate, PoolSizing,
    SizeClass, VdsLock,
};
