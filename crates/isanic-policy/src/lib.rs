//! DMA policy engine (component D).
//!
//! DMA transfers are gated on the conjunction of three predicates —
//! `runtime_enable`, `validation_passed`, `last_known_safe` — backed by a
//! 16-byte record that survives a reboot. A hardware-signature check
//! invalidates the record if it was written on a different platform, and a
//! three-strike rule downgrades a misbehaving adapter back to PIO without
//! operator intervention.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod engine;
pub mod record;
pub mod table;

pub use engine::{
    counters_monotonic, dma_permitted, load, persist, report_result, run_validation, Backoff, DegradedFallback,
    PolicyError, PolicyStore, ValidationCounters,
};
pub use record::{hardware_signature, DmaPolicyRecord};
pub use table::{copybreak_bytes, default_transfer, TransferPreference};
