//! Versioned driver-operations record.
//!
//! A per-device driver exposes exactly one of these records: an ABI
//! version range, a feature bitset, identifying strings, and the raw
//! C-ABI function pointers the bridge calls through. None of this is a
//! Rust trait object — drivers live in resident module images the bridge
//! never compiles against, so the only contract that can cross that
//! boundary is a fixed-layout record of function pointers, the same way a
//! vendor's binary-only driver would expose one.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

use bitflags::bitflags;

bitflags! {
    /// Capability bits a driver may advertise.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u16 {
        /// Packet send/receive with no offloads.
        const BASIC = 1 << 0;
        /// Bounce-buffer DMA.
        const DMA = 1 << 1;
        /// Bus-master DMA (descriptor rings).
        const BUS_MASTER = 1 << 2;
        /// Hardware checksum offload.
        const CHECKSUM_OFFLOAD = 1 << 3;
        /// Power-management states.
        const POWER_MANAGEMENT = 1 << 4;
        /// Wake-on-arrival (magic packet or similar).
        const WAKE_ON_ARRIVAL = 1 << 5;
        /// 802.1Q VLAN tagging.
        const VLAN = 1 << 6;
        /// Extended hardware statistics counters.
        const STATISTICS = 1 << 7;
    }
}

/// Opaque per-instance driver state. The bridge never interprets this; it
/// only carries the pointer between calls.
pub type DriverContext = *mut core::ffi::c_void;

/// `init_v1(ctx, init_context) -> 0` on success, negative on failure.
pub type InitFn = unsafe extern "C" fn(ctx: DriverContext, init_context: *const u8) -> i32;
/// `send_packet_v1(ctx, buffer, length) -> 0` on success, negative on failure.
pub type SendPacketFn = unsafe extern "C" fn(ctx: DriverContext, buffer: *const u8, length: u16) -> i32;
/// `receive_packet_v1(ctx, buffer, capacity, out_length) -> 0` on success
/// (with `*out_length` set), `1` if no packet is available, negative on
/// failure.
pub type ReceivePacketFn =
    unsafe extern "C" fn(ctx: DriverContext, buffer: *mut u8, capacity: u16, out_length: *mut u16) -> i32;
/// `cleanup_v1(ctx)`, called once during detach.
pub type CleanupFn = unsafe extern "C" fn(ctx: DriverContext);
/// `detect_v1(ctx) -> 0` if a matching device is present, negative otherwise.
pub type DetectFn = unsafe extern "C" fn(ctx: DriverContext) -> i32;
/// `set_mode_v1(ctx, mode) -> 0` on success, negative on failure.
pub type SetModeFn = unsafe extern "C" fn(ctx: DriverContext, mode: u16) -> i32;

/// A per-device driver's versioned operations record.
#[derive(Debug, Clone, Copy)]
pub struct DriverOperations {
    /// The version this build of the driver actually implements.
    pub abi_version: u16,
    /// Oldest caller-required version this driver still accepts.
    pub min_required: u16,
    /// Newest caller-required version this driver accepts.
    pub max_supported: u16,
    /// Capabilities this driver implements.
    pub features: Features,
    /// Short driver name, for diagnostics.
    pub driver_name: &'static str,
    /// Vendor/board name, for diagnostics.
    pub vendor_name: &'static str,
    /// Entry point called once during attach.
    pub init: InitFn,
    /// Entry point called for every outbound packet.
    pub send_packet: SendPacketFn,
    /// Entry point called to poll for an inbound packet.
    pub receive_packet: ReceivePacketFn,
    /// Entry point called once during detach.
    pub cleanup: CleanupFn,
    /// Entry point probing for a matching device, independent of `init`.
    pub detect: DetectFn,
    /// Entry point changing the receive-mode filter.
    pub set_mode: SetModeFn,
}

/// Outcome of [`DriverOperations::check_compatibility`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compatibility {
    /// Exact version and feature match.
    FullyCompatible,
    /// Same major version, different minor; safe to proceed, worth a log line.
    MinorDifference,
    /// Different major version but still within the driver's supported
    /// range; safe to proceed, worth a warning.
    MajorDifference,
    /// The record is self-inconsistent (its own `abi_version` falls
    /// outside `min_required..=max_supported`) and cannot be trusted.
    Incompatible,
    /// `required_version` is older than `min_required`.
    TooOld,
    /// `required_version` is newer than `max_supported`.
    TooNew,
    /// The driver does not implement every feature the caller requires.
    MissingFeatures,
}

impl Compatibility {
    /// `true` for the outcomes that must fail an attach. Only
    /// [`Compatibility::Incompatible`], [`Compatibility::TooOld`],
    /// [`Compatibility::TooNew`], and [`Compatibility::MissingFeatures`]
    /// do; the two "difference" outcomes proceed with a warning.
    #[must_use]
    pub const fn fails_attach(self) -> bool {
        matches!(self, Self::Incompatible | Self::TooOld | Self::TooNew | Self::MissingFeatures)
    }
}

fn major(version: u16) -> u16 {
    version >> 8
}

impl DriverOperations {
    /// Checks this record against a caller's required version and feature
    /// set. See [`Compatibility`] for the precedence of outcomes.
    #[must_use]
    pub fn check_compatibility(&self, required_version: u16, required_features: Features) -> Compatibility {
        if self.abi_version < self.min_required || self.abi_version > self.max_supported {
            return Compatibility::Incompatible;
        }
        if required_version < self.min_required {
            return Compatibility::TooOld;
        }
        if required_version > self.max_supported {
            return Compatibility::TooNew;
        }
        if !self.features.contains(required_features) {
            return Compatibility::MissingFeatures;
        }
        if major(required_version) != major(self.abi_version) {
            return Compatibility::MajorDifference;
        }
        if required_version != self.abi_version {
            return Compatibility::MinorDifference;
        }
        Compatibility::FullyCompatible
    }
}
