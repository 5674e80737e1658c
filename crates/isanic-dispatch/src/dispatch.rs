//! Routing table and error mapping for the dispatcher's two function-code
//! ranges: the standard packet-driver API (routed to a device's bridge)
//! and the DMA-policy extension range (routed to the policy record
//! directly, no device involved).

use isanic_bridge::{ApiParams, ApiResult, Bridge, BridgeError, FunctionCode};
use isanic_core::sync::InterruptMask;
use isanic_policy::{dma_permitted, DmaPolicyRecord, ValidationCounters};
use planck_noalloc::vec::ArrayVec;

use isanic_registry::MAX_DEVICES;

/// Errors the dispatcher itself can report, wrapping whatever the routed
/// component reported (§7: "Image-build failure ... All fatal at load
/// time"; the analogous run-time rule here is that every dispatch error
/// maps to one accumulator byte, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// No registered bridge claims `device_id`.
    UnknownDevice,
    /// The bridge's own dispatch failed.
    Bridge(BridgeError),
    /// [`Dispatcher::register`] was called with no free bridge slots.
    TooManyBridges,
}

impl From<BridgeError> for DispatchError {
    fn from(e: BridgeError) -> Self {
        Self::Bridge(e)
    }
}

impl core::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnknownDevice => f.write_str("no bridge registered for this device id"),
            Self::Bridge(e) => core::fmt::Display::fmt(e, f),
            Self::TooManyBridges => f.write_str("dispatcher has no free bridge slots"),
        }
    }
}

impl DispatchError {
    /// The one-byte accumulator code §6 carries on failure (alongside the
    /// set carry flag). Values are this workspace's own assignment — the
    /// distilled packet-driver error table was out of scope — chosen as a
    /// small dense enumeration with 0 reserved for success.
    #[must_use]
    pub const fn accumulator_code(&self) -> u8 {
        match self {
            Self::UnknownDevice => 1,
            Self::Bridge(BridgeError::DeviceBusy) => 2,
            Self::Bridge(BridgeError::DeviceNotFound) => 3,
            Self::Bridge(BridgeError::DriverIncompatible) => 4,
            Self::Bridge(BridgeError::IsrUnsafe) => 5,
            Self::Bridge(BridgeError::IsrReentrant) => 6,
            Self::Bridge(BridgeError::IsrStackOverflow) => 7,
            Self::Bridge(BridgeError::NoData) => 8,
            Self::Bridge(BridgeError::UnsupportedFunction) => 9,
            Self::Bridge(BridgeError::InvalidState) => 10,
            Self::TooManyBridges => 11,
        }
    }
}

/// Routes §6's standard packet-driver function codes to the attached
/// device's bridge. Owns no policy, no buffers, and no platform state —
/// exactly the "narrow bottleneck" §4.H describes.
pub struct Dispatcher {
    bridges: ArrayVec<Bridge, MAX_DEVICES>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// An empty dispatcher with no bridges registered.
    #[must_use]
    pub const fn new() -> Self {
        Self { bridges: ArrayVec::new() }
    }

    /// Registers an already-attached bridge, making it reachable by its
    /// [`Bridge::registry_id`].
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TooManyBridges`] at [`MAX_DEVICES`] bridges.
    pub fn register(&mut self, bridge: Bridge) -> Result<(), DispatchError> {
        self.bridges.try_push(bridge).map_err(|_| DispatchError::TooManyBridges)
    }

    /// Number of bridges currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    /// `true` if no bridges are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    fn find_mut(&mut self, device_id: u32) -> Result<&mut Bridge, DispatchError> {
        self.bridges.iter_mut().find(|b| b.registry_id() == Some(device_id)).ok_or(DispatchError::UnknownDevice)
    }

    /// Routes one standard-API call to the bridge claiming `device_id`.
    ///
    /// This is the body the entry dispatcher runs after switching onto the
    /// private stack and before switching back; it carries no policy of
    /// its own (§4.H).
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::UnknownDevice`] if no bridge claims
    /// `device_id`, or [`DispatchError::Bridge`] for whatever the bridge
    /// itself reported.
    ///
    /// # Safety
    ///
    /// Forwards [`Bridge::dispatch_api`]'s contract: `params.buffer` must
    /// be valid for `params.length` bytes as the called function requires.
    pub unsafe fn dispatch(
        &mut self,
        device_id: u32,
        code: FunctionCode,
        params: ApiParams,
    ) -> Result<ApiResult, DispatchError> {
        let bridge = self.find_mut(device_id)?;
        // SAFETY: forwarded from this function's own contract.
        unsafe { bridge.dispatch_api(code, params) }.map_err(DispatchError::from)
    }
}

/// DMA-policy extension function codes (§6 "Extension API").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionFunction {
    /// Reports the three policy predicates and the derived gate.
    GetState,
    /// Sets `runtime_enable` to the given value.
    SetRuntimeEnable(bool),
    /// Clears `validation_passed`, forcing the next validation cycle to
    /// re-run before DMA is permitted again.
    RequestRevalidation,
    /// Reports the live validation counters.
    DumpStatistics,
}

/// The extension API's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionResult {
    /// Reply to [`ExtensionFunction::GetState`].
    State {
        /// `record.runtime_enable`.
        runtime_enable: bool,
        /// `record.validation_passed`.
        validation_passed: bool,
        /// `record.last_known_safe`.
        last_known_safe: bool,
        /// The conjunction of all three.
        dma_permitted: bool,
    },
    /// A mutating request completed.
    Acknowledged,
    /// Reply to [`ExtensionFunction::DumpStatistics`].
    Statistics(ValidationCounters),
}

/// Handles one extension-range call against the process-wide policy
/// record. Unlike [`Dispatcher::dispatch`] this never touches a bridge:
/// the extension range is policy-only (§6).
///
/// Mutating variants mask interrupts around the write, matching the
/// locking discipline for policy-record updates (§5): the interrupt
/// context reads these fields but must never observe a half-written one.
pub fn dispatch_extension(
    record: &mut DmaPolicyRecord,
    counters: ValidationCounters,
    function: ExtensionFunction,
) -> ExtensionResult {
    match function {
        ExtensionFunction::GetState => ExtensionResult::State {
            runtime_enable: record.runtime_enable,
            validation_passed: record.validation_passed,
            last_known_safe: record.last_known_safe,
            dma_permitted: dma_permitted(record),
        },
        ExtensionFunction::SetRuntimeEnable(enable) => {
            let _mask = InterruptMask::acquire();
            record.runtime_enable = enable;
            ExtensionResult::Acknowledged
        }
        ExtensionFunction::RequestRevalidation => {
            let _mask = InterruptMask::acquire();
            record.validation_passed = false;
            ExtensionResult::Acknowledged
        }
        ExtensionFunction::DumpStatistics => ExtensionResult::Statistics(counters),
    }
}
