//! Driver bridge (component F): the uniform operations surface between the
//! entry dispatcher and a per-device driver, plus the ISR safety envelope
//! that wraps every interrupt-context call into it.
//!
//! One [`Bridge`] exists per attached device. It owns nothing about the
//! device itself — that lives behind the [`isanic_driver_api::DriverOperations`]
//! record it was attached with — and instead arbitrates three things: the
//! device's claim in the [`isanic_registry::Registry`], the driver's
//! advertised ABI/feature compatibility, and the ISR nesting/latency bound
//! from §4.F.1.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod isr;

use isanic_driver_api::{Compatibility, DriverOperations, Features};
use isanic_registry::{Registry, RegistryError};

pub use isr::{IsrError, IsrState, ISR_SLOW_THRESHOLD_US, MAX_ISR_NESTING, STACK_CANARY};

/// Lifecycle state of one attached bridge instance.
///
/// Transitions are linear: `Uninitialized -> Initializing -> Active ->
/// Suspending -> Suspended -> Active` (resume) or `Active -> Unloading`,
/// with `Error` reachable from any state a fatal envelope observation
/// (stack overflow) or a failed attach leaves behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Constructed but not yet attached to a device.
    Uninitialized,
    /// `attach` is in progress.
    Initializing,
    /// Attached, claimed, verified, and accepting dispatch calls.
    Active,
    /// A suspend request has been accepted; driver teardown in progress.
    Suspending,
    /// Suspended; hardware resources released, claim retained.
    Suspended,
    /// `detach` is in progress; the device claim is being released.
    Unloading,
    /// A fatal condition (stack overflow, incompatible driver) was observed.
    Error,
}

/// Errors the bridge can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeError {
    /// The target device is already claimed by another owner.
    DeviceBusy,
    /// No such device exists in the registry.
    DeviceNotFound,
    /// `check_compatibility` returned one of the outcomes §4.F says must
    /// fail the attach.
    DriverIncompatible,
    /// The envelope observed a fatal condition (stack overflow) during
    /// attach-time validation.
    IsrUnsafe,
    /// `handle_interrupt` refused to dispatch: nesting would exceed
    /// [`MAX_ISR_NESTING`].
    IsrReentrant,
    /// `handle_interrupt` observed a corrupted stack canary on exit; the
    /// bridge transitions to [`BridgeState::Error`].
    IsrStackOverflow,
    /// The driver reported no packet available for `receive`.
    NoData,
    /// `dispatch_api` was called with a function code the bridge does not
    /// route.
    UnsupportedFunction,
    /// The operation is not valid in the bridge's current state.
    InvalidState,
}

impl core::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::DeviceBusy => f.write_str("device already claimed by another owner"),
            Self::DeviceNotFound => f.write_str("no such device in the registry"),
            Self::DriverIncompatible => f.write_str("driver operations record failed compatibility check"),
            Self::IsrUnsafe => f.write_str("ISR safety validation failed during attach"),
            Self::IsrReentrant => f.write_str("ISR nesting exceeds the envelope's bound"),
            Self::IsrStackOverflow => f.write_str("ISR stack canary corrupted"),
            Self::NoData => f.write_str("no packet available"),
            Self::UnsupportedFunction => f.write_str("unsupported dispatcher function code"),
            Self::InvalidState => f.write_str("operation invalid in the bridge's current state"),
        }
    }
}

impl From<RegistryError> for BridgeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::DeviceBusy => Self::DeviceBusy,
            RegistryError::NoSuchDevice => Self::DeviceNotFound,
            RegistryError::AccessDenied => Self::DeviceBusy,
            RegistryError::RegistryFull => Self::DeviceNotFound,
        }
    }
}

/// The fixed set of function codes [`Bridge::dispatch_api`] routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionCode {
    /// Probe whether a matching device is present.
    Detect,
    /// Run (or re-run) the driver's `init_v1`.
    Init,
    /// Send one packet.
    Send,
    /// Poll for one received packet.
    Receive,
    /// Read driver statistics.
    Stats,
    /// Change the receive-mode filter.
    SetMode,
}

/// Parameters for one [`Bridge::dispatch_api`] call. Only the fields
/// relevant to `code` are consulted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ApiParams {
    /// Buffer pointer for `Send`/`Receive`.
    pub buffer: *mut u8,
    /// Buffer length (`Send`) or capacity (`Receive`).
    pub length: u16,
    /// Receive-mode value for `SetMode`.
    pub mode: u16,
}

// SAFETY: the raw pointer is only ever dereferenced by the driver the
// bridge is attached to, under the same single-threaded discipline as
// every other foreground call; `ApiParams` itself carries no aliasing.
unsafe impl Send for ApiParams {}

/// Outcome of a successful [`Bridge::dispatch_api`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiResult {
    /// `Detect`/`Init`/`SetMode` completed with no payload to return.
    Done,
    /// `Send` completed.
    Sent,
    /// `Receive` completed; the driver wrote `length` bytes into the
    /// caller's buffer.
    Received {
        /// Bytes written into the caller's buffer.
        length: u16,
    },
    /// `Stats` completed; the bridge's lifetime packet counter.
    Stats {
        /// Packets sent successfully since attach.
        packets_sent: u32,
    },
}

/// One attached device's bridge instance: the ISR envelope plus the
/// uniform operations surface over a [`DriverOperations`] record.
pub struct Bridge {
    state: BridgeState,
    ops: Option<DriverOperations>,
    ctx: isanic_driver_api::DriverContext,
    init_context: *const u8,
    registry_id: Option<u32>,
    owner: u32,
    isr: IsrState,
    packets_sent: u32,
}

impl Bridge {
    /// Creates an unattached bridge. `owner` is the identifier this bridge
    /// presents to the registry when claiming a device (stable for the
    /// bridge's lifetime).
    #[must_use]
    pub const fn new(owner: u32) -> Self {
        Self {
            state: BridgeState::Uninitialized,
            ops: None,
            ctx: core::ptr::null_mut(),
            init_context: core::ptr::null(),
            registry_id: None,
            owner,
            isr: IsrState::new(),
            packets_sent: 0,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> BridgeState {
        self.state
    }

    /// ISR bookkeeping: nesting level, lock bit, counts, and durations.
    #[must_use]
    pub const fn isr_state(&self) -> &IsrState {
        &self.isr
    }

    /// Lifetime count of packets sent successfully.
    #[must_use]
    pub const fn packets_sent(&self) -> u32 {
        self.packets_sent
    }

    /// The registry id this bridge is attached to, if any. Used by the
    /// entry dispatcher to route a function call to the right bridge.
    #[must_use]
    pub const fn registry_id(&self) -> Option<u32> {
        self.registry_id
    }

    /// Attaches this bridge to `device_id`: claims and verifies the device
    /// in `registry`, checks `ops` against `required_version`/
    /// `required_features`, calls the driver's `init_v1`, and transitions
    /// to [`BridgeState::Active`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::DeviceBusy`]/[`BridgeError::DeviceNotFound`]
    /// if the registry claim fails, [`BridgeError::DriverIncompatible`] if
    /// `ops.check_compatibility` fails the attach (§4.F: only
    /// `Incompatible`, `TooOld`, `TooNew`, `MissingFeatures` do), or
    /// [`BridgeError::InvalidState`] if this bridge is already attached.
    ///
    /// # Safety
    ///
    /// `ctx` and `init_context` must be valid for the calls `ops.init`
    /// makes with them; they are the same contract `ops.init` itself
    /// documents at the C ABI boundary.
    #[allow(clippy::missing_panics_doc)]
    pub unsafe fn attach(
        &mut self,
        registry: &mut Registry,
        device_id: u32,
        ops: DriverOperations,
        required_version: u16,
        required_features: Features,
        ctx: isanic_driver_api::DriverContext,
        init_context: *const u8,
    ) -> Result<(), BridgeError> {
        if self.state != BridgeState::Uninitialized {
            return Err(BridgeError::InvalidState);
        }
        self.state = BridgeState::Initializing;

        let compat = ops.check_compatibility(required_version, required_features);
        if compat.fails_attach() {
            self.state = BridgeState::Error;
            return Err(BridgeError::DriverIncompatible);
        }

        registry.claim(device_id, self.owner)?;
        let init_result =
            // SAFETY: forwarded from the caller's contract above.
            unsafe { (ops.init)(ctx, init_context) };
        if init_result != 0 {
            let _ = registry.release(device_id, self.owner);
            self.state = BridgeState::Error;
            return Err(BridgeError::DriverIncompatible);
        }
        registry.verify(device_id, self.owner)?;

        self.ops = Some(ops);
        self.ctx = ctx;
        self.init_context = init_context;
        self.registry_id = Some(device_id);
        self.state = BridgeState::Active;
        Ok(())
    }

    /// Reports the compatibility outcome an `attach` call with these
    /// arguments would observe, without performing it. Useful for a
    /// dry-run / diagnostic path.
    #[must_use]
    pub fn check_compatibility(ops: &DriverOperations, required_version: u16, required_features: Features) -> Compatibility {
        ops.check_compatibility(required_version, required_features)
    }

    fn active_ops(&self) -> Result<&DriverOperations, BridgeError> {
        if self.state != BridgeState::Active {
            return Err(BridgeError::InvalidState);
        }
        self.ops.as_ref().ok_or(BridgeError::InvalidState)
    }

    /// Sends `length` bytes from `buffer` through the attached driver.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidState`] if this bridge is not
    /// [`BridgeState::Active`], or propagates the driver's own failure as
    /// [`BridgeError::InvalidState`] (the driver's negative return codes
    /// are opaque to the bridge by design — only the registry/envelope
    /// outcomes get a dedicated variant).
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for reads of `length` bytes.
    pub unsafe fn send(&mut self, buffer: *const u8, length: u16) -> Result<(), BridgeError> {
        let ops = self.active_ops()?;
        // SAFETY: forwarded from the caller's contract above; `self.ctx`
        // was established by a prior successful `attach`.
        let result = unsafe { (ops.send_packet)(self.ctx, buffer, length) };
        if result != 0 {
            return Err(BridgeError::InvalidState);
        }
        self.packets_sent += 1;
        Ok(())
    }

    /// Polls the attached driver for one received packet into `buffer`
    /// (capacity `capacity` bytes).
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NoData`] when the driver reports no packet
    /// available, or [`BridgeError::InvalidState`] if this bridge is not
    /// active or the driver reports a hard failure.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for writes of `capacity` bytes.
    pub unsafe fn receive(&mut self, buffer: *mut u8, capacity: u16) -> Result<u16, BridgeError> {
        let ops = self.active_ops()?;
        let mut out_length: u16 = 0;
        // SAFETY: forwarded from the caller's contract above.
        let result = unsafe { (ops.receive_packet)(self.ctx, buffer, capacity, core::ptr::addr_of_mut!(out_length)) };
        match result {
            0 => Ok(out_length),
            1 => Err(BridgeError::NoData),
            _ => Err(BridgeError::InvalidState),
        }
    }

    /// Routes one extension/packet-driver API call to the attached driver.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnsupportedFunction`] for a code this bridge
    /// does not route (there is no such thing as an unknown
    /// [`FunctionCode`] value, but callers constructing one from a raw wire
    /// function code are expected to map unrecognized codes to this error
    /// before calling in); otherwise propagates [`Bridge::send`]/
    /// [`Bridge::receive`]'s errors.
    ///
    /// # Safety
    ///
    /// `params.buffer` must satisfy the same contract as the corresponding
    /// `send`/`receive` call for `code`.
    pub unsafe fn dispatch_api(&mut self, code: FunctionCode, params: ApiParams) -> Result<ApiResult, BridgeError> {
        match code {
            FunctionCode::Detect => {
                let ops = self.active_ops()?;
                // SAFETY: forwarded from the caller's contract above;
                // `self.ctx` was established by a prior successful `attach`.
                let result = unsafe { (ops.detect)(self.ctx) };
                if result != 0 {
                    return Err(BridgeError::InvalidState);
                }
                Ok(ApiResult::Done)
            }
            FunctionCode::Init => {
                let ops = self.active_ops()?;
                // SAFETY: forwarded from the caller's contract above;
                // `self.ctx`/`self.init_context` were established by a prior
                // successful `attach`, and re-running `init_v1` is the
                // documented way a caller re-initializes an active driver.
                let result = unsafe { (ops.init)(self.ctx, self.init_context) };
                if result != 0 {
                    return Err(BridgeError::InvalidState);
                }
                Ok(ApiResult::Done)
            }
            FunctionCode::SetMode => {
                let ops = self.active_ops()?;
                // SAFETY: forwarded from the caller's contract above.
                let result = unsafe { (ops.set_mode)(self.ctx, params.mode) };
                if result != 0 {
                    return Err(BridgeError::InvalidState);
                }
                Ok(ApiResult::Done)
            }
            FunctionCode::Send => {
                // SAFETY: forwarded from the caller's contract above.
                unsafe { self.send(params.buffer.cast_const(), params.length) }?;
                Ok(ApiResult::Sent)
            }
            FunctionCode::Receive => {
                // SAFETY: forwarded from the caller's contract above.
                let length = unsafe { self.receive(params.buffer, params.length) }?;
                Ok(ApiResult::Received { length })
            }
            FunctionCode::Stats => Ok(ApiResult::Stats { packets_sent: self.packets_sent }),
        }
    }

    /// Wraps one interrupt-context driver dispatch in the ISR safety
    /// envelope: enters, invokes `body`, exits, and folds the envelope's
    /// own observations together with whatever `body` returns.
    ///
    /// `body` must not allocate, log through a buffered sink, or touch
    /// policy state (§5): it may only call the driver's interrupt handler
    /// and fold its result into counters.
    ///
    /// `enter_tick` and `exit_tick` are independent samples of the
    /// free-running counter, taken immediately before and after `body`
    /// runs; passing the same tick for both makes every call read as
    /// zero-duration and defeats the slow-dispatch check below.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::IsrReentrant`] without calling `body` at all
    /// if nesting would exceed [`MAX_ISR_NESTING`]; returns
    /// [`BridgeError::IsrStackOverflow`] (mapped from
    /// [`IsrError::StackOverflow`]) if the stack canary was corrupted,
    /// transitioning this bridge to [`BridgeState::Error`]. A
    /// [`IsrError::Slow`] observation is not an error: `handle_interrupt`
    /// still returns `Ok`, with the slow flag folded into the returned
    /// bool.
    pub fn handle_interrupt(
        &mut self,
        enter_tick: u32,
        exit_tick: u32,
        canary_at_exit: u16,
        body: impl FnOnce(),
    ) -> Result<bool, BridgeError> {
        let start = self.isr.enter(enter_tick).map_err(|_| BridgeError::IsrReentrant)?;
        body();
        match self.isr.exit(start, exit_tick, canary_at_exit) {
            Ok(()) => Ok(false),
            Err(IsrError::Slow) => Ok(true),
            Err(IsrError::StackOverflow) => {
                self.state = BridgeState::Error;
                Err(BridgeError::IsrStackOverflow)
            }
            Err(IsrError::Reentrant) => unreachable!("exit never returns Reentrant"),
        }
    }

    /// Releases the claimed device and tears down this bridge, leaving it
    /// in [`BridgeState::Unloading`].
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::InvalidState`] if no device is claimed.
    pub fn detach(&mut self, registry: &mut Registry) -> Result<(), BridgeError> {
        let device_id = self.registry_id.ok_or(BridgeError::InvalidState)?;
        self.state = BridgeState::Unloading;
        registry.release(device_id, self.owner)?;
        if let Some(ops) = self.ops.take() {
            // SAFETY: `self.ctx` was established by a prior successful
            // `attach` and is valid until this call, its documented
            // lifetime end.
            unsafe { (ops.cleanup)(self.ctx) };
        }
        self.registry_id = None;
        self.ctx = core::ptr::null_mut();
        self.init_context = core::ptr::null();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isanic_registry::{BusLocation, BusTag, DeviceEntry};

    unsafe extern "C" fn ok_init(_ctx: isanic_driver_api::DriverContext, _init_context: *const u8) -> i32 {
        0
    }
    unsafe extern "C" fn failing_init(_ctx: isanic_driver_api::DriverContext, _init_context: *const u8) -> i32 {
        -1
    }
    unsafe extern "C" fn ok_send(_ctx: isanic_driver_api::DriverContext, _buffer: *const u8, _length: u16) -> i32 {
        0
    }
    unsafe extern "C" fn no_data_receive(
        _ctx: isanic_driver_api::DriverContext,
        _buffer: *mut u8,
        _capacity: u16,
        _out_length: *mut u16,
    ) -> i32 {
        1
    }
    unsafe extern "C" fn ok_receive(
        _ctx: isanic_driver_api::DriverContext,
        _buffer: *mut u8,
        _capacity: u16,
        out_length: *mut u16,
    ) -> i32 {
        // SAFETY: test stub; caller-provided pointer is valid per contract.
        unsafe { *out_length = 42 };
        0
    }
    unsafe extern "C" fn noop_cleanup(_ctx: isanic_driver_api::DriverContext) {}
    unsafe extern "C" fn ok_detect(_ctx: isanic_driver_api::DriverContext) -> i32 {
        0
    }
    unsafe extern "C" fn failing_detect(_ctx: isanic_driver_api::DriverContext) -> i32 {
        -1
    }
    unsafe extern "C" fn ok_set_mode(_ctx: isanic_driver_api::DriverContext, _mode: u16) -> i32 {
        0
    }

    fn ops(init: isanic_driver_api::InitFn) -> DriverOperations {
        DriverOperations {
            abi_version: 0x0100,
            min_required: 0x0100,
            max_supported: 0x0200,
            features: Features::BASIC,
            driver_name: "test-nic",
            vendor_name: "test-vendor",
            init,
            send_packet: ok_send,
            receive_packet: no_data_receive,
            cleanup: noop_cleanup,
            detect: ok_detect,
            set_mode: ok_set_mode,
        }
    }

    fn entry() -> DeviceEntry {
        DeviceEntry {
            vendor_id: 0x10EC,
            device_id: 0x8029,
            bus_tag: BusTag::LegacyIsa,
            io_base: 0x300,
            irq: 10,
            location: None,
            mac: None,
        }
    }

    #[test]
    fn attach_claims_verifies_and_activates() {
        let mut reg = Registry::new();
        let id = reg.add(entry()).unwrap();
        let mut bridge = Bridge::new(1);
        // SAFETY: stub init/cleanup take no real pointers.
        unsafe {
            bridge
                .attach(&mut reg, id, ops(ok_init), 0x0100, Features::BASIC, core::ptr::null_mut(), core::ptr::null())
                .unwrap();
        }
        assert_eq!(bridge.state(), BridgeState::Active);
        assert!(reg.is_verified(id));
    }

    #[test]
    fn attach_fails_on_device_busy() {
        let mut reg = Registry::new();
        let id = reg.add(entry()).unwrap();
        reg.claim(id, 99).unwrap();
        let mut bridge = Bridge::new(1);
        // SAFETY: stub init/cleanup take no real pointers.
        let result = unsafe {
            bridge.attach(&mut reg, id, ops(ok_init), 0x0100, Features::BASIC, core::ptr::null_mut(), core::ptr::null())
        };
        assert_eq!(result, Err(BridgeError::DeviceBusy));
        assert_eq!(bridge.state(), BridgeState::Initializing);
    }

    #[test]
    fn attach_fails_on_incompatible_driver() {
        let mut reg = Registry::new();
        let id = reg.add(entry()).unwrap();
        let mut bridge = Bridge::new(1);
        // SAFETY: stub init/cleanup take no real pointers.
        let result = unsafe {
            bridge.attach(
                &mut reg,
                id,
                ops(ok_init),
                0x0300,
                Features::BASIC,
                core::ptr::null_mut(),
                core::ptr::null(),
            )
        };
        assert_eq!(result, Err(BridgeError::DriverIncompatible));
        assert_eq!(bridge.state(), BridgeState::Error);
        assert!(!reg.is_claimed(id));
    }

    #[test]
    fn attach_releases_claim_when_driver_init_fails() {
        let mut reg = Registry::new();
        let id = reg.add(entry()).unwrap();
        let mut bridge = Bridge::new(1);
        // SAFETY: stub init/cleanup take no real pointers.
        let result = unsafe {
            bridge.attach(
                &mut reg,
                id,
                ops(failing_init),
                0x0100,
                Features::BASIC,
                core::ptr::null_mut(),
                core::ptr::null(),
            )
        };
        assert_eq!(result, Err(BridgeError::DriverIncompatible));
        assert!(!reg.is_claimed(id));
    }

    fn active_bridge(reg: &mut Registry, receive: isanic_driver_api::ReceivePacketFn) -> (Bridge, u32) {
        let id = reg.add(entry()).unwrap();
        let mut bridge = Bridge::new(1);
        let mut o = ops(ok_init);
        o.receive_packet = receive;
        // SAFETY: stub init/cleanup take no real pointers.
        unsafe {
            bridge.attach(reg, id, o, 0x0100, Features::BASIC, core::ptr::null_mut(), core::ptr::null()).unwrap();
        }
        (bridge, id)
    }

    #[test]
    fn send_increments_packet_counter() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        // SAFETY: null buffer, length 0, accepted by the stub.
        unsafe { bridge.send(core::ptr::null(), 0).unwrap() };
        assert_eq!(bridge.packets_sent(), 1);
    }

    #[test]
    fn receive_reports_no_data() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        let mut buf = [0u8; 4];
        // SAFETY: buffer is a valid, appropriately sized local array.
        let result = unsafe { bridge.receive(buf.as_mut_ptr(), 4) };
        assert_eq!(result, Err(BridgeError::NoData));
    }

    #[test]
    fn receive_returns_driver_length() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, ok_receive);
        let mut buf = [0u8; 64];
        // SAFETY: buffer is a valid, appropriately sized local array.
        let result = unsafe { bridge.receive(buf.as_mut_ptr(), 64) };
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn dispatch_api_stats_reports_packet_count() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        // SAFETY: null buffer, length 0, accepted by the stub.
        unsafe { bridge.send(core::ptr::null(), 0).unwrap() };
        // SAFETY: Stats ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::Stats, ApiParams::default()) };
        assert_eq!(result, Ok(ApiResult::Stats { packets_sent: 1 }));
    }

    #[test]
    fn dispatch_api_detect_reaches_the_driver() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        // SAFETY: Detect ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::Detect, ApiParams::default()) };
        assert_eq!(result, Ok(ApiResult::Done));
    }

    #[test]
    fn dispatch_api_detect_propagates_driver_failure() {
        let mut reg = Registry::new();
        let id = reg.add(entry()).unwrap();
        let mut bridge = Bridge::new(1);
        let mut o = ops(ok_init);
        o.detect = failing_detect;
        // SAFETY: stub init/cleanup take no real pointers.
        unsafe {
            bridge.attach(&mut reg, id, o, 0x0100, Features::BASIC, core::ptr::null_mut(), core::ptr::null()).unwrap();
        }
        // SAFETY: Detect ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::Detect, ApiParams::default()) };
        assert_eq!(result, Err(BridgeError::InvalidState));
    }

    #[test]
    fn dispatch_api_init_re_runs_the_driver_init_entry() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        // SAFETY: Init ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::Init, ApiParams::default()) };
        assert_eq!(result, Ok(ApiResult::Done));
    }

    #[test]
    fn dispatch_api_set_mode_reaches_the_driver() {
        let mut reg = Registry::new();
        let (mut bridge, _id) = active_bridge(&mut reg, no_data_receive);
        let params = ApiParams { mode: 3, ..ApiParams::default() };
        // SAFETY: SetMode ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::SetMode, params) };
        assert_eq!(result, Ok(ApiResult::Done));
    }

    #[test]
    fn dispatch_api_on_uninitialized_bridge_is_invalid_state() {
        let mut bridge = Bridge::new(1);
        // SAFETY: Detect ignores the buffer field entirely.
        let result = unsafe { bridge.dispatch_api(FunctionCode::Detect, ApiParams::default()) };
        assert_eq!(result, Err(BridgeError::InvalidState));
    }

    #[test]
    fn detach_releases_registry_claim() {
        let mut reg = Registry::new();
        let (mut bridge, id) = active_bridge(&mut reg, no_data_receive);
        bridge.detach(&mut reg).unwrap();
        assert_eq!(bridge.state(), BridgeState::Unloading);
        assert!(!reg.is_claimed(id));
    }

    #[test]
    fn handle_interrupt_completes_without_slow_flag_at_zero_elapsed() {
        let mut bridge = Bridge::new(1);
        let slow = bridge.handle_interrupt(0, 0, STACK_CANARY, || {}).unwrap();
        assert!(!slow);
        assert_eq!(bridge.isr_state().total_count(), 1);
    }

    #[test]
    fn handle_interrupt_reports_stack_overflow_and_enters_error_state() {
        let mut bridge = Bridge::new(1);
        let result = bridge.handle_interrupt(0, 0, !STACK_CANARY, || {});
        assert_eq!(result, Err(BridgeError::IsrStackOverflow));
        assert_eq!(bridge.state(), BridgeState::Error);
    }

    #[test]
    fn handle_interrupt_raises_slow_flag_past_threshold() {
        let mut bridge = Bridge::new(1);
        let slow = bridge
            .handle_interrupt(0, ISR_SLOW_THRESHOLD_US + 1, STACK_CANARY, || {})
            .unwrap();
        assert!(slow);
        assert_eq!(bridge.isr_state().last_duration_us(), ISR_SLOW_THRESHOLD_US + 1);
    }

    #[test]
    fn isr_envelope_nesting_bound_matches_bridge_constant() {
        let mut isr = IsrState::new();
        isr.enter(0).unwrap();
        isr.enter(0).unwrap();
        isr.enter(0).unwrap();
        assert_eq!(isr.enter(0), Err(IsrError::Reentrant));
        assert_eq!(isr.nesting_level(), MAX_ISR_NESTING);
    }
}
