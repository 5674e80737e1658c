//! Entry dispatcher (component H): the single software-interrupt vector a
//! loaded image exposes to callers.
//!
//! On entry the real build saves registers, switches onto the private
//! stack reserved past the image's end, routes the call by function code,
//! switches back, and returns via IRET. This crate owns the routing table
//! and the stack switch; it carries no policy of its own, matching the
//! narrow-bottleneck role §4.H describes — the standard packet-driver API
//! range goes to a device's [`isanic_bridge::Bridge`], and the DMA-policy
//! extension range goes straight to the policy record.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod dispatch;
pub mod stack;

pub use dispatch::{dispatch_extension, DispatchError, Dispatcher, ExtensionFunction, ExtensionResult};
pub use stack::PrivateStack;
