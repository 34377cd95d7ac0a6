//! Device command channel for the rigline pipeline engine.
//!
//! The engine drives a remote device rig over a persistent connection whose
//! transport lives outside this workspace. This crate specifies the message
//! contract on that connection ([`protocol`]) and provides the
//! [`CommandDispatcher`]: it turns a resolved command string into a completed
//! output string by correlating outgoing requests with asynchronous
//! responses, enforcing a per-call timeout, and honoring cooperative
//! cancellation.
//!
//! ## Design
//!
//! - `DeviceTransport`: the seam the external transport implements, a
//!   single `send` for outgoing frames. Incoming frames are pushed into the
//!   dispatcher through a channel, keeping this crate free of socket code.
//! - `CommandDispatcher`: owns a pending-request table keyed by generated
//!   correlation ids. A background router task drains incoming frames and
//!   resolves the matching caller. Every exit path (success, timeout,
//!   cancellation, transport failure) removes its table entry, so a long
//!   pipeline never accumulates dangling listeners.
//! - `DevicePort`: the consumer-facing trait the engine executes against,
//!   with an offline `EchoPort` for previews and tests.

pub mod dispatch;
pub mod error;
pub mod port;
pub mod protocol;

pub use dispatch::{CommandDispatcher, DeviceTransport};
pub use error::ChannelError;
pub use port::{DevicePort, EchoPort};
pub use protocol::{CommandRequest, ImageMatchRequest, ImageMatchResult, IncomingMessage, OutgoingMessage};
