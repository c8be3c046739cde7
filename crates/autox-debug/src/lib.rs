//! Remote debug control for autox script executions.
//!
//! An interpreter calls [`DebugPointRegistry::check_for_debug_point`] before executing each
//! location. When the location is a registered [`DebugPoint`], the calling thread is parked in
//! a [`LivePausePoint`] and a debugger connected through [`DebugServer`] can inspect the
//! execution context, run ad-hoc steps, evaluate expressions and step onwards.
//!
//! [`DebugPoint`]: autox_debug_proto::DebugPoint

pub mod bootstrap;
pub mod client;
pub mod context;
pub mod error;
pub mod handlers;
pub mod hardening;
pub mod live_point;
pub mod outbox;
pub mod registry;
pub mod server;

pub use crate::client::{ClientEvent, ClientOptions, ConfirmationOutcome, DebugClient};
pub use crate::context::{DebugHost, ExecutionContext};
pub use crate::error::{DebugError, DebugResult};
pub use crate::live_point::{LivePausePoint, PausePhase};
pub use crate::registry::DebugPointRegistry;
pub use crate::server::{DebugConnection, DebugServer};
