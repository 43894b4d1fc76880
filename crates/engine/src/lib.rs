//! # Keywell Engine
//!
//! The RPC plugin gateway: each configured database is driven by an
//! isolated engine process speaking a private newline-delimited JSON
//! protocol over stdio. This crate owns the wire format, the broker-side
//! session ([`PluginClient`]), the engine-side serve loop ([`serve`]), and
//! the closed registry of supported engines.
//!
//! Sessions are strictly synchronous: one request in flight, ever. A dead
//! process surfaces as one of two permanently fatal sentinels,
//! [`EngineError::TransportClosed`] or [`EngineError::PluginShutdown`],
//! which the connection registry (in `keywell-broker`) uses to retire the
//! handle. Nothing in this crate retries.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Broker-side session.
pub mod client;
/// The [`Database`] trait implemented by concrete engines.
pub mod database;
/// Error types.
pub mod error;
/// Wire protocol frames and framing.
pub mod proto;
/// Closed engine registry and the open façade.
pub mod registry;
/// Engine-side serve loop.
pub mod server;

pub use client::PluginClient;
pub use database::Database;
pub use error::{EngineError, RemoteError, Result};
pub use proto::{CAPABILITY_TOKEN, PROTOCOL_VERSION};
pub use registry::{EngineRegistry, EngineSpec, Gateway};
pub use server::{announce_shutdown, serve};
