//! # Keywell Broker
//!
//! The credential broker backend: a connection registry keeping at most one
//! live engine session per configured database, a priority-ordered rotation
//! scheduler for static credentials, role storage and resolution (including
//! identity-derived roles), and the management surface the surrounding
//! request-routing framework calls into.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The backend composition root and management surface.
pub mod backend;
/// Durable connection configuration.
pub mod config;
/// Error types.
pub mod error;
/// The live connection registry.
pub mod registry;
/// Role resolution, including derived roles.
pub mod resolver;
/// Durable role records.
pub mod roles;
/// Static-credential rotation scheduling.
pub mod rotation;

pub use backend::{Backend, BackendConfig, IssuedCredentials};
pub use config::{CONNECTION_CONFIG_PREFIX, ConnectionConfig};
pub use error::{BrokerError, Result};
pub use registry::{ConnectionHandle, ConnectionRegistry, GatewayOpener, SessionOpener};
pub use resolver::{DERIVED_ROLE_PREFIX, DerivedRoleParts, parse_derived_role};
pub use roles::{
    MIN_ROTATION_PERIOD, ROLE_PREFIX, RoleEntry, RoleStore, STATIC_ROLE_PREFIX, StaticRoleEntry,
};
pub use rotation::{
    LockShards, RotationConfig, RotationEntry, RotationOutcome, RotationQueue, RotationScheduler,
};
