//! # Keywell Storage
//!
//! The storage boundary for the keywell broker: a small key/value trait
//! ([`StorageBackend`]), JSON entry helpers, and an in-memory backend for
//! tests and embedders. The production backend is supplied by the mount
//! framework above this workspace.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The storage trait, error type, and JSON helpers.
pub mod backend;
/// In-memory backend.
pub mod memory;

pub use backend::{Result, StorageBackend, StorageError, get_json, put_json};
pub use memory::MemoryStorage;
