//! # Keywell Identity
//!
//! Reconciles an external, watched collection of namespaced identity
//! objects against durable storage:
//!
//! - a **watch loop** mirrors the collection into an in-memory
//!   [`IdentityCache`] (list, then deltas, with a periodic full resync);
//! - a **reconciliation pass** ([`sync_identities`]) copies annotated
//!   objects into durable records and deletes records no longer backed by
//!   one, using survivor-set semantics;
//! - a **fallback read path** ([`annotation_for`]) serves derived-role
//!   resolution from the cache when warm and from storage when not.
//!
//! Annotation values are gated by a restrictive identifier pattern before
//! they can ever reach a rendered statement.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The in-memory mirror of the watched collection.
pub mod cache;
/// Source connection configuration.
pub mod config;
/// Error types.
pub mod error;
/// Identity objects and annotation extraction.
pub mod object;
/// The reconciliation pass and fallback reads.
pub mod reconciler;
/// The list+watch boundary.
pub mod source;
/// The watch loop.
pub mod watcher;

pub use cache::IdentityCache;
pub use config::{
    DEFAULT_DATABASE_ANNOTATION, DEFAULT_ROLE_ANNOTATION, IDENTITY_RECORD_PREFIX,
    SOURCE_CONFIG_KEY, SourceConfig,
};
pub use error::{IdentityError, Result};
pub use object::{ANNOTATION_PATTERN, DEFAULT_NAMESPACE, IdentityObject, cache_key};
pub use reconciler::{SyncSummary, annotation_for, sync_identities};
pub use source::{EventStream, HttpIdentitySource, IdentityList, IdentitySource, WatchEvent};
pub use watcher::{IdentityWatcher, WatcherConfig};
