//! The durable storage boundary.
//!
//! The surrounding mount framework supplies the real backend; everything in
//! this workspace talks to it through [`StorageBackend`]. Per-key
//! durability is assumed; cross-key transactions are not.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors crossing the storage boundary.
///
/// Every variant is fatal to the operation that hit it; callers never
/// silently ignore one (the sole sanctioned exception is close-error
/// swallowing during connection teardown, which never touches storage).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A read failed.
    #[error("storage read failed for key '{key}'")]
    Read {
        /// The key being read.
        key: String,
        /// The backend failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A write failed.
    #[error("storage write failed for key '{key}'")]
    Write {
        /// The key being written.
        key: String,
        /// The backend failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A delete failed.
    #[error("storage delete failed for key '{key}'")]
    Delete {
        /// The key being deleted.
        key: String,
        /// The backend failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A prefix listing failed.
    #[error("storage list failed for prefix '{prefix}'")]
    List {
        /// The prefix being listed.
        prefix: String,
        /// The backend failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A stored entry could not be decoded.
    #[error("failed to decode stored entry at '{key}'")]
    Decode {
        /// The key whose value failed to decode.
        key: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },
    /// An entry could not be encoded for storage.
    #[error("failed to encode entry for '{key}'")]
    Encode {
        /// The key whose value failed to encode.
        key: String,
        /// The encode failure.
        #[source]
        source: serde_json::Error,
    },
}

/// Key/value storage with per-key durability.
///
/// `list` returns every key under `prefix` with the prefix stripped; the
/// remainder may itself contain `/` separators (deep listing). The identity
/// reconciler's deletion pass depends on that.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the value at `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Durably write `value` at `key`, replacing any existing value.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Delete the value at `key`. Deleting an absent key is a no-op.
    async fn delete(&self, key: &str) -> Result<()>;

    /// All keys under `prefix`, prefix-stripped, in unspecified order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and JSON-decode the entry at `key`.
pub async fn get_json<T: DeserializeOwned>(
    storage: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>> {
    let Some(bytes) = storage.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes).map_err(|source| StorageError::Decode {
        key: key.to_string(),
        source,
    })?;
    Ok(Some(value))
}

/// JSON-encode `value` and write it at `key`.
pub async fn put_json<T: Serialize>(
    storage: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    storage.put(key, bytes).await
}
