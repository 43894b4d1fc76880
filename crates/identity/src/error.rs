//! Error types for the identity reconciler.

use keywell_storage::StorageError;

/// Result type for identity operations.
pub type Result<T> = std::result::Result<T, IdentityError>;

/// Errors from watching or reconciling the external identity source.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// An annotation value was non-empty but failed the identifier pattern.
    ///
    /// This is a hard error for the object that carried it, never silently
    /// interpolated. The reconciliation pass logs it and moves on.
    #[error("annotation value {value:?} on '{object}' does not match pattern {pattern}")]
    AnnotationPattern {
        /// Cache key of the offending object.
        object: String,
        /// The rejected value.
        value: String,
        /// The pattern it failed.
        pattern: &'static str,
    },

    /// The identity source configuration is unusable.
    #[error("invalid identity source config: {reason}")]
    Config {
        /// What is wrong with it.
        reason: String,
    },

    /// A request to the identity source failed.
    #[error("identity source request failed: {reason}")]
    Source {
        /// What failed.
        reason: String,
        /// The transport failure, when there was one.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Durable storage failed. Fatal to the operation that hit it.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl IdentityError {
    pub(crate) fn source_err(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }
}
