//! Error types for the broker backend.

use keywell_core::{ConnectionName, NameError, RoleName, TtlError};
use keywell_engine::EngineError;
use keywell_identity::IdentityError;
use keywell_storage::StorageError;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by the broker's management and issuance surface.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// No configuration exists for the named connection.
    #[error("unknown connection '{name}'")]
    UnknownConnection {
        /// The connection that was asked for.
        name: ConnectionName,
    },

    /// No role (stored or derivable) exists under the given name.
    #[error("unknown role '{name}'")]
    UnknownRole {
        /// The role that was asked for.
        name: RoleName,
    },

    /// A derived role name does not have the required shape.
    #[error(
        "derived role name '{name}' is malformed; must be k8s_<role>_<namespace>_<identity-name>"
    )]
    MalformedDerivedRole {
        /// The malformed name.
        name: String,
    },

    /// A caller-supplied value failed validation.
    #[error("invalid {what}: {reason}")]
    Validation {
        /// Which input was rejected.
        what: &'static str,
        /// Why.
        reason: String,
    },

    /// A name failed validation.
    #[error(transparent)]
    Name(#[from] NameError),

    /// A TTL pair failed validation.
    #[error(transparent)]
    Ttl(#[from] TtlError),

    /// Durable storage failed; fatal to the current operation.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The engine gateway failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// The identity reconciler failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),
}

impl BrokerError {
    /// Whether a retry of the same call can be expected to succeed.
    ///
    /// True exactly for connection-lost engine failures: the registry
    /// replaces the dead handle asynchronously, so a subsequent call
    /// rebuilds the connection.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Engine(err) if err.is_connection_lost())
    }

    /// Whether this is the caller's mistake rather than a broker fault.
    #[must_use]
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownConnection { .. }
                | Self::UnknownRole { .. }
                | Self::MalformedDerivedRole { .. }
                | Self::Validation { .. }
                | Self::Name(_)
                | Self::Ttl(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(BrokerError::Engine(EngineError::TransportClosed).is_retryable());
        assert!(BrokerError::Engine(EngineError::PluginShutdown).is_retryable());
        assert!(
            !BrokerError::Engine(EngineError::Remote(keywell_engine::RemoteError::new("x")))
                .is_retryable()
        );
    }

    #[test]
    fn user_error_classification() {
        let err = BrokerError::MalformedDerivedRole {
            name: "k8s_rw".to_string(),
        };
        assert!(err.is_user_error());
        assert!(!err.is_retryable());
    }
}
