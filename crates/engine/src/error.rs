//! Error types for the engine gateway.

use keywell_core::EngineKind;
use serde::{Deserialize, Serialize};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// A well-formed error returned by the remote engine process.
///
/// Carried verbatim across the wire and surfaced verbatim to the caller; the
/// session stays usable after one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    /// The engine's error message.
    pub message: String,
}

impl RemoteError {
    /// Build a remote error from any displayable value.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors from opening or driving an engine session.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine identifier is not in the closed builtin registry.
    #[error("unknown engine '{kind}': custom engines are not supported")]
    UnknownEngine {
        /// The unrecognized identifier.
        kind: EngineKind,
    },

    /// The engine child process failed to start.
    #[error("failed to start engine process '{program}'")]
    ProcessStart {
        /// The program that failed to spawn.
        program: String,
        /// The spawn failure.
        #[source]
        source: std::io::Error,
    },

    /// The version/identity handshake failed.
    #[error("engine handshake failed: {reason}")]
    Handshake {
        /// Why the handshake was rejected.
        reason: String,
    },

    /// The transport to the engine process shut down (EOF, broken pipe,
    /// process exit). Permanently fatal to the session.
    #[error("engine transport closed")]
    TransportClosed,

    /// The engine announced its own shutdown. Permanently fatal to the
    /// session.
    #[error("engine announced shutdown")]
    PluginShutdown,

    /// The engine returned a well-formed error; surfaced verbatim.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A malformed frame or an out-of-protocol reply.
    #[error("engine wire protocol violation: {reason}")]
    Protocol {
        /// What was wrong with the frame.
        reason: String,
    },
}

impl EngineError {
    /// Whether this error means the session is dead and must be replaced.
    ///
    /// Callers never retry on the same handle; the connection registry
    /// replaces it on the next lookup.
    #[must_use]
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::TransportClosed | Self::PluginShutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_lost_classification() {
        assert!(EngineError::TransportClosed.is_connection_lost());
        assert!(EngineError::PluginShutdown.is_connection_lost());
        assert!(!EngineError::Remote(RemoteError::new("boom")).is_connection_lost());
        assert!(
            !EngineError::Handshake {
                reason: "bad token".into()
            }
            .is_connection_lost()
        );
    }

    #[test]
    fn remote_error_is_verbatim() {
        let err = EngineError::Remote(RemoteError::new("relation does not exist"));
        assert_eq!(err.to_string(), "relation does not exist");
    }
}
