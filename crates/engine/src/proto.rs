//! The private wire protocol between the broker and an engine process.
//!
//! Frames are newline-delimited JSON over the child's stdio. A session is a
//! handshake followed by strictly synchronous request/response pairs; there
//! is never more than one request in flight.

use keywell_core::{EngineKind, StatementSet};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{EngineError, RemoteError, Result};

/// Protocol version spoken by this build. Bumped on any incompatible frame
/// change; both sides refuse a mismatch during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Fixed capability token proving the spawned binary is a keywell engine
/// and not an arbitrary program that happens to be on the path.
pub const CAPABILITY_TOKEN: &str = "keywell-engine-proto";

/// First frame, client → engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol version the client speaks.
    pub protocol_version: u32,
    /// Must equal [`CAPABILITY_TOKEN`].
    pub capability_token: String,
}

/// Handshake reply, engine → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Protocol version the engine speaks.
    pub protocol_version: u32,
    /// The engine identifying itself.
    pub engine: EngineKind,
}

/// One engine operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Configure the engine with connection details; optionally verify by
    /// connecting.
    Initialize {
        /// Engine-specific connection details (DSN, credentials, ...).
        config: Map<String, Value>,
        /// Whether to prove connectivity before answering.
        verify: bool,
    },
    /// Execute rendered creation statements for a new user.
    CreateUser {
        /// Statement templates; the engine renders `{{name}}` etc. itself.
        statements: StatementSet,
        /// Username to create.
        username: String,
        /// Password to assign.
        password: String,
        /// Formatted expiration instant.
        expiration: String,
    },
    /// Extend an existing user's expiration.
    RenewUser {
        /// Statement templates.
        statements: StatementSet,
        /// Username to renew.
        username: String,
        /// New formatted expiration instant.
        expiration: String,
    },
    /// Remove an existing user.
    RevokeUser {
        /// Statement templates.
        statements: StatementSet,
        /// Username to revoke.
        username: String,
    },
    /// Produce a username for the given display name and role.
    GenerateUsername {
        /// Requesting client's display name.
        display_name: String,
        /// Role the credential is for.
        role: String,
    },
    /// Produce a random password.
    GeneratePassword,
    /// Produce a formatted expiration `ttl_secs` from now.
    GenerateExpiration {
        /// TTL in seconds.
        ttl_secs: u64,
    },
    /// Report the engine kind.
    Kind,
    /// Terminate the session. The engine answers, then exits its serve loop.
    Close,
}

/// A request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Round-trip correlation id; echoed in the reply.
    pub id: u64,
    /// The operation to perform.
    pub op: Operation,
}

/// Successful operation payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "value", rename_all = "snake_case")]
pub enum OpResult {
    /// Operation with no payload.
    Unit,
    /// A generated username.
    Username {
        /// The username.
        username: String,
    },
    /// A generated password.
    Password {
        /// The password.
        password: String,
    },
    /// A formatted expiration.
    Expiration {
        /// The expiration string.
        expiration: String,
    },
    /// The engine kind.
    Kind {
        /// The engine identifier.
        kind: EngineKind,
    },
}

/// Reply frames, engine → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The operation succeeded.
    Result {
        /// Correlation id of the request being answered.
        id: u64,
        /// The payload.
        result: OpResult,
    },
    /// The operation failed inside the engine; the session stays usable.
    Error {
        /// Correlation id of the request being answered.
        id: u64,
        /// The engine's error, surfaced verbatim.
        error: RemoteError,
    },
    /// The engine is terminating (signal, fatal internal error). Anything
    /// in flight is lost and the session is dead.
    Shutdown {
        /// Why the engine is going away.
        reason: String,
    },
}

/// Write one frame. IO failure means the transport is gone.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut frame = serde_json::to_vec(message).map_err(|err| EngineError::Protocol {
        reason: format!("failed to encode frame: {err}"),
    })?;
    frame.push(b'\n');
    writer
        .write_all(&frame)
        .await
        .map_err(|_| EngineError::TransportClosed)?;
    writer.flush().await.map_err(|_| EngineError::TransportClosed)?;
    Ok(())
}

/// Read one frame. `Ok(None)` means clean EOF.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin + ?Sized,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|_| EngineError::TransportClosed)?;
    if read == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line.trim_end()).map_err(|err| EngineError::Protocol {
        reason: format!("malformed frame: {err}"),
    })?;
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frames_cross_a_buffer() {
        let request = Request {
            id: 7,
            op: Operation::GenerateUsername {
                display_name: "token".into(),
                role: "rw".into(),
            },
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &request).await.unwrap();
        assert!(buf.ends_with(b"\n"));

        let mut reader = buf.as_slice();
        let decoded: Request = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, request);

        // Nothing left; clean EOF.
        let eof: Option<Request> = read_message(&mut reader).await.unwrap();
        assert_eq!(eof, None);
    }

    #[tokio::test]
    async fn malformed_frame_is_a_protocol_error() {
        let mut reader: &[u8] = b"{not json}\n";
        let err = read_message::<Request, _>(&mut reader).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol { .. }));
    }

    #[test]
    fn operation_tag_is_stable() {
        let json = serde_json::to_value(Operation::GeneratePassword).unwrap();
        assert_eq!(json, serde_json::json!({"op": "generate_password"}));
    }

    #[test]
    fn shutdown_frame_shape() {
        let json = serde_json::to_value(ServerMessage::Shutdown {
            reason: "sigterm".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "shutdown", "reason": "sigterm"})
        );
    }
}
