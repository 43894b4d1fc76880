//! Broker-side engine session.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use keywell_core::{EngineKind, StatementSet};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::proto::{
    CAPABILITY_TOKEN, HandshakeRequest, HandshakeResponse, OpResult, Operation, PROTOCOL_VERSION,
    Request, ServerMessage, read_message, write_message,
};
use crate::registry::EngineSpec;

type BoxedReader = Box<dyn AsyncBufRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A live session with one engine process.
///
/// All operations are synchronous request/response round-trips serialized by
/// an internal lock; a hung engine blocks its caller until the transport
/// itself fails. Once a call reports a connection-lost error the session is
/// permanently dead; the connection registry replaces it, never this type.
pub struct PluginClient {
    kind: EngineKind,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SessionState,
    child: Option<Child>,
}

enum SessionState {
    Open {
        reader: BoxedReader,
        writer: BoxedWriter,
        next_id: u64,
    },
    /// The session died. `announced` distinguishes the engine saying goodbye
    /// from the transport just going away.
    Lost {
        announced: bool,
    },
    Closed,
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl PluginClient {
    /// Spawn the engine process described by `spec` and perform the
    /// handshake.
    pub async fn open(spec: &EngineSpec) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| EngineError::ProcessStart {
            program: spec.program.display().to_string(),
            source,
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::Handshake {
                reason: "engine process stdio was not piped".into(),
            });
        };

        debug!(engine = %spec.kind, program = %spec.program.display(), "spawned engine process");
        Self::establish(
            Box::new(BufReader::new(stdout)),
            Box::new(stdin),
            Some(child),
        )
        .await
    }

    /// Establish a session over an arbitrary transport (tests drive this
    /// with an in-process duplex stream against [`serve`](crate::serve)).
    pub async fn connect<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::establish(Box::new(BufReader::new(reader)), Box::new(writer), None).await
    }

    async fn establish(
        mut reader: BoxedReader,
        mut writer: BoxedWriter,
        child: Option<Child>,
    ) -> Result<Self> {
        let request = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            capability_token: CAPABILITY_TOKEN.to_string(),
        };
        write_message(&mut writer, &request)
            .await
            .map_err(|_| EngineError::Handshake {
                reason: "transport closed before the handshake".into(),
            })?;

        let response: HandshakeResponse = match read_message(&mut reader).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return Err(EngineError::Handshake {
                    reason: "engine closed the transport during the handshake".into(),
                });
            }
            Err(err) => {
                return Err(EngineError::Handshake {
                    reason: format!("handshake reply unreadable: {err}"),
                });
            }
        };

        if response.protocol_version != PROTOCOL_VERSION {
            return Err(EngineError::Handshake {
                reason: format!(
                    "protocol version mismatch: broker speaks {PROTOCOL_VERSION}, engine speaks {}",
                    response.protocol_version
                ),
            });
        }

        debug!(engine = %response.engine, "engine session established");
        Ok(Self {
            kind: response.engine,
            inner: Mutex::new(Inner {
                state: SessionState::Open {
                    reader,
                    writer,
                    next_id: 0,
                },
                child,
            }),
        })
    }

    /// The engine kind reported in the handshake.
    pub fn engine_kind(&self) -> &EngineKind {
        &self.kind
    }

    /// Ask the engine for its kind over the wire (the handshake value is the
    /// cached answer; this round-trips).
    pub async fn remote_kind(&self) -> Result<EngineKind> {
        match self.call(Operation::Kind).await? {
            OpResult::Kind { kind } => Ok(kind),
            other => Err(unexpected_payload("kind", &other)),
        }
    }

    /// Terminate the session. Idempotent: the `Close` operation is sent at
    /// most once, a dead or already-closed session is left alone, and this
    /// never reports an error; the process is discarded regardless.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        match std::mem::replace(&mut inner.state, SessionState::Closed) {
            SessionState::Open {
                mut reader,
                mut writer,
                next_id,
            } => {
                let request = Request {
                    id: next_id,
                    op: Operation::Close,
                };
                if write_message(&mut writer, &request).await.is_ok() {
                    let _ = read_message::<ServerMessage, _>(&mut reader).await;
                }
            }
            SessionState::Lost { .. } | SessionState::Closed => {}
        }
        if let Some(child) = inner.child.as_mut() {
            let _ = child.start_kill();
        }
    }

    pub(crate) async fn call(&self, op: Operation) -> Result<OpResult> {
        let mut inner = self.inner.lock().await;
        inner.round_trip(&self.kind, op).await
    }
}

impl Inner {
    async fn round_trip(&mut self, kind: &EngineKind, op: Operation) -> Result<OpResult> {
        let SessionState::Open {
            reader,
            writer,
            next_id,
        } = &mut self.state
        else {
            return Err(self.lost_error());
        };

        let id = *next_id;
        *next_id += 1;

        if write_message(writer, &Request { id, op }).await.is_err() {
            self.state = SessionState::Lost { announced: false };
            return Err(EngineError::TransportClosed);
        }

        match read_message::<ServerMessage, _>(reader).await {
            Ok(Some(ServerMessage::Result { id: reply_id, result })) if reply_id == id => Ok(result),
            Ok(Some(ServerMessage::Error { id: reply_id, error })) if reply_id == id => {
                Err(EngineError::Remote(error))
            }
            Ok(Some(ServerMessage::Shutdown { reason })) => {
                warn!(engine = %kind, reason = %reason, "engine announced shutdown");
                self.state = SessionState::Lost { announced: true };
                Err(EngineError::PluginShutdown)
            }
            Ok(Some(_)) => {
                // Correlation id mismatch on a strictly synchronous session
                // means the stream is desynchronized; nothing after this
                // point can be trusted.
                self.state = SessionState::Lost { announced: false };
                Err(EngineError::Protocol {
                    reason: "reply correlation id does not match the request".into(),
                })
            }
            Ok(None) => {
                self.state = SessionState::Lost { announced: false };
                Err(EngineError::TransportClosed)
            }
            Err(err) => {
                if err.is_connection_lost() {
                    self.state = SessionState::Lost { announced: false };
                }
                Err(err)
            }
        }
    }

    fn lost_error(&self) -> EngineError {
        match self.state {
            SessionState::Lost { announced: true } => EngineError::PluginShutdown,
            _ => EngineError::TransportClosed,
        }
    }
}

fn unexpected_payload(operation: &str, got: &OpResult) -> EngineError {
    EngineError::Protocol {
        reason: format!("unexpected payload for {operation}: {got:?}"),
    }
}

#[async_trait]
impl Database for PluginClient {
    async fn initialize(&self, config: Map<String, Value>, verify: bool) -> Result<()> {
        match self.call(Operation::Initialize { config, verify }).await? {
            OpResult::Unit => Ok(()),
            other => Err(unexpected_payload("initialize", &other)),
        }
    }

    async fn create_user(
        &self,
        statements: StatementSet,
        username: &str,
        password: &str,
        expiration: &str,
    ) -> Result<()> {
        let op = Operation::CreateUser {
            statements,
            username: username.to_string(),
            password: password.to_string(),
            expiration: expiration.to_string(),
        };
        match self.call(op).await? {
            OpResult::Unit => Ok(()),
            other => Err(unexpected_payload("create_user", &other)),
        }
    }

    async fn renew_user(
        &self,
        statements: StatementSet,
        username: &str,
        expiration: &str,
    ) -> Result<()> {
        let op = Operation::RenewUser {
            statements,
            username: username.to_string(),
            expiration: expiration.to_string(),
        };
        match self.call(op).await? {
            OpResult::Unit => Ok(()),
            other => Err(unexpected_payload("renew_user", &other)),
        }
    }

    async fn revoke_user(&self, statements: StatementSet, username: &str) -> Result<()> {
        let op = Operation::RevokeUser {
            statements,
            username: username.to_string(),
        };
        match self.call(op).await? {
            OpResult::Unit => Ok(()),
            other => Err(unexpected_payload("revoke_user", &other)),
        }
    }

    async fn generate_username(&self, display_name: &str, role: &str) -> Result<String> {
        let op = Operation::GenerateUsername {
            display_name: display_name.to_string(),
            role: role.to_string(),
        };
        match self.call(op).await? {
            OpResult::Username { username } => Ok(username),
            other => Err(unexpected_payload("generate_username", &other)),
        }
    }

    async fn generate_password(&self) -> Result<String> {
        match self.call(Operation::GeneratePassword).await? {
            OpResult::Password { password } => Ok(password),
            other => Err(unexpected_payload("generate_password", &other)),
        }
    }

    async fn generate_expiration(&self, ttl: Duration) -> Result<String> {
        let op = Operation::GenerateExpiration {
            ttl_secs: ttl.as_secs(),
        };
        match self.call(op).await? {
            OpResult::Expiration { expiration } => Ok(expiration),
            other => Err(unexpected_payload("generate_expiration", &other)),
        }
    }

    fn kind(&self) -> EngineKind {
        self.kind.clone()
    }

    async fn close(&self) -> Result<()> {
        PluginClient::close(self).await;
        Ok(())
    }
}
