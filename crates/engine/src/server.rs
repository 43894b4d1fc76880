//! Engine-side serve loop.
//!
//! An engine binary wires its [`Database`] implementation to its stdio with
//! [`serve`]; integration tests wire one to an in-process duplex stream and
//! talk to it through a [`PluginClient`](crate::PluginClient).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tracing::debug;

use crate::database::Database;
use crate::error::{EngineError, RemoteError, Result};
use crate::proto::{
    CAPABILITY_TOKEN, HandshakeRequest, HandshakeResponse, OpResult, Operation, PROTOCOL_VERSION,
    Request, ServerMessage, read_message, write_message,
};

/// Answer the handshake, then dispatch request/response pairs until the
/// client sends `Close` or the transport ends.
///
/// Database errors are answered as [`ServerMessage::Error`] and do not end
/// the session; only transport failures and `Close` do.
pub async fn serve<D, R, W>(database: D, reader: R, writer: W) -> Result<()>
where
    D: Database,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut writer = writer;

    let Some(handshake) = read_message::<HandshakeRequest, _>(&mut reader).await? else {
        // Peer went away before saying hello; nothing to clean up.
        return Ok(());
    };
    if handshake.capability_token != CAPABILITY_TOKEN {
        return Err(EngineError::Handshake {
            reason: "unrecognized capability token".into(),
        });
    }
    if handshake.protocol_version != PROTOCOL_VERSION {
        return Err(EngineError::Handshake {
            reason: format!(
                "protocol version mismatch: engine speaks {PROTOCOL_VERSION}, broker speaks {}",
                handshake.protocol_version
            ),
        });
    }

    let response = HandshakeResponse {
        protocol_version: PROTOCOL_VERSION,
        engine: database.kind(),
    };
    write_message(&mut writer, &response).await?;
    debug!(engine = %response.engine, "serving engine session");

    while let Some(Request { id, op }) = read_message::<Request, _>(&mut reader).await? {
        let closing = matches!(op, Operation::Close);
        let reply = match dispatch(&database, op).await {
            Ok(result) => ServerMessage::Result { id, result },
            Err(err) => ServerMessage::Error {
                id,
                error: RemoteError::new(err.to_string()),
            },
        };
        write_message(&mut writer, &reply).await?;
        if closing {
            break;
        }
    }

    Ok(())
}

/// Announce engine-initiated termination to the peer (signal handler, fatal
/// internal error). The client maps this to its plugin-shutdown sentinel.
pub async fn announce_shutdown<W>(writer: &mut W, reason: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_message(
        writer,
        &ServerMessage::Shutdown {
            reason: reason.to_string(),
        },
    )
    .await
}

async fn dispatch<D: Database>(database: &D, op: Operation) -> Result<OpResult> {
    match op {
        Operation::Initialize { config, verify } => database
            .initialize(config, verify)
            .await
            .map(|()| OpResult::Unit),
        Operation::CreateUser {
            statements,
            username,
            password,
            expiration,
        } => database
            .create_user(statements, &username, &password, &expiration)
            .await
            .map(|()| OpResult::Unit),
        Operation::RenewUser {
            statements,
            username,
            expiration,
        } => database
            .renew_user(statements, &username, &expiration)
            .await
            .map(|()| OpResult::Unit),
        Operation::RevokeUser {
            statements,
            username,
        } => database
            .revoke_user(statements, &username)
            .await
            .map(|()| OpResult::Unit),
        Operation::GenerateUsername { display_name, role } => database
            .generate_username(&display_name, &role)
            .await
            .map(|username| OpResult::Username { username }),
        Operation::GeneratePassword => database
            .generate_password()
            .await
            .map(|password| OpResult::Password { password }),
        Operation::GenerateExpiration { ttl_secs } => database
            .generate_expiration(Duration::from_secs(ttl_secs))
            .await
            .map(|expiration| OpResult::Expiration { expiration }),
        Operation::Kind => Ok(OpResult::Kind {
            kind: database.kind(),
        }),
        Operation::Close => database.close().await.map(|()| OpResult::Unit),
    }
}
