//! The polymorphic engine seam.

use std::time::Duration;

use async_trait::async_trait;
use keywell_core::{EngineKind, StatementSet, USERNAME_MAX_LEN, creds};
use serde_json::{Map, Value};

use crate::error::Result;

/// One database engine, regardless of where it runs.
///
/// Concrete engines (postgresql, cassandra, ...) implement this inside their
/// own process and are served over the wire protocol; the broker side holds
/// a [`PluginClient`](crate::PluginClient) which implements the same trait
/// by proxying every call. Statement execution semantics are entirely the
/// engine's business.
#[async_trait]
pub trait Database: Send + Sync {
    /// Configure the engine with connection details; when `verify` is set,
    /// prove connectivity before returning.
    async fn initialize(&self, config: Map<String, Value>, verify: bool) -> Result<()>;

    /// Create a user from rendered creation statements.
    async fn create_user(
        &self,
        statements: StatementSet,
        username: &str,
        password: &str,
        expiration: &str,
    ) -> Result<()>;

    /// Extend a user's expiration.
    async fn renew_user(
        &self,
        statements: StatementSet,
        username: &str,
        expiration: &str,
    ) -> Result<()>;

    /// Remove a user.
    async fn revoke_user(&self, statements: StatementSet, username: &str) -> Result<()>;

    /// Produce a username for a new credential.
    async fn generate_username(&self, display_name: &str, role: &str) -> Result<String> {
        Ok(creds::generate_username(
            display_name,
            role,
            USERNAME_MAX_LEN,
        ))
    }

    /// Produce a random password.
    async fn generate_password(&self) -> Result<String> {
        Ok(creds::generate_password())
    }

    /// Produce a formatted expiration `ttl` from now.
    async fn generate_expiration(&self, ttl: Duration) -> Result<String> {
        Ok(creds::generate_expiration(ttl))
    }

    /// The engine identifier.
    fn kind(&self) -> EngineKind;

    /// Release engine-side resources. Must be idempotent.
    async fn close(&self) -> Result<()>;
}
