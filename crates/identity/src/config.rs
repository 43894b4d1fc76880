//! Identity source connection configuration.

use keywell_storage::{StorageBackend, get_json, put_json};
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, Result};

/// Storage key of the singleton source configuration.
pub const SOURCE_CONFIG_KEY: &str = "config/identity-source";

/// Storage prefix of the durable annotation records.
pub const IDENTITY_RECORD_PREFIX: &str = "config/identity/";

/// Default annotation key whose value parameterizes derived roles.
pub const DEFAULT_ROLE_ANNOTATION: &str = "keywell.io/keyspace";

/// Default annotation key overriding the database name for an identity.
pub const DEFAULT_DATABASE_ANNOTATION: &str = "keywell.io/database";

fn default_role_annotation() -> String {
    DEFAULT_ROLE_ANNOTATION.to_string()
}

fn default_database_annotation() -> String {
    DEFAULT_DATABASE_ANNOTATION.to_string()
}

/// Connection details for the watched identity collection.
///
/// A singleton durable record; rewriting it tears down and restarts the
/// watch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the identity API.
    pub host: String,
    /// PEM-encoded CA certificate for the TLS client; empty means the
    /// system roots.
    #[serde(default)]
    pub ca_cert: String,
    /// Bearer credential presented on every request.
    pub token: String,
    /// Annotation key read for derived-role parameters.
    #[serde(default = "default_role_annotation")]
    pub role_annotation: String,
    /// Annotation key overriding the identity's database name.
    #[serde(default = "default_database_annotation")]
    pub database_annotation: String,
}

impl SourceConfig {
    /// Reject configs that cannot possibly work.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(IdentityError::Config {
                reason: "no host provided".into(),
            });
        }
        if self.token.is_empty() {
            return Err(IdentityError::Config {
                reason: "bearer token must be set".into(),
            });
        }
        if self.role_annotation.is_empty() {
            return Err(IdentityError::Config {
                reason: "role annotation key must be set".into(),
            });
        }
        Ok(())
    }

    /// Load the singleton config, `None` when never written.
    pub async fn load(storage: &dyn StorageBackend) -> Result<Option<Self>> {
        Ok(get_json(storage, SOURCE_CONFIG_KEY).await?)
    }

    /// Persist the singleton config.
    pub async fn store(&self, storage: &dyn StorageBackend) -> Result<()> {
        self.validate()?;
        Ok(put_json(storage, SOURCE_CONFIG_KEY, self).await?)
    }
}
