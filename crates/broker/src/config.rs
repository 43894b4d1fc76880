//! Durable connection configuration.

use keywell_core::{ConnectionName, EngineKind};
use keywell_storage::{StorageBackend, get_json, put_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Storage prefix for connection configurations.
pub const CONNECTION_CONFIG_PREFIX: &str = "database/config/";

fn default_verify() -> bool {
    true
}

/// Durable record describing one backing database.
///
/// Written by configuration calls; read-only to the connection registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Which engine drives this database.
    pub engine: EngineKind,
    /// Engine-specific connection details (DSN, admin credentials, ...),
    /// passed opaquely to the engine's `Initialize`.
    #[serde(default)]
    pub connection_details: Map<String, Value>,
    /// Whether `Initialize` should prove connectivity before the connection
    /// is considered open.
    #[serde(default = "default_verify")]
    pub verify_connection: bool,
}

fn config_key(name: &ConnectionName) -> String {
    format!("{CONNECTION_CONFIG_PREFIX}{name}")
}

/// Load the configuration for `name`, `None` when never configured.
pub async fn load_connection_config(
    storage: &dyn StorageBackend,
    name: &ConnectionName,
) -> Result<Option<ConnectionConfig>> {
    Ok(get_json(storage, &config_key(name)).await?)
}

/// Persist the configuration for `name`.
pub async fn store_connection_config(
    storage: &dyn StorageBackend,
    name: &ConnectionName,
    config: &ConnectionConfig,
) -> Result<()> {
    Ok(put_json(storage, &config_key(name), config).await?)
}

/// Delete the configuration for `name`.
pub async fn delete_connection_config(
    storage: &dyn StorageBackend,
    name: &ConnectionName,
) -> Result<()> {
    Ok(storage.delete(&config_key(name)).await?)
}

/// List every configured connection name.
pub async fn list_connection_configs(storage: &dyn StorageBackend) -> Result<Vec<String>> {
    Ok(storage.list(CONNECTION_CONFIG_PREFIX).await?)
}
