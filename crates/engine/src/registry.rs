//! The closed registry of supported engines and the open/call/close façade.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use keywell_core::EngineKind;
use serde_json::{Map, Value};
use tracing::info;

use crate::client::PluginClient;
use crate::database::Database;
use crate::error::{EngineError, Result};

/// Engine identifiers compiled into this build. Anything else is rejected;
/// custom engines are not supported in this deployment.
const BUILTIN_ENGINES: &[&str] = &[
    "postgresql-engine",
    "mysql-engine",
    "mssql-engine",
    "cassandra-engine",
    "mongodb-engine",
    "influxdb-engine",
];

/// How to launch one engine's process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSpec {
    /// The engine identifier.
    pub kind: EngineKind,
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

/// Closed, statically compiled table of engine kinds to spawn specs.
#[derive(Debug, Clone)]
pub struct EngineRegistry {
    engines: HashMap<EngineKind, EngineSpec>,
}

impl EngineRegistry {
    /// The builtin table: each engine `X-engine` launches the binary
    /// `keywell-X-engine` from the default search path.
    pub fn builtin() -> Self {
        Self::builtin_in(Path::new(""))
    }

    /// The builtin table with engine binaries resolved under `bin_dir`.
    pub fn builtin_in(bin_dir: &Path) -> Self {
        let engines = BUILTIN_ENGINES
            .iter()
            .map(|name| {
                let kind = EngineKind::new(*name)
                    .expect("builtin engine identifiers are statically valid");
                let spec = EngineSpec {
                    kind: kind.clone(),
                    program: bin_dir.join(format!("keywell-{name}")),
                    args: Vec::new(),
                };
                (kind, spec)
            })
            .collect();
        Self { engines }
    }

    /// Look up the spawn spec for an engine kind.
    pub fn get(&self, kind: &EngineKind) -> Result<&EngineSpec> {
        self.engines
            .get(kind)
            .ok_or_else(|| EngineError::UnknownEngine { kind: kind.clone() })
    }

    /// Whether `kind` is a recognized engine.
    pub fn contains(&self, kind: &EngineKind) -> bool {
        self.engines.contains_key(kind)
    }

    /// All recognized engine kinds.
    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.keys().cloned().collect()
    }
}

/// The broker's entry point to engines: look up, spawn, handshake,
/// initialize.
#[derive(Debug, Clone)]
pub struct Gateway {
    registry: EngineRegistry,
}

impl Gateway {
    /// A gateway over the given registry.
    pub fn new(registry: EngineRegistry) -> Self {
        Self { registry }
    }

    /// A gateway over the builtin registry.
    pub fn builtin() -> Self {
        Self::new(EngineRegistry::builtin())
    }

    /// The underlying registry.
    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    /// Open a session: spawn the engine's process, handshake, verify the
    /// engine identifies as the requested kind, and initialize it with the
    /// connection details.
    pub async fn open(
        &self,
        kind: &EngineKind,
        config: Map<String, Value>,
        verify: bool,
    ) -> Result<PluginClient> {
        let spec = self.registry.get(kind)?;
        let client = PluginClient::open(spec).await?;

        if client.engine_kind() != kind {
            let reported = client.engine_kind().clone();
            client.close().await;
            return Err(EngineError::Handshake {
                reason: format!("engine identified as '{reported}', expected '{kind}'"),
            });
        }

        if let Err(err) = client.initialize(config, verify).await {
            // The session never becomes usable; discard the process.
            client.close().await;
            return Err(err);
        }

        info!(engine = %kind, "engine session opened");
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_is_closed() {
        let registry = EngineRegistry::builtin();
        let known = EngineKind::new("postgresql-engine").unwrap();
        assert!(registry.contains(&known));
        assert_eq!(
            registry.get(&known).unwrap().program,
            PathBuf::from("keywell-postgresql-engine")
        );

        let unknown = EngineKind::new("oracle-engine").unwrap();
        let err = registry.get(&unknown).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEngine { .. }));
        assert!(err.to_string().contains("custom engines are not supported"));
    }

    #[test]
    fn bin_dir_prefixes_programs() {
        let registry = EngineRegistry::builtin_in(Path::new("/opt/keywell/engines"));
        let kind = EngineKind::new("cassandra-engine").unwrap();
        assert_eq!(
            registry.get(&kind).unwrap().program,
            PathBuf::from("/opt/keywell/engines/keywell-cassandra-engine")
        );
    }

    #[tokio::test]
    async fn gateway_rejects_unknown_engine() {
        let gateway = Gateway::builtin();
        let kind = EngineKind::new("custom-engine").unwrap();
        let err = gateway.open(&kind, Map::new(), false).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownEngine { .. }));
    }
}
