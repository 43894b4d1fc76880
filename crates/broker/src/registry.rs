//! The live connection registry.
//!
//! Maps a connection name to exactly one open engine session. Creation is
//! deduplicated with a double-checked read/write lock (opening an engine is
//! expensive and must happen at most once per name); teardown of a handle
//! whose process died is identity-checked so a replacement handle is never
//! torn down by a stale failure observation.

use std::collections::HashMap;
use std::sync::Arc;

use keywell_core::ConnectionName;
use keywell_engine::{Database, EngineError};
use keywell_storage::StorageBackend;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConnectionConfig, load_connection_config};
use crate::error::{BrokerError, Result};

/// Opens engine sessions for the registry.
///
/// Production wires this to the engine gateway; tests count and script it.
#[async_trait::async_trait]
pub trait SessionOpener: Send + Sync {
    /// Open a session for `name` per its configuration.
    async fn open(
        &self,
        name: &ConnectionName,
        config: &ConnectionConfig,
    ) -> keywell_engine::Result<Box<dyn Database>>;

    /// Whether `kind` belongs to the closed set of supported engines.
    fn recognizes(&self, kind: &keywell_core::EngineKind) -> bool;
}

/// The gateway-backed production opener.
pub struct GatewayOpener {
    gateway: keywell_engine::Gateway,
}

impl GatewayOpener {
    /// An opener spawning engines through `gateway`.
    pub fn new(gateway: keywell_engine::Gateway) -> Self {
        Self { gateway }
    }
}

#[async_trait::async_trait]
impl SessionOpener for GatewayOpener {
    async fn open(
        &self,
        _name: &ConnectionName,
        config: &ConnectionConfig,
    ) -> keywell_engine::Result<Box<dyn Database>> {
        let client = self
            .gateway
            .open(
                &config.engine,
                config.connection_details.clone(),
                config.verify_connection,
            )
            .await?;
        Ok(Box::new(client))
    }

    fn recognizes(&self, kind: &keywell_core::EngineKind) -> bool {
        self.gateway.registry().contains(kind)
    }
}

/// One live engine session, identified by connection name plus an opaque
/// instance id distinguishing successive handles for the same name.
pub struct ConnectionHandle {
    name: ConnectionName,
    id: Uuid,
    session: Box<dyn Database>,
    closed: Mutex<bool>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    /// The connection name this handle serves.
    pub fn name(&self) -> &ConnectionName {
        &self.name
    }

    /// The instance id minted when this handle was created.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The underlying engine session.
    pub fn session(&self) -> &dyn Database {
        self.session.as_ref()
    }

    /// Close the session. Idempotent: the underlying close runs at most
    /// once, guarded by the handle's own lock.
    pub async fn close(&self) -> keywell_engine::Result<()> {
        let mut closed = self.closed.lock().await;
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.session.close().await
    }
}

type ConnectionMap = HashMap<ConnectionName, Arc<ConnectionHandle>>;

/// Registry of live connections, at most one handle per name.
pub struct ConnectionRegistry {
    connections: Arc<RwLock<ConnectionMap>>,
    opener: Arc<dyn SessionOpener>,
    storage: Arc<dyn StorageBackend>,
}

impl ConnectionRegistry {
    /// A registry reading configs from `storage` and opening through
    /// `opener`.
    pub fn new(storage: Arc<dyn StorageBackend>, opener: Arc<dyn SessionOpener>) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            opener,
            storage,
        }
    }

    /// The opener this registry creates sessions through.
    pub fn opener(&self) -> &Arc<dyn SessionOpener> {
        &self.opener
    }

    /// Get the live handle for `name`, opening it on first use.
    ///
    /// Optimistic read under the shared lock; on a miss, upgrade to the
    /// exclusive lock and re-check, so two racing callers cannot both run
    /// the expensive open; the loser of the upgrade race observes the
    /// winner's entry on re-check.
    pub async fn get_connection(&self, name: &ConnectionName) -> Result<Arc<ConnectionHandle>> {
        {
            let connections = self.connections.read().await;
            if let Some(handle) = connections.get(name) {
                return Ok(Arc::clone(handle));
            }
        }

        let mut connections = self.connections.write().await;
        if let Some(handle) = connections.get(name) {
            return Ok(Arc::clone(handle));
        }

        let config = load_connection_config(self.storage.as_ref(), name)
            .await?
            .ok_or_else(|| BrokerError::UnknownConnection { name: name.clone() })?;

        let session = self.opener.open(name, &config).await?;
        let handle = Arc::new(ConnectionHandle {
            name: name.clone(),
            id: Uuid::new_v4(),
            session,
            closed: Mutex::new(false),
        });

        info!(connection = %name, id = %handle.id, "opened connection");
        connections.insert(name.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Close and remove the handle for `name`, if present.
    ///
    /// Close errors are swallowed: the remote session is unconditionally
    /// discarded, and the next `get_connection` rebuilds from the current
    /// configuration.
    pub async fn clear_connection(&self, name: &ConnectionName) {
        let mut connections = self.connections.write().await;
        if let Some(handle) = connections.remove(name) {
            debug!(connection = %name, id = %handle.id, "clearing connection");
            let _ = handle.close().await;
        }
    }

    /// React to a connection-lost failure observed through `handle`.
    ///
    /// Runs asynchronously so the caller (typically mid-request) never
    /// takes the registry's exclusive lock itself. The map entry is removed
    /// only if it still carries this handle's instance id: a replacement
    /// created by a concurrent `get_connection` must survive a stale
    /// failure observation.
    ///
    /// Returns the cleanup task when the error warranted one.
    pub fn invalidate_on_shutdown(
        &self,
        handle: &Arc<ConnectionHandle>,
        err: &EngineError,
    ) -> Option<JoinHandle<()>> {
        if !err.is_connection_lost() {
            return None;
        }

        warn!(connection = %handle.name, id = %handle.id, error = %err, "connection lost; retiring handle");
        let connections = Arc::clone(&self.connections);
        let handle = Arc::clone(handle);
        Some(tokio::spawn(async move {
            let mut connections = connections.write().await;
            let _ = handle.close().await;
            let still_current = connections
                .get(&handle.name)
                .is_some_and(|current| current.id == handle.id);
            if still_current {
                connections.remove(&handle.name);
            }
        }))
    }

    /// Close every handle and reset the map. Used on backend teardown and
    /// on external configuration-invalidation events.
    pub async fn invalidate_all(&self) {
        let mut connections = self.connections.write().await;
        for (name, handle) in connections.drain() {
            debug!(connection = %name, "closing connection on invalidate");
            let _ = handle.close().await;
        }
    }

    /// Number of live handles.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Whether no handles are live.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
