//! The broker backend: composition root and management surface.
//!
//! All state is owned by the instance (connection map, rotation queue,
//! identity cache), with lifecycles tied to [`Backend::start`] and
//! [`Backend::teardown`], so several independent backends can coexist in
//! one process and tests get deterministic setup and teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keywell_core::{ConnectionName, RoleName, validate_ttls};
use keywell_identity::{
    DEFAULT_DATABASE_ANNOTATION, DEFAULT_ROLE_ANNOTATION, HttpIdentitySource, IdentityCache,
    IdentityWatcher, SourceConfig, SyncSummary, WatcherConfig,
};
use keywell_storage::StorageBackend;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    CONNECTION_CONFIG_PREFIX, ConnectionConfig, delete_connection_config, list_connection_configs,
    load_connection_config, store_connection_config,
};
use crate::error::{BrokerError, Result};
use crate::registry::{ConnectionHandle, ConnectionRegistry, SessionOpener};
use crate::resolver;
use crate::roles::{RoleEntry, RoleStore, StaticRoleEntry};
use crate::rotation::{RotationConfig, RotationOutcome, RotationScheduler};

/// Lease TTL used when a role does not set one.
const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3600);

/// Backend tuning.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Rotation driver tuning.
    pub rotation: RotationConfig,
    /// Identity watch tuning.
    pub watcher: WatcherConfig,
    /// How often the identity reconciliation pass runs.
    pub sync_interval: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            rotation: RotationConfig::default(),
            watcher: WatcherConfig::default(),
            sync_interval: Duration::from_secs(60),
        }
    }
}

/// A freshly minted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCredentials {
    /// The created username.
    pub username: String,
    /// Its password.
    pub password: String,
    /// The lease duration the credential was issued for.
    pub ttl: Duration,
}

struct Lifecycle {
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    sync: Option<JoinHandle<()>>,
}

/// The dynamic-credential broker.
pub struct Backend {
    storage: Arc<dyn StorageBackend>,
    registry: ConnectionRegistry,
    roles: RoleStore,
    scheduler: Arc<RotationScheduler>,
    cache: Arc<IdentityCache>,
    watcher: IdentityWatcher,
    source_config: parking_lot::RwLock<Option<SourceConfig>>,
    sync_interval: Duration,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl Backend {
    /// Assemble a backend over `storage`, opening engine sessions through
    /// `opener`. Background loops do not run until [`Backend::start`].
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        opener: Arc<dyn SessionOpener>,
        config: BackendConfig,
    ) -> Arc<Self> {
        let cache = Arc::new(IdentityCache::new());
        Arc::new(Self {
            registry: ConnectionRegistry::new(Arc::clone(&storage), opener),
            roles: RoleStore::new(Arc::clone(&storage)),
            scheduler: Arc::new(RotationScheduler::new(config.rotation)),
            watcher: IdentityWatcher::with_config(Arc::clone(&cache), config.watcher),
            cache,
            storage,
            source_config: parking_lot::RwLock::new(None),
            sync_interval: config.sync_interval,
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                cancel: CancellationToken::new(),
                driver: None,
                sync: None,
            }),
        })
    }

    /// Start background work: load every static role into the rotation
    /// queue with a computed initial deadline, start the rotation driver
    /// and the reconciliation tick, and, if an identity source is
    /// configured, the watch.
    ///
    /// A broken identity source config is logged, never fatal: startup must
    /// succeed so the operator can fix the config through the management
    /// surface.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        for raw in self.roles.list_static_roles().await? {
            let Ok(name) = RoleName::new(raw.as_str()) else {
                warn!(key = %raw, "skipping static role with unusable name");
                continue;
            };
            if let Some(entry) = self.roles.static_role(&name).await? {
                let due = entry.next_rotation();
                self.scheduler.queue_role(name, due).await;
            }
        }
        info!(queued = self.scheduler.queued().await, "static roles scheduled");

        let mut lifecycle = self.lifecycle.lock().await;
        let cancel = lifecycle.cancel.clone();

        let backend = Arc::clone(self);
        lifecycle.driver = Some(self.scheduler.spawn_driver(
            move |role| {
                let backend = Arc::clone(&backend);
                async move { backend.rotate_static_role(&role).await }
            },
            cancel.clone(),
        ));

        let backend = Arc::clone(self);
        let sync_cancel = cancel.clone();
        let sync_interval = self.sync_interval;
        lifecycle.sync = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(sync_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = sync_cancel.cancelled() => return,
                    _ = tick.tick() => {}
                }
                if sync_cancel.is_cancelled() {
                    return;
                }
                if let Err(err) = backend.sync_identities().await {
                    warn!(error = %err, "identity sync failed");
                }
            }
        }));
        drop(lifecycle);

        match SourceConfig::load(self.storage.as_ref()).await {
            Ok(Some(config)) => {
                *self.source_config.write() = Some(config.clone());
                match HttpIdentitySource::from_config(&config) {
                    Ok(source) => self.watcher.restart(Arc::new(source)).await,
                    Err(err) => {
                        warn!(error = %err, "identity source unusable; watch not started");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to load identity source config"),
        }

        Ok(())
    }

    /// Stop all background work and close every connection.
    pub async fn teardown(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.cancel.cancel();
        if let Some(driver) = lifecycle.driver.take() {
            let _ = driver.await;
        }
        if let Some(sync) = lifecycle.sync.take() {
            let _ = sync.await;
        }
        drop(lifecycle);

        self.watcher.stop().await;
        self.registry.invalidate_all().await;
        info!("backend torn down");
    }

    /// External invalidation hook: a durable write under a connection's
    /// config key forces the next lookup to rebuild from the new config.
    pub async fn invalidate(&self, key: &str) {
        if let Some(raw) = key.strip_prefix(CONNECTION_CONFIG_PREFIX) {
            if let Ok(name) = ConnectionName::new(raw) {
                self.registry.clear_connection(&name).await;
            }
        }
    }

    /// The identity cache (read-side for tests and embedders; the watch
    /// loop is the writer).
    pub fn identity_cache(&self) -> &Arc<IdentityCache> {
        &self.cache
    }

    /// The live connection registry.
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Number of roles currently scheduled for rotation.
    pub async fn scheduled_rotations(&self) -> usize {
        self.scheduler.queued().await
    }

    // ── Credential issuance ────────────────────────────────────────────────

    /// Issue fresh credentials for `name`.
    pub async fn issue_credentials(
        &self,
        name: &RoleName,
        display_name: &str,
    ) -> Result<IssuedCredentials> {
        let role = self
            .resolve_role(name)
            .await?
            .ok_or_else(|| BrokerError::UnknownRole { name: name.clone() })?;
        let ttl = lease_ttl(&role, None)?;

        let handle = self.registry.get_connection(&role.connection).await?;
        let session = handle.session();

        let username = self.via(
            &handle,
            session.generate_username(display_name, name.as_str()).await,
        )?;
        let password = self.via(&handle, session.generate_password().await)?;
        let expiration = self.via(&handle, session.generate_expiration(ttl).await)?;
        self.via(
            &handle,
            session
                .create_user(role.statements.clone(), &username, &password, &expiration)
                .await,
        )?;

        info!(role = %name, connection = %role.connection, username = %username, "issued credentials");
        Ok(IssuedCredentials {
            username,
            password,
            ttl,
        })
    }

    /// Renew a previously issued credential's expiration.
    ///
    /// Returns the lease duration granted.
    pub async fn renew_credentials(
        &self,
        name: &RoleName,
        username: &str,
        increment: Option<Duration>,
    ) -> Result<Duration> {
        let role = self
            .resolve_role(name)
            .await?
            .ok_or_else(|| BrokerError::UnknownRole { name: name.clone() })?;
        let ttl = lease_ttl(&role, increment)?;

        let handle = self.registry.get_connection(&role.connection).await?;
        let session = handle.session();
        let expiration = self.via(&handle, session.generate_expiration(ttl).await)?;
        self.via(
            &handle,
            session
                .renew_user(role.statements.clone(), username, &expiration)
                .await,
        )?;
        Ok(ttl)
    }

    /// Revoke a previously issued credential.
    pub async fn revoke_credentials(&self, name: &RoleName, username: &str) -> Result<()> {
        let role = self
            .resolve_role(name)
            .await?
            .ok_or_else(|| BrokerError::UnknownRole { name: name.clone() })?;

        let handle = self.registry.get_connection(&role.connection).await?;
        let session = handle.session();
        self.via(
            &handle,
            session
                .revoke_user(role.statements.clone(), username)
                .await,
        )?;
        info!(role = %name, username = %username, "revoked credentials");
        Ok(())
    }

    /// Resolve a role name, including derived names.
    pub async fn resolve_role(&self, name: &RoleName) -> Result<Option<RoleEntry>> {
        let (role_key, database_key) = self.annotation_keys();
        resolver::resolve_role(
            &self.roles,
            &self.cache,
            self.storage.as_ref(),
            &role_key,
            &database_key,
            name,
        )
        .await
    }

    // ── Connection management ──────────────────────────────────────────────

    /// Create or update a connection configuration.
    ///
    /// The engine must belong to the closed builtin set. Any live handle is
    /// reset so the next lookup re-reads the new configuration.
    pub async fn configure_connection(
        &self,
        name: &ConnectionName,
        config: ConnectionConfig,
    ) -> Result<()> {
        if !self.registry.opener().recognizes(&config.engine) {
            return Err(BrokerError::Validation {
                what: "connection",
                reason: format!(
                    "unknown engine '{}': custom engines are not supported",
                    config.engine
                ),
            });
        }
        store_connection_config(self.storage.as_ref(), name, &config).await?;
        self.registry.clear_connection(name).await;
        info!(connection = %name, engine = %config.engine, "connection configured");
        Ok(())
    }

    /// Read a connection configuration.
    pub async fn read_connection(&self, name: &ConnectionName) -> Result<Option<ConnectionConfig>> {
        load_connection_config(self.storage.as_ref(), name).await
    }

    /// Delete a connection configuration and retire any live handle.
    pub async fn delete_connection(&self, name: &ConnectionName) -> Result<()> {
        delete_connection_config(self.storage.as_ref(), name).await?;
        self.registry.clear_connection(name).await;
        Ok(())
    }

    /// Force the next lookup to rebuild the connection from stored config.
    pub async fn reset_connection(&self, name: &ConnectionName) {
        self.registry.clear_connection(name).await;
    }

    /// Names of all configured connections.
    pub async fn list_connections(&self) -> Result<Vec<String>> {
        list_connection_configs(self.storage.as_ref()).await
    }

    // ── Role management ────────────────────────────────────────────────────

    /// Create or update an ordinary role.
    pub async fn write_role(&self, name: &RoleName, entry: RoleEntry) -> Result<()> {
        entry.validate()?;
        self.roles.put_role(name, &entry).await
    }

    /// Read a role; derived names resolve through the identity reconciler.
    pub async fn read_role(&self, name: &RoleName) -> Result<Option<RoleEntry>> {
        self.resolve_role(name).await
    }

    /// Delete an ordinary role.
    pub async fn delete_role(&self, name: &RoleName) -> Result<()> {
        self.roles.delete_role(name).await
    }

    /// Names of all ordinary roles.
    pub async fn list_roles(&self) -> Result<Vec<String>> {
        self.roles.list_roles().await
    }

    /// Create or update a static role and (re)schedule its rotation.
    pub async fn write_static_role(&self, name: &RoleName, entry: StaticRoleEntry) -> Result<()> {
        entry.validate(self.scheduler.config().min_rotation_period)?;
        let _guard = self.scheduler.role_lock(name).lock().await;
        self.roles.put_static_role(name, &entry).await?;
        self.scheduler
            .requeue_role(name.clone(), entry.next_rotation())
            .await;
        info!(role = %name, "static role scheduled");
        Ok(())
    }

    /// Read a static role, including its current credential.
    pub async fn read_static_role(&self, name: &RoleName) -> Result<Option<StaticRoleEntry>> {
        self.roles.static_role(name).await
    }

    /// Delete a static role and drop it from the rotation schedule.
    pub async fn delete_static_role(&self, name: &RoleName) -> Result<()> {
        let _guard = self.scheduler.role_lock(name).lock().await;
        self.scheduler.unqueue_role(name).await;
        self.roles.delete_static_role(name).await
    }

    /// Names of all static roles.
    pub async fn list_static_roles(&self) -> Result<Vec<String>> {
        self.roles.list_static_roles().await
    }

    /// Rotate a static role's credential immediately, outside its schedule.
    pub async fn rotate_role(&self, name: &RoleName) -> Result<()> {
        let _guard = self.scheduler.role_lock(name).lock().await;
        match self.rotate_static_role(name).await? {
            RotationOutcome::Requeue(next) => {
                self.scheduler.requeue_role(name.clone(), next).await;
                Ok(())
            }
            RotationOutcome::Unscheduled => Err(BrokerError::UnknownRole { name: name.clone() }),
        }
    }

    // ── Identity source management ─────────────────────────────────────────

    /// Read the identity source configuration.
    pub async fn read_source_config(&self) -> Result<Option<SourceConfig>> {
        Ok(SourceConfig::load(self.storage.as_ref()).await?)
    }

    /// Write the identity source configuration and restart the watch
    /// against the new source. The previous watch is fully stopped first.
    pub async fn write_source_config(&self, config: SourceConfig) -> Result<()> {
        config.store(self.storage.as_ref()).await?;
        *self.source_config.write() = Some(config.clone());
        let source = HttpIdentitySource::from_config(&config)?;
        self.watcher.restart(Arc::new(source)).await;
        Ok(())
    }

    /// Run one identity reconciliation pass now.
    pub async fn sync_identities(&self) -> Result<SyncSummary> {
        let (role_key, _) = self.annotation_keys();
        Ok(keywell_identity::sync_identities(&self.cache, self.storage.as_ref(), &role_key).await?)
    }

    // ── Internals ──────────────────────────────────────────────────────────

    fn annotation_keys(&self) -> (String, String) {
        let config = self.source_config.read();
        match config.as_ref() {
            Some(config) => (
                config.role_annotation.clone(),
                config.database_annotation.clone(),
            ),
            None => (
                DEFAULT_ROLE_ANNOTATION.to_string(),
                DEFAULT_DATABASE_ANNOTATION.to_string(),
            ),
        }
    }

    /// One rotation attempt. The caller holds the role's shard lock.
    async fn rotate_static_role(&self, name: &RoleName) -> Result<RotationOutcome> {
        // Re-read: the role may have been updated or deleted since it was
        // queued.
        let Some(mut entry) = self.roles.static_role(name).await? else {
            return Ok(RotationOutcome::Unscheduled);
        };

        let handle = self.registry.get_connection(&entry.connection).await?;
        let session = handle.session();

        let password = self.via(&handle, session.generate_password().await)?;
        let expiration = self.via(
            &handle,
            session.generate_expiration(entry.rotation_period).await,
        )?;
        // Rotation statements when present, creation statements otherwise.
        let mut statements = entry.statements.clone();
        statements.creation = statements.for_rotation().to_vec();
        self.via(
            &handle,
            session
                .create_user(statements, &entry.username, &password, &expiration)
                .await,
        )?;

        entry.password = Some(password);
        entry.last_rotation = Some(Utc::now());
        self.roles.put_static_role(name, &entry).await?;
        info!(role = %name, connection = %entry.connection, "rotated static credential");
        Ok(RotationOutcome::Requeue(entry.next_rotation()))
    }

    /// Map a session result, retiring the handle on a connection-lost
    /// failure. The cleanup runs on its own task; this call path never
    /// takes the registry's exclusive lock.
    fn via<T>(
        &self,
        handle: &Arc<ConnectionHandle>,
        result: keywell_engine::Result<T>,
    ) -> Result<T> {
        result.map_err(|err| {
            self.registry.invalidate_on_shutdown(handle, &err);
            err.into()
        })
    }
}

/// Effective lease TTL for a role: the explicit increment or the role's
/// default, clamped to the role's max.
fn lease_ttl(role: &RoleEntry, increment: Option<Duration>) -> Result<Duration> {
    validate_ttls(role.default_ttl, role.max_ttl)?;
    let mut ttl = increment.unwrap_or(if role.default_ttl.is_zero() {
        DEFAULT_LEASE_TTL
    } else {
        role.default_ttl
    });
    if ttl.is_zero() {
        ttl = DEFAULT_LEASE_TTL;
    }
    if !role.max_ttl.is_zero() && ttl > role.max_ttl {
        ttl = role.max_ttl;
    }
    Ok(ttl)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keywell_core::StatementSet;

    fn role(default_secs: u64, max_secs: u64) -> RoleEntry {
        RoleEntry {
            connection: ConnectionName::new("db").unwrap(),
            statements: StatementSet::default(),
            default_ttl: Duration::from_secs(default_secs),
            max_ttl: Duration::from_secs(max_secs),
        }
    }

    #[test]
    fn lease_ttl_defaults_and_clamps() {
        // No default: fall back to the broker default.
        assert_eq!(lease_ttl(&role(0, 0), None).unwrap(), DEFAULT_LEASE_TTL);

        // Role default wins when set.
        assert_eq!(
            lease_ttl(&role(600, 0), None).unwrap(),
            Duration::from_secs(600)
        );

        // Explicit increment wins over the default but is clamped to max.
        assert_eq!(
            lease_ttl(&role(600, 1800), Some(Duration::from_secs(900))).unwrap(),
            Duration::from_secs(900)
        );
        assert_eq!(
            lease_ttl(&role(600, 1800), Some(Duration::from_secs(7200))).unwrap(),
            Duration::from_secs(1800)
        );

        // Inverted TTLs are a validation error.
        assert!(lease_ttl(&role(7200, 1800), None).is_err());
    }
}
