//! End-to-end backend scenarios over in-memory storage and a scripted
//! engine opener.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keywell_broker::{
    Backend, BackendConfig, BrokerError, ConnectionConfig, RoleEntry, RotationConfig,
    SessionOpener, StaticRoleEntry,
};
use keywell_core::{ConnectionName, EngineKind, RoleName, StatementSet};
use keywell_engine::{Database, EngineError};
use keywell_identity::{IdentityObject, WatchEvent, WatcherConfig};
use keywell_storage::{MemoryStorage, StorageBackend};
use pretty_assertions::assert_eq;
use serde_json::Map;

const ROLE_KEY: &str = "keywell.io/keyspace";

#[derive(Debug, Clone)]
struct CreatedUser {
    username: String,
    password: String,
    creation: Vec<String>,
}

#[derive(Default)]
struct EngineScript {
    opens: AtomicUsize,
    closes: AtomicUsize,
    created: parking_lot::Mutex<Vec<CreatedUser>>,
    revoked: parking_lot::Mutex<Vec<String>>,
    fail_next_create: AtomicBool,
    recognize_engines: bool,
}

struct FakeSession {
    engine: EngineKind,
    script: Arc<EngineScript>,
}

#[async_trait]
impl Database for FakeSession {
    async fn initialize(
        &self,
        _config: Map<String, serde_json::Value>,
        _verify: bool,
    ) -> keywell_engine::Result<()> {
        Ok(())
    }

    async fn create_user(
        &self,
        statements: StatementSet,
        username: &str,
        password: &str,
        _expiration: &str,
    ) -> keywell_engine::Result<()> {
        if self.script.fail_next_create.swap(false, Ordering::SeqCst) {
            return Err(EngineError::TransportClosed);
        }
        self.script.created.lock().push(CreatedUser {
            username: username.to_string(),
            password: password.to_string(),
            creation: statements.creation,
        });
        Ok(())
    }

    async fn renew_user(
        &self,
        _statements: StatementSet,
        _username: &str,
        _expiration: &str,
    ) -> keywell_engine::Result<()> {
        Ok(())
    }

    async fn revoke_user(
        &self,
        _statements: StatementSet,
        username: &str,
    ) -> keywell_engine::Result<()> {
        self.script.revoked.lock().push(username.to_string());
        Ok(())
    }

    fn kind(&self) -> EngineKind {
        self.engine.clone()
    }

    async fn close(&self) -> keywell_engine::Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeOpener {
    script: Arc<EngineScript>,
}

#[async_trait]
impl SessionOpener for FakeOpener {
    async fn open(
        &self,
        _name: &ConnectionName,
        config: &ConnectionConfig,
    ) -> keywell_engine::Result<Box<dyn Database>> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            engine: config.engine.clone(),
            script: Arc::clone(&self.script),
        }))
    }

    fn recognizes(&self, _kind: &EngineKind) -> bool {
        self.script.recognize_engines
    }
}

fn fast_config() -> BackendConfig {
    BackendConfig {
        rotation: RotationConfig {
            tick: Duration::from_millis(10),
            failure_backoff: Duration::from_millis(20),
            min_rotation_period: Duration::from_millis(1),
        },
        watcher: WatcherConfig {
            resync_interval: Duration::from_secs(3600),
            retry_backoff: Duration::from_millis(50),
        },
        sync_interval: Duration::from_secs(3600),
    }
}

fn harness() -> (Arc<Backend>, Arc<EngineScript>, Arc<MemoryStorage>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    harness_with_storage(Arc::new(MemoryStorage::new()))
}

fn harness_with_storage(
    storage: Arc<MemoryStorage>,
) -> (Arc<Backend>, Arc<EngineScript>, Arc<MemoryStorage>) {
    let script = Arc::new(EngineScript {
        recognize_engines: true,
        ..EngineScript::default()
    });
    let backend = Backend::new(
        Arc::clone(&storage) as Arc<dyn StorageBackend>,
        Arc::new(FakeOpener {
            script: Arc::clone(&script),
        }),
        fast_config(),
    );
    (backend, script, storage)
}

fn db() -> ConnectionName {
    ConnectionName::new("main-db").unwrap()
}

fn connection() -> ConnectionConfig {
    ConnectionConfig {
        engine: EngineKind::new("cassandra-engine").unwrap(),
        connection_details: Map::new(),
        verify_connection: false,
    }
}

fn rw_role() -> RoleEntry {
    RoleEntry {
        connection: db(),
        statements: StatementSet {
            creation: vec![
                "CREATE ROLE {{name}} WITH PASSWORD '{{password}}'".to_string(),
                "GRANT ALL ON KEYSPACE {{annotation}} TO {{name}}".to_string(),
            ],
            revocation: vec!["DROP ROLE {{name}}".to_string()],
            ..StatementSet::default()
        },
        default_ttl: Duration::from_secs(600),
        max_ttl: Duration::from_secs(3600),
    }
}

fn worker_identity(annotation: Option<&str>) -> IdentityObject {
    let mut annotations = BTreeMap::new();
    if let Some(value) = annotation {
        annotations.insert(ROLE_KEY.to_string(), value.to_string());
    }
    IdentityObject {
        namespace: Some("payments".to_string()),
        name: "worker".to_string(),
        annotations,
    }
}

#[tokio::test]
async fn issues_credentials_for_an_ordinary_role() {
    let (backend, script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();

    let role = RoleName::new("rw").unwrap();
    backend.write_role(&role, rw_role()).await.unwrap();

    let issued = backend.issue_credentials(&role, "app").await.unwrap();
    assert!(issued.username.starts_with("v-app-rw-"));
    assert!(!issued.password.is_empty());
    assert_eq!(issued.ttl, Duration::from_secs(600));

    let created = script.created.lock().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].username, issued.username);
    assert_eq!(created[0].password, issued.password);
    // Name/password placeholders are the engine's to render; they arrive
    // untouched.
    assert!(created[0].creation[0].contains("{{name}}"));

    backend.revoke_credentials(&role, &issued.username).await.unwrap();
    assert_eq!(script.revoked.lock().clone(), vec![issued.username.clone()]);

    let renewed = backend
        .renew_credentials(&role, &issued.username, Some(Duration::from_secs(900)))
        .await
        .unwrap();
    assert_eq!(renewed, Duration::from_secs(900));
}

#[tokio::test]
async fn unknown_role_and_connection_are_user_errors() {
    let (backend, _script, _storage) = harness();

    let err = backend
        .issue_credentials(&RoleName::new("ghost").unwrap(), "app")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownRole { .. }));
    assert!(err.is_user_error());

    // Role exists but points at a never-configured connection.
    let role = RoleName::new("rw").unwrap();
    backend.write_role(&role, rw_role()).await.unwrap();
    let err = backend.issue_credentials(&role, "app").await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownConnection { .. }));
}

#[tokio::test]
async fn derived_role_interpolates_the_identity_annotation() {
    let (backend, script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();
    backend
        .write_role(&RoleName::new("rw").unwrap(), rw_role())
        .await
        .unwrap();

    backend
        .identity_cache()
        .apply(WatchEvent::Added(worker_identity(Some("ledger"))))
        .await;

    let derived = RoleName::new("k8s_rw_payments_worker").unwrap();
    backend.issue_credentials(&derived, "app").await.unwrap();

    let created = script.created.lock().clone();
    assert_eq!(
        created[0].creation[1],
        "GRANT ALL ON KEYSPACE ledger TO {{name}}"
    );

    // Read path resolves the same way.
    let resolved = backend.read_role(&derived).await.unwrap().unwrap();
    assert!(resolved.statements.creation[1].contains("ledger"));
}

#[tokio::test]
async fn derived_role_without_identity_annotation_is_not_found() {
    let (backend, _script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();
    backend
        .write_role(&RoleName::new("rw").unwrap(), rw_role())
        .await
        .unwrap();
    backend
        .identity_cache()
        .apply(WatchEvent::Added(worker_identity(None)))
        .await;

    let derived = RoleName::new("k8s_rw_payments_worker").unwrap();
    let err = backend.issue_credentials(&derived, "app").await.unwrap_err();
    assert!(matches!(err, BrokerError::UnknownRole { .. }));

    assert_eq!(backend.read_role(&derived).await.unwrap(), None);

    // Malformed derived names fail validation instead.
    let err = backend
        .issue_credentials(&RoleName::new("k8s_rw").unwrap(), "app")
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::MalformedDerivedRole { .. }));
}

#[tokio::test]
async fn connection_lost_retires_the_handle_and_the_next_call_rebuilds() {
    let (backend, script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();
    let role = RoleName::new("rw").unwrap();
    backend.write_role(&role, rw_role()).await.unwrap();

    // Warm the connection.
    backend.issue_credentials(&role, "app").await.unwrap();
    assert_eq!(script.opens.load(Ordering::SeqCst), 1);

    // The engine process dies mid-call.
    script.fail_next_create.store(true, Ordering::SeqCst);
    let err = backend.issue_credentials(&role, "app").await.unwrap_err();
    assert!(err.is_retryable());

    // Cleanup runs asynchronously; give it a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(backend.registry().is_empty().await);

    // The retry rebuilds the connection from config.
    backend.issue_credentials(&role, "app").await.unwrap();
    assert_eq!(script.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn static_roles_rotate_on_schedule_and_on_demand() {
    let (backend, script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();
    backend.start().await.unwrap();

    let role = RoleName::new("ledger-writer").unwrap();
    backend
        .write_static_role(
            &role,
            StaticRoleEntry {
                connection: db(),
                username: "svc_ledger".to_string(),
                statements: StatementSet {
                    creation: vec!["ALTER ROLE {{name}} WITH PASSWORD '{{password}}'".to_string()],
                    ..StatementSet::default()
                },
                rotation_period: Duration::from_millis(50),
                password: None,
                last_rotation: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(backend.scheduled_rotations().await, 1);

    // Let the driver rotate at least once.
    tokio::time::sleep(Duration::from_millis(300)).await;

    let entry = backend.read_static_role(&role).await.unwrap().unwrap();
    let scheduled_password = entry.password.clone().expect("password persisted");
    assert!(entry.last_rotation.is_some());
    assert!(
        script
            .created
            .lock()
            .iter()
            .any(|c| c.username == "svc_ledger"),
        "rotation went through the engine"
    );

    // Forced rotation replaces the credential immediately.
    backend.rotate_role(&role).await.unwrap();
    let entry = backend.read_static_role(&role).await.unwrap().unwrap();
    assert_ne!(entry.password.unwrap(), scheduled_password);

    // Deletion drops the role from the schedule.
    backend.delete_static_role(&role).await.unwrap();
    assert_eq!(backend.scheduled_rotations().await, 0);

    backend.teardown().await;
    assert!(backend.registry().is_empty().await);
}

#[tokio::test]
async fn startup_schedules_preexisting_static_roles() {
    let (seed_backend, _script, storage) = harness();
    seed_backend.configure_connection(&db(), connection()).await.unwrap();
    seed_backend
        .write_static_role(
            &RoleName::new("ledger-writer").unwrap(),
            StaticRoleEntry {
                connection: db(),
                username: "svc_ledger".to_string(),
                statements: StatementSet {
                    creation: vec!["ALTER ROLE {{name}}".to_string()],
                    ..StatementSet::default()
                },
                rotation_period: Duration::from_millis(50),
                password: None,
                last_rotation: None,
            },
        )
        .await
        .unwrap();

    // A fresh backend over the same storage picks the role up on start.
    let (backend, script, _storage) = harness_with_storage(storage);
    backend.start().await.unwrap();
    assert_eq!(backend.scheduled_rotations().await, 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        script
            .created
            .lock()
            .iter()
            .any(|c| c.username == "svc_ledger"),
        "loaded role rotated"
    );
    backend.teardown().await;
}

#[tokio::test]
async fn configure_connection_validates_engine_and_resets_the_handle() {
    let (backend, script, _storage) = harness();
    backend.configure_connection(&db(), connection()).await.unwrap();
    let role = RoleName::new("rw").unwrap();
    backend.write_role(&role, rw_role()).await.unwrap();
    backend.issue_credentials(&role, "app").await.unwrap();
    assert_eq!(script.opens.load(Ordering::SeqCst), 1);

    // Reconfiguration retires the live handle; the next call reopens with
    // the new config.
    let mut updated = connection();
    updated.engine = EngineKind::new("postgresql-engine").unwrap();
    backend.configure_connection(&db(), updated).await.unwrap();
    backend.issue_credentials(&role, "app").await.unwrap();
    assert_eq!(script.opens.load(Ordering::SeqCst), 2);

    // External invalidation events behave like reconfiguration.
    backend.invalidate("database/config/main-db").await;
    backend.issue_credentials(&role, "app").await.unwrap();
    assert_eq!(script.opens.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn configure_connection_rejects_engines_outside_the_registry() {
    let storage = Arc::new(MemoryStorage::new());
    let script = Arc::new(EngineScript {
        recognize_engines: false,
        ..EngineScript::default()
    });
    let backend = Backend::new(
        storage as Arc<dyn StorageBackend>,
        Arc::new(FakeOpener {
            script: Arc::clone(&script),
        }),
        fast_config(),
    );

    let err = backend
        .configure_connection(&db(), connection())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Validation { .. }));
    assert!(err.to_string().contains("custom engines are not supported"));
}

#[tokio::test]
async fn source_config_roundtrips_and_controls_the_watch() {
    let (backend, _script, _storage) = harness();
    assert_eq!(backend.read_source_config().await.unwrap(), None);

    let config = keywell_identity::SourceConfig {
        // Nothing listens here; the watch loop just retries with backoff
        // until teardown.
        host: "http://127.0.0.1:9".to_string(),
        ca_cert: String::new(),
        token: "token".to_string(),
        role_annotation: ROLE_KEY.to_string(),
        database_annotation: "keywell.io/database".to_string(),
    };
    backend.write_source_config(config.clone()).await.unwrap();
    assert_eq!(backend.read_source_config().await.unwrap(), Some(config));

    backend.teardown().await;
}

#[tokio::test]
async fn reconciliation_persists_cached_annotations() {
    let (backend, _script, storage) = harness();
    backend
        .identity_cache()
        .apply(WatchEvent::Added(worker_identity(Some("ledger"))))
        .await;

    let summary = backend.sync_identities().await.unwrap();
    assert_eq!(summary.written, 1);

    let stored: Option<String> =
        keywell_storage::get_json(storage.as_ref(), "config/identity/payments/worker")
            .await
            .unwrap();
    assert_eq!(stored, Some("ledger".to_string()));
}
