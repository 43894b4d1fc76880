//! Durable role records.
//!
//! Two storage namespaces exist, ordinary roles under `role/` and static
//! roles under `static-role/`, distinguished by path prefix rather than a
//! type field.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keywell_core::{ConnectionName, RoleName, StatementSet, validate_ttls};
use keywell_storage::{StorageBackend, get_json, put_json};
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// Storage prefix for ordinary roles.
pub const ROLE_PREFIX: &str = "role/";

/// Storage prefix for static roles.
pub const STATIC_ROLE_PREFIX: &str = "static-role/";

/// Floor on a static role's rotation period.
pub const MIN_ROTATION_PERIOD: Duration = Duration::from_secs(5);

/// A role minting fresh credentials per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleEntry {
    /// The connection credentials are issued against.
    pub connection: ConnectionName,
    /// Statement templates per operation.
    #[serde(default)]
    pub statements: StatementSet,
    /// Lease TTL when the caller does not ask for one.
    #[serde(with = "humantime_serde", default)]
    pub default_ttl: Duration,
    /// Hard cap on the lease TTL. Zero means uncapped.
    #[serde(with = "humantime_serde", default)]
    pub max_ttl: Duration,
}

impl RoleEntry {
    /// Reject inconsistent entries before they are stored.
    pub fn validate(&self) -> Result<()> {
        validate_ttls(self.default_ttl, self.max_ttl)?;
        if self.statements.creation_is_empty() {
            return Err(BrokerError::Validation {
                what: "role",
                reason: "creation statements must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// A role whose single credential is rotated on a schedule instead of
/// minted per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRoleEntry {
    /// The connection the credential lives on.
    pub connection: ConnectionName,
    /// The fixed database username whose password is rotated.
    pub username: String,
    /// Statement templates; `rotation` is preferred, `creation` is the
    /// fallback.
    #[serde(default)]
    pub statements: StatementSet,
    /// How often the credential is rotated.
    #[serde(with = "humantime_serde")]
    pub rotation_period: Duration,
    /// The credential as of the last completed rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// When the last rotation completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotation: Option<DateTime<Utc>>,
}

impl StaticRoleEntry {
    /// Reject inconsistent entries before they are stored.
    pub fn validate(&self, min_rotation_period: Duration) -> Result<()> {
        if self.username.is_empty() {
            return Err(BrokerError::Validation {
                what: "static role",
                reason: "username must not be empty".into(),
            });
        }
        if self.rotation_period < min_rotation_period {
            return Err(BrokerError::Validation {
                what: "static role",
                reason: format!(
                    "rotation period must be at least {}s",
                    min_rotation_period.as_secs()
                ),
            });
        }
        Ok(())
    }

    /// The deadline for the next rotation: one period after the last one,
    /// or one period from now for a role that has never rotated. Never
    /// bare "now": a freshly loaded backend must not stampede its
    /// databases.
    pub fn next_rotation(&self) -> DateTime<Utc> {
        let base = self.last_rotation.unwrap_or_else(Utc::now);
        chrono::Duration::from_std(self.rotation_period)
            .ok()
            .and_then(|period| base.checked_add_signed(period))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Role persistence over the storage boundary.
#[derive(Clone)]
pub struct RoleStore {
    storage: Arc<dyn StorageBackend>,
}

impl RoleStore {
    /// A store over `storage`.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Load the ordinary role at `name`. Statements are normalized on load
    /// (revocation entries are never empty).
    pub async fn role(&self, name: &RoleName) -> Result<Option<RoleEntry>> {
        let mut entry: Option<RoleEntry> =
            get_json(self.storage.as_ref(), &format!("{ROLE_PREFIX}{name}")).await?;
        if let Some(entry) = entry.as_mut() {
            entry.statements.normalize();
        }
        Ok(entry)
    }

    /// Persist an ordinary role.
    pub async fn put_role(&self, name: &RoleName, entry: &RoleEntry) -> Result<()> {
        Ok(put_json(self.storage.as_ref(), &format!("{ROLE_PREFIX}{name}"), entry).await?)
    }

    /// Delete an ordinary role. Absent is fine.
    pub async fn delete_role(&self, name: &RoleName) -> Result<()> {
        Ok(self.storage.delete(&format!("{ROLE_PREFIX}{name}")).await?)
    }

    /// Names of all ordinary roles.
    pub async fn list_roles(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(ROLE_PREFIX).await?)
    }

    /// Load the static role at `name`.
    pub async fn static_role(&self, name: &RoleName) -> Result<Option<StaticRoleEntry>> {
        let mut entry: Option<StaticRoleEntry> =
            get_json(self.storage.as_ref(), &format!("{STATIC_ROLE_PREFIX}{name}")).await?;
        if let Some(entry) = entry.as_mut() {
            entry.statements.normalize();
        }
        Ok(entry)
    }

    /// Persist a static role.
    pub async fn put_static_role(&self, name: &RoleName, entry: &StaticRoleEntry) -> Result<()> {
        Ok(put_json(
            self.storage.as_ref(),
            &format!("{STATIC_ROLE_PREFIX}{name}"),
            entry,
        )
        .await?)
    }

    /// Delete a static role. Absent is fine.
    pub async fn delete_static_role(&self, name: &RoleName) -> Result<()> {
        Ok(self
            .storage
            .delete(&format!("{STATIC_ROLE_PREFIX}{name}"))
            .await?)
    }

    /// Names of all static roles.
    pub async fn list_static_roles(&self) -> Result<Vec<String>> {
        Ok(self.storage.list(STATIC_ROLE_PREFIX).await?)
    }
}
