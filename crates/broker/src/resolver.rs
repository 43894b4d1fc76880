//! Role resolution, including derived (identity-parameterized) roles.

use keywell_core::{ConnectionName, RoleName, render_all};
use keywell_identity::{IdentityCache, annotation_for, cache_key};
use keywell_storage::StorageBackend;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::roles::{RoleEntry, RoleStore};

/// Prefix marking a role name as derived from an external identity.
pub const DERIVED_ROLE_PREFIX: &str = "k8s_";

/// The components of a derived role name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DerivedRoleParts<'a> {
    /// The stored base role.
    pub base_role: &'a str,
    /// The identity's namespace.
    pub namespace: &'a str,
    /// The identity's name (may itself contain underscores).
    pub identity: &'a str,
}

/// Split `k8s_<role>_<namespace>_<identity-name>` into its components.
///
/// Malformed names fail fast with a validation error rather than a lookup
/// miss, so a typo is distinguishable from a genuinely unknown role.
pub fn parse_derived_role(name: &str) -> Result<DerivedRoleParts<'_>> {
    let mut parts = name.splitn(4, '_');
    let (Some(prefix), Some(base_role), Some(namespace), Some(identity)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(BrokerError::MalformedDerivedRole {
            name: name.to_string(),
        });
    };
    if prefix != "k8s" || base_role.is_empty() || namespace.is_empty() || identity.is_empty() {
        return Err(BrokerError::MalformedDerivedRole {
            name: name.to_string(),
        });
    }
    Ok(DerivedRoleParts {
        base_role,
        namespace,
        identity,
    })
}

/// Resolve a role name to its effective entry.
///
/// Ordinary names load directly. A `k8s_`-prefixed name that is not stored
/// literally is derived: load the base role, resolve the identity's
/// annotation (live cache first, durable record fallback), and substitute
/// it into every creation statement via `{{annotation}}`. A derived role
/// whose identity carries no annotation does not exist (`Ok(None)`);
/// callers treat that as "role not found", not as a fault.
pub async fn resolve_role(
    store: &RoleStore,
    cache: &IdentityCache,
    storage: &dyn StorageBackend,
    role_annotation: &str,
    database_annotation: &str,
    name: &RoleName,
) -> Result<Option<RoleEntry>> {
    // A literally stored role always wins, derived-looking name or not.
    if let Some(entry) = store.role(name).await? {
        return Ok(Some(entry));
    }
    if !name.as_str().starts_with(DERIVED_ROLE_PREFIX) {
        return Ok(None);
    }

    let parts = parse_derived_role(name.as_str())?;
    let base_role = RoleName::new(parts.base_role)?;
    let Some(mut entry) = store.role(&base_role).await? else {
        return Ok(None);
    };

    let Some(annotation) =
        annotation_for(cache, storage, role_annotation, parts.namespace, parts.identity).await?
    else {
        // No identity with an annotation backs this name.
        return Ok(None);
    };

    debug!(role = %name, base = %base_role, annotation = %annotation, "derived role resolved");
    entry.statements.creation =
        render_all(&entry.statements.creation, &[("annotation", &annotation)]);

    // A live identity may also override which database it lives on.
    if let Some(object) = cache
        .get(&cache_key(Some(parts.namespace), parts.identity))
        .await
    {
        if let Some(database) = object.annotation(database_annotation)? {
            entry.connection = ConnectionName::new(database)?;
        }
    }

    Ok(Some(entry))
}
