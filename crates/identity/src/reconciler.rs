//! The periodic pass making durable storage match the watch cache.

use std::collections::HashSet;

use keywell_storage::{StorageBackend, get_json, put_json};
use tracing::{error, info};

use crate::cache::IdentityCache;
use crate::config::IDENTITY_RECORD_PREFIX;
use crate::error::Result;
use crate::object::cache_key;

/// What one reconciliation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Records written this pass (the survivor set size).
    pub written: usize,
    /// Objects skipped for missing/empty annotations.
    pub skipped: usize,
    /// Objects rejected by the annotation pattern.
    pub invalid: usize,
    /// Stale records deleted.
    pub deleted: usize,
}

/// Copy the cache's annotations into durable storage and delete records no
/// longer backed by an annotated object.
///
/// An empty cache is a strict no-op: a transient empty watch must never
/// wipe storage. Deletion is driven by the survivor set (only keys written
/// this pass are kept), so it removes exactly the records provably not
/// backed anymore. Per-object annotation failures are logged and skipped;
/// any storage failure aborts the pass before it can delete anything it
/// should not.
pub async fn sync_identities(
    cache: &IdentityCache,
    storage: &dyn StorageBackend,
    annotation_key: &str,
) -> Result<SyncSummary> {
    let objects = cache.list().await;
    if objects.is_empty() {
        return Ok(SyncSummary::default());
    }

    info!(count = objects.len(), "syncing identity annotations");
    let mut summary = SyncSummary::default();
    let mut survivors = HashSet::new();

    for object in &objects {
        let annotation = match object.annotation(annotation_key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                summary.skipped += 1;
                continue;
            }
            Err(err) => {
                error!(object = %object.cache_key(), error = %err, "rejecting annotation");
                summary.invalid += 1;
                continue;
            }
        };

        let suffix = object.cache_key();
        put_json(
            storage,
            &format!("{IDENTITY_RECORD_PREFIX}{suffix}"),
            &annotation,
        )
        .await?;
        survivors.insert(suffix);
        summary.written += 1;
    }

    // Reading the persisted set must succeed before any deletion happens;
    // partial deletion is worse than a skipped pass.
    let persisted = storage.list(IDENTITY_RECORD_PREFIX).await?;
    for suffix in persisted {
        if !survivors.contains(&suffix) {
            storage
                .delete(&format!("{IDENTITY_RECORD_PREFIX}{suffix}"))
                .await?;
            summary.deleted += 1;
        }
    }

    info!(
        written = summary.written,
        skipped = summary.skipped,
        invalid = summary.invalid,
        deleted = summary.deleted,
        "identity sync complete"
    );
    Ok(summary)
}

/// Resolve the annotation for one identity: live cache first, durable
/// record as the fallback.
///
/// The fallback covers early startup, when the watch cache may not be
/// populated yet but a previous process already synced the annotation.
pub async fn annotation_for(
    cache: &IdentityCache,
    storage: &dyn StorageBackend,
    annotation_key: &str,
    namespace: &str,
    name: &str,
) -> Result<Option<String>> {
    let key = cache_key(Some(namespace), name);

    if let Some(object) = cache.get(&key).await {
        return Ok(object.annotation(annotation_key)?.map(str::to_string));
    }

    Ok(get_json(storage, &format!("{IDENTITY_RECORD_PREFIX}{key}")).await?)
}
