//! Identity objects mirrored from the external source.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, Result};

/// Namespace assumed when an object carries none.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Pattern a non-empty annotation value must match before it is ever
/// interpolated into a statement: alphanumerics, underscores, and dots only.
pub const ANNOTATION_PATTERN: &str = r"^[\w.]+$";

static ANNOTATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(ANNOTATION_PATTERN).expect("annotation pattern is a valid literal regex")
});

/// One namespaced object from the watched collection.
///
/// Not owned by keywell: mirrored read-only, and the whole cache may be
/// replaced on resync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityObject {
    /// Namespace; absent means [`DEFAULT_NAMESPACE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Object name, unique within its namespace.
    pub name: String,
    /// Annotation key/value pairs.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl IdentityObject {
    /// The cache (and storage-suffix) key: `namespace/name`, with the
    /// namespace defaulted when absent.
    pub fn cache_key(&self) -> String {
        cache_key(self.namespace.as_deref(), &self.name)
    }

    /// Extract the annotation under `key`, gated by the identifier pattern.
    ///
    /// Missing or empty values are `Ok(None)`: the object simply is not
    /// participating. A non-empty value that fails the pattern is an error:
    /// skipping it silently would hide a misconfiguration (or an injection
    /// attempt) from operators.
    pub fn annotation(&self, key: &str) -> Result<Option<&str>> {
        match self.annotations.get(key) {
            None => Ok(None),
            Some(value) if value.is_empty() => Ok(None),
            Some(value) => {
                if ANNOTATION_REGEX.is_match(value) {
                    Ok(Some(value))
                } else {
                    Err(IdentityError::AnnotationPattern {
                        object: self.cache_key(),
                        value: value.clone(),
                        pattern: ANNOTATION_PATTERN,
                    })
                }
            }
        }
    }
}

/// Build the `namespace/name` key used by the cache and the durable records.
pub fn cache_key(namespace: Option<&str>, name: &str) -> String {
    let namespace = match namespace {
        Some(ns) if !ns.is_empty() => ns,
        _ => DEFAULT_NAMESPACE,
    };
    format!("{namespace}/{name}")
}
