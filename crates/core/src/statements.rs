//! Statement sets and named-placeholder rendering.

use serde::{Deserialize, Serialize};

/// Ordered template statements per credential operation.
///
/// Each statement is a string with named placeholders (`{{name}}`,
/// `{{password}}`, `{{expiration}}`, `{{annotation}}`) substituted at
/// issuance time by [`render`]. The templating language is deliberately
/// nothing more than that.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementSet {
    /// Statements executed to create a user.
    #[serde(default)]
    pub creation: Vec<String>,
    /// Statements executed to revoke a user.
    #[serde(default)]
    pub revocation: Vec<String>,
    /// Statements executed to roll back a partially-applied creation.
    #[serde(default)]
    pub rollback: Vec<String>,
    /// Statements executed to renew a user.
    #[serde(default)]
    pub renewal: Vec<String>,
    /// Statements executed to rotate a static credential. Empty means
    /// "use the creation statements".
    #[serde(default)]
    pub rotation: Vec<String>,
}

impl StatementSet {
    /// Normalize a freshly-loaded set.
    ///
    /// Revocation statements must never contain empty entries; they are
    /// dropped here rather than rejected, since older writers emitted them.
    pub fn normalize(&mut self) {
        self.revocation.retain(|s| !s.trim().is_empty());
    }

    /// Whether no creation statements are present.
    pub fn creation_is_empty(&self) -> bool {
        self.creation.iter().all(|s| s.trim().is_empty())
    }

    /// The statements used for a scheduled rotation: the dedicated rotation
    /// set when present, otherwise the creation set.
    pub fn for_rotation(&self) -> &[String] {
        if self.rotation.is_empty() {
            &self.creation
        } else {
            &self.rotation
        }
    }
}

/// Substitute named placeholders into a statement template.
///
/// Every occurrence of `{{key}}` for each `(key, value)` pair is replaced.
/// Unknown placeholders are left untouched so an engine can reject them with
/// a useful message instead of silently executing a mangled statement.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// Render every statement in a slice with the same variable set.
pub fn render_all(statements: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    statements.iter().map(|s| render(s, vars)).collect()
}
