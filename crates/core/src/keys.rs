//! Validated name newtypes shared across the workspace.
//!
//! Connection, role, and engine identifiers all end up in storage paths and
//! inside rendered statements, so they are validated once at the boundary
//! instead of re-checked at every use site.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length for any validated name.
const NAME_MAX_LEN: usize = 255;

/// Errors from constructing a validated name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    /// The input was empty.
    #[error("{kind} name cannot be empty")]
    Empty {
        /// Which name type rejected the input.
        kind: &'static str,
    },
    /// The input contains characters outside `[A-Za-z0-9_.-]`.
    #[error("{kind} name {name:?} contains invalid characters (allowed: alphanumerics, '_', '.', '-')")]
    InvalidCharacters {
        /// Which name type rejected the input.
        kind: &'static str,
        /// The offending input.
        name: String,
    },
    /// The input exceeds [`NAME_MAX_LEN`] characters.
    #[error("{kind} name exceeds maximum length of {NAME_MAX_LEN} characters")]
    TooLong {
        /// Which name type rejected the input.
        kind: &'static str,
    },
}

fn validate(kind: &'static str, raw: &str) -> Result<(), NameError> {
    if raw.is_empty() {
        return Err(NameError::Empty { kind });
    }
    if raw.len() > NAME_MAX_LEN {
        return Err(NameError::TooLong { kind });
    }
    if !raw
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
    {
        return Err(NameError::InvalidCharacters {
            kind,
            name: raw.to_string(),
        });
    }
    Ok(())
}

macro_rules! name_type {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Create a new validated name.
            pub fn new(raw: impl Into<String>) -> Result<Self, NameError> {
                let raw = raw.into();
                validate($kind, &raw)?;
                Ok(Self(raw))
            }

            /// Return the inner string slice.
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = NameError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = NameError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<String> for $name {
            type Error = NameError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(name: $name) -> Self {
                name.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }
    };
}

name_type!(
    /// Name of a configured database connection.
    ///
    /// Keys the durable `ConnectionConfig` record and the live connection
    /// registry entry.
    ConnectionName,
    "connection"
);

name_type!(
    /// Name of a role (ordinary or static; the storage path prefix decides
    /// which, not the name itself).
    ///
    /// Derived names like `k8s_rw_payments_worker` pass the same character
    /// set; their structure is interpreted by the role resolver, not here.
    RoleName,
    "role"
);

name_type!(
    /// Identifier of a database engine plugin, e.g. `postgresql-engine`.
    ///
    /// The set of recognized engines is a closed registry; this type only
    /// guarantees the identifier is well-formed, not that it is known.
    EngineKind,
    "engine"
);
