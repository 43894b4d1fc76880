//! Stateless credential generation helpers.
//!
//! Engines answer the `GenerateUsername` / `GeneratePassword` /
//! `GenerateExpiration` operations with these by default; nothing here
//! touches a database or any shared state.

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngExt;
use uuid::Uuid;

/// Display-name prefixes longer than this are truncated before the random
/// suffix is appended.
const DISPLAY_NAME_MAX_LEN: usize = 26;

/// Default cap on a generated username. Engines with tighter limits pass
/// their own cap.
pub const USERNAME_MAX_LEN: usize = 63;

/// Random bytes of entropy in a generated password.
const PASSWORD_ENTROPY_BYTES: usize = 20;

/// Generate a username of the form `v-{display}-{role}-{uuid}`, truncated to
/// `max_len` bytes.
///
/// The `v-` prefix marks brokered users so operators can tell them apart
/// from human accounts when auditing the database side.
pub fn generate_username(display_name: &str, role: &str, max_len: usize) -> String {
    let display = truncate(display_name, DISPLAY_NAME_MAX_LEN);
    let role = truncate(role, DISPLAY_NAME_MAX_LEN);
    let mut username = format!("v-{display}-{role}-{}", Uuid::new_v4());
    username.truncate(max_len);
    // A trailing separator reads like a mistake in audit logs.
    while username.ends_with('-') {
        username.pop();
    }
    username
}

/// Generate a random password: 160 bits of entropy, base64url, no padding.
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_ENTROPY_BYTES];
    rand::rng().fill(&mut bytes[..]);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Format an absolute expiration instant the way engines expect it,
/// e.g. `2026-08-06 15:04:05+0000`.
pub fn format_expiration(expires_at: DateTime<Utc>) -> String {
    expires_at.format("%Y-%m-%d %H:%M:%S%z").to_string()
}

/// Compute and format the expiration `ttl` from now. Absurdly large TTLs
/// saturate instead of overflowing.
pub fn generate_expiration(ttl: Duration) -> String {
    let now = Utc::now();
    let expires_at = chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    format_expiration(expires_at)
}

/// Errors from TTL validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TtlError {
    /// `default_ttl` exceeds a non-zero `max_ttl`.
    #[error("default ttl {default_secs}s exceeds maximum ttl {max_secs}s")]
    DefaultExceedsMax {
        /// The configured default TTL in seconds.
        default_secs: u64,
        /// The configured maximum TTL in seconds.
        max_secs: u64,
    },
}

/// Check a role's TTL pair for consistency. A zero `max_ttl` means
/// "no maximum".
pub fn validate_ttls(default_ttl: Duration, max_ttl: Duration) -> Result<(), TtlError> {
    if !max_ttl.is_zero() && default_ttl > max_ttl {
        return Err(TtlError::DefaultExceedsMax {
            default_secs: default_ttl.as_secs(),
            max_secs: max_ttl.as_secs(),
        });
    }
    Ok(())
}

fn truncate(s: &str, max_len: usize) -> &str {
    match s.char_indices().nth(max_len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_has_prefix_and_fits_cap() {
        let username = generate_username("token-create-abcdefghijklmnopqrstuvwxyz", "rw", 63);
        assert!(username.starts_with("v-token-create-abcdefghijkl"));
        assert!(username.len() <= 63);
        assert!(!username.ends_with('-'));
    }

    #[test]
    fn usernames_are_unique() {
        let a = generate_username("app", "rw", 63);
        let b = generate_username("app", "rw", 63);
        assert_ne!(a, b);
    }

    #[test]
    fn tight_cap_still_valid() {
        let username = generate_username("app", "rw", 16);
        assert!(username.len() <= 16);
        assert!(!username.is_empty());
    }

    #[test]
    fn passwords_are_random_and_urlsafe() {
        let a = generate_password();
        let b = generate_password();
        assert_ne!(a, b);
        assert!(a.bytes().all(|c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_'));
    }

    #[test]
    fn expiration_format_matches_engine_expectation() {
        let at = DateTime::parse_from_rfc3339("2026-08-06T15:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_expiration(at), "2026-08-06 15:04:05+0000");
    }

    #[test]
    fn ttl_validation() {
        let ok = validate_ttls(Duration::from_secs(60), Duration::from_secs(3600));
        assert_eq!(ok, Ok(()));

        // Zero max means unlimited.
        assert_eq!(
            validate_ttls(Duration::from_secs(60), Duration::ZERO),
            Ok(())
        );

        let err = validate_ttls(Duration::from_secs(7200), Duration::from_secs(3600)).unwrap_err();
        assert_eq!(
            err,
            TtlError::DefaultExceedsMax {
                default_secs: 7200,
                max_secs: 3600
            }
        );
    }
}
