//! ACS credential storage.
//!
//! Credentials are loaded once from configuration and held immutably for the
//! life of the process. Lookup is a linear scan: the list is expected to stay
//! below ten entries (one pair, plus a second during credential migration).
//!
//! Absent or mismatched credentials are reported as "not found", never as an
//! error, so callers always fall back to re-challenging the device.

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::config::CredentialEntry;

/// One valid username/password pair.
pub struct Credential {
    username: String,
    password: SecretString,
}

impl Credential {
    /// Create a credential from plain strings.
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: SecretString::from(password.into()),
        }
    }

    /// The username the device presents.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Expose the password for digest computation.
    ///
    /// The password participates in the HA1 hash, so the authenticator needs
    /// the cleartext. It must never be logged or embedded in error messages.
    #[must_use]
    pub fn password(&self) -> &str {
        self.password.expose_secret()
    }

    /// Check a candidate password in constant time.
    #[must_use]
    pub fn password_matches(&self, candidate: &str) -> bool {
        bool::from(
            self.password
                .expose_secret()
                .as_bytes()
                .ct_eq(candidate.as_bytes()),
        )
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Immutable list of valid ACS credentials.
#[derive(Debug)]
pub struct CredentialStore {
    credentials: Vec<Credential>,
}

impl CredentialStore {
    /// Build a store from explicit credentials.
    #[must_use]
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }

    /// Build a store from configuration entries.
    #[must_use]
    pub fn from_config(entries: &[CredentialEntry]) -> Self {
        Self {
            credentials: entries
                .iter()
                .map(|e| Credential::new(e.username.clone(), e.password.clone()))
                .collect(),
        }
    }

    /// Look up a credential by username.
    #[must_use]
    pub fn find(&self, username: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.username == username)
    }

    /// Verify a username/password pair.
    ///
    /// Returns `false` for unknown usernames and for password mismatches
    /// alike; the caller re-challenges in both cases.
    #[must_use]
    pub fn verify(&self, username: &str, password: &str) -> bool {
        self.find(username)
            .is_some_and(|c| c.password_matches(password))
    }

    /// Number of configured credential pairs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Returns `true` if no credentials are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CredentialStore {
        CredentialStore::new(vec![
            Credential::new("acs-user", "acs-password"),
            Credential::new("acs-user-new", "rotated"),
        ])
    }

    #[test]
    fn test_find_known_username() {
        let store = store();
        assert_eq!(store.find("acs-user").unwrap().username(), "acs-user");
    }

    #[test]
    fn test_find_unknown_username_is_none() {
        assert!(store().find("nobody").is_none());
    }

    #[test]
    fn test_verify_correct_pair() {
        assert!(store().verify("acs-user", "acs-password"));
    }

    #[test]
    fn test_verify_wrong_password() {
        assert!(!store().verify("acs-user", "acs-passwore"));
    }

    #[test]
    fn test_verify_unknown_username() {
        assert!(!store().verify("nobody", "acs-password"));
    }

    #[test]
    fn test_both_migration_pairs_valid_concurrently() {
        let store = store();
        assert!(store.verify("acs-user", "acs-password"));
        assert!(store.verify("acs-user-new", "rotated"));
    }

    #[test]
    fn test_debug_never_shows_password() {
        let debug = format!("{:?}", store());
        assert!(!debug.contains("acs-password"));
        assert!(debug.contains("[REDACTED]"));
    }
}
