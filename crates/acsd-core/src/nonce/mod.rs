//! Nonce cache for Digest challenge/response exchanges.
//!
//! The CWMP digest handshake is inherently stateful: the server must
//! remember the nonce it issued to validate the response that eventually
//! arrives. Device sessions are ephemeral and high-volume, so retention is
//! bounded by a TTL (default 300 seconds) instead of growing with the fleet.
//!
//! Records are keyed by `(client IP, nonce)` so concurrent sessions from
//! distinct addresses never collide, and a nonce is only ever valid for the
//! IP that received the original challenge.
//!
//! # Thread Safety
//!
//! The cache is thread-safe using `RwLock` for the internal map; axum
//! handlers issue and validate concurrently. Entries are independent — there
//! is no coordination across unrelated keys.
//!
//! # Memory Management
//!
//! Two defenses bound memory against unauthenticated challenge floods:
//!
//! 1. **Opportunistic cleanup**: every Nth issue (default: 100) drops all
//!    expired records.
//! 2. **Hard cap on live records**: `max_entries` (default: 10,000) is a
//!    strict upper bound. When the cap is hit and cleanup frees nothing, the
//!    oldest record is evicted to make room for the new challenge.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rand::RngCore;
use rand::rngs::OsRng;

/// Nonce length in random bytes (32 hex characters on the wire).
const NONCE_BYTES: usize = 16;

/// Opaque length in random bytes (16 hex characters on the wire).
const OPAQUE_BYTES: usize = 8;

/// Configuration for the nonce cache.
#[derive(Debug, Clone)]
pub struct NonceCacheConfig {
    /// How long an issued nonce stays valid.
    pub ttl: Duration,

    /// How often to run cleanup (every N issued challenges).
    pub cleanup_interval: u64,

    /// Maximum number of live records.
    pub max_entries: usize,
}

impl Default for NonceCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            cleanup_interval: 100,
            max_entries: 10_000,
        }
    }
}

impl NonceCacheConfig {
    /// Config with the given TTL in seconds and default bounds.
    #[must_use]
    pub fn with_ttl_secs(ttl_secs: u64) -> Self {
        Self {
            ttl: Duration::from_secs(ttl_secs),
            ..Self::default()
        }
    }
}

/// A validated nonce record snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    /// The nonce value (32 lowercase hex characters).
    pub nonce: String,

    /// The opaque value issued alongside the nonce (16 lowercase hex
    /// characters).
    pub opaque: String,

    /// The client IP the challenge was issued to.
    pub client_ip: IpAddr,
}

struct StoredNonce {
    opaque: String,
    issued_at: Instant,
}

/// TTL-bounded store of issued challenge nonces.
pub struct NonceCache {
    config: NonceCacheConfig,
    records: RwLock<HashMap<(IpAddr, String), StoredNonce>>,
    // Counter driving opportunistic cleanup
    issue_count: AtomicU64,
}

impl NonceCache {
    /// Creates a new cache with the given configuration.
    #[must_use]
    pub fn new(config: NonceCacheConfig) -> Self {
        Self {
            config,
            records: RwLock::new(HashMap::new()),
            issue_count: AtomicU64::new(0),
        }
    }

    /// Generates and stores a fresh nonce/opaque pair for a client.
    ///
    /// Returns the `(nonce, opaque)` hex strings to embed in the Digest
    /// challenge. The record expires `ttl` after this call whether or not it
    /// is ever used.
    pub fn issue(&self, client_ip: IpAddr) -> (String, String) {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = hex::encode(nonce_bytes);

        let mut opaque_bytes = [0u8; OPAQUE_BYTES];
        OsRng.fill_bytes(&mut opaque_bytes);
        let opaque = hex::encode(opaque_bytes);

        // Opportunistic cleanup every Nth issue. Relaxed is fine: a missed
        // or duplicate cleanup pass is harmless.
        let count = self.issue_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % self.config.cleanup_interval == 0 {
            let removed = self.cleanup();
            if removed > 0 {
                tracing::debug!(removed, "nonce cache cleanup");
            }
        }

        let mut records = self.write_lock();
        if records.len() >= self.config.max_entries {
            Self::drop_expired(&mut records, self.config.ttl);
        }
        if records.len() >= self.config.max_entries {
            // Still full: evict the oldest record so a live device can
            // always obtain a challenge.
            if let Some(oldest) = records
                .iter()
                .min_by_key(|(_, v)| v.issued_at)
                .map(|(k, _)| k.clone())
            {
                records.remove(&oldest);
                tracing::warn!(
                    max_entries = self.config.max_entries,
                    "nonce cache at capacity, evicted oldest record"
                );
            }
        }

        records.insert(
            (client_ip, nonce.clone()),
            StoredNonce {
                opaque: opaque.clone(),
                issued_at: Instant::now(),
            },
        );

        (nonce, opaque)
    }

    /// Looks up an unexpired record for `(client_ip, nonce)`.
    ///
    /// Expired records are treated as absent; whether they have been evicted
    /// yet is invisible to the caller.
    #[must_use]
    pub fn validate(&self, client_ip: IpAddr, nonce: &str) -> Option<NonceRecord> {
        let records = self.read_lock();
        let stored = records.get(&(client_ip, nonce.to_string()))?;
        if stored.issued_at.elapsed() >= self.config.ttl {
            return None;
        }
        Some(NonceRecord {
            nonce: nonce.to_string(),
            opaque: stored.opaque.clone(),
            client_ip,
        })
    }

    /// Removes a record, if present.
    ///
    /// Used by the authenticator when single-use nonces are configured.
    pub fn invalidate(&self, client_ip: IpAddr, nonce: &str) {
        self.write_lock().remove(&(client_ip, nonce.to_string()));
    }

    /// Drops all expired records, returning how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut records = self.write_lock();
        Self::drop_expired(&mut records, self.config.ttl)
    }

    /// Number of live (possibly expired but unevicted) records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read_lock().len()
    }

    /// Returns `true` if the cache holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read_lock().is_empty()
    }

    fn drop_expired(
        records: &mut HashMap<(IpAddr, String), StoredNonce>,
        ttl: Duration,
    ) -> usize {
        let before = records.len();
        records.retain(|_, v| v.issued_at.elapsed() < ttl);
        before - records.len()
    }

    fn read_lock(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<(IpAddr, String), StoredNonce>> {
        // Propagating poison would turn a panicked handler into a permanent
        // auth outage; the map holds no invariants a panic can break.
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<(IpAddr, String), StoredNonce>> {
        self.records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    #[test]
    fn test_issue_returns_hex_tokens() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        let (nonce, opaque) = cache.issue(ip(1));
        assert_eq!(nonce.len(), 32);
        assert_eq!(opaque.len(), 16);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(opaque.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_validate_returns_stored_opaque() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        let (nonce, opaque) = cache.issue(ip(1));
        let record = cache.validate(ip(1), &nonce).unwrap();
        assert_eq!(record.opaque, opaque);
        assert_eq!(record.client_ip, ip(1));
    }

    #[test]
    fn test_validate_unknown_nonce_is_none() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        assert!(cache.validate(ip(1), "deadbeefdeadbeefdeadbeefdeadbeef").is_none());
    }

    #[test]
    fn test_nonce_bound_to_issuing_ip() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        let (nonce, _) = cache.issue(ip(1));
        assert!(cache.validate(ip(1), &nonce).is_some());
        assert!(cache.validate(ip(2), &nonce).is_none());
    }

    #[test]
    fn test_concurrent_issues_are_independent() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        let (nonce_a, _) = cache.issue(ip(1));
        let (nonce_b, _) = cache.issue(ip(2));
        assert_ne!(nonce_a, nonce_b);
        assert!(cache.validate(ip(1), &nonce_a).is_some());
        assert!(cache.validate(ip(2), &nonce_b).is_some());
    }

    #[test]
    fn test_expired_nonce_is_absent() {
        let cache = NonceCache::new(NonceCacheConfig {
            ttl: Duration::from_millis(10),
            ..NonceCacheConfig::default()
        });
        let (nonce, _) = cache.issue(ip(1));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.validate(ip(1), &nonce).is_none());
    }

    #[test]
    fn test_cleanup_drops_expired_records() {
        let cache = NonceCache::new(NonceCacheConfig {
            ttl: Duration::from_millis(10),
            ..NonceCacheConfig::default()
        });
        cache.issue(ip(1));
        cache.issue(ip(2));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.cleanup(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_removes_record() {
        let cache = NonceCache::new(NonceCacheConfig::default());
        let (nonce, _) = cache.issue(ip(1));
        cache.invalidate(ip(1), &nonce);
        assert!(cache.validate(ip(1), &nonce).is_none());
    }

    #[test]
    fn test_capacity_cap_evicts_oldest() {
        let cache = NonceCache::new(NonceCacheConfig {
            max_entries: 2,
            ..NonceCacheConfig::default()
        });
        let (first, _) = cache.issue(ip(1));
        std::thread::sleep(Duration::from_millis(2));
        let (second, _) = cache.issue(ip(2));
        std::thread::sleep(Duration::from_millis(2));
        let (third, _) = cache.issue(ip(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.validate(ip(1), &first).is_none());
        assert!(cache.validate(ip(2), &second).is_some());
        assert!(cache.validate(ip(3), &third).is_some());
    }
}
