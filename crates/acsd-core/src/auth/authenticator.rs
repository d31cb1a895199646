//! Per-request Digest/Basic authentication state machine.
//!
//! Each inbound request resolves to exactly one [`AuthDecision`]:
//!
//! ```text
//! NoAuthHeader ------------------------------> Challenge
//! DigestHeaderPresent --validate--> Authenticated | Challenge
//! BasicHeaderPresent  --validate--> Authenticated | Challenge
//! UnknownAuthType ---------------------------> Challenge
//! ```
//!
//! Every failure path re-issues a fresh challenge instead of terminating the
//! exchange with a hard error: intermittent CPE firmware retries with
//! corrected credentials inside the same TCP session expectations, and a 401
//! keeps that retry path open.
//!
//! Each decision branch emits a structured tracing event. Operating a device
//! fleet without that trail makes authentication faults undiagnosable, so
//! the logging here is part of the contract, not decoration.

use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use subtle::ConstantTimeEq;

use super::digest::DigestParams;
use crate::credentials::CredentialStore;
use crate::nonce::NonceCache;

/// Outcome of authenticating one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Credentials verified; the request proceeds to the device session.
    Authenticated {
        /// The username that authenticated.
        username: String,
    },

    /// The request must be answered with a 401 carrying both challenge
    /// headers.
    Challenge {
        /// Fresh nonce for the Digest challenge.
        nonce: String,
        /// Opaque value stored alongside the nonce.
        opaque: String,
        /// Why the request was not authenticated.
        reason: ChallengeReason,
    },
}

/// Why a request was answered with a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeReason {
    /// No `Authorization` header was present.
    NoCredentials,
    /// The header carried a scheme other than `Digest` or `Basic`.
    UnrecognizedScheme,
    /// The header could not be parsed (bad base64, missing `:` separator,
    /// missing or empty required digest fields).
    MalformedCredentials,
    /// The digest nonce is unknown for this client IP or past its TTL.
    NonceInvalid,
    /// The supplied opaque does not match the one stored with the nonce.
    OpaqueMismatch,
    /// The username is not in the credential store.
    UnknownUsername,
    /// The digest response hash does not match the expected value.
    ResponseMismatch,
    /// Basic credentials named a known user but the password was wrong.
    CredentialMismatch,
}

impl ChallengeReason {
    /// Stable label used in log events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoCredentials => "no_credentials",
            Self::UnrecognizedScheme => "unrecognized_scheme",
            Self::MalformedCredentials => "malformed_credentials",
            Self::NonceInvalid => "nonce_invalid",
            Self::OpaqueMismatch => "opaque_mismatch",
            Self::UnknownUsername => "unknown_username",
            Self::ResponseMismatch => "response_mismatch",
            Self::CredentialMismatch => "credential_mismatch",
        }
    }
}

/// The Digest/Basic authentication negotiator.
///
/// Constructed once from the loaded credential list and an injected nonce
/// cache; cheap to share across connection handlers. Multiple independent
/// instances (e.g. in tests) never interfere because all state lives in the
/// injected cache.
pub struct Authenticator {
    realm: String,
    credentials: Arc<CredentialStore>,
    nonces: Arc<NonceCache>,
    single_use_nonces: bool,
}

impl Authenticator {
    /// Create an authenticator.
    #[must_use]
    pub fn new(
        realm: impl Into<String>,
        credentials: Arc<CredentialStore>,
        nonces: Arc<NonceCache>,
        single_use_nonces: bool,
    ) -> Self {
        Self {
            realm: realm.into(),
            credentials,
            nonces,
            single_use_nonces,
        }
    }

    /// The realm emitted in challenges.
    #[must_use]
    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Authenticate one inbound request.
    ///
    /// `authorization` is the raw `Authorization` header value, if any, and
    /// `method` the request method the device digested. The request URI
    /// enters the hash through the header's own `uri` field, the value the
    /// device actually signed.
    pub fn authenticate(
        &self,
        client_ip: IpAddr,
        method: &str,
        authorization: Option<&str>,
    ) -> AuthDecision {
        let Some(header) = authorization else {
            tracing::debug!(client_ip = %client_ip, "no authorization header, challenging");
            return self.challenge(client_ip, ChallengeReason::NoCredentials);
        };

        if let Some(value) = strip_scheme(header, "Digest") {
            self.authenticate_digest(client_ip, method, value)
        } else if let Some(value) = strip_scheme(header, "Basic") {
            self.authenticate_basic(client_ip, value)
        } else {
            tracing::warn!(client_ip = %client_ip, "unrecognized authorization scheme");
            self.challenge(client_ip, ChallengeReason::UnrecognizedScheme)
        }
    }

    /// The two `WWW-Authenticate` header values for a challenge response.
    ///
    /// Both must be emitted as separate header lines, Digest first.
    #[must_use]
    pub fn challenge_header_values(&self, nonce: &str, opaque: &str) -> [String; 2] {
        [
            format!(
                "Digest realm=\"{}\", qop=\"auth\", nonce=\"{nonce}\", opaque=\"{opaque}\"",
                self.realm
            ),
            format!("Basic realm=\"{}\"", self.realm),
        ]
    }

    fn authenticate_digest(&self, client_ip: IpAddr, method: &str, value: &str) -> AuthDecision {
        let Some(params) = DigestParams::parse(value) else {
            tracing::warn!(client_ip = %client_ip, "digest header missing required fields");
            return self.challenge(client_ip, ChallengeReason::MalformedCredentials);
        };

        let Some(record) = self.nonces.validate(client_ip, &params.nonce) else {
            tracing::warn!(
                client_ip = %client_ip,
                username = %params.username,
                "digest nonce unknown or expired"
            );
            return self.challenge(client_ip, ChallengeReason::NonceInvalid);
        };

        if let Some(opaque) = &params.opaque {
            if *opaque != record.opaque {
                tracing::warn!(
                    client_ip = %client_ip,
                    username = %params.username,
                    "digest opaque does not match issued value"
                );
                return self.challenge(client_ip, ChallengeReason::OpaqueMismatch);
            }
        }

        let Some(credential) = self.credentials.find(&params.username) else {
            tracing::warn!(
                client_ip = %client_ip,
                username = %params.username,
                "digest username unknown"
            );
            return self.challenge(client_ip, ChallengeReason::UnknownUsername);
        };

        let Some(expected) = params.expected_response(method, credential.password()) else {
            tracing::warn!(
                client_ip = %client_ip,
                username = %params.username,
                qop = params.qop.as_deref().unwrap_or(""),
                "digest qop present without nc/cnonce"
            );
            return self.challenge(client_ip, ChallengeReason::MalformedCredentials);
        };

        if !bool::from(expected.as_bytes().ct_eq(params.response.as_bytes())) {
            tracing::warn!(
                client_ip = %client_ip,
                username = %params.username,
                "digest response mismatch"
            );
            return self.challenge(client_ip, ChallengeReason::ResponseMismatch);
        }

        if self.single_use_nonces {
            self.nonces.invalidate(client_ip, &params.nonce);
        }

        tracing::info!(
            client_ip = %client_ip,
            username = %params.username,
            scheme = "digest",
            "device authenticated"
        );
        AuthDecision::Authenticated {
            username: params.username,
        }
    }

    fn authenticate_basic(&self, client_ip: IpAddr, value: &str) -> AuthDecision {
        let Ok(decoded) = BASE64.decode(value.trim()) else {
            tracing::warn!(client_ip = %client_ip, "basic payload is not valid base64");
            return self.challenge(client_ip, ChallengeReason::MalformedCredentials);
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            tracing::warn!(client_ip = %client_ip, "basic payload is not valid utf-8");
            return self.challenge(client_ip, ChallengeReason::MalformedCredentials);
        };
        let Some((username, password)) = pair.split_once(':') else {
            tracing::warn!(client_ip = %client_ip, "basic payload missing ':' separator");
            return self.challenge(client_ip, ChallengeReason::MalformedCredentials);
        };

        let Some(credential) = self.credentials.find(username) else {
            tracing::warn!(
                client_ip = %client_ip,
                username = %username,
                "basic username unknown"
            );
            return self.challenge(client_ip, ChallengeReason::UnknownUsername);
        };

        if !credential.password_matches(password) {
            tracing::warn!(
                client_ip = %client_ip,
                username = %username,
                "basic password mismatch"
            );
            return self.challenge(client_ip, ChallengeReason::CredentialMismatch);
        }

        tracing::info!(
            client_ip = %client_ip,
            username = %username,
            scheme = "basic",
            "device authenticated"
        );
        AuthDecision::Authenticated {
            username: username.to_string(),
        }
    }

    fn challenge(&self, client_ip: IpAddr, reason: ChallengeReason) -> AuthDecision {
        let (nonce, opaque) = self.nonces.issue(client_ip);
        tracing::debug!(
            client_ip = %client_ip,
            reason = reason.as_str(),
            "challenge issued"
        );
        AuthDecision::Challenge {
            nonce,
            opaque,
            reason,
        }
    }
}

/// Strip an auth scheme prefix (case-insensitive) and the following space.
fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let prefix = header.get(..scheme.len())?;
    let rest = header.get(scheme.len()..)?;
    if prefix.eq_ignore_ascii_case(scheme) && rest.starts_with(' ') {
        Some(rest.trim_start_matches(' '))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use base64::Engine as _;

    use super::*;
    use crate::auth::digest::md5_hex;
    use crate::credentials::Credential;
    use crate::nonce::NonceCacheConfig;

    const REALM: &str = "TR-069 ACS";

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn authenticator(single_use: bool) -> Authenticator {
        let credentials = Arc::new(CredentialStore::new(vec![Credential::new(
            "acs-user",
            "acs-password",
        )]));
        let nonces = Arc::new(NonceCache::new(NonceCacheConfig::default()));
        Authenticator::new(REALM, credentials, nonces, single_use)
    }

    fn challenge_for(auth: &Authenticator, client: IpAddr) -> (String, String) {
        match auth.authenticate(client, "POST", None) {
            AuthDecision::Challenge { nonce, opaque, .. } => (nonce, opaque),
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    fn digest_header(nonce: &str, opaque: &str, password: &str) -> String {
        let ha1 = md5_hex(&format!("acs-user:{REALM}:{password}"));
        let ha2 = md5_hex("POST:/cwmp");
        let response = md5_hex(&format!("{ha1}:{nonce}:00000001:abad1dea:auth:{ha2}"));
        format!(
            "Digest username=\"acs-user\", realm=\"{REALM}\", nonce=\"{nonce}\", \
             uri=\"/cwmp\", qop=auth, nc=00000001, cnonce=\"abad1dea\", \
             response=\"{response}\", opaque=\"{opaque}\""
        )
    }

    #[test]
    fn test_no_header_challenges() {
        let auth = authenticator(false);
        match auth.authenticate(ip(1), "POST", None) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::NoCredentials);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_challenge_header_values_digest_then_basic() {
        let auth = authenticator(false);
        let values = auth.challenge_header_values("abc", "def");
        assert_eq!(
            values[0],
            "Digest realm=\"TR-069 ACS\", qop=\"auth\", nonce=\"abc\", opaque=\"def\""
        );
        assert_eq!(values[1], "Basic realm=\"TR-069 ACS\"");
    }

    #[test]
    fn test_digest_round_trip_authenticates() {
        let auth = authenticator(false);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Authenticated { username } => assert_eq!(username, "acs-user"),
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_flipped_response_char_rejected() {
        let auth = authenticator(false);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password");
        // Flip one character of the 32-hex response value
        let pos = header.find("response=\"").unwrap() + "response=\"".len();
        let mut bytes = header.into_bytes();
        bytes[pos] = if bytes[pos] == b'0' { b'1' } else { b'0' };
        let tampered = String::from_utf8(bytes).unwrap();
        match auth.authenticate(ip(1), "POST", Some(&tampered)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::ResponseMismatch);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_nonce_rejected_under_wrong_ip() {
        let auth = authenticator(false);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password");
        match auth.authenticate(ip(2), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::NonceInvalid);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_opaque_mismatch_rejected() {
        let auth = authenticator(false);
        let (nonce, _) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, "0000000000000000", "acs-password");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::OpaqueMismatch);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_omitted_opaque_accepted() {
        let auth = authenticator(false);
        let (nonce, _) = challenge_for(&auth, ip(1));
        let ha1 = md5_hex(&format!("acs-user:{REALM}:acs-password"));
        let ha2 = md5_hex("POST:/cwmp");
        let response = md5_hex(&format!("{ha1}:{nonce}:{ha2}"));
        // Legacy RFC 2069 response without qop, nc, cnonce, or opaque
        let header = format!(
            "Digest username=\"acs-user\", realm=\"{REALM}\", nonce=\"{nonce}\", \
             uri=\"/cwmp\", response=\"{response}\""
        );
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Authenticated { username } => assert_eq!(username, "acs-user"),
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[test]
    fn test_digest_unknown_username_rechallenges() {
        let auth = authenticator(false);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password")
            .replace("username=\"acs-user\"", "username=\"intruder\"");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::UnknownUsername);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_nonce_reusable_until_expiry_by_default() {
        let auth = authenticator(false);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password");
        for _ in 0..2 {
            match auth.authenticate(ip(1), "POST", Some(&header)) {
                AuthDecision::Authenticated { .. } => {},
                other => panic!("expected authenticated, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_single_use_nonce_consumed_on_success() {
        let auth = authenticator(true);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let header = digest_header(&nonce, &opaque, "acs-password");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Authenticated { .. } => {},
            other => panic!("expected authenticated, got {other:?}"),
        }
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::NonceInvalid);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_attempt_leaves_single_use_nonce_intact() {
        let auth = authenticator(true);
        let (nonce, opaque) = challenge_for(&auth, ip(1));
        let bad = digest_header(&nonce, &opaque, "wrong-password");
        match auth.authenticate(ip(1), "POST", Some(&bad)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::ResponseMismatch);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
        // The device retries with the corrected password and the same nonce
        let good = digest_header(&nonce, &opaque, "acs-password");
        match auth.authenticate(ip(1), "POST", Some(&good)) {
            AuthDecision::Authenticated { .. } => {},
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_known_vector_authenticates() {
        let auth = authenticator(false);
        // base64 of "acs-user:acs-password"
        let header = "Basic YWNzLXVzZXI6YWNzLXBhc3N3b3Jk";
        match auth.authenticate(ip(1), "POST", Some(header)) {
            AuthDecision::Authenticated { username } => assert_eq!(username, "acs-user"),
            other => panic!("expected authenticated, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_wrong_password_rechallenges() {
        let auth = authenticator(false);
        // base64 of "acs-user:acs-passwore"
        let payload = BASE64.encode("acs-user:acs-passwore");
        let header = format!("Basic {payload}");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::CredentialMismatch);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_invalid_base64_is_malformed() {
        let auth = authenticator(false);
        match auth.authenticate(ip(1), "POST", Some("Basic !!!not-base64!!!")) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::MalformedCredentials);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_basic_missing_separator_is_malformed() {
        let auth = authenticator(false);
        let payload = BASE64.encode("acs-user-no-colon");
        let header = format!("Basic {payload}");
        match auth.authenticate(ip(1), "POST", Some(&header)) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::MalformedCredentials);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_scheme_challenges() {
        let auth = authenticator(false);
        match auth.authenticate(ip(1), "POST", Some("Bearer some-token")) {
            AuthDecision::Challenge { reason, .. } => {
                assert_eq!(reason, ChallengeReason::UnrecognizedScheme);
            },
            other => panic!("expected challenge, got {other:?}"),
        }
    }
}
