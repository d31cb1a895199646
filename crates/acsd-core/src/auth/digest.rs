//! RFC 2617 Digest parameter parsing and response computation.
//!
//! The hash is MD5, retained for wire compatibility with deployed CPE
//! firmware. This is a protocol constraint of HTTP Digest as the field
//! implements it, not a security recommendation.

use md5::{Digest, Md5};

/// Parsed parameters from a `Digest ...` authorization header value.
///
/// Only the fields the validation algorithm consumes are retained. Optional
/// fields stay `None` when the device omits them (RFC 2069 legacy mode omits
/// `qop`, `nc`, and `cnonce`; `opaque` is echoed only by some firmware).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DigestParams {
    /// Username the device authenticates as.
    pub username: String,
    /// Realm echoed from the challenge.
    pub realm: String,
    /// Challenge nonce echoed from the challenge.
    pub nonce: String,
    /// Request URI the digest was computed over.
    pub uri: String,
    /// The client's computed response hash (32 lowercase hex expected).
    pub response: String,
    /// Opaque value echoed from the challenge, if the device sent one.
    pub opaque: Option<String>,
    /// Quality of protection (`auth` or `auth-int`), absent in legacy mode.
    pub qop: Option<String>,
    /// Nonce use count, required when `qop` is present.
    pub nc: Option<String>,
    /// Client nonce, required when `qop` is present.
    pub cnonce: Option<String>,
}

impl DigestParams {
    /// Parse the `key=value` pairs following the `Digest ` prefix.
    ///
    /// Accepts both quoted (`key="value"`) and unquoted (`key=value`)
    /// tokens, in any order, separated by commas. Returns `None` when any of
    /// the required fields {username, realm, nonce, uri, response} is
    /// missing or empty.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let mut params = Self::default();
        for (key, value) in iter_params(input) {
            match key {
                "username" => params.username = value,
                "realm" => params.realm = value,
                "nonce" => params.nonce = value,
                "uri" => params.uri = value,
                "response" => params.response = value,
                "opaque" => params.opaque = Some(value),
                "qop" => params.qop = Some(value),
                "nc" => params.nc = Some(value),
                "cnonce" => params.cnonce = Some(value),
                // Unknown keys (algorithm, charset, ...) are ignored
                _ => {},
            }
        }

        if params.username.is_empty()
            || params.realm.is_empty()
            || params.nonce.is_empty()
            || params.uri.is_empty()
            || params.response.is_empty()
        {
            return None;
        }
        Some(params)
    }

    /// Compute the expected response hash for this request.
    ///
    /// With `qop` present (`auth` / `auth-int`):
    /// `MD5(HA1:nonce:nc:cnonce:qop:HA2)`. Without it, legacy RFC 2069:
    /// `MD5(HA1:nonce:HA2)`.
    ///
    /// Returns `None` when `qop` is present but `nc` or `cnonce` is missing;
    /// the caller treats that as a malformed header and re-challenges.
    #[must_use]
    pub fn expected_response(&self, method: &str, password: &str) -> Option<String> {
        let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, password));
        let ha2 = md5_hex(&format!("{method}:{}", self.uri));

        match self.qop.as_deref() {
            Some(qop @ ("auth" | "auth-int")) => {
                let nc = self.nc.as_deref()?;
                let cnonce = self.cnonce.as_deref()?;
                Some(md5_hex(&format!(
                    "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                    self.nonce
                )))
            },
            Some(_) => None,
            None => Some(md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce))),
        }
    }
}

/// MD5 of a string, canonical lowercase hex encoding.
#[must_use]
pub fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Iterate over `key=value` / `key="value"` pairs in a header value.
fn iter_params<'a>(input: &'a str) -> impl Iterator<Item = (&'a str, String)> + 'a {
    let mut rest = input;
    std::iter::from_fn(move || {
        loop {
            rest = rest.trim_start_matches([' ', '\t', ',']);
            if rest.is_empty() {
                return None;
            }
            let eq = rest.find('=')?;
            let key = rest[..eq].trim();
            let after = &rest[eq + 1..];
            let (value, remainder) = if let Some(stripped) = after.strip_prefix('"') {
                match stripped.find('"') {
                    Some(end) => (stripped[..end].to_string(), &stripped[end + 1..]),
                    // Unterminated quote: take the tail and stop
                    None => (stripped.to_string(), ""),
                }
            } else {
                match after.find([',', ' ', '\t']) {
                    Some(end) => (after[..end].to_string(), &after[end..]),
                    None => (after.to_string(), ""),
                }
            };
            rest = remainder;
            if key.is_empty() {
                continue;
            }
            return Some((key, value));
        }
    })
}
