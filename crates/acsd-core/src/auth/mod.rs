//! Digest/Basic authentication for inbound CWMP sessions.
//!
//! Every inbound device request passes through [`Authenticator::authenticate`]
//! before it can reach task dispatch. The authenticator is a per-request
//! state machine; the only state that survives a request is the challenge
//! nonce, which lives in the injected [`crate::nonce::NonceCache`].
//!
//! # Modules
//!
//! - [`digest`]: RFC 2617 parameter parsing and response computation
//! - [`authenticator`]: the decision state machine and challenge builder

pub mod authenticator;
pub mod digest;

pub use authenticator::{AuthDecision, Authenticator, ChallengeReason};
pub use digest::DigestParams;
