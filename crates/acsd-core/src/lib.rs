//! acsd-core - Device authentication and task lifecycle core
//!
//! This library implements the device-facing core of a TR-069 ACS: the
//! Digest/Basic authentication negotiator that gates CWMP sessions and the
//! task lifecycle manager that dispatches queued RPCs to authenticated
//! devices.
//!
//! The crate is I/O-free apart from the process clock and RNG. The HTTP
//! front end, the durable task store, and the periodic timeout sweeper live
//! in `acsd-daemon`.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration model shared by the daemon and tests
//! - [`credentials`]: immutable ACS credential list with constant-time
//!   verification
//! - [`nonce`]: TTL-bounded nonce cache keyed by `(client IP, nonce)`
//! - [`auth`]: the per-request Digest/Basic authentication state machine
//! - [`task`]: task state machine, store trait, in-memory store, and the
//!   lifecycle manager

pub mod auth;
pub mod config;
pub mod credentials;
pub mod nonce;
pub mod task;

pub use auth::{AuthDecision, Authenticator, ChallengeReason};
pub use config::{AcsConfig, AuthConfig, ConfigError};
pub use credentials::{Credential, CredentialStore};
pub use nonce::{NonceCache, NonceCacheConfig, NonceRecord};
pub use task::{
    InMemoryTaskStore, NewTask, SessionPlan, SweepOutcome, Task, TaskError, TaskManager,
    TaskStatus, TaskStore, TaskType,
};
