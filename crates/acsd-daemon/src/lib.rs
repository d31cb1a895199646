//! acsd-daemon - TR-069 ACS Daemon Library
//!
//! This library provides the runtime plumbing around `acsd-core`: the
//! HTTP front end devices connect to, the SQLite-backed task store, and the
//! periodic timeout sweeper.
//!
//! # Modules
//!
//! - [`http`]: axum router with the Digest/Basic authentication gate
//! - [`store`]: durable task store on SQLite
//! - [`sweep`]: background worker flipping overdue tasks

pub mod http;
pub mod store;
pub mod sweep;

pub use http::{AppState, router};
pub use store::SqliteTaskStore;
pub use sweep::TimeoutSweeper;
