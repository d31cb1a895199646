//! Task lifecycle management.
//!
//! Tasks represent queued RPCs awaiting delivery to a device during its next
//! CWMP session. Collaborators (the admin UI, automated workflows) create
//! tasks in `Pending`; the lifecycle manager owns every transition after
//! that.
//!
//! # State Machine
//!
//! ```text
//! Pending --claimed during device session--> Sent
//! Pending --user/admin cancel-------------> Cancelled
//! Sent --device RPC success---------------> Completed
//! Sent --device RPC fault-----------------> Failed
//! Sent --type-specific timeout------------> Failed
//! Sent --timeout (SetParameterValues)-----> Verifying
//! Verifying --next session confirms-------> Completed | Failed
//! ```
//!
//! # Key Concepts
//!
//! - **Exactly-once-in-flight**: once a task is `Sent` it is never
//!   re-selected until it resolves or times out. Every status flip is a
//!   compare-and-swap on the current status.
//! - **Type-specific timeouts**: each [`TaskType`] carries its own response
//!   deadline; firmware downloads get 20 minutes, a parameter read 2.
//! - **Audit retention**: tasks are never deleted, only transitioned.

mod error;
mod manager;
mod state;
mod store;

pub use error::TaskError;
pub use manager::{SessionPlan, SweepOutcome, TaskManager};
pub use state::{Task, TaskStatus, TaskType};
pub use store::{InMemoryTaskStore, NewTask, TaskStore};
