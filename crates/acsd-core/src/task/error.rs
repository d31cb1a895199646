//! Task module error types.

use thiserror::Error;

use super::state::TaskStatus;

/// Errors that can occur during task lifecycle operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TaskError {
    /// Task not found.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: u64,
    },

    /// State transition not allowed by the state machine.
    #[error("task {task_id}: transition from {from_status} to {to_status} is not allowed")]
    TransitionNotAllowed {
        /// The task ID.
        task_id: u64,
        /// The current state.
        from_status: TaskStatus,
        /// The attempted target state.
        to_status: TaskStatus,
    },

    /// Cancellation attempted on a task that is no longer pending.
    ///
    /// Reported to the caller as a no-op, not a system fault: the task may
    /// legitimately have been dispatched or resolved while the cancel
    /// request was in flight.
    #[error("task {task_id} is {current_status}, only pending tasks can be cancelled")]
    CancelNotPending {
        /// The task ID.
        task_id: u64,
        /// The status the task was found in.
        current_status: TaskStatus,
    },

    /// Invalid task status string.
    #[error("invalid task status: {value}")]
    InvalidTaskStatus {
        /// The invalid status string.
        value: String,
    },

    /// Invalid task type string.
    #[error("invalid task type: {value}")]
    InvalidTaskType {
        /// The invalid type string.
        value: String,
    },

    /// Underlying store failure.
    #[error("task store error: {message}")]
    Storage {
        /// Error message from the store backend.
        message: String,
    },
}
