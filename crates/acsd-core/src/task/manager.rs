//! Task lifecycle manager.
//!
//! The manager is the only component that transitions tasks. It layers the
//! state-machine rules over a [`TaskStore`] and reports every transition as
//! a structured tracing event.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::error::TaskError;
use super::state::{Task, TaskStatus, TaskType};
use super::store::{NewTask, TaskStore};

/// What a freshly opened device session has to work through.
#[derive(Debug, Clone, Default)]
pub struct SessionPlan {
    /// Tasks claimed for this session, now `Sent`, in creation order.
    pub dispatched: Vec<Task>,
    /// Parameter-set tasks whose effect the session must re-confirm.
    pub awaiting_verification: Vec<Task>,
}

/// Result of one timeout sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// Overdue tasks flipped to `Failed`.
    pub failed: u64,
    /// Overdue parameter-set tasks flipped to `Verifying`.
    pub verifying: u64,
}

/// Lifecycle manager over a task store.
pub struct TaskManager {
    store: Arc<dyn TaskStore>,
}

impl TaskManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Create a task in `Pending` state.
    ///
    /// # Errors
    ///
    /// Returns an error if the store rejects the insert.
    pub fn create(&self, new_task: NewTask) -> Result<Task, TaskError> {
        let task = self.store.insert(new_task)?;
        tracing::info!(
            task_id = task.id,
            device_id = %task.device_id,
            task_type = %task.task_type,
            initiator = task.initiator.as_deref().unwrap_or("acs"),
            "task created"
        );
        Ok(task)
    }

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub fn task(&self, task_id: u64) -> Result<Option<Task>, TaskError> {
        self.store.get(task_id)
    }

    /// All tasks for a device in creation order, for collaborator display.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lookup fails.
    pub fn tasks_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError> {
        self.store.tasks_for_device(device_id)
    }

    /// Open a device session: claim all pending tasks and surface tasks
    /// awaiting verification.
    ///
    /// Claimed tasks are marked `Sent` atomically, so a concurrent session
    /// for the same device can never dispatch the same task twice.
    ///
    /// # Errors
    ///
    /// Returns an error if the store claim fails.
    pub fn begin_session(&self, device_id: &str) -> Result<SessionPlan, TaskError> {
        let now = Utc::now();
        let dispatched = self.store.claim_pending(device_id, now)?;
        let awaiting_verification = self.store.verifying_for_device(device_id)?;
        for task in &dispatched {
            tracing::info!(
                task_id = task.id,
                device_id = %device_id,
                task_type = %task.task_type,
                "task dispatched"
            );
        }
        if !awaiting_verification.is_empty() {
            tracing::info!(
                device_id = %device_id,
                count = awaiting_verification.len(),
                "tasks awaiting verification in this session"
            );
        }
        Ok(SessionPlan {
            dispatched,
            awaiting_verification,
        })
    }

    /// Record a successful RPC response for a `Sent` task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for unknown ids and
    /// [`TaskError::TransitionNotAllowed`] if the task already left `Sent`
    /// (for example, the timeout sweep beat the response).
    pub fn complete(&self, task_id: u64, result: Option<&str>) -> Result<Task, TaskError> {
        self.transition(task_id, TaskStatus::Sent, TaskStatus::Completed, result, None)
    }

    /// Record an RPC fault for a `Sent` task.
    ///
    /// # Errors
    ///
    /// Same contract as [`complete`](Self::complete).
    pub fn fail(&self, task_id: u64, error: Option<&str>) -> Result<Task, TaskError> {
        self.transition(task_id, TaskStatus::Sent, TaskStatus::Failed, None, error)
    }

    /// Conclude verification of a parameter-set task.
    ///
    /// Called when the next device session confirms (or refutes) that the
    /// written values took effect.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for unknown ids and
    /// [`TaskError::TransitionNotAllowed`] if the task is not `Verifying`.
    pub fn resolve_verification(
        &self,
        task_id: u64,
        confirmed: bool,
        note: Option<&str>,
    ) -> Result<Task, TaskError> {
        if confirmed {
            self.transition(task_id, TaskStatus::Verifying, TaskStatus::Completed, note, None)
        } else {
            self.transition(task_id, TaskStatus::Verifying, TaskStatus::Failed, None, note)
        }
    }

    /// Cancel a single pending task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::TaskNotFound`] for unknown ids and
    /// [`TaskError::CancelNotPending`] when the task already left `Pending`
    /// — including the race where dispatch claimed it concurrently; exactly
    /// one of `Sent`/`Cancelled` wins, never both.
    pub fn cancel(&self, task_id: u64) -> Result<(), TaskError> {
        let affected = self.store.cancel_pending(&[task_id])?;
        if affected == 1 {
            tracing::info!(task_id, "task cancelled");
            return Ok(());
        }
        match self.store.get(task_id)? {
            None => Err(TaskError::TaskNotFound { task_id }),
            Some(task) => Err(TaskError::CancelNotPending {
                task_id,
                current_status: task.status,
            }),
        }
    }

    /// Cancel every task in `task_ids` that is still pending.
    ///
    /// The operation is atomic over the set and reports the count actually
    /// transitioned; ids that are unknown or no longer pending are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the store update fails.
    pub fn cancel_many(&self, task_ids: &[u64]) -> Result<u64, TaskError> {
        let affected = self.store.cancel_pending(task_ids)?;
        tracing::info!(
            requested = task_ids.len(),
            affected,
            "bulk task cancellation"
        );
        Ok(affected)
    }

    /// Flip every overdue `Sent` task to its timeout state.
    ///
    /// Parameter-set tasks go to `Verifying` (the write may have applied
    /// even though the response never arrived, so the next session must
    /// check); everything else fails closed to `Failed`. Each flip is a
    /// compare-and-swap: a task that resolved between the overdue scan and
    /// the flip is left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the store scan fails.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<SweepOutcome, TaskError> {
        let mut outcome = SweepOutcome::default();
        for task in self.store.overdue_sent(now)? {
            let timeout_secs = task.task_type.timeout().num_seconds();
            if task.task_type == TaskType::SetParameterValues {
                if self.store.resolve(
                    task.id,
                    TaskStatus::Sent,
                    TaskStatus::Verifying,
                    now,
                    None,
                    None,
                )? {
                    outcome.verifying += 1;
                    tracing::warn!(
                        task_id = task.id,
                        device_id = %task.device_id,
                        timeout_secs,
                        "parameter-set task timed out, awaiting verification"
                    );
                }
            } else {
                let message = format!("no device response within {timeout_secs}s");
                if self.store.resolve(
                    task.id,
                    TaskStatus::Sent,
                    TaskStatus::Failed,
                    now,
                    None,
                    Some(&message),
                )? {
                    outcome.failed += 1;
                    tracing::warn!(
                        task_id = task.id,
                        device_id = %task.device_id,
                        task_type = %task.task_type,
                        timeout_secs,
                        "task timed out"
                    );
                }
            }
        }
        Ok(outcome)
    }

    fn transition(
        &self,
        task_id: u64,
        from: TaskStatus,
        to: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<Task, TaskError> {
        let now = Utc::now();
        if self.store.resolve(task_id, from, to, now, result, error)? {
            tracing::info!(task_id, from = %from, to = %to, "task transitioned");
            return self
                .store
                .get(task_id)?
                .ok_or(TaskError::TaskNotFound { task_id });
        }
        match self.store.get(task_id)? {
            None => Err(TaskError::TaskNotFound { task_id }),
            Some(task) => Err(TaskError::TransitionNotAllowed {
                task_id,
                from_status: task.status,
                to_status: to,
            }),
        }
    }
}
