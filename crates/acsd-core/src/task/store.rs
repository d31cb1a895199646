//! Task persistence trait and the in-memory store.
//!
//! The store owns atomicity: every status flip is a compare-and-swap
//! against the caller's expected current status, so a task that resolved
//! concurrently (device response racing the timeout sweep, cancellation
//! racing dispatch) is never double-transitioned. The in-memory store gets
//! this from a single write lock; the SQLite store in `acsd-daemon` gets it
//! from conditional `UPDATE` statements.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};

use super::error::TaskError;
use super::state::{Task, TaskStatus, TaskType};

/// Fields a collaborator supplies when creating a task.
#[derive(Debug, Clone)]
pub struct NewTask {
    /// The device the task targets.
    pub device_id: String,
    /// The RPC kind.
    pub task_type: TaskType,
    /// Human-readable description for collaborator display.
    pub description: String,
    /// Creating user; `None` means ACS-initiated.
    pub initiator: Option<String>,
}

/// Storage backend for tasks.
///
/// Implementations must be safe for concurrent use from multiple connection
/// handlers and the timeout sweeper.
pub trait TaskStore: Send + Sync {
    /// Insert a new task in `Pending` state, allocating its id.
    fn insert(&self, new_task: NewTask) -> Result<Task, TaskError>;

    /// Fetch a task by id.
    fn get(&self, task_id: u64) -> Result<Option<Task>, TaskError>;

    /// All tasks for a device, in creation order.
    fn tasks_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError>;

    /// Atomically claim every `Pending` task for a device, in creation
    /// order, marking each `Sent` with `sent_at = now`.
    ///
    /// A task claimed here is invisible to any concurrent or subsequent
    /// claim until it resolves or times out.
    fn claim_pending(&self, device_id: &str, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError>;

    /// All `Verifying` tasks for a device, in creation order.
    fn verifying_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError>;

    /// Compare-and-swap one task's status.
    ///
    /// Applies the transition only if the task's current status equals
    /// `from`; returns `false` (without touching the task) otherwise.
    /// `result`/`error` payloads are recorded alongside the flip.
    fn resolve(
        &self,
        task_id: u64,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, TaskError>;

    /// Atomically cancel every task in `task_ids` that is still `Pending`.
    ///
    /// Returns the count actually transitioned; ids that are unknown or no
    /// longer pending are skipped, not errors.
    fn cancel_pending(&self, task_ids: &[u64]) -> Result<u64, TaskError>;

    /// All `Sent` tasks whose type-specific deadline is at or before `now`.
    fn overdue_sent(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError>;
}

/// In-memory task store.
///
/// Suitable for tests and for deployments that accept losing queue state on
/// restart; production deployments use the SQLite store in `acsd-daemon`.
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<u64, Task>>,
    next_id: AtomicU64,
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read_lock(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Task>> {
        self.tasks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_lock(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Task>> {
        self.tasks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn sorted_for_device(tasks: &HashMap<u64, Task>, device_id: &str) -> Vec<Task> {
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect();
        // Ids are allocated in creation order
        matching.sort_by_key(|t| t.id);
        matching
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, new_task: NewTask) -> Result<Task, TaskError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Task {
            id,
            device_id: new_task.device_id,
            task_type: new_task.task_type,
            status: TaskStatus::Pending,
            initiator: new_task.initiator,
            created_at: Utc::now(),
            sent_at: None,
            resolved_at: None,
            description: new_task.description,
            result: None,
            error: None,
        };
        self.write_lock().insert(id, task.clone());
        Ok(task)
    }

    fn get(&self, task_id: u64) -> Result<Option<Task>, TaskError> {
        Ok(self.read_lock().get(&task_id).cloned())
    }

    fn tasks_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError> {
        Ok(Self::sorted_for_device(&self.read_lock(), device_id))
    }

    fn claim_pending(&self, device_id: &str, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let mut tasks = self.write_lock();
        let mut claimed: Vec<u64> = tasks
            .values()
            .filter(|t| t.device_id == device_id && t.status == TaskStatus::Pending)
            .map(|t| t.id)
            .collect();
        claimed.sort_unstable();

        let mut out = Vec::with_capacity(claimed.len());
        for id in claimed {
            if let Some(task) = tasks.get_mut(&id) {
                task.status = TaskStatus::Sent;
                task.sent_at = Some(now);
                out.push(task.clone());
            }
        }
        Ok(out)
    }

    fn verifying_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError> {
        let mut matching = Self::sorted_for_device(&self.read_lock(), device_id);
        matching.retain(|t| t.status == TaskStatus::Verifying);
        Ok(matching)
    }

    fn resolve(
        &self,
        task_id: u64,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, TaskError> {
        debug_assert!(from.can_transition_to(to));
        let mut tasks = self.write_lock();
        let Some(task) = tasks.get_mut(&task_id) else {
            return Ok(false);
        };
        if task.status != from {
            return Ok(false);
        }
        task.status = to;
        task.resolved_at = Some(now);
        if let Some(result) = result {
            task.result = Some(result.to_string());
        }
        if let Some(error) = error {
            task.error = Some(error.to_string());
        }
        Ok(true)
    }

    fn cancel_pending(&self, task_ids: &[u64]) -> Result<u64, TaskError> {
        let mut tasks = self.write_lock();
        let now = Utc::now();
        let mut affected = 0;
        for id in task_ids {
            if let Some(task) = tasks.get_mut(id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Cancelled;
                    task.resolved_at = Some(now);
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    fn overdue_sent(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let tasks = self.read_lock();
        let mut overdue: Vec<Task> = tasks
            .values()
            .filter(|t| t.is_overdue(now))
            .cloned()
            .collect();
        overdue.sort_by_key(|t| t.id);
        Ok(overdue)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn new_task(device: &str, ty: TaskType) -> NewTask {
        NewTask {
            device_id: device.to_string(),
            task_type: ty,
            description: format!("{ty} for {device}"),
            initiator: Some("admin".to_string()),
        }
    }

    #[test]
    fn test_insert_allocates_sequential_ids() {
        let store = InMemoryTaskStore::new();
        let a = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let b = store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap();
        assert!(a.id < b.id);
        assert_eq!(a.status, TaskStatus::Pending);
    }

    #[test]
    fn test_claim_takes_all_pending_in_creation_order() {
        let store = InMemoryTaskStore::new();
        let a = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let b = store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap();
        store.insert(new_task("cpe-2", TaskType::Upload)).unwrap();

        let now = Utc::now();
        let claimed = store.claim_pending("cpe-1", now).unwrap();
        assert_eq!(
            claimed.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
        for task in &claimed {
            assert_eq!(task.status, TaskStatus::Sent);
            assert_eq!(task.sent_at, Some(now));
        }
    }

    #[test]
    fn test_claim_never_reselects_sent_tasks() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let first = store.claim_pending("cpe-1", Utc::now()).unwrap();
        assert_eq!(first.len(), 1);
        let second = store.claim_pending("cpe-1", Utc::now()).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn test_resolve_is_compare_and_swap() {
        let store = InMemoryTaskStore::new();
        let task = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        store.claim_pending("cpe-1", Utc::now()).unwrap();

        let now = Utc::now();
        assert!(
            store
                .resolve(task.id, TaskStatus::Sent, TaskStatus::Completed, now, Some("ok"), None)
                .unwrap()
        );
        // Second writer loses: the task is no longer Sent
        assert!(
            !store
                .resolve(task.id, TaskStatus::Sent, TaskStatus::Failed, now, None, Some("late"))
                .unwrap()
        );
        let stored = store.get(task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.result.as_deref(), Some("ok"));
        assert!(stored.error.is_none());
    }

    #[test]
    fn test_cancel_pending_skips_non_pending() {
        let store = InMemoryTaskStore::new();
        let a = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let b = store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap();
        let c = store.insert(new_task("cpe-1", TaskType::Upload)).unwrap();
        // b resolves before the cancel arrives
        store.claim_pending("cpe-1", Utc::now()).unwrap();
        store
            .resolve(b.id, TaskStatus::Sent, TaskStatus::Completed, Utc::now(), None, None)
            .unwrap();

        let affected = store.cancel_pending(&[a.id, b.id, c.id]).unwrap();
        // a and c were already claimed too, so nothing is pending
        assert_eq!(affected, 0);

        let d = store.insert(new_task("cpe-1", TaskType::Download)).unwrap();
        assert_eq!(store.cancel_pending(&[d.id, 9999]).unwrap(), 1);
        assert_eq!(
            store.get(d.id).unwrap().unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[test]
    fn test_overdue_sent_respects_type_deadlines() {
        let store = InMemoryTaskStore::new();
        store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        store.insert(new_task("cpe-1", TaskType::Download)).unwrap();
        let sent_at = Utc::now();
        store.claim_pending("cpe-1", sent_at).unwrap();

        // Past the 120s GetParams deadline, inside the 1200s Download one
        let overdue = store.overdue_sent(sent_at + Duration::seconds(500)).unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].task_type, TaskType::GetParams);

        let overdue = store.overdue_sent(sent_at + Duration::seconds(1500)).unwrap();
        assert_eq!(overdue.len(), 2);
    }
}
