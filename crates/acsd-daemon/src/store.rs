//! Durable task store on SQLite.
//!
//! The task queue survives daemon restarts: a reboot task queued for a
//! device that only checks in nightly must not vanish because the ACS was
//! redeployed in between. Tasks are never deleted, only transitioned, so
//! the table doubles as the audit history.
//!
//! Status flips use conditional `UPDATE ... WHERE status = ?` statements;
//! `changes()` tells the caller whether its compare-and-swap won. Combined
//! with the connection mutex this makes every transition atomic against
//! concurrent dispatch, device responses, cancellation, and the timeout
//! sweep.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use acsd_core::task::{NewTask, Task, TaskError, TaskStatus, TaskStore, TaskType};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, params};

/// SQLite-backed implementation of [`TaskStore`].
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Open (or create) the task database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be initialized.
    pub fn open(path: &Path) -> Result<Self, TaskError> {
        let conn = Connection::open(path).map_err(storage_error)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails.
    pub fn open_in_memory() -> Result<Self, TaskError> {
        let conn = Connection::open_in_memory().map_err(storage_error)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, TaskError> {
        Self::init_schema(&conn).map_err(storage_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                task_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                initiator TEXT,
                created_at INTEGER NOT NULL,
                sent_at INTEGER,
                resolved_at INTEGER,
                description TEXT NOT NULL DEFAULT '',
                result TEXT,
                error TEXT
            )",
            [],
        )?;
        // Dispatch and sweep both select on (device_id, status)
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_device_status \
             ON tasks(device_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, TaskError> {
        self.conn.lock().map_err(|_| TaskError::Storage {
            message: "connection lock poisoned".to_string(),
        })
    }
}

const TASK_COLUMNS: &str =
    "id, device_id, task_type, status, initiator, created_at, sent_at, resolved_at, \
     description, result, error";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Task {
        id: row.get(0)?,
        device_id: row.get(1)?,
        task_type: TaskType::parse(&task_type).map_err(|e| conversion_error(2, e))?,
        status: TaskStatus::parse(&status).map_err(|e| conversion_error(3, e))?,
        initiator: row.get(4)?,
        created_at: timestamp_to_datetime(row.get(5)?).ok_or_else(|| {
            conversion_error(
                5,
                TaskError::Storage {
                    message: "created_at out of range".to_string(),
                },
            )
        })?,
        sent_at: row.get::<_, Option<i64>>(6)?.and_then(timestamp_to_datetime),
        resolved_at: row.get::<_, Option<i64>>(7)?.and_then(timestamp_to_datetime),
        description: row.get(8)?,
        result: row.get(9)?,
        error: row.get(10)?,
    })
}

fn timestamp_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn conversion_error(column: usize, err: TaskError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(err))
}

fn storage_error(err: rusqlite::Error) -> TaskError {
    TaskError::Storage {
        message: err.to_string(),
    }
}

impl TaskStore for SqliteTaskStore {
    fn insert(&self, new_task: NewTask) -> Result<Task, TaskError> {
        let conn = self.lock()?;
        let created_at = Utc::now();
        conn.execute(
            "INSERT INTO tasks (device_id, task_type, status, initiator, created_at, description) \
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5)",
            params![
                new_task.device_id,
                new_task.task_type.as_str(),
                new_task.initiator,
                created_at.timestamp(),
                new_task.description,
            ],
        )
        .map_err(storage_error)?;
        let id = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            row_to_task,
        )
        .map_err(storage_error)
    }

    fn get(&self, task_id: u64) -> Result<Option<Task>, TaskError> {
        use rusqlite::OptionalExtension;
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            row_to_task,
        )
        .optional()
        .map_err(storage_error)
    }

    fn tasks_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE device_id = ?1 ORDER BY id"
            ))
            .map_err(storage_error)?;
        let tasks = stmt
            .query_map(params![device_id], row_to_task)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)?;
        Ok(tasks)
    }

    fn claim_pending(&self, device_id: &str, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_error)?;

        let pending_ids: Vec<u64> = {
            let mut stmt = tx
                .prepare(
                    "SELECT id FROM tasks WHERE device_id = ?1 AND status = 'pending' \
                     ORDER BY id",
                )
                .map_err(storage_error)?;
            let ids = stmt
                .query_map(params![device_id], |row| row.get(0))
                .map_err(storage_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(storage_error)?;
            ids
        };

        let mut claimed = Vec::with_capacity(pending_ids.len());
        for id in pending_ids {
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = 'sent', sent_at = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![now.timestamp(), id],
                )
                .map_err(storage_error)?;
            if changed == 1 {
                let task = tx
                    .query_row(
                        &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                        params![id],
                        row_to_task,
                    )
                    .map_err(storage_error)?;
                claimed.push(task);
            }
        }

        tx.commit().map_err(storage_error)?;
        Ok(claimed)
    }

    fn verifying_for_device(&self, device_id: &str) -> Result<Vec<Task>, TaskError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE device_id = ?1 AND status = 'verifying' ORDER BY id"
            ))
            .map_err(storage_error)?;
        let tasks = stmt
            .query_map(params![device_id], row_to_task)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)?;
        Ok(tasks)
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
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE tasks SET status = ?1, resolved_at = ?2, \
                 result = COALESCE(?3, result), error = COALESCE(?4, error) \
                 WHERE id = ?5 AND status = ?6",
                params![
                    to.as_str(),
                    now.timestamp(),
                    result,
                    error,
                    task_id,
                    from.as_str(),
                ],
            )
            .map_err(storage_error)?;
        Ok(changed == 1)
    }

    fn cancel_pending(&self, task_ids: &[u64]) -> Result<u64, TaskError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(storage_error)?;
        let now = Utc::now().timestamp();
        let mut affected = 0u64;
        for id in task_ids {
            let changed = tx
                .execute(
                    "UPDATE tasks SET status = 'cancelled', resolved_at = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id],
                )
                .map_err(storage_error)?;
            affected += changed as u64;
        }
        tx.commit().map_err(storage_error)?;
        Ok(affected)
    }

    fn overdue_sent(&self, now: DateTime<Utc>) -> Result<Vec<Task>, TaskError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'sent' ORDER BY id"
            ))
            .map_err(storage_error)?;
        let sent = stmt
            .query_map([], row_to_task)
            .map_err(storage_error)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_error)?;
        // The deadline is type-specific, so the filter lives on the model
        Ok(sent.into_iter().filter(|t| t.is_overdue(now)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(device: &str, ty: TaskType) -> NewTask {
        NewTask {
            device_id: device.to_string(),
            task_type: ty,
            description: String::new(),
            initiator: None,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = store
            .insert(NewTask {
                device_id: "cpe-1".to_string(),
                task_type: TaskType::SetParameterValues,
                description: "set wifi ssid".to_string(),
                initiator: Some("admin".to_string()),
            })
            .unwrap();
        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded, task);
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.initiator.as_deref(), Some("admin"));
    }

    #[test]
    fn test_get_unknown_id_is_none() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        assert!(store.get(404).unwrap().is_none());
    }

    #[test]
    fn test_claim_is_exclusive_and_ordered() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let a = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let b = store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap();
        store.insert(new_task("cpe-2", TaskType::Upload)).unwrap();

        let claimed = store.claim_pending("cpe-1", Utc::now()).unwrap();
        assert_eq!(
            claimed.iter().map(|t| t.id).collect::<Vec<_>>(),
            vec![a.id, b.id]
        );
        assert!(claimed.iter().all(|t| t.status == TaskStatus::Sent));
        assert!(store.claim_pending("cpe-1", Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_compare_and_swap() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let task = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        store.claim_pending("cpe-1", Utc::now()).unwrap();

        let now = Utc::now();
        assert!(
            store
                .resolve(task.id, TaskStatus::Sent, TaskStatus::Completed, now, Some("ok"), None)
                .unwrap()
        );
        assert!(
            !store
                .resolve(task.id, TaskStatus::Sent, TaskStatus::Failed, now, None, Some("late"))
                .unwrap()
        );
        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Completed);
        assert_eq!(loaded.result.as_deref(), Some("ok"));
        assert!(loaded.error.is_none());
    }

    #[test]
    fn test_cancel_pending_counts_only_transitions() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        let a = store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        let b = store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap();
        store.claim_pending("cpe-1", Utc::now()).unwrap();
        store
            .resolve(b.id, TaskStatus::Sent, TaskStatus::Completed, Utc::now(), None, None)
            .unwrap();
        let c = store.insert(new_task("cpe-1", TaskType::Upload)).unwrap();

        let affected = store.cancel_pending(&[a.id, b.id, c.id, 9999]).unwrap();
        assert_eq!(affected, 1);
        assert_eq!(store.get(c.id).unwrap().unwrap().status, TaskStatus::Cancelled);
        assert_eq!(store.get(b.id).unwrap().unwrap().status, TaskStatus::Completed);
        assert_eq!(store.get(a.id).unwrap().unwrap().status, TaskStatus::Sent);
    }

    #[test]
    fn test_overdue_sent_uses_type_deadline() {
        let store = SqliteTaskStore::open_in_memory().unwrap();
        store.insert(new_task("cpe-1", TaskType::GetParams)).unwrap();
        store.insert(new_task("cpe-1", TaskType::Download)).unwrap();
        let sent_at = Utc::now();
        store.claim_pending("cpe-1", sent_at).unwrap();

        let overdue = store
            .overdue_sent(sent_at + chrono::Duration::seconds(500))
            .unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].task_type, TaskType::GetParams);
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tasks.db");
        let task = {
            let store = SqliteTaskStore::open(&path).unwrap();
            store.insert(new_task("cpe-1", TaskType::Reboot)).unwrap()
        };
        let store = SqliteTaskStore::open(&path).unwrap();
        let loaded = store.get(task.id).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);
        assert_eq!(loaded.device_id, "cpe-1");
    }
}
