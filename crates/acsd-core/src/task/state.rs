//! Task data model and state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::TaskError;

/// The kind of RPC a task asks a device to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Read parameter values.
    GetParams,
    /// Write parameter values.
    SetParameterValues,
    /// Discover the parameter tree.
    GetParameterNames,
    /// Instantiate a multi-instance object.
    AddObject,
    /// Remove a multi-instance object.
    DeleteObject,
    /// Reboot the device.
    Reboot,
    /// Restore factory defaults.
    FactoryReset,
    /// Transfer a file (firmware image) to the device.
    Download,
    /// Retrieve a file (config dump, log) from the device.
    Upload,
}

impl TaskType {
    /// How long a `Sent` task of this type may await a device response.
    ///
    /// The values are a design contract, not tuning knobs: parameter writes
    /// get extra headroom because WiFi-related settings require a
    /// post-change verification read, reboots cover the device's boot time,
    /// and downloads cover a full firmware transfer on slow uplinks.
    #[must_use]
    pub fn timeout(self) -> Duration {
        match self {
            Self::GetParams | Self::GetParameterNames => Duration::seconds(120),
            Self::SetParameterValues | Self::AddObject | Self::DeleteObject => {
                Duration::seconds(180)
            },
            Self::Reboot | Self::FactoryReset => Duration::seconds(300),
            Self::Download => Duration::seconds(1200),
            Self::Upload => Duration::seconds(600),
        }
    }

    /// Stable string form used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GetParams => "get_params",
            Self::SetParameterValues => "set_parameter_values",
            Self::GetParameterNames => "get_parameter_names",
            Self::AddObject => "add_object",
            Self::DeleteObject => "delete_object",
            Self::Reboot => "reboot",
            Self::FactoryReset => "factory_reset",
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTaskType`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, TaskError> {
        match value {
            "get_params" => Ok(Self::GetParams),
            "set_parameter_values" => Ok(Self::SetParameterValues),
            "get_parameter_names" => Ok(Self::GetParameterNames),
            "add_object" => Ok(Self::AddObject),
            "delete_object" => Ok(Self::DeleteObject),
            "reboot" => Ok(Self::Reboot),
            "factory_reset" => Ok(Self::FactoryReset),
            "download" => Ok(Self::Download),
            "upload" => Ok(Self::Upload),
            _ => Err(TaskError::InvalidTaskType {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, awaiting the device's next session.
    Pending,
    /// Delivered during a device session, awaiting the RPC response.
    Sent,
    /// Response timed out on a parameter write; the effect must be
    /// re-confirmed during the next session.
    Verifying,
    /// Confirmed success. Terminal.
    Completed,
    /// RPC fault or response timeout. Terminal.
    Failed,
    /// Cancelled by a user or administrator while still pending. Terminal.
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` for states with no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits `self -> to`.
    ///
    /// Illegal jumps (e.g. `Completed -> Sent`) are rejected here; callers
    /// never mutate status except through guarded transitions.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Sent | Self::Cancelled)
                | (Self::Sent, Self::Completed | Self::Failed | Self::Verifying)
                | (Self::Verifying, Self::Completed | Self::Failed)
        )
    }

    /// Stable string form used in storage and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse the stable string form.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTaskStatus`] for unknown values.
    pub fn parse(value: &str) -> Result<Self, TaskError> {
        match value {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "verifying" => Ok(Self::Verifying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(TaskError::InvalidTaskStatus {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued RPC for one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Store-allocated identifier.
    pub id: u64,
    /// The device this task targets.
    pub device_id: String,
    /// The RPC kind.
    pub task_type: TaskType,
    /// Current lifecycle state.
    pub status: TaskStatus,
    /// User that created the task; `None` means ACS-initiated.
    pub initiator: Option<String>,
    /// Creation time; dispatch order follows it.
    pub created_at: DateTime<Utc>,
    /// When the task was delivered to a device session.
    pub sent_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state or entered verification.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Human-readable description shown by collaborators.
    pub description: String,
    /// Result payload recorded on completion.
    pub result: Option<String>,
    /// Error payload recorded on failure.
    pub error: Option<String>,
}

impl Task {
    /// The moment an in-flight task is considered overdue.
    ///
    /// `None` unless the task has been sent.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.sent_at.map(|sent| sent + self.task_type.timeout())
    }

    /// Whether a `Sent` task has outlived its type-specific timeout.
    #[must_use]
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Sent && self.deadline().is_some_and(|d| d <= now)
    }
}
