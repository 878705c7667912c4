use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::params::{ParamValue, TaskParamType};

// ---------------------------------------------------------------------------
// BackgroundTaskStatus
// ---------------------------------------------------------------------------

/// Execution status of a background task.
///
/// ```text
/// RUN → ABORT
///     → STOPPING
/// ```
///
/// Completion is tracked separately by [`BackgroundTask::completed`]; a task
/// can finish while still in `Run`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundTaskStatus {
    #[default]
    Run,
    Abort,
    Stopping,
}

impl BackgroundTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Abort => "ABORT",
            Self::Stopping => "STOPPING",
        }
    }

    /// Integer code persisted in the store.
    pub fn code(&self) -> i64 {
        match self {
            Self::Run => 1,
            Self::Abort => 2,
            Self::Stopping => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Run),
            2 => Some(Self::Abort),
            3 => Some(Self::Stopping),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "RUN" => Some(Self::Run),
            "ABORT" => Some(Self::Abort),
            "STOPPING" => Some(Self::Stopping),
            _ => None,
        }
    }

    /// Whether the task is being torn down.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abort | Self::Stopping)
    }
}

impl std::fmt::Display for BackgroundTaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Level attached to a task or a log entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Info => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Info),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// BackgroundTask
// ---------------------------------------------------------------------------

/// A long-running panel operation (provisioning, backup, import, ...).
///
/// Rows are created on task start, updated as progress and status change,
/// and retired once completed or aborted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTask {
    /// Store-assigned identity. Zero until the task is added.
    #[serde(default)]
    pub id: i64,
    /// Group identity shared by a task and the tasks it spawns.
    pub guid: Uuid,
    /// Caller-visible task key.
    pub task_id: String,

    // --- association ---
    #[serde(default)]
    pub schedule_id: i64,
    #[serde(default)]
    pub package_id: i64,
    pub user_id: i64,
    pub effective_user_id: i64,

    // --- description ---
    pub task_name: String,
    #[serde(default)]
    pub item_id: i64,
    #[serde(default)]
    pub item_name: String,
    #[serde(default)]
    pub source: String,

    // --- progress ---
    #[serde(default)]
    pub indicator_current: i64,
    #[serde(default)]
    pub indicator_maximum: i64,

    // --- timing ---
    pub start_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_date: Option<DateTime<Utc>>,
    /// Seconds; 0 means no limit.
    #[serde(default)]
    pub maximum_execution_time: i64,

    // --- status ---
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub notify_on_complete: bool,
    #[serde(default)]
    pub status: BackgroundTaskStatus,

    #[serde(default)]
    pub params: Vec<BackgroundTaskParameter>,
}

impl BackgroundTask {
    /// Whether an update with this state retires the task's stack record.
    pub fn is_retired(&self) -> bool {
        self.completed || self.status.is_terminal()
    }

    /// Find a parameter by name.
    pub fn param(&self, name: &str) -> Option<&BackgroundTaskParameter> {
        self.params.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// BackgroundTaskParameter
// ---------------------------------------------------------------------------

/// A named value attached to a task.
///
/// `type_name` and `serialized_value` are what the store keeps; `value` is
/// the live value, filled on encode (from the caller) or on decode (from the
/// registry).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTaskParameter {
    pub name: String,
    #[serde(default)]
    pub type_name: String,
    #[serde(default)]
    pub serialized_value: String,
    #[serde(skip)]
    pub value: Option<ParamValue>,
}

impl BackgroundTaskParameter {
    pub fn new<T: TaskParamType>(name: impl Into<String>, value: T) -> Self {
        let value = ParamValue::new(value);
        Self {
            name: name.into(),
            type_name: value.type_name().to_string(),
            serialized_value: String::new(),
            value: Some(value),
        }
    }

    /// Borrow the live value as `T`, if present and of that type.
    pub fn get<T: TaskParamType>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref::<T>())
    }
}

// ---------------------------------------------------------------------------
// BackgroundTaskLogRecord
// ---------------------------------------------------------------------------

/// An append-only log line written by a running task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackgroundTaskLogRecord {
    /// Store-assigned identity. Zero until the record is added.
    #[serde(default)]
    pub log_id: i64,
    pub task_id: i64,
    pub date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_stack_trace: Option<String>,
    /// Marks the first line of a nested task.
    #[serde(default)]
    pub inner_task_start: bool,
    #[serde(default)]
    pub severity: Severity,
    pub text: String,
    /// Indentation level for display.
    #[serde(default)]
    pub text_ident: i64,
    #[serde(default)]
    pub text_parameters: Vec<String>,
    /// Stored `<parameters>` fragment, as read back from the store.
    #[serde(default, skip_serializing)]
    pub xml_parameters: String,
}

impl BackgroundTaskLogRecord {
    pub fn new(task_id: i64, severity: Severity, text: impl Into<String>) -> Self {
        Self {
            task_id,
            date: Utc::now(),
            severity,
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_parameters<I, S>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.text_parameters = parameters.into_iter().map(Into::into).collect();
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
