//! Persistence provider seam for background tasks.
//!
//! The provider is the system of record. It stores rows as they are given:
//! parameter payloads and log fragments arrive already encoded and leave
//! still encoded. Decoding is the service's job.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use panel_core::ServiceError;

use crate::model::{
    BackgroundTask, BackgroundTaskLogRecord, BackgroundTaskParameter, BackgroundTaskStatus,
};

/// Writes that keep a task row, its parameters and its stack record in step.
///
/// A `TaskWriter` handed out by [`TaskProvider::atomically`] commits all of
/// its writes together.
pub trait TaskWriter {
    /// Insert a task row and return its assigned id.
    fn add_task(&self, task: &BackgroundTask) -> Result<i64, ServiceError>;

    /// Update the mutable columns of the row identified by `task.id`.
    fn update_task(&self, task: &BackgroundTask) -> Result<(), ServiceError>;

    fn add_task_stack(&self, task_id: i64) -> Result<(), ServiceError>;

    /// Remove the stack record. Removing an absent record is not an error.
    fn delete_task_stack(&self, task_id: i64) -> Result<(), ServiceError>;

    /// Store an encoded parameter, replacing any previous value of that name.
    fn add_task_param(
        &self,
        task_id: i64,
        name: &str,
        type_name: &str,
        serialized_value: &str,
    ) -> Result<(), ServiceError>;
}

/// Data access for tasks, task parameters, task logs and task stack records.
///
/// Methods taking `actor_id` only return tasks the actor owns or runs as.
/// Returned tasks carry no parameters; returned parameters carry no live
/// value; returned logs carry the raw `xml_parameters` fragment.
pub trait TaskProvider: TaskWriter + Send + Sync {
    // --- tasks ---

    fn get_task(&self, actor_id: i64, task_id: &str)
        -> Result<Option<BackgroundTask>, ServiceError>;

    fn get_schedule_tasks(
        &self,
        actor_id: i64,
        schedule_id: i64,
    ) -> Result<Vec<BackgroundTask>, ServiceError>;

    fn get_tasks(&self, actor_id: i64) -> Result<Vec<BackgroundTask>, ServiceError>;

    fn get_group_tasks(&self, actor_id: i64, guid: Uuid)
        -> Result<Vec<BackgroundTask>, ServiceError>;

    fn get_process_tasks(
        &self,
        actor_id: i64,
        status: BackgroundTaskStatus,
    ) -> Result<Vec<BackgroundTask>, ServiceError>;

    /// The earliest-started task of a group.
    fn get_top_task(&self, actor_id: i64, guid: Uuid)
        -> Result<Option<BackgroundTask>, ServiceError>;

    /// Run `f` so that either all of its writes are stored or none are.
    ///
    /// An error returned by `f` is returned unchanged after the rollback.
    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn TaskWriter) -> Result<(), ServiceError>,
    ) -> Result<(), ServiceError>;

    // --- task stack ---

    fn task_stack_exists(&self, task_id: i64) -> Result<bool, ServiceError>;

    // --- parameters ---

    /// All stored parameters of a task, in first-insertion order.
    fn get_task_params(&self, task_id: i64)
        -> Result<Vec<BackgroundTaskParameter>, ServiceError>;

    // --- logs ---

    /// Append a log row with its already-built parameters fragment.
    fn add_task_log(
        &self,
        log: &BackgroundTaskLogRecord,
        xml_parameters: &str,
    ) -> Result<i64, ServiceError>;

    /// Log rows of a task dated at or after `since`, oldest first.
    fn get_task_logs(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackgroundTaskLogRecord>, ServiceError>;
}
