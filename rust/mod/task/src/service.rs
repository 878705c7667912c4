use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use panel_core::{Caller, ServiceError};
use panel_sql::SQLStore;

use crate::log_params::{build_parameters_xml, parse_parameters_xml};
use crate::model::{
    BackgroundTask, BackgroundTaskLogRecord, BackgroundTaskParameter, BackgroundTaskStatus,
};
use crate::params::ParamRegistry;
use crate::provider::{TaskProvider, TaskWriter};
use crate::store::SqlTaskProvider;

// ---------------------------------------------------------------------------
// TaskService: record store facade
// ---------------------------------------------------------------------------

/// Reads and writes background task records.
///
/// This is a pass-through to a [`TaskProvider`]: it owns no state besides
/// the parameter codec registry, and every call is independent. It:
/// - Scopes task queries by the explicit [`Caller`].
/// - Encodes parameter values on the way in and decodes them on the way out.
/// - Builds and parses the `<parameters>` fragment of log lines.
/// - Keeps the task stack record in step with task lifecycle.
pub struct TaskService {
    provider: Arc<dyn TaskProvider>,
    registry: ParamRegistry,
}

impl TaskService {
    pub fn new(provider: Arc<dyn TaskProvider>, registry: ParamRegistry) -> Self {
        Self { provider, registry }
    }

    /// SQL-backed service with the builtin parameter types.
    pub fn sqlite(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        let provider = Arc::new(SqlTaskProvider::new(db)?);
        Ok(Self::new(provider, ParamRegistry::with_builtins()))
    }

    pub fn registry_mut(&mut self) -> &mut ParamRegistry {
        &mut self.registry
    }

    // =======================================================================
    // Queries
    // =======================================================================

    /// Get a task by its task key, with parameters decoded.
    pub fn get_task(&self, caller: &Caller, task_id: &str) -> Result<BackgroundTask, ServiceError> {
        let task = self
            .provider
            .get_task(caller.user_id, task_id)?
            .ok_or_else(|| ServiceError::NotFound(format!("background task {task_id}")))?;
        self.with_params(task)
    }

    pub fn get_schedule_tasks(
        &self,
        caller: &Caller,
        schedule_id: i64,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.provider.get_schedule_tasks(caller.user_id, schedule_id)
    }

    pub fn get_tasks(&self, caller: &Caller) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.provider.get_tasks(caller.user_id)
    }

    /// Tasks sharing a group guid.
    pub fn get_group_tasks(
        &self,
        caller: &Caller,
        guid: Uuid,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.provider.get_group_tasks(caller.user_id, guid)
    }

    pub fn get_process_tasks(
        &self,
        caller: &Caller,
        status: BackgroundTaskStatus,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.provider.get_process_tasks(caller.user_id, status)
    }

    /// The first task of a group, with parameters decoded.
    pub fn get_top_task(&self, caller: &Caller, guid: Uuid) -> Result<BackgroundTask, ServiceError> {
        let task = self
            .provider
            .get_top_task(caller.user_id, guid)?
            .ok_or_else(|| ServiceError::NotFound(format!("background task group {guid}")))?;
        self.with_params(task)
    }

    // =======================================================================
    // Task lifecycle
    // =======================================================================

    /// Insert a task, its parameters and its stack record.
    ///
    /// Parameters are encoded before anything is written. On success
    /// `task.id` holds the assigned id and every parameter carries its
    /// stored `type_name`/`serialized_value`.
    pub fn add_task(&self, task: &mut BackgroundTask) -> Result<i64, ServiceError> {
        self.encode_params(&mut task.params)?;

        let mut id = 0;
        let row = &*task;
        self.provider.atomically(&mut |tx| {
            id = tx.add_task(row)?;
            write_params(tx, id, &row.params)?;
            tx.add_task_stack(id)
        })?;
        task.id = id;

        info!(
            "background task {} ({}) added as #{id} with {} params",
            task.task_id,
            task.task_name,
            task.params.len()
        );
        Ok(id)
    }

    /// Update a task row and rewrite its current parameters.
    ///
    /// The stack record is removed once the task is completed or its status
    /// is `Abort` or `Stopping`.
    pub fn update_task(&self, task: &mut BackgroundTask) -> Result<(), ServiceError> {
        self.encode_params(&mut task.params)?;

        let retired = task.is_retired();
        let row = &*task;
        self.provider.atomically(&mut |tx| {
            tx.update_task(row)?;
            write_params(tx, row.id, &row.params)?;
            if retired {
                tx.delete_task_stack(row.id)?;
            }
            Ok(())
        })?;

        if retired {
            info!(
                "background task #{} retired (completed: {}, status: {})",
                task.id, task.completed, task.status
            );
        }
        Ok(())
    }

    /// Remove a task's stack record. No-op if there is none.
    pub fn delete_task_stack(&self, task_id: i64) -> Result<(), ServiceError> {
        self.provider.delete_task_stack(task_id)
    }

    pub fn has_task_stack(&self, task_id: i64) -> Result<bool, ServiceError> {
        self.provider.task_stack_exists(task_id)
    }

    // =======================================================================
    // Parameters
    // =======================================================================

    /// Encode and store a parameter set for a task.
    pub fn add_task_params(
        &self,
        task_id: i64,
        params: &mut [BackgroundTaskParameter],
    ) -> Result<(), ServiceError> {
        self.encode_params(params)?;
        let params = &*params;
        self.provider
            .atomically(&mut |tx| write_params(tx, task_id, params))
    }

    /// Fetch and decode all parameters of a task.
    pub fn get_task_params(&self, task_id: i64) -> Result<Vec<BackgroundTaskParameter>, ServiceError> {
        let mut params = self.provider.get_task_params(task_id)?;
        for param in &mut params {
            let value = self
                .registry
                .decode(&param.type_name, &param.serialized_value)
                .map_err(|e| ServiceError::Decode(format!("parameter {}: {e}", param.name)))?;
            param.value = Some(value);
        }
        Ok(params)
    }

    // =======================================================================
    // Logs
    // =======================================================================

    /// Append a log line. Returns the assigned log id.
    pub fn add_log(&self, log: &BackgroundTaskLogRecord) -> Result<i64, ServiceError> {
        let xml = build_parameters_xml(&log.text_parameters)?;
        self.provider.add_task_log(log, &xml)
    }

    /// Log lines of a task dated at or after `since`, oldest first, with
    /// text parameters decoded.
    pub fn get_logs(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackgroundTaskLogRecord>, ServiceError> {
        let mut logs = self.provider.get_task_logs(task_id, since)?;
        for log in &mut logs {
            log.text_parameters = parse_parameters_xml(&log.xml_parameters)?;
        }
        debug!("task #{task_id}: {} log lines since {since}", logs.len());
        Ok(logs)
    }

    // =======================================================================
    // Internal
    // =======================================================================

    fn with_params(&self, mut task: BackgroundTask) -> Result<BackgroundTask, ServiceError> {
        task.params = self.get_task_params(task.id)?;
        Ok(task)
    }

    /// Fill `type_name`/`serialized_value` from each live value.
    ///
    /// A parameter without a live value keeps the pair it already has.
    fn encode_params(&self, params: &mut [BackgroundTaskParameter]) -> Result<(), ServiceError> {
        for param in params.iter_mut() {
            match &param.value {
                Some(value) => {
                    param.type_name = value.type_name().to_string();
                    param.serialized_value = self.registry.encode(value)?;
                }
                None if param.type_name.is_empty() => {
                    return Err(ServiceError::Validation(format!(
                        "parameter {} has neither a value nor a stored type",
                        param.name
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }
}

fn write_params(
    tx: &dyn TaskWriter,
    task_id: i64,
    params: &[BackgroundTaskParameter],
) -> Result<(), ServiceError> {
    for param in params {
        tx.add_task_param(task_id, &param.name, &param.type_name, &param.serialized_value)?;
    }
    debug!("task #{task_id}: wrote {} params", params.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use panel_sql::{SQLConn, SqliteStore};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::model::Severity;
    use crate::params::TaskParamType;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SiteBinding {
        host: String,
        port: i32,
    }

    impl TaskParamType for SiteBinding {
        const TYPE_NAME: &'static str = "SiteBinding";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SiteAliases {
        host: String,
        aliases: Vec<String>,
    }

    impl TaskParamType for SiteAliases {
        const TYPE_NAME: &'static str = "SiteAliases";
    }

    const REJECT_OVERWRITE_PARAM: &str = "
        CREATE TRIGGER reject_overwrite BEFORE INSERT ON background_task_params
        WHEN NEW.name = 'Overwrite'
        BEGIN SELECT RAISE(ABORT, 'params rejected'); END;";

    fn service() -> TaskService {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        TaskService::sqlite(db).unwrap()
    }

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 1, 8, minute, 0).unwrap()
    }

    fn make_task(task_id: &str, guid: Uuid) -> BackgroundTask {
        BackgroundTask {
            guid,
            task_id: task_id.into(),
            user_id: 1,
            effective_user_id: 1,
            task_name: "BACKUP".into(),
            source: "SPACE".into(),
            start_date: at(0),
            params: vec![
                BackgroundTaskParameter::new("PackageId", 42i32),
                BackgroundTaskParameter::new("BackupFile", "space42.bak".to_string()),
                BackgroundTaskParameter::new("Overwrite", true),
            ],
            ..Default::default()
        }
    }

    const OWNER: Caller = Caller { user_id: 1 };

    #[test]
    fn added_task_comes_back_with_params() {
        let svc = service();
        let mut task = make_task("backup-1", Uuid::new_v4());
        let id = svc.add_task(&mut task).unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.params[0].serialized_value, "<Int32>42</Int32>");

        let got = svc.get_task(&OWNER, "backup-1").unwrap();
        assert_eq!(got.id, id);
        let names: Vec<&str> = got.params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["PackageId", "BackupFile", "Overwrite"]);
        assert_eq!(got.params, task.params);
        assert_eq!(got.param("BackupFile").unwrap().get::<String>().unwrap(), "space42.bak");
        assert!(svc.has_task_stack(id).unwrap());
    }

    #[test]
    fn missing_task_is_not_found() {
        let svc = service();
        let err = svc.get_task(&OWNER, "nope").unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
        let err = svc.get_top_task(&OWNER, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ServiceError::NotFound(_)));
    }

    #[test]
    fn other_callers_do_not_see_the_task() {
        let svc = service();
        let mut task = make_task("backup-1", Uuid::new_v4());
        svc.add_task(&mut task).unwrap();

        let stranger = Caller::new(2);
        assert!(matches!(
            svc.get_task(&stranger, "backup-1").unwrap_err(),
            ServiceError::NotFound(_)
        ));
        assert!(svc.get_tasks(&stranger).unwrap().is_empty());
        assert_eq!(svc.get_tasks(&OWNER).unwrap().len(), 1);
    }

    #[test]
    fn top_task_has_params() {
        let svc = service();
        let group = Uuid::new_v4();
        let mut root = make_task("root", group);
        svc.add_task(&mut root).unwrap();
        let mut child = make_task("child", group);
        child.start_date = at(5);
        child.params.clear();
        svc.add_task(&mut child).unwrap();

        let top = svc.get_top_task(&OWNER, group).unwrap();
        assert_eq!(top.task_id, "root");
        assert_eq!(top.params.len(), 3);
        assert_eq!(svc.get_group_tasks(&OWNER, group).unwrap().len(), 2);
    }

    #[test]
    fn list_queries_leave_params_empty() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        task.schedule_id = 8;
        svc.add_task(&mut task).unwrap();

        let scheduled = svc.get_schedule_tasks(&OWNER, 8).unwrap();
        assert_eq!(scheduled.len(), 1);
        assert!(scheduled[0].params.is_empty());
        assert_eq!(
            svc.get_process_tasks(&OWNER, BackgroundTaskStatus::Run).unwrap().len(),
            1
        );
    }

    #[test]
    fn update_retires_stack_only_when_finished() {
        let cases = [
            (false, BackgroundTaskStatus::Run, true),
            (true, BackgroundTaskStatus::Run, false),
            (false, BackgroundTaskStatus::Abort, false),
            (false, BackgroundTaskStatus::Stopping, false),
            (true, BackgroundTaskStatus::Abort, false),
        ];
        for (completed, status, stack_remains) in cases {
            let svc = service();
            let mut task = make_task("t", Uuid::new_v4());
            svc.add_task(&mut task).unwrap();

            task.completed = completed;
            task.status = status;
            task.indicator_current = 3;
            svc.update_task(&mut task).unwrap();

            assert_eq!(
                svc.has_task_stack(task.id).unwrap(),
                stack_remains,
                "completed={completed} status={status}"
            );
        }
    }

    #[test]
    fn update_overwrites_param_values() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        svc.add_task(&mut task).unwrap();

        task.params[0] = BackgroundTaskParameter::new("PackageId", 43i32);
        task.params.push(BackgroundTaskParameter::new("Progress", 0.75f64));
        svc.update_task(&mut task).unwrap();

        let got = svc.get_task(&OWNER, "t").unwrap();
        assert_eq!(got.params.len(), 4);
        assert_eq!(got.param("PackageId").unwrap().get::<i32>(), Some(&43));
        assert_eq!(got.param("Progress").unwrap().get::<f64>(), Some(&0.75));
    }

    #[test]
    fn unregistered_param_type_is_rejected_before_writing() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        task.params.push(BackgroundTaskParameter::new(
            "Binding",
            SiteBinding { host: "example.com".into(), port: 80 },
        ));

        let err = svc.add_task(&mut task).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(svc.get_tasks(&OWNER).unwrap().is_empty());
    }

    #[test]
    fn registered_structured_param_roundtrips() {
        let mut svc = service();
        svc.registry_mut().register::<SiteBinding>().unwrap();

        let binding = SiteBinding { host: "example.com".into(), port: 443 };
        let mut task = make_task("t", Uuid::new_v4());
        task.params = vec![BackgroundTaskParameter::new("Binding", binding.clone())];
        svc.add_task(&mut task).unwrap();

        let got = svc.get_task(&OWNER, "t").unwrap();
        assert_eq!(got.params[0].type_name, "SiteBinding");
        assert_eq!(got.params[0].get::<SiteBinding>(), Some(&binding));
    }

    #[test]
    fn stored_param_of_unknown_type_fails_to_decode() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        task.params.clear();
        let id = svc.add_task(&mut task).unwrap();

        let mut params = vec![BackgroundTaskParameter {
            name: "Plan".into(),
            type_name: "HostingPlan".into(),
            serialized_value: "<HostingPlan><PlanId>3</PlanId></HostingPlan>".into(),
            value: None,
        }];
        svc.add_task_params(id, &mut params).unwrap();

        let err = svc.get_task(&OWNER, "t").unwrap_err();
        assert!(matches!(err, ServiceError::Decode(_)));
    }

    #[test]
    fn param_without_value_or_type_is_invalid() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        let id = svc.add_task(&mut task).unwrap();

        let mut params = vec![BackgroundTaskParameter {
            name: "Empty".into(),
            ..Default::default()
        }];
        let err = svc.add_task_params(id, &mut params).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn delete_task_stack_is_idempotent() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        let id = svc.add_task(&mut task).unwrap();

        svc.delete_task_stack(id).unwrap();
        svc.delete_task_stack(id).unwrap();
        svc.delete_task_stack(9999).unwrap();
        assert!(!svc.has_task_stack(id).unwrap());
    }

    #[test]
    fn logs_since_with_text_parameters() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        let id = svc.add_task(&mut task).unwrap();

        let lines = [
            (1, "Backup started", vec![]),
            (2, "Copying {0} to {1}", vec!["wwwroot", "space42.bak"]),
            (3, "Backup finished", vec!["12 MB"]),
        ];
        for (minute, text, params) in lines {
            let mut log = BackgroundTaskLogRecord::new(id, Severity::Info, text)
                .with_parameters(params);
            log.date = at(minute);
            svc.add_log(&log).unwrap();
        }

        let logs = svc.get_logs(id, at(2)).unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].text, "Copying {0} to {1}");
        assert_eq!(logs[0].text_parameters, vec!["wwwroot", "space42.bak"]);
        assert_eq!(logs[1].text_parameters, vec!["12 MB"]);

        let all = svc.get_logs(id, at(0)).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all[0].text_parameters.is_empty());
    }

    #[test]
    fn failed_param_write_leaves_no_task_behind() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let svc = TaskService::sqlite(db.clone()).unwrap();
        db.exec_batch(REJECT_OVERWRITE_PARAM).unwrap();

        let mut task = make_task("t", Uuid::new_v4());
        let err = svc.add_task(&mut task).unwrap_err();
        assert!(matches!(err, ServiceError::Storage(_)), "{err:?}");
        assert_eq!(task.id, 0);
        assert!(svc.get_tasks(&OWNER).unwrap().is_empty());

        let leftovers = db
            .query("SELECT COUNT(*) AS cnt FROM background_task_params", &[])
            .unwrap();
        assert_eq!(leftovers[0].get_i64("cnt"), Some(0));
    }

    #[test]
    fn failed_update_keeps_previous_row_and_stack() {
        let db = Arc::new(SqliteStore::open_in_memory().unwrap());
        let svc = TaskService::sqlite(db.clone()).unwrap();
        let mut task = make_task("t", Uuid::new_v4());
        let id = svc.add_task(&mut task).unwrap();
        db.exec_batch(REJECT_OVERWRITE_PARAM).unwrap();

        task.indicator_current = 9;
        task.status = BackgroundTaskStatus::Abort;
        let err = svc.update_task(&mut task).unwrap_err();
        assert!(matches!(err, ServiceError::Storage(_)), "{err:?}");

        let got = svc.get_task(&OWNER, "t").unwrap();
        assert_eq!(got.indicator_current, 0);
        assert_eq!(got.status, BackgroundTaskStatus::Run);
        assert!(svc.has_task_stack(id).unwrap());
    }

    #[test]
    fn param_that_cannot_be_read_back_is_never_stored() {
        let mut svc = service();
        svc.registry_mut().register::<SiteAliases>().unwrap();

        let mut task = make_task("t", Uuid::new_v4());
        task.params.push(BackgroundTaskParameter::new(
            "Aliases",
            SiteAliases { host: "example.com".into(), aliases: Vec::new() },
        ));
        let err = svc.add_task(&mut task).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)), "{err:?}");
        assert!(svc.get_tasks(&OWNER).unwrap().is_empty());
    }

    #[test]
    fn padded_string_param_comes_back_unchanged() {
        let svc = service();
        let mut task = make_task("t", Uuid::new_v4());
        task.params = vec![
            BackgroundTaskParameter::new("Path", "  C:\\HostingSpaces\\site ".to_string()),
            BackgroundTaskParameter::new("Blank", " ".to_string()),
        ];
        svc.add_task(&mut task).unwrap();

        let got = svc.get_task(&OWNER, "t").unwrap();
        assert_eq!(
            got.param("Path").unwrap().get::<String>().unwrap(),
            "  C:\\HostingSpaces\\site "
        );
        assert_eq!(got.param("Blank").unwrap().get::<String>().unwrap(), " ");
    }
}
