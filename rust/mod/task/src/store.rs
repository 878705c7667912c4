use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::debug;
use uuid::Uuid;

use panel_core::ServiceError;
use panel_sql::{Row, SQLConn, SQLError, SQLStore, Value};

use crate::model::{
    BackgroundTask, BackgroundTaskLogRecord, BackgroundTaskParameter, BackgroundTaskStatus,
    Severity,
};
use crate::provider::{TaskProvider, TaskWriter};

/// SQL schema for background tasks and their satellites.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS background_tasks (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    guid                    TEXT NOT NULL,
    task_id                 TEXT NOT NULL,
    schedule_id             INTEGER NOT NULL DEFAULT 0,
    package_id              INTEGER NOT NULL DEFAULT 0,
    user_id                 INTEGER NOT NULL,
    effective_user_id       INTEGER NOT NULL,
    task_name               TEXT NOT NULL,
    item_id                 INTEGER NOT NULL DEFAULT 0,
    item_name               TEXT NOT NULL DEFAULT '',
    start_date              TEXT NOT NULL,
    finish_date             TEXT,
    indicator_current       INTEGER NOT NULL DEFAULT 0,
    indicator_maximum       INTEGER NOT NULL DEFAULT 0,
    maximum_execution_time  INTEGER NOT NULL DEFAULT 0,
    source                  TEXT NOT NULL DEFAULT '',
    severity                INTEGER NOT NULL DEFAULT 0,
    completed               INTEGER NOT NULL DEFAULT 0,
    notify_on_complete      INTEGER NOT NULL DEFAULT 0,
    status                  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_bt_task_id ON background_tasks(task_id);
CREATE INDEX IF NOT EXISTS idx_bt_guid ON background_tasks(guid);
CREATE INDEX IF NOT EXISTS idx_bt_schedule ON background_tasks(schedule_id);
CREATE INDEX IF NOT EXISTS idx_bt_user ON background_tasks(user_id, effective_user_id);

CREATE TABLE IF NOT EXISTS background_task_params (
    param_id          INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id           INTEGER NOT NULL REFERENCES background_tasks(id) ON DELETE CASCADE,
    name              TEXT NOT NULL,
    type_name         TEXT NOT NULL,
    serialized_value  TEXT NOT NULL,
    UNIQUE (task_id, name)
);

CREATE TABLE IF NOT EXISTS background_task_stack (
    task_id  INTEGER PRIMARY KEY REFERENCES background_tasks(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS background_task_logs (
    log_id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id                INTEGER NOT NULL REFERENCES background_tasks(id) ON DELETE CASCADE,
    date                   TEXT NOT NULL,
    exception_stack_trace  TEXT,
    inner_task_start       INTEGER NOT NULL DEFAULT 0,
    severity               INTEGER NOT NULL DEFAULT 0,
    text                   TEXT NOT NULL,
    text_ident             INTEGER NOT NULL DEFAULT 0,
    xml_parameters         TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_btl_task_date ON background_task_logs(task_id, date);
";

const TASK_COLUMNS: &str = "id, guid, task_id, schedule_id, package_id, user_id, \
     effective_user_id, task_name, item_id, item_name, start_date, finish_date, \
     indicator_current, indicator_maximum, maximum_execution_time, source, severity, \
     completed, notify_on_complete, status";

/// Tasks the actor owns or runs as.
const VISIBLE_TO_ACTOR: &str = "(user_id = ?1 OR effective_user_id = ?1)";

/// [`TaskProvider`] backed by SQLStore (SQLite).
pub struct SqlTaskProvider {
    db: Arc<dyn SQLStore>,
}

impl SqlTaskProvider {
    /// Create the provider and initialise the schema.
    pub fn new(db: Arc<dyn SQLStore>) -> Result<Self, ServiceError> {
        db.exec_batch(SCHEMA)
            .map_err(|e| ServiceError::Storage(format!("task schema init: {e}")))?;
        Ok(Self { db })
    }

    fn tables(&self) -> TaskTables<'_, dyn SQLStore> {
        TaskTables {
            conn: self.db.as_ref(),
        }
    }
}

impl TaskWriter for SqlTaskProvider {
    fn add_task(&self, task: &BackgroundTask) -> Result<i64, ServiceError> {
        self.tables().add_task(task)
    }

    fn update_task(&self, task: &BackgroundTask) -> Result<(), ServiceError> {
        self.tables().update_task(task)
    }

    fn add_task_stack(&self, task_id: i64) -> Result<(), ServiceError> {
        self.tables().add_task_stack(task_id)
    }

    fn delete_task_stack(&self, task_id: i64) -> Result<(), ServiceError> {
        self.tables().delete_task_stack(task_id)
    }

    fn add_task_param(
        &self,
        task_id: i64,
        name: &str,
        type_name: &str,
        serialized_value: &str,
    ) -> Result<(), ServiceError> {
        self.tables().add_task_param(task_id, name, type_name, serialized_value)
    }
}

impl TaskProvider for SqlTaskProvider {
    fn get_task(
        &self,
        actor_id: i64,
        task_id: &str,
    ) -> Result<Option<BackgroundTask>, ServiceError> {
        self.tables().get_task(actor_id, task_id)
    }

    fn get_schedule_tasks(
        &self,
        actor_id: i64,
        schedule_id: i64,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.tables().get_schedule_tasks(actor_id, schedule_id)
    }

    fn get_tasks(&self, actor_id: i64) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.tables().get_tasks(actor_id)
    }

    fn get_group_tasks(
        &self,
        actor_id: i64,
        guid: Uuid,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.tables().get_group_tasks(actor_id, guid)
    }

    fn get_process_tasks(
        &self,
        actor_id: i64,
        status: BackgroundTaskStatus,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.tables().get_process_tasks(actor_id, status)
    }

    fn get_top_task(
        &self,
        actor_id: i64,
        guid: Uuid,
    ) -> Result<Option<BackgroundTask>, ServiceError> {
        self.tables().get_top_task(actor_id, guid)
    }

    fn atomically(
        &self,
        f: &mut dyn FnMut(&dyn TaskWriter) -> Result<(), ServiceError>,
    ) -> Result<(), ServiceError> {
        let mut failure = None;
        let outcome = self.db.transaction(&mut |conn| {
            f(&TaskTables { conn }).map_err(|e| {
                let aborted = SQLError::Aborted(e.to_string());
                failure = Some(e);
                aborted
            })
        });
        match failure {
            Some(e) => Err(e),
            None => outcome.map_err(storage_err),
        }
    }

    fn task_stack_exists(&self, task_id: i64) -> Result<bool, ServiceError> {
        self.tables().task_stack_exists(task_id)
    }

    fn get_task_params(
        &self,
        task_id: i64,
    ) -> Result<Vec<BackgroundTaskParameter>, ServiceError> {
        self.tables().get_task_params(task_id)
    }

    fn add_task_log(
        &self,
        log: &BackgroundTaskLogRecord,
        xml_parameters: &str,
    ) -> Result<i64, ServiceError> {
        self.tables().add_task_log(log, xml_parameters)
    }

    fn get_task_logs(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackgroundTaskLogRecord>, ServiceError> {
        self.tables().get_task_logs(task_id, since)
    }
}

// ---------------------------------------------------------------------------
// SQL
// ---------------------------------------------------------------------------

/// Task SQL over one connection: the shared store, or an open transaction.
struct TaskTables<'a, C: SQLConn + ?Sized> {
    conn: &'a C,
}

impl<C: SQLConn + ?Sized> TaskTables<'_, C> {
    fn select_tasks(
        &self,
        filter: &str,
        params: &[Value],
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM background_tasks WHERE {filter}");
        let rows = self.conn.query(&sql, params).map_err(storage_err)?;
        debug!("background_tasks: {} rows for [{filter}]", rows.len());
        rows.iter().map(row_to_task).collect()
    }

    fn get_task(
        &self,
        actor_id: i64,
        task_id: &str,
    ) -> Result<Option<BackgroundTask>, ServiceError> {
        let mut tasks = self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} AND task_id = ?2 ORDER BY id DESC LIMIT 1"),
            &[Value::Integer(actor_id), Value::from(task_id)],
        )?;
        Ok(tasks.pop())
    }

    fn get_schedule_tasks(
        &self,
        actor_id: i64,
        schedule_id: i64,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} AND schedule_id = ?2 ORDER BY id"),
            &[Value::Integer(actor_id), Value::Integer(schedule_id)],
        )
    }

    fn get_tasks(&self, actor_id: i64) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} ORDER BY id"),
            &[Value::Integer(actor_id)],
        )
    }

    fn get_group_tasks(
        &self,
        actor_id: i64,
        guid: Uuid,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} AND guid = ?2 ORDER BY id"),
            &[Value::Integer(actor_id), Value::Text(guid.to_string())],
        )
    }

    fn get_process_tasks(
        &self,
        actor_id: i64,
        status: BackgroundTaskStatus,
    ) -> Result<Vec<BackgroundTask>, ServiceError> {
        self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} AND status = ?2 ORDER BY id"),
            &[Value::Integer(actor_id), Value::Integer(status.code())],
        )
    }

    fn get_top_task(
        &self,
        actor_id: i64,
        guid: Uuid,
    ) -> Result<Option<BackgroundTask>, ServiceError> {
        let mut tasks = self.select_tasks(
            &format!("{VISIBLE_TO_ACTOR} AND guid = ?2 ORDER BY start_date ASC, id ASC LIMIT 1"),
            &[Value::Integer(actor_id), Value::Text(guid.to_string())],
        )?;
        Ok(tasks.pop())
    }

    fn task_stack_exists(&self, task_id: i64) -> Result<bool, ServiceError> {
        let rows = self
            .conn
            .query(
                "SELECT COUNT(*) AS cnt FROM background_task_stack WHERE task_id = ?1",
                &[Value::Integer(task_id)],
            )
            .map_err(storage_err)?;
        Ok(rows.first().and_then(|r| r.get_i64("cnt")).unwrap_or(0) > 0)
    }

    fn get_task_params(
        &self,
        task_id: i64,
    ) -> Result<Vec<BackgroundTaskParameter>, ServiceError> {
        let rows = self
            .conn
            .query(
                "SELECT name, type_name, serialized_value FROM background_task_params \
                 WHERE task_id = ?1 ORDER BY param_id",
                &[Value::Integer(task_id)],
            )
            .map_err(storage_err)?;

        rows.iter()
            .map(|row| {
                Ok(BackgroundTaskParameter {
                    name: col_str(row, "name")?.to_string(),
                    type_name: col_str(row, "type_name")?.to_string(),
                    serialized_value: col_str(row, "serialized_value")?.to_string(),
                    value: None,
                })
            })
            .collect()
    }

    fn add_task_log(
        &self,
        log: &BackgroundTaskLogRecord,
        xml_parameters: &str,
    ) -> Result<i64, ServiceError> {
        let rows = self
            .conn
            .query(
                "INSERT INTO background_task_logs (task_id, date, exception_stack_trace, \
                 inner_task_start, severity, text, text_ident, xml_parameters) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) RETURNING log_id",
                &[
                    Value::Integer(log.task_id),
                    Value::Text(format_date(&log.date)),
                    Value::from(log.exception_stack_trace.clone()),
                    Value::from(log.inner_task_start),
                    Value::Integer(log.severity.code()),
                    Value::from(log.text.as_str()),
                    Value::Integer(log.text_ident),
                    Value::from(xml_parameters),
                ],
            )
            .map_err(storage_err)?;

        rows.first()
            .and_then(|r| r.get_i64("log_id"))
            .ok_or_else(|| ServiceError::Storage("insert returned no log id".into()))
    }

    fn get_task_logs(
        &self,
        task_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<BackgroundTaskLogRecord>, ServiceError> {
        let rows = self
            .conn
            .query(
                "SELECT log_id, task_id, date, exception_stack_trace, inner_task_start, severity, \
                 text, text_ident, xml_parameters FROM background_task_logs \
                 WHERE task_id = ?1 AND date >= ?2 ORDER BY date, log_id",
                &[Value::Integer(task_id), Value::Text(format_date(&since))],
            )
            .map_err(storage_err)?;

        rows.iter().map(row_to_log).collect()
    }
}

impl<C: SQLConn + ?Sized> TaskWriter for TaskTables<'_, C> {
    fn add_task(&self, task: &BackgroundTask) -> Result<i64, ServiceError> {
        let rows = self
            .conn
            .query(
                "INSERT INTO background_tasks (guid, task_id, schedule_id, package_id, user_id, \
                 effective_user_id, task_name, item_id, item_name, start_date, finish_date, \
                 indicator_current, indicator_maximum, maximum_execution_time, source, severity, \
                 completed, notify_on_complete, status) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19) \
                 RETURNING id",
                &[
                    Value::Text(task.guid.to_string()),
                    Value::from(task.task_id.as_str()),
                    Value::Integer(task.schedule_id),
                    Value::Integer(task.package_id),
                    Value::Integer(task.user_id),
                    Value::Integer(task.effective_user_id),
                    Value::from(task.task_name.as_str()),
                    Value::Integer(task.item_id),
                    Value::from(task.item_name.as_str()),
                    Value::Text(format_date(&task.start_date)),
                    Value::from(task.finish_date.as_ref().map(format_date)),
                    Value::Integer(task.indicator_current),
                    Value::Integer(task.indicator_maximum),
                    Value::Integer(task.maximum_execution_time),
                    Value::from(task.source.as_str()),
                    Value::Integer(task.severity.code()),
                    Value::from(task.completed),
                    Value::from(task.notify_on_complete),
                    Value::Integer(task.status.code()),
                ],
            )
            .map_err(storage_err)?;

        rows.first()
            .and_then(|r| r.get_i64("id"))
            .ok_or_else(|| ServiceError::Storage("insert returned no task id".into()))
    }

    fn update_task(&self, task: &BackgroundTask) -> Result<(), ServiceError> {
        let affected = self
            .conn
            .exec(
                "UPDATE background_tasks SET guid = ?1, schedule_id = ?2, package_id = ?3, \
                 task_name = ?4, item_id = ?5, item_name = ?6, finish_date = ?7, \
                 indicator_current = ?8, indicator_maximum = ?9, maximum_execution_time = ?10, \
                 source = ?11, severity = ?12, completed = ?13, notify_on_complete = ?14, \
                 status = ?15 \
                 WHERE id = ?16",
                &[
                    Value::Text(task.guid.to_string()),
                    Value::Integer(task.schedule_id),
                    Value::Integer(task.package_id),
                    Value::from(task.task_name.as_str()),
                    Value::Integer(task.item_id),
                    Value::from(task.item_name.as_str()),
                    Value::from(task.finish_date.as_ref().map(format_date)),
                    Value::Integer(task.indicator_current),
                    Value::Integer(task.indicator_maximum),
                    Value::Integer(task.maximum_execution_time),
                    Value::from(task.source.as_str()),
                    Value::Integer(task.severity.code()),
                    Value::from(task.completed),
                    Value::from(task.notify_on_complete),
                    Value::Integer(task.status.code()),
                    Value::Integer(task.id),
                ],
            )
            .map_err(storage_err)?;

        if affected == 0 {
            return Err(ServiceError::NotFound(format!("background task {}", task.id)));
        }
        Ok(())
    }

    fn add_task_stack(&self, task_id: i64) -> Result<(), ServiceError> {
        self.conn
            .exec(
                "INSERT OR IGNORE INTO background_task_stack (task_id) VALUES (?1)",
                &[Value::Integer(task_id)],
            )
            .map_err(storage_err)?;
        Ok(())
    }

    fn delete_task_stack(&self, task_id: i64) -> Result<(), ServiceError> {
        let affected = self
            .conn
            .exec(
                "DELETE FROM background_task_stack WHERE task_id = ?1",
                &[Value::Integer(task_id)],
            )
            .map_err(storage_err)?;
        debug!("task stack {task_id}: {affected} rows deleted");
        Ok(())
    }

    fn add_task_param(
        &self,
        task_id: i64,
        name: &str,
        type_name: &str,
        serialized_value: &str,
    ) -> Result<(), ServiceError> {
        self.conn
            .exec(
                "INSERT INTO background_task_params (task_id, name, type_name, serialized_value) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT (task_id, name) DO UPDATE SET \
                 type_name = excluded.type_name, serialized_value = excluded.serialized_value",
                &[
                    Value::Integer(task_id),
                    Value::from(name),
                    Value::from(type_name),
                    Value::from(serialized_value),
                ],
            )
            .map_err(storage_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Fixed-width UTC form, so text order is time order.
fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_date(column: &str, raw: &str) -> Result<DateTime<Utc>, ServiceError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ServiceError::Storage(format!("bad {column} {raw:?}: {e}")))
}

fn storage_err(e: SQLError) -> ServiceError {
    ServiceError::Storage(e.to_string())
}

fn missing(column: &str) -> ServiceError {
    ServiceError::Storage(format!("missing {column} column"))
}

fn col_i64(row: &Row, column: &str) -> Result<i64, ServiceError> {
    row.get_i64(column).ok_or_else(|| missing(column))
}

fn col_bool(row: &Row, column: &str) -> Result<bool, ServiceError> {
    row.get_bool(column).ok_or_else(|| missing(column))
}

fn col_str<'r>(row: &'r Row, column: &str) -> Result<&'r str, ServiceError> {
    row.get_str(column).ok_or_else(|| missing(column))
}

fn col_date(row: &Row, column: &str) -> Result<DateTime<Utc>, ServiceError> {
    parse_date(column, col_str(row, column)?)
}

fn col_opt_date(row: &Row, column: &str) -> Result<Option<DateTime<Utc>>, ServiceError> {
    row.get_str(column)
        .map(|raw| parse_date(column, raw))
        .transpose()
}

fn col_severity(row: &Row) -> Result<Severity, ServiceError> {
    let code = col_i64(row, "severity")?;
    Severity::from_code(code)
        .ok_or_else(|| ServiceError::Storage(format!("unknown severity code {code}")))
}

fn row_to_task(row: &Row) -> Result<BackgroundTask, ServiceError> {
    let guid = col_str(row, "guid")?;
    let status = col_i64(row, "status")?;

    Ok(BackgroundTask {
        id: col_i64(row, "id")?,
        guid: Uuid::parse_str(guid)
            .map_err(|e| ServiceError::Storage(format!("bad guid {guid:?}: {e}")))?,
        task_id: col_str(row, "task_id")?.to_string(),
        schedule_id: col_i64(row, "schedule_id")?,
        package_id: col_i64(row, "package_id")?,
        user_id: col_i64(row, "user_id")?,
        effective_user_id: col_i64(row, "effective_user_id")?,
        task_name: col_str(row, "task_name")?.to_string(),
        item_id: col_i64(row, "item_id")?,
        item_name: col_str(row, "item_name")?.to_string(),
        source: col_str(row, "source")?.to_string(),
        indicator_current: col_i64(row, "indicator_current")?,
        indicator_maximum: col_i64(row, "indicator_maximum")?,
        start_date: col_date(row, "start_date")?,
        finish_date: col_opt_date(row, "finish_date")?,
        maximum_execution_time: col_i64(row, "maximum_execution_time")?,
        severity: col_severity(row)?,
        completed: col_bool(row, "completed")?,
        notify_on_complete: col_bool(row, "notify_on_complete")?,
        status: BackgroundTaskStatus::from_code(status)
            .ok_or_else(|| ServiceError::Storage(format!("unknown task status code {status}")))?,
        params: Vec::new(),
    })
}

fn row_to_log(row: &Row) -> Result<BackgroundTaskLogRecord, ServiceError> {
    Ok(BackgroundTaskLogRecord {
        log_id: col_i64(row, "log_id")?,
        task_id: col_i64(row, "task_id")?,
        date: col_date(row, "date")?,
        exception_stack_trace: row.get_str("exception_stack_trace").map(str::to_string),
        inner_task_start: col_bool(row, "inner_task_start")?,
        severity: col_severity(row)?,
        text: col_str(row, "text")?.to_string(),
        text_ident: col_i64(row, "text_ident")?,
        text_parameters: Vec::new(),
        xml_parameters: col_str(row, "xml_parameters")?.to_string(),
    })
}
