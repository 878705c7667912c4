//! Task inspection commands.
//!
//! `panelctl tasks`, `panelctl task <key>`, `panelctl logs <id>`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use panel_core::Caller;
use panel_task::{BackgroundTask, BackgroundTaskLogRecord, BackgroundTaskStatus, TaskService};

/// Filters for `panelctl tasks`. All given filters must match.
#[derive(Debug, Default)]
pub struct TaskFilter {
    pub schedule: Option<i64>,
    pub group: Option<Uuid>,
    pub status: Option<BackgroundTaskStatus>,
}

impl TaskFilter {
    fn matches(&self, task: &BackgroundTask) -> bool {
        self.schedule.map_or(true, |s| task.schedule_id == s)
            && self.group.map_or(true, |g| task.guid == g)
            && self.status.map_or(true, |s| task.status == s)
    }
}

pub fn parse_status(s: &str) -> Result<BackgroundTaskStatus> {
    BackgroundTaskStatus::parse(s)
        .ok_or_else(|| anyhow::anyhow!("Unknown task status: {} (expected run, abort or stopping)", s))
}

pub fn parse_since(since: Option<&str>) -> Result<DateTime<Utc>> {
    match since {
        Some(raw) => Ok(DateTime::parse_from_rfc3339(raw)
            .map_err(|e| anyhow::anyhow!("Invalid --since {:?}: {}", raw, e))?
            .with_timezone(&Utc)),
        None => Ok(DateTime::<Utc>::UNIX_EPOCH),
    }
}

/// List tasks visible to the caller.
pub fn list(service: &TaskService, caller: &Caller, filter: &TaskFilter, output_json: bool) -> Result<()> {
    // Narrowest store query first, remaining filters in memory.
    let mut tasks = if let Some(schedule) = filter.schedule {
        service.get_schedule_tasks(caller, schedule)?
    } else if let Some(group) = filter.group {
        service.get_group_tasks(caller, group)?
    } else if let Some(status) = filter.status {
        service.get_process_tasks(caller, status)?
    } else {
        service.get_tasks(caller)?
    };
    tasks.retain(|t| filter.matches(t));

    if output_json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!("{}", task_header());
    for task in &tasks {
        println!("{}", task_row(task));
    }
    Ok(())
}

/// Show one task with its decoded parameters.
pub fn show(service: &TaskService, caller: &Caller, task_id: &str, output_json: bool) -> Result<()> {
    let task = service.get_task(caller, task_id)?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&task)?);
        return Ok(());
    }

    println!("{}", task_header());
    println!("{}", task_row(&task));
    println!("stack record: {}", if service.has_task_stack(task.id)? { "present" } else { "absent" });
    if !task.params.is_empty() {
        println!();
        println!("{:<24} {:<12} VALUE", "PARAMETER", "TYPE");
        for p in &task.params {
            let value = p
                .value
                .as_ref()
                .map(|v| format!("{:?}", v))
                .unwrap_or_else(|| p.serialized_value.clone());
            println!("{:<24} {:<12} {}", p.name, p.type_name, value);
        }
    }
    Ok(())
}

/// Print the log lines of a task.
pub fn logs(service: &TaskService, task_id: i64, since: Option<&str>, output_json: bool) -> Result<()> {
    let since = parse_since(since)?;
    let logs = service.get_logs(task_id, since)?;

    if output_json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
        return Ok(());
    }

    for log in &logs {
        println!("{}", log_line(log));
        if let Some(trace) = &log.exception_stack_trace {
            println!("{}", trace);
        }
    }
    Ok(())
}

fn task_header() -> String {
    format!(
        "{:<6} {:<20} {:<24} {:<9} {:>11} {}",
        "ID", "TASK", "NAME", "STATUS", "PROGRESS", "ITEM"
    )
}

fn task_row(task: &BackgroundTask) -> String {
    let status = if task.completed {
        "DONE".to_string()
    } else {
        task.status.to_string()
    };
    format!(
        "{:<6} {:<20} {:<24} {:<9} {:>11} {}",
        task.id,
        task.task_id,
        task.task_name,
        status,
        format!("{}/{}", task.indicator_current, task.indicator_maximum),
        task.item_name
    )
}

/// `{0}`-style placeholders in the text are filled from the text parameters.
fn log_line(log: &BackgroundTaskLogRecord) -> String {
    let mut text = log.text.clone();
    for (i, value) in log.text_parameters.iter().enumerate() {
        text = text.replace(&format!("{{{}}}", i), value);
    }
    let indent = "  ".repeat(log.text_ident.max(0) as usize);
    format!(
        "{} {:<7} {}{}",
        log.date.format("%Y-%m-%d %H:%M:%S"),
        log.severity.as_str().to_uppercase(),
        indent,
        text
    )
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use panel_task::Severity;

    use super::*;

    #[test]
    fn parse_status_accepts_any_case() {
        assert_eq!(parse_status("run").unwrap(), BackgroundTaskStatus::Run);
        assert_eq!(parse_status("STOPPING").unwrap(), BackgroundTaskStatus::Stopping);
        assert!(parse_status("paused").is_err());
    }

    #[test]
    fn parse_since_defaults_to_epoch() {
        assert_eq!(parse_since(None).unwrap(), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(
            parse_since(Some("2026-01-01T02:00:00+02:00")).unwrap(),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_since(Some("yesterday")).is_err());
    }

    #[test]
    fn filter_requires_all_given_fields() {
        let group = Uuid::new_v4();
        let task = BackgroundTask {
            guid: group,
            schedule_id: 4,
            status: BackgroundTaskStatus::Abort,
            ..Default::default()
        };
        assert!(TaskFilter::default().matches(&task));
        assert!(TaskFilter { schedule: Some(4), group: Some(group), status: None }.matches(&task));
        assert!(!TaskFilter {
            status: Some(BackgroundTaskStatus::Run),
            ..Default::default()
        }
        .matches(&task));
    }

    #[test]
    fn log_line_fills_placeholders() {
        let mut log = BackgroundTaskLogRecord::new(1, Severity::Warning, "Copying {0} to {1}")
            .with_parameters(["wwwroot", "backup.bak"]);
        log.date = Utc.with_ymd_and_hms(2026, 1, 1, 9, 30, 0).unwrap();
        log.text_ident = 1;
        assert_eq!(
            log_line(&log),
            "2026-01-01 09:30:00 WARNING   Copying wwwroot to backup.bak"
        );
    }
}
