//! One-shot CLI commands. Each returns an [`ApiResponse`] that `main`
//! prints as JSON.

use serde::Serialize;
use serde_json::Value;
use vidsync::jobs::{BulkOutcome, JobQueryParams};
use vidsync::scheduler::SettingsUpdate;
use vidsync::{App, ControlOutcome, VidsyncError};

use crate::cli::{EventsCommand, JobsCommand, ListArgs, SchedulerCommand};

/// Response wrapper for every command.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl ApiResponse<Value> {
    fn from_result<T: Serialize>(result: Result<T, VidsyncError>) -> Self {
        match result {
            Ok(data) => match serde_json::to_value(data) {
                Ok(value) => Self::ok(value),
                Err(e) => Self::err(format!("Failed to serialize response: {}", e)),
            },
            Err(e) => Self::err(e.to_string()),
        }
    }

    fn from_control(id: &str, action: &str, outcome: ControlOutcome) -> Self {
        match outcome {
            ControlOutcome::Applied(job) => Self::from_result(Ok(job)),
            ControlOutcome::Ineligible { status, deleted } if deleted => Self::err(format!(
                "Cannot {} job {}: it is deleted ({})",
                action, id, status
            )),
            ControlOutcome::Ineligible { status, .. } => {
                Self::err(format!("Cannot {} job {} in status {}", action, id, status))
            }
            ControlOutcome::NotFound => Self::err(format!("Job {} not found", id)),
        }
    }
}

/// A single id reports the job or why it was refused; several ids report
/// counts.
fn control_many<S, M>(ids: &[String], action: &str, single: S, many: M) -> ApiResponse<Value>
where
    S: FnOnce(&str) -> Result<ControlOutcome, VidsyncError>,
    M: FnOnce(&[String]) -> Result<BulkOutcome, VidsyncError>,
{
    match ids {
        [id] => match single(id) {
            Ok(outcome) => ApiResponse::from_control(id, action, outcome),
            Err(e) => ApiResponse::err(e.to_string()),
        },
        _ => ApiResponse::from_result(many(ids)),
    }
}

pub fn jobs(app: &App, command: JobsCommand) -> ApiResponse<Value> {
    match command {
        JobsCommand::List(args) => ApiResponse::from_result(app.store.list(&query_params(args))),
        JobsCommand::Show { id } => match app.store.get_detail(&id) {
            Ok(Some(detail)) => ApiResponse::from_result(Ok(detail)),
            Ok(None) => ApiResponse::err(format!("Job {} not found", id)),
            Err(e) => ApiResponse::err(format!("Database error: {}", e)),
        },
        JobsCommand::Counts => ApiResponse::from_result(app.store.counts().map_err(Into::into)),
        JobsCommand::Create {
            job_type,
            target,
            incremental,
        } => ApiResponse::from_result(app.queue.create_job(
            &job_type,
            target.as_deref(),
            incremental,
        )),
        JobsCommand::Pause { id } => match app.queue.pause(&id) {
            Ok(outcome) => ApiResponse::from_control(&id, "pause", outcome),
            Err(e) => ApiResponse::err(e.to_string()),
        },
        JobsCommand::Cancel { id } => match app.queue.cancel(&id) {
            Ok(outcome) => ApiResponse::from_control(&id, "cancel", outcome),
            Err(e) => ApiResponse::err(e.to_string()),
        },
        JobsCommand::Retry { ids } => control_many(
            &ids,
            "retry",
            |id| app.queue.retry(id),
            |ids| app.queue.bulk_retry(ids),
        ),
        JobsCommand::Delete { ids } => control_many(
            &ids,
            "delete",
            |id| app.queue.delete(id),
            |ids| app.queue.bulk_delete(ids),
        ),
        // Streaming commands are handled by main.
        JobsCommand::Tail { .. } | JobsCommand::Export { .. } => {
            ApiResponse::err("not a one-shot command")
        }
    }
}

fn query_params(args: ListArgs) -> JobQueryParams {
    JobQueryParams {
        search: args.search,
        status: args.status,
        job_type: args.job_type,
        from_date: args.from_date,
        to_date: args.to_date,
        include_deleted: args.include_deleted,
        limit: args.limit,
        offset: args.offset,
    }
}

pub fn scheduler(app: &App, command: SchedulerCommand) -> ApiResponse<Value> {
    let scheduler = &app.scheduler;
    match command {
        SchedulerCommand::Status => ApiResponse::from_result(scheduler.status()),
        SchedulerCommand::Start => ApiResponse::from_result(toggled(app, scheduler.start())),
        SchedulerCommand::Stop => ApiResponse::from_result(toggled(app, scheduler.stop())),
        SchedulerCommand::Set {
            interval_hours,
            timezone,
        } => {
            let update = SettingsUpdate {
                interval_hours,
                timezone,
            };
            ApiResponse::from_result(scheduler.update_settings(&update))
        }
        SchedulerCommand::RunNow => ApiResponse::from_result(scheduler.run_now()),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Toggled {
    /// False when the schedule was already in the requested state.
    changed: bool,
    settings: vidsync::SchedulerSettings,
}

fn toggled(app: &App, result: Result<bool, VidsyncError>) -> Result<Toggled, VidsyncError> {
    Ok(Toggled {
        changed: result?,
        settings: app.scheduler.settings()?,
    })
}

pub fn events(app: &App, command: EventsCommand) -> ApiResponse<Value> {
    match command {
        EventsCommand::List { limit } => {
            ApiResponse::from_result(app.events.recent(limit).map_err(Into::into))
        }
    }
}
