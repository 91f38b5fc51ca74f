use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// vidsync - scheduled video metadata ingestion
#[derive(Parser, Debug)]
#[command(name = "vidsync")]
#[command(version)]
#[command(about = "Job orchestration for scheduled video metadata ingestion", long_about = None)]
pub struct Cli {
    /// Path to the JSON config file (default: ~/.vidsync/config.json if present)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Override the database path from the config
    #[arg(long = "db", global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the executor: process the queue and the scheduler until Ctrl-C
    Run,

    /// Inspect and control jobs
    #[command(subcommand)]
    Jobs(JobsCommand),

    /// Inspect and control the recurring schedule
    #[command(subcommand)]
    Scheduler(SchedulerCommand),

    /// Inspect the error event log
    #[command(subcommand)]
    Events(EventsCommand),
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// List jobs, newest first
    List(ListArgs),

    /// Show one job with its full log
    Show { id: String },

    /// Per-status counts
    Counts,

    /// Submit a new job
    Create {
        /// full_sync, channel_scan or scheduler_incremental
        job_type: String,

        /// Channel to scan (channel_scan only)
        #[arg(long = "target")]
        target: Option<String>,

        #[arg(long = "incremental")]
        incremental: bool,
    },

    /// Stop a running job
    Pause { id: String },

    /// Cancel a pending or running job
    Cancel { id: String },

    /// Re-queue failed jobs
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Hide jobs from listings
    Delete {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Follow a job's progress and log live
    Tail {
        /// Job id; follows the active job when omitted
        id: Option<String>,
    },

    /// Print a job's log as JSON Lines
    Export { id: String },
}

#[derive(Args, Debug, Default)]
pub struct ListArgs {
    /// Substring match on id, type or target
    #[arg(long = "search")]
    pub search: Option<String>,

    #[arg(long = "status")]
    pub status: Option<String>,

    #[arg(long = "type")]
    pub job_type: Option<String>,

    /// RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long = "from")]
    pub from_date: Option<String>,

    /// RFC 3339 timestamp or YYYY-MM-DD
    #[arg(long = "to")]
    pub to_date: Option<String>,

    #[arg(long = "include-deleted")]
    pub include_deleted: bool,

    #[arg(long = "limit")]
    pub limit: Option<u64>,

    #[arg(long = "offset")]
    pub offset: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum SchedulerCommand {
    /// Show settings and whether a job is running
    Status,

    /// Activate the schedule
    Start,

    /// Deactivate the schedule
    Stop,

    /// Change interval or timezone
    Set {
        /// Hours between runs (1-24)
        #[arg(long = "interval")]
        interval_hours: Option<u32>,

        #[arg(long = "timezone")]
        timezone: Option<String>,
    },

    /// Queue a full sync right away
    RunNow,
}

#[derive(Subcommand, Debug)]
pub enum EventsCommand {
    /// Most recent events, newest first
    List {
        #[arg(long = "limit", default_value = "50")]
        limit: u64,
    },
}
