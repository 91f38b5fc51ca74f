//! Scraping unit backed by an external process.
//!
//! The process receives the job in its environment and reports on stdout,
//! one JSON object per line:
//!
//! ```text
//! {"progress": {"videosAdded": 3}, "log": {"level": "info", "message": "..."}}
//! ```
//!
//! Lines that are not JSON objects are logged verbatim at `info`.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::scraper::{JobReporter, ScrapeError, ScrapeUnit};
use crate::config::ScraperConfig;
use crate::jobs::{Job, LogEntry, LogLevel, ProgressUpdate};

/// How many trailing stderr lines are kept for the failure message.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLog {
    #[serde(default = "default_level")]
    level: LogLevel,
    message: String,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    channel_name: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

fn default_level() -> LogLevel {
    LogLevel::Info
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMessage {
    #[serde(default)]
    progress: Option<ProgressUpdate>,
    #[serde(default)]
    log: Option<WireLog>,
}

impl From<WireLog> for LogEntry {
    fn from(wire: WireLog) -> Self {
        let mut entry = LogEntry::new(wire.level, wire.message);
        entry.channel_id = wire.channel_id;
        entry.channel_name = wire.channel_name;
        entry.data = wire.data;
        entry
    }
}

fn handle_line(line: &str, reporter: &JobReporter) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<WireMessage>(line) {
        Ok(msg) => reporter.report(msg.progress.unwrap_or_default(), msg.log.map(LogEntry::from)),
        Err(_) => reporter.log(LogLevel::Info, line),
    }
}

pub struct CommandScraper {
    config: ScraperConfig,
    cancel_check_interval: Duration,
}

impl CommandScraper {
    pub fn new(config: ScraperConfig) -> Self {
        Self {
            config,
            cancel_check_interval: Duration::from_secs(1),
        }
    }

    pub fn with_cancel_check_interval(mut self, interval: Duration) -> Self {
        self.cancel_check_interval = interval;
        self
    }

    fn command_for(&self, job: &Job) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .env("VIDSYNC_JOB_ID", &job.id)
            .env("VIDSYNC_JOB_TYPE", job.job_type.as_str())
            .env("VIDSYNC_TARGET_ID", job.target_id.as_deref().unwrap_or(""))
            .env("VIDSYNC_INCREMENTAL", if job.incremental { "1" } else { "0" })
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

#[async_trait]
impl ScrapeUnit for CommandScraper {
    async fn run(&self, job: &Job, reporter: &JobReporter) -> Result<(), ScrapeError> {
        let mut child = self
            .command_for(job)
            .spawn()
            .map_err(|e| ScrapeError::Spawn {
                command: self.config.command.clone(),
                source: e,
            })?;
        log::debug!(
            "Spawned scraper '{}' for job {} (pid {:?})",
            self.config.command,
            job.id,
            child.id()
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ScrapeError::Failed("scraper stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ScrapeError::Failed("scraper stderr was not captured".to_string()))?;

        let stderr_task = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut cancel_check = tokio::time::interval(self.cancel_check_interval);
        loop {
            tokio::select! {
                line = lines.next_line() => match line? {
                    Some(line) => handle_line(&line, reporter),
                    None => break,
                },
                _ = cancel_check.tick() => {
                    if reporter.is_cancelled() {
                        log::info!("Job {} cancelled, stopping scraper", job.id);
                        if let Err(e) = child.kill().await {
                            log::warn!("Failed to kill scraper for job {}: {}", job.id, e);
                        }
                        stderr_task.abort();
                        return Err(ScrapeError::Cancelled);
                    }
                }
            }
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();
        if status.success() {
            Ok(())
        } else if stderr_tail.is_empty() {
            Err(ScrapeError::Failed(format!("scraper exited with {}", status)))
        } else {
            Err(ScrapeError::Failed(format!(
                "scraper exited with {}: {}",
                status, stderr_tail
            )))
        }
    }
}
