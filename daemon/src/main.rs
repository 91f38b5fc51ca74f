mod cli;
mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;
use tokio::sync::watch;
use vidsync::config::LoggingConfig;
use vidsync::{App, AppConfig, StreamEvent, StreamTarget, VidsyncError};

use cli::{Cli, Command, JobsCommand};
use commands::ApiResponse;

/// Config file used when `--config` is not given, if it exists.
fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".vidsync").join("config.json"))
}

fn load_config(cli: &Cli) -> Result<AppConfig, VidsyncError> {
    let mut config = match cli.config {
        Some(ref path) => vidsync::load_config(path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => {
                info!("Using config file {}", path.display());
                vidsync::load_config(&path)?
            }
            _ => AppConfig::default(),
        },
    };
    if let Some(ref db) = cli.database {
        config.database.path = Some(db.clone());
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    match rendered {
        Ok(s) => println!("{}", s),
        Err(e) => eprintln!("Failed to render output: {}", e),
    }
}

fn report(response: ApiResponse<serde_json::Value>) -> ExitCode {
    let success = response.success;
    print_json(&response, true);
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Flips to true on the first Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = tx.send(true);
    }) {
        warn!("Failed to install Ctrl-C handler: {}", e);
    }
    rx
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    // An error means the handler (and its sender) is gone: wait forever.
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn run_daemon(config: AppConfig) -> Result<(), VidsyncError> {
    if config.scraper.is_none() {
        warn!("No scraper configured: this process will not execute jobs");
    }
    let app = App::open(config)?;
    let tasks = app.start_background()?;
    info!("vidsync v{} running", env!("CARGO_PKG_VERSION"));

    let mut shutdown = shutdown_signal();
    wait_for_shutdown(&mut shutdown).await;

    info!("Shutting down");
    if let Ok(Some(job)) = app.store.get_running() {
        warn!(
            "Job {} is still running and will be marked interrupted on next start",
            job.id
        );
    }
    tasks.shutdown();
    Ok(())
}

/// Prints one JSON object per event until the stream ends or Ctrl-C.
async fn tail(app: &App, id: Option<String>) -> ExitCode {
    let target = match id {
        Some(id) => StreamTarget::Job(id),
        None => StreamTarget::Active,
    };
    let mut stream = app.stream(target);
    let mut shutdown = shutdown_signal();

    loop {
        tokio::select! {
            event = stream.next_event() => match event {
                Some(event) => {
                    let ended = matches!(event, StreamEvent::End { .. });
                    print_json(&event, false);
                    if ended {
                        return ExitCode::SUCCESS;
                    }
                }
                None => return ExitCode::SUCCESS,
            },
            _ = wait_for_shutdown(&mut shutdown) => return ExitCode::SUCCESS,
        }
    }
}

fn export(app: &App, id: &str) -> ExitCode {
    match app.store.export_logs(id) {
        Ok(Some(lines)) => {
            print!("{}", lines);
            ExitCode::SUCCESS
        }
        Ok(None) => report(ApiResponse::err(format!("Job {} not found", id))),
        Err(e) => report(ApiResponse::err(format!("Database error: {}", e))),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; fall back to defaults to report this.
            let _ = vidsync::telemetry::init_logging(&LoggingConfig::default());
            error!("{}", e);
            return report(ApiResponse::err(e.to_string()));
        }
    };
    if let Err(e) = vidsync::telemetry::init_logging(&config.logging) {
        eprintln!("{}", e);
    }

    if let Command::Run = cli.command {
        return match run_daemon(config).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let app = match App::open_client(config) {
        Ok(app) => app,
        Err(e) => return report(ApiResponse::err(e.to_string())),
    };

    match cli.command {
        Command::Run => ExitCode::SUCCESS,
        Command::Jobs(JobsCommand::Tail { id }) => tail(&app, id).await,
        Command::Jobs(JobsCommand::Export { id }) => export(&app, &id),
        Command::Jobs(command) => report(commands::jobs(&app, command)),
        Command::Scheduler(command) => report(commands::scheduler(&app, command)),
        Command::Events(command) => report(commands::events(&app, command)),
    }
}
