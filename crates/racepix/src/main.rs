//! racepix command line.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use walkdir::WalkDir;

use racepix::archive::{is_image_name, read_manifest};
use racepix::config::{load_config, LoggingConfig};
use racepix::derivatives::upload_batch;
use racepix::error::{RacepixError, Result};
use racepix::jobs::JobError;
use racepix::logging::init_logging;
use racepix::sanitize::validate_archive_file;
use racepix::{AppState, UploadOutcome};

#[derive(Parser)]
#[command(name = "racepix", version, about = "Bulk event-photo uploads")]
struct Cli {
    /// Path to the JSON config file.
    #[arg(short, long, env = "RACEPIX_CONFIG", default_value = "racepix.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upload a ZIP archive of event photos and hand it to the worker.
    Upload {
        archive: PathBuf,
        #[arg(long)]
        event: String,
        #[arg(long)]
        user: String,
    },
    /// Print a job as JSON.
    Status { job_id: String },
    /// List the most recent jobs of an event.
    List {
        #[arg(long)]
        event: String,
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Cancel a pending or uploading job and delete its archive.
    Cancel { job_id: String },
    /// Re-queue a failed job whose archive is still stored.
    Retry { job_id: String },
    /// Print a job every time it changes until it reaches a terminal status.
    Watch {
        job_id: String,
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
    /// Validate an archive locally and list the photos it contains.
    Inspect { archive: PathBuf },
    /// Upload every photo of a directory as original, watermarked copy and thumbnail.
    Photos {
        directory: PathBuf,
        #[arg(long)]
        event: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Inspect needs neither config nor database.
    let command = match cli.command {
        Command::Inspect { archive } => {
            init_logging(&LoggingConfig::default())?;
            return inspect(&archive);
        }
        command => command,
    };

    let config = load_config(&cli.config)?;
    init_logging(&config.logging)?;
    let state = AppState::from_config(config).await?;

    match command {
        Command::Upload {
            archive,
            event,
            user,
        } => upload(&state, &archive, &event, &user).await,
        Command::Status { job_id } => {
            let job = state
                .orchestrator
                .job_status(&job_id)?
                .ok_or(JobError::NotFound(job_id))?;
            print_json(&job)
        }
        Command::List { event, limit } => print_json(&state.jobs().list_for_event(&event, limit)?),
        Command::Cancel { job_id } => {
            let cancelled = state.orchestrator.cancel_job(&job_id).await?;
            println!("{}", if cancelled { "cancelled" } else { "already finished" });
            Ok(())
        }
        Command::Retry { job_id } => {
            let retried = state.orchestrator.retry_job(&job_id).await?;
            println!("{}", if retried { "re-queued" } else { "not retryable" });
            Ok(())
        }
        Command::Watch {
            job_id,
            interval_ms,
        } => watch(&state, &job_id, Duration::from_millis(interval_ms)).await,
        Command::Photos { directory, event } => photos(&state, &directory, &event).await,
        Command::Inspect { archive } => inspect(&archive),
    }
}

async fn upload(state: &AppState, archive: &Path, event: &str, user: &str) -> Result<()> {
    let upload = state.orchestrator.upload_archive(archive, event, user)?;
    eprintln!("job {} created", upload.job_id());

    let mut progress = upload.progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow();
            eprintln!("{:>3}% ({}/{} bytes)", p.percentage, p.bytes_uploaded, p.bytes_total);
        }
    });

    let outcome = upload.wait().await;
    reporter.abort();

    match outcome {
        UploadOutcome::Uploaded { job, trigger } => {
            if let Some(trigger) = trigger {
                eprintln!("worker: {:?}", trigger);
            }
            print_json(&job)
        }
        UploadOutcome::Cancelled { job_id } => {
            println!("job {} cancelled", job_id);
            Ok(())
        }
        UploadOutcome::Failed { job_id, error } => Err(RacepixError::UploadFailed { job_id, error }),
    }
}

async fn watch(state: &AppState, job_id: &str, interval: Duration) -> Result<()> {
    // Other processes update the job, so poll the database rather than the
    // in-process feed.
    let mut last = None;
    loop {
        let job = state
            .jobs()
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        if last.as_ref() != Some(&job) {
            print_json(&job)?;
        }
        if job.status.is_terminal() {
            return Ok(());
        }
        last = Some(job);
        tokio::time::sleep(interval).await;
    }
}

fn inspect(archive: &Path) -> Result<()> {
    let file = validate_archive_file(archive, &Default::default())?;
    let names = read_manifest(&file.path)?;
    eprintln!("{}: {} bytes, {} photos", file.name, file.size_bytes, names.len());
    print_json(&names)
}

async fn photos(state: &AppState, directory: &Path, event: &str) -> Result<()> {
    let mut files: Vec<PathBuf> = WalkDir::new(directory)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| is_image_name(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();

    let result = upload_batch(
        &state.uploader,
        event,
        &files,
        state.config.derivatives.refresh_interval(),
        |p| eprintln!("[{}/{}] {}", p.current, p.total, p.file_name),
    )
    .await;
    print_json(&result)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
