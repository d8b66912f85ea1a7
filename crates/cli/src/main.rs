//! CLI entry point for Toonkor Collector
//!
//! Starts the collector, reads newline-delimited job submissions from stdin
//! and prints the progress events of every submitted title to stdout as JSON
//! lines. Logs go to stderr.

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use toonkor_collector::{BusEvent, Collector, Components, Config, Job, ServiceError};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Toonkor Collector - comic chapter downloader and translation queue
#[derive(Parser, Debug)]
#[command(name = "toonkor-collector")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Override storage.data_dir
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Skip startup checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Emit logs as JSON
    #[arg(long, default_value = "false")]
    log_json: bool,

    /// Add a title to the library before taking jobs (repeatable)
    #[arg(long = "add", value_name = "TITLE_ID")]
    add: Vec<String>,

    /// Remove a title from the library before taking jobs (repeatable)
    #[arg(long = "remove", value_name = "TITLE_ID")]
    remove: Vec<String>,

    /// Print the ids of titles with downloaded chapters and exit
    #[arg(long, default_value = "false")]
    list_stored: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn build_collector(args: &Args) -> Result<Collector, ServiceError> {
    let mut config = Config::load(&args.config)?;
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    let components = Components::from_config(&config)?;
    if args.skip_checks {
        warn!("skipping startup checks (--skip-checks enabled)");
        Ok(Collector::new_without_checks(config, components))
    } else {
        Collector::with_config(config, components)
    }
}

/// Print every event on a title topic until the bus goes away.
fn spawn_printer(collector: &Collector, title_id: &str) {
    let mut rx = collector.subscribe_title(title_id);
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => warn!(missed, "event printer lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn print_event(event: &BusEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => error!(error = %e, "failed to encode event"),
    }
}

async fn update_library(collector: &Collector, args: &Args) {
    for title_id in &args.add {
        if let Err(e) = collector.add_to_library(title_id).await {
            warn!(%title_id, error = %e, "failed to add title to library");
        }
    }
    for title_id in &args.remove {
        if let Err(e) = collector.remove_from_library(title_id).await {
            warn!(%title_id, error = %e, "failed to remove title from library");
        }
    }
}

/// Submit jobs read from stdin. Once stdin closes, wait for the queue to
/// drain and request shutdown.
async fn read_jobs(collector: Arc<Collector>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut watched = HashSet::new();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "failed to read stdin");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let job = match Job::from_submission(&line) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "ignoring invalid job line");
                continue;
            }
        };
        if watched.insert(job.title_id.clone()) {
            spawn_printer(&collector, &job.title_id);
        }
        if let Err(e) = collector.submit(job) {
            warn!(error = %e, "job rejected");
        }
    }
    collector.queue().wait_idle().await;
    collector.shutdown();
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!(config = %args.config.display(), "toonkor collector starting");

    let collector = match build_collector(&args) {
        Ok(collector) => Arc::new(collector),
        Err(e) => {
            error!(error = %e, "failed to initialize collector");
            return ExitCode::FAILURE;
        }
    };

    info!(
        page_workers = collector.concurrency_plan.page_fetch_workers,
        metrics_addr = %collector.config.metrics.addr,
        "collector initialized"
    );

    if args.list_stored {
        return match collector.stored_titles() {
            Ok(ids) => {
                for id in ids {
                    println!("{}", id);
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "failed to list stored titles");
                ExitCode::FAILURE
            }
        };
    }
    update_library(&collector, &args).await;

    let token = collector.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            token.cancel();
        }
    });
    tokio::spawn(read_jobs(collector.clone()));

    if let Err(e) = collector.run_with_server().await {
        error!(error = %e, "collector error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
