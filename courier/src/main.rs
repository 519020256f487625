//! `edudash-courier`: inspect and manage messages that failed to send.
//!
//! Operates on the same file-backed store the courier library persists
//! failed messages to. Configuration via CLI flags, environment variables,
//! or config file (`~/.config/edudash-courier/config.toml`).
//!
//! ```bash
//! # List every failed message
//! cargo run --bin edudash-courier -- list
//!
//! # Only one thread
//! cargo run --bin edudash-courier -- list --thread 4f1c...
//!
//! # Give up on a message
//! cargo run --bin edudash-courier -- dismiss temp-0192...
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;

use courier::config::{CliArgs, Command, CourierConfig};
use courier::outbox::store::FailedMessageStore;
use courier::persist::file::FileKv;
use courier_proto::failed::{FailedMessageRecord, RetryState};
use courier_proto::message::{MessageId, ThreadId, Timestamp};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match CourierConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            CourierConfig::default()
        }
    };

    // Logs go to a file so stdout only carries command output.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    tracing::info!(data_dir = %config.data_dir.display(), "edudash-courier starting");

    let store = FailedMessageStore::with_key(FileKv::new(&config.data_dir), &config.storage_key);
    let records = store.load().await;

    let command = cli.command.unwrap_or(Command::List { thread: None });
    let code = match command {
        Command::List { thread } => {
            let shown: Vec<&FailedMessageRecord> = match thread {
                Some(ref t) => {
                    let thread_id = ThreadId::new(t.as_str());
                    records.iter().filter(|r| r.thread_id == thread_id).collect()
                }
                None => records.iter().collect(),
            };
            if shown.is_empty() {
                println!("No failed messages.");
            }
            for record in shown {
                println!("{}", format_record(record, config.max_auto_retries));
            }
            ExitCode::SUCCESS
        }
        Command::Dismiss { local_id } => {
            if store.remove(&MessageId::new(local_id.as_str())).await {
                println!("Dismissed {local_id}.");
                ExitCode::SUCCESS
            } else {
                eprintln!("No failed message with id {local_id}.");
                ExitCode::FAILURE
            }
        }
        Command::Clear => {
            store.clear().await;
            println!("Cleared {} failed message(s).", records.len());
            ExitCode::SUCCESS
        }
    };

    if store.is_degraded() {
        eprintln!("Warning: storage unavailable, changes were not saved.");
        return ExitCode::FAILURE;
    }

    tracing::info!("edudash-courier exiting");
    code
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("edudash-courier.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// One line per record: id, thread, failure time, retries, error.
fn format_record(record: &FailedMessageRecord, max_auto_retries: u32) -> String {
    let retries = match record.state(max_auto_retries) {
        RetryState::PendingRetry { count } => format!("{count}/{max_auto_retries}"),
        RetryState::Exhausted => format!("{}/{max_auto_retries} exhausted", record.retry_count),
    };
    format!(
        "{}  thread={}  failed={}  retries={}  error={}",
        record.local_id,
        record.thread_id,
        format_time(record.failed_at),
        retries,
        record.error
    )
}

fn format_time(ts: Timestamp) -> String {
    i64::try_from(ts.as_millis())
        .ok()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map_or_else(
            || ts.to_string(),
            |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        )
}
