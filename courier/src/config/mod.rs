//! Configuration for the courier components and the maintenance CLI.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/edudash-courier/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use courier_proto::failed::MAX_AUTO_RETRIES;

use crate::outbox::retry::RetryConfig;
use crate::outbox::store::FAILED_MESSAGES_KEY;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    outbox: OutboxFileConfig,
    realtime: RealtimeFileConfig,
}

/// `[outbox]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OutboxFileConfig {
    data_dir: Option<PathBuf>,
    storage_key: Option<String>,
    max_auto_retries: Option<u32>,
    send_timeout_secs: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[realtime]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RealtimeFileConfig {
    attention_buffer: Option<usize>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    // -- Outbox --
    /// Directory holding the file-backed key-value store.
    pub data_dir: PathBuf,
    /// Key the failed-message array is stored under.
    pub storage_key: String,
    /// Retry count at which automatic retries stop.
    pub max_auto_retries: u32,
    /// Timeout of a single send attempt.
    pub send_timeout: Duration,
    /// Buffer size of the retry event channel.
    pub event_buffer: usize,

    // -- Realtime --
    /// Buffer size of the attention cue channel.
    pub attention_buffer: usize,
    /// Payload buffer of each realtime subscription.
    pub channel_capacity: usize,
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_key: FAILED_MESSAGES_KEY.to_string(),
            max_auto_retries: MAX_AUTO_RETRIES,
            send_timeout: Duration::from_secs(15),
            event_buffer: 64,
            attention_buffer: 32,
            channel_capacity: 256,
        }
    }
}

impl CourierConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `CourierConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.outbox.data_dir.clone())
                .unwrap_or(defaults.data_dir),
            storage_key: file
                .outbox
                .storage_key
                .clone()
                .unwrap_or(defaults.storage_key),
            max_auto_retries: file
                .outbox
                .max_auto_retries
                .unwrap_or(defaults.max_auto_retries),
            send_timeout: file
                .outbox
                .send_timeout_secs
                .map_or(defaults.send_timeout, Duration::from_secs),
            event_buffer: file.outbox.event_buffer.unwrap_or(defaults.event_buffer),
            attention_buffer: file
                .realtime
                .attention_buffer
                .unwrap_or(defaults.attention_buffer),
            channel_capacity: file
                .realtime
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
        }
    }

    /// Retry settings for the [`RetryCoordinator`](crate::outbox::retry::RetryCoordinator).
    #[must_use]
    pub const fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_auto_retries: self.max_auto_retries,
            send_timeout: self.send_timeout,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Inspect and manage undelivered EduDash messages")]
pub struct CliArgs {
    /// Directory holding the courier's persisted data.
    #[arg(long, env = "EDUDASH_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Path to config file (default: `~/.config/edudash-courier/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "COURIER_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/edudash-courier.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do (default: `list`).
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Maintenance commands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show failed messages.
    List {
        /// Only show messages addressed to this thread.
        #[arg(long)]
        thread: Option<String>,
    },
    /// Delete one failed message without sending it.
    Dismiss {
        /// Local id of the failed message.
        local_id: String,
    },
    /// Delete every failed message.
    Clear,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Per-user data directory, falling back to the temp dir.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("edudash-courier")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("edudash-courier").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
