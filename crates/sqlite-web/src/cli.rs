use std::{path::PathBuf, time::Duration};

use clap::Parser;

use crate::core::connection::OpenOptions;

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlite-web", about = "SQLite admin backend speaking NDJSON over stdio")]
pub struct Args {
    /// SQLite database file. Must already exist.
    #[arg(long)]
    pub db: PathBuf,

    /// Open the database read-only.
    #[arg(long)]
    pub readonly: bool,

    /// Logging level (stderr). Also supports RUST_LOG.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Upper bound on the page size a caller may request.
    #[arg(long, default_value_t = 1000)]
    pub max_rows: usize,

    /// Deadline for a single request; long scans are abandoned past it.
    #[arg(long, default_value_t = 30_000)]
    pub timeout_ms: u64,

    /// How long SQLite waits on a locked database before giving up.
    #[arg(long, default_value_t = 2_000)]
    pub busy_timeout_ms: u64,
}

impl Args {
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            readonly: self.readonly,
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
