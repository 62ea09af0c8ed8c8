use tracing_subscriber::EnvFilter;

/// Structured logs go to stderr; stdout carries the protocol.
///
/// `--log-level` applies to this crate only so engine-adjacent crates stay
/// quiet. `RUST_LOG`, when set, replaces the whole filter.
pub fn init(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,sqlite_web={log_level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
