use tracing_subscriber::EnvFilter;

/// Install the process-wide subscriber. `RUST_LOG` overrides the `info` default.
///
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
