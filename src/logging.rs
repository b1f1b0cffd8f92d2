use tracing_subscriber::EnvFilter;

/// Initializes a `tracing` subscriber for the demo binary. Defaults to `info`
/// when `RUST_LOG` isn't set.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
