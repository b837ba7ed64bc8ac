/// Installs a global `tracing` subscriber printing engine events to stderr.
///
/// Verbosity follows `RUST_LOG`, falling back to `crossbind=info`. Fails if
/// another global subscriber is already installed.
#[cfg(feature = "logging")]
pub fn init_logging() -> Result<(), crate::EngineError> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("crossbind=info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| crate::EngineError::Logging(anyhow::anyhow!(e)))
}

/// Builds the worker thread name for the given index.
pub(crate) fn thread_name(prefix: &str, index: usize) -> String {
    format!("{prefix}-{index}")
}
