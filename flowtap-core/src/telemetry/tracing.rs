use tracing_subscriber::EnvFilter;

/// Initialize process-wide structured logging.
///
/// `log_level` seeds the filter unless `RUST_LOG` is set in the environment,
/// matching the precedence the rest of this corpus uses.
pub fn init_tracing(log_level: &str, show_target: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(show_target)
        .init();
}
