// Logging setup shared by binaries and demos
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Installs a global fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns an error when a global subscriber is already set, which callers
/// such as tests may ignore.
pub fn init_logging() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .try_init()?;

    tracing::info!(target: "telemetry", "Logging initialized");
    Ok(())
}
