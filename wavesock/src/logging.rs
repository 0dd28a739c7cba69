//! Logging setup
//!
//! Installs a `tracing` subscriber reading the filter from `RUST_LOG`,
//! defaulting to `info`. Library code only emits events; calling this is
//! up to the application.

/// Initialize the global tracing subscriber
#[cfg(feature = "logging")]
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;
    Ok(())
}
