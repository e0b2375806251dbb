use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Builds the log filter: `RUST_LOG` when set and valid, otherwise the
/// configured level for Perch crates and `warn` for everything else.
pub fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &logging.level;
        EnvFilter::new(format!(
            "warn,perch={level},perch_core={level},perch_xmpp={level},perch_storage={level},perch_presence={level}"
        ))
    })
}

/// Installs the global fmt subscriber. Fails if one is already installed.
pub fn init(logging: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter(logging))
        .with(fmt_layer)
        .try_init()?;

    tracing::debug!(level = %logging.level, "tracing initialized");
    Ok(())
}
