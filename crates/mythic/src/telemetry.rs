//! Tracing subscriber setup for the CLI.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose { "info,mythic=debug" } else { "info" }
}

/// Install a console subscriber.
///
/// `RUST_LOG` takes precedence over `verbose`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_console_telemetry(verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}
