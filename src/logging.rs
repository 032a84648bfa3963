//! Tracing setup for the relay binaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{RelayError, Result};

/// Map a verbosity count to a level name (0=warn, 1=info, 2=debug, 3+=trace).
pub fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `verbosity`.
pub fn init_logging(verbosity: u8) -> Result<()> {
    let level = level_for(verbosity);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "file_relay={},relay_server={},relay_client={}",
            level, level, level
        ))
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 2)
                .with_line_number(verbosity >= 2)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| RelayError::Config(format!("failed to initialize logging: {}", err)))
}
