//! echo-relay: a readiness-driven TCP echo server
//!
//! Every accepted connection is one relay session: bytes read from the
//! socket are written back to it in order, as fast as the peer accepts them.
//!
//! Features:
//! - Non-blocking, event-driven relay core (no busy-waiting)
//! - Ordered overflow buffering under outbound backpressure
//! - Optional overflow cap that turns into TCP backpressure upstream
//! - Exactly-once session termination
//! - Configuration via CLI arguments or TOML file

mod config;
mod relay;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        chunk_size = config.chunk_size,
        max_overflow = ?config.max_overflow,
        "Starting echo-relay server"
    );

    runtime::run(config)?;
    Ok(())
}
