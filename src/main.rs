//! line-relay: a line-oriented TCP chat relay
//!
//! Clients connect over TCP and send newline-terminated lines. Every
//! complete line is relayed to all other connected clients, prefixed with
//! the sender's client number. Arrivals and departures are announced the
//! same way.
//!
//! Features:
//! - Single-threaded readiness loop (epoll/kqueue via mio)
//! - Byte-exact line framing across arbitrary read boundaries
//! - Configuration via CLI arguments or TOML file

mod config;
mod protocol;
mod runtime;

use config::Config;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Fatal error: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        max_connections = config.max_connections,
        "Starting line-relay"
    );

    match runtime::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
