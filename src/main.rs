//! fortune-server: a fortune-telling cow over TCP
//!
//! Every connection gets one fortune:
//! - run the quote program (`fortune` by default)
//! - pipe its output through the render program (`cowsay` by default)
//! - write the rendered text to the client and close the connection
//!
//! There is no request to parse. Clients connect and read until EOF.
//!
//! Features:
//! - One task per connection, no shared mutable state
//! - Optional cap on concurrently handled connections
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod pipeline;
mod server;

use config::Config;
use server::Server;
use tracing::{error, info};
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
        host = %config.host,
        port = config.port,
        quote = %config.quote,
        render = %config.render,
        max_connections = ?config.max_connections,
        "Starting fortune-server"
    );

    let runtime = build_runtime(config.workers)?;
    runtime.block_on(serve(config))?;
    Ok(())
}

/// Build the multi-threaded tokio runtime.
fn build_runtime(workers: Option<usize>) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = workers {
        builder.worker_threads(workers.max(1));
    }
    builder.enable_all().build()
}

/// Bind the listener and run the accept loop.
async fn serve(config: Config) -> Result<(), server::ServerError> {
    let server = Server::bind(&config).inspect_err(|e| error!(error = %e, "Startup failed"))?;
    server.run().await
}
