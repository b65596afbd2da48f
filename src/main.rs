//! shared-mailbox-api: HTTP API for Exchange Online shared mailboxes
//!
//! Each API call is turned into a generated automation script that runs in a
//! fresh interpreter subprocess holding one authenticated Exchange Online
//! session. The script reports a single JSON result object on its last stdout
//! line, which is shaped into the HTTP response.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI overrides, and serving
//! - [`config`]: Environment-driven credentials and execution settings
//! - [`errors`]: Application error model with HTTP status mapping
//! - [`models`]: Request bodies and the execution result envelope
//! - [`script`]: Typed statement plans rendered with safe literal quoting
//! - [`session`]: Connect/teardown wrapper and credential file lifecycle
//! - [`runner`]: Bounded, time-limited interpreter subprocesses
//! - [`extract`]: Result-line extraction from raw process output
//! - [`executor`]: Session + runner + extractor behind one seam
//! - [`server`]: HTTP routes, authentication, validation, and response shaping

mod config;
mod errors;
mod executor;
mod extract;
mod models;
mod runner;
mod script;
mod server;
mod session;

use std::net::IpAddr;

use clap::Parser;
use config::ServerConfig;
use tracing_subscriber::EnvFilter;

/// Command-line overrides for the listen address
#[derive(Debug, Parser)]
#[command(name = "shared-mailbox-api", version, about)]
struct Cli {
    /// Port to listen on (overrides PORT)
    #[arg(long)]
    port: Option<u16>,
    /// Address to bind (overrides MAILBOX_API_BIND)
    #[arg(long)]
    bind: Option<IpAddr>,
}

/// Application entry point
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// API_KEY=change-me \
/// AZURE_CLIENT_ID=00000000-0000-0000-0000-000000000000 \
/// EXCHANGE_ORG=contoso.onmicrosoft.com \
/// AZURE_CERT_BASE64="$(base64 -w0 cert.pfx)" \
/// cargo run -- --port 8080
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = ServerConfig::load_from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    server::serve(config).await?;
    Ok(())
}
