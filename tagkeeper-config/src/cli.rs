//! CLI flags for binaries built on top of this crate. Kept separate from
//! [`crate::loader`] because only a binary (not this library) knows which
//! flags the operator actually passed.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "tagkeeper", about = "Music-library ML tagging coordination core")]
pub struct CommonArgs {
    /// Path to a TOML config file layered on top of the built-in defaults.
    #[arg(long, env = "TAGKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit structured JSON logs instead of the interactive pretty format.
    #[arg(long)]
    pub json_logs: bool,
}

/// Initializes the global `tracing` subscriber per §10.1: `EnvFilter`
/// driven by `RUST_LOG`, pretty for interactive use, JSON for production.
pub fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
