//! Out-of-process vat worker: speaks the netstring worker protocol on
//! stdin/stdout and runs bundles from the built-in fixture registry.

use std::io;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "swing-worker", about = "SwingSet vat worker process")]
struct Cli {
    /// Log filter (RUST_LOG syntax). Logs go to stderr.
    #[arg(long, default_value = "warn")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let loader = Arc::new(swing_worker::fixtures::registry());
    swing_worker::run_worker(io::stdin(), io::stdout(), loader).context("worker loop failed")?;
    Ok(())
}
