use anyhow::Result;
use clap::Parser;

use lan_chat::{cli::Cli, console};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    // Logs go to stderr so stdout carries only the chat transcript.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    console::run(cli).await
}
