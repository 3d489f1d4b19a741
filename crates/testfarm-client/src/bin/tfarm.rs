use anyhow::Result;
use clap::Parser;
use testfarm_client::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if !cli.run().await? {
        std::process::exit(1);
    }
    Ok(())
}
