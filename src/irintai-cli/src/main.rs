//! Irintai CLI - main entry point.

use anyhow::Result;
use clap::Parser;

use irintai_cli::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();
    cli.run().await
}
