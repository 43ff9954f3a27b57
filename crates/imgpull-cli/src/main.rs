//! imgpull CLI - pulls container images into `docker load` archives.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(cli.logging.filter()?)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Pull(args) => commands::pull::execute(args).await,
        Commands::Version => {
            println!("imgpull {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
