use anyhow::{Context, Result};
use clap::Parser;
use talkspot_core::CallConfig;
use talkspot_core::cli::{self, Cli, Command};
use talkspot_core::telemetry::logging;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialize logging")?;

    let config = CallConfig::from_env();
    debug!(?config, "loaded call configuration");

    match cli.command {
        Command::Loopback(args) => {
            let summary = cli::run_loopback(config, &args).await?;
            if summary.remote_media {
                println!("loopback call in {} completed with media flowing", summary.room);
            } else {
                println!(
                    "loopback call in {} completed, but no remote media arrived",
                    summary.room
                );
            }
        }
        Command::Link(args) => {
            let (room, url) = cli::share_link(&config, &args.token)?;
            println!("{room}");
            println!("{url}");
        }
    }
    Ok(())
}
