//! Pub/sub broker between the relay and the live servers.

use std::path::PathBuf;

use clap::Parser;
use folio_live::broker::{BrokerConfig, BrokerHub};
use folio_live::config::Config;

#[derive(Parser, Debug)]
#[command(name = "folio-broker")]
#[command(about = "Folio change broker")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "PATH", default_value = "folio.toml")]
    config: PathBuf,

    /// Overrides broker.bind_addr
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = Config::load(&args.config).await?;

    let hub = BrokerHub::new(BrokerConfig {
        bind_addr: args.bind.unwrap_or(config.broker.bind_addr),
        channel_capacity: config.broker.channel_capacity,
    });

    tokio::select! {
        result = hub.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = hub.stats().await;
            log::info!(
                "Broker stopping ({} frames published, {} connections served)",
                stats.frames_published,
                stats.total_connections
            );
        }
    }
    Ok(())
}
