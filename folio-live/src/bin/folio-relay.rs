//! Standalone notification relay.
//!
//! Opens the store as a RocksDB secondary instance, tails its change rows
//! and publishes signed events to the broker.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use folio_live::broker::BrokerPublisher;
use folio_live::config::Config;
use folio_live::protocol::ChangeSigner;
use folio_live::relay::{NotificationRelay, RelayConfig};
use folio_store::SecondaryFeed;

#[derive(Parser, Debug)]
#[command(name = "folio-relay")]
#[command(about = "Relay Folio change events to the broker")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "PATH", default_value = "folio.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = Config::load(&args.config).await?;

    if config.relay.key.is_empty() {
        return Err("relay key is required (set FOLIO_RELAY_KEY or relay.key)".into());
    }

    let feed = SecondaryFeed::open(&config.store.path, &config.relay.secondary_path)?;
    log::info!(
        "Tailing change rows of {} via {}",
        config.store.path.display(),
        config.relay.secondary_path.display()
    );

    let publisher = Arc::new(BrokerPublisher::new(
        config.broker.url.clone(),
        config.broker.backoff(),
    ));
    let relay = NotificationRelay::new(
        Arc::new(feed),
        ChangeSigner::new(&config.relay.key),
        publisher,
        RelayConfig {
            topic: config.broker.topic.clone(),
            poll_interval: config.relay.poll_interval(),
            batch_size: config.relay.batch_size,
        },
    )?;

    tokio::select! {
        _ = relay.run() => {}
        _ = tokio::signal::ctrl_c() => {
            let stats = relay.stats();
            log::info!(
                "Relay stopping at change #{} ({} published, {} dropped)",
                relay.cursor(),
                stats.published,
                stats.failed
            );
        }
    }
    Ok(())
}
