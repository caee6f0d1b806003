//! Folio server binary.
//!
//! Runs the Edit API, the live WebSocket endpoint, the fan-out subscriber
//! and the janitor against one store. With `--embedded-relay` the
//! notification relay runs in-process on the primary store.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use folio_live::api::{build_app, AppState};
use folio_live::config::Config;
use folio_live::fanout::{ConnectionRegistry, LiveFanout};
use folio_live::janitor::Janitor;
use folio_live::protocol::ChangeSigner;
use folio_live::relay::{NotificationRelay, RelayConfig};
use folio_live::server::LiveServer;
use folio_live::services::Services;
use folio_live::BrokerPublisher;

#[derive(Parser, Debug)]
#[command(name = "folio-server")]
#[command(about = "Folio edit API and live-update server")]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, value_name = "PATH", default_value = "folio.toml")]
    config: PathBuf,

    /// Run the notification relay inside this process
    #[arg(long)]
    embedded_relay: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = Config::load(&args.config).await?;
    if config.relay.key.is_empty() {
        log::warn!("Relay key is empty; live updates will not verify across processes");
    }

    let services = Arc::new(Services::open(&config)?);
    log::info!("Store opened at {}", services.store.path().display());

    // Live updates
    let signer = ChangeSigner::new(&config.relay.key);
    let registry = Arc::new(ConnectionRegistry::new(config.fanout.queue_capacity));
    let fanout = Arc::new(LiveFanout::new(registry.clone(), signer.clone()));
    let _subscription = fanout.spawn_subscriber(
        config.broker.url.clone(),
        config.broker.topic.clone(),
        config.broker.backoff(),
    );

    let live = LiveServer::new(config.server.live_addr.clone(), registry);
    tokio::spawn(async move {
        if let Err(e) = live.run().await {
            log::error!("Live server stopped: {e}");
        }
    });

    if args.embedded_relay {
        let publisher = Arc::new(BrokerPublisher::new(
            config.broker.url.clone(),
            config.broker.backoff(),
        ));
        let relay = NotificationRelay::new(
            services.store.clone(),
            signer,
            publisher,
            RelayConfig {
                topic: config.broker.topic.clone(),
                poll_interval: config.relay.poll_interval(),
                batch_size: config.relay.batch_size,
            },
        )?;
        tokio::spawn(async move { relay.run().await });
    }

    let janitor = Arc::new(Janitor::new((*services).clone(), config.janitor.clone()));
    let _janitor = janitor.spawn();

    // Edit API
    let state = AppState {
        services,
        admin_token: config.server.admin_token.clone(),
    };
    let app = build_app(
        state,
        Duration::from_secs(config.server.request_timeout_secs),
    );
    let listener = tokio::net::TcpListener::bind(&config.server.http_addr).await?;
    log::info!("Edit API listening on {}", config.server.http_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("Shutting down");
    })
    .await?;

    Ok(())
}
