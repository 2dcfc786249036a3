// pubsub-node: Runs one federation node.
//
// Wires a consumer listener (peers dial us to deliver events), a producer
// dialing the seed peers, and (when configured) the discovery driver
// keeping the producer's dial set in step with the advertised fleet.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use node::config::{self, NodeConfig};
use node::status::{self, StatusState};
use psc_discovery::{ConsulDiscovery, DiscoveryConfig};
use psc_federation::{Consumer, EndpointConfig, MemoryBroker, PeerControl, Producer};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "pubsub-node", about = "PubSubClub federation node")]
struct Args {
    /// Path to the node TOML config.
    #[arg(long, default_value = "/etc/pubsubclub/node.toml")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "pubsub-node starting");

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "node failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint_config = EndpointConfig {
        node_id: cfg.node_id,
        supported_versions: cfg.supported_versions.clone(),
    };

    let broker = Arc::new(MemoryBroker::new());

    let consumer = Consumer::new(endpoint_config.clone(), broker.clone());
    let bind = format!("{}:{}", cfg.consumer.bind_interface, cfg.consumer.bind_port);
    let consumer_addr = consumer.listen(&bind).await?;
    info!(%consumer_addr, "consumer endpoint up");

    // Pre-subscribe the configured topics so this node declares interest as
    // soon as sessions come up.
    for topic in &cfg.consumer.topics {
        broker.client_subscribe(topic);
        consumer.on_client_subscribed(topic).await;
        info!(%topic, "tailing topic");
    }

    let producer = Producer::new(endpoint_config);
    for peer in &cfg.producer.initial_peers {
        info!(peer = %peer, "dialing seed peer");
        producer.connect(&peer.host, peer.port);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(discovery_cfg) = &cfg.discovery {
        let driver = ConsulDiscovery::new(
            DiscoveryConfig::new(discovery_cfg.url.clone(), discovery_cfg.service.clone()),
            Arc::new(producer.clone()),
        )?;
        tokio::spawn(driver.run(shutdown_rx.clone()));
    }

    // Tail everything the federation delivers into the local broker.
    let mut events = broker.events();
    tokio::spawn(async move {
        while let Ok((topic, event)) = events.recv().await {
            info!(%topic, %event, "event received");
        }
    });

    status::serve(
        &cfg.status_http.bind,
        StatusState {
            producer: producer.clone(),
            consumer: consumer.clone(),
        },
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    producer.shutdown();
    consumer.shutdown();
    Ok(())
}
