use std::sync::Arc;
use std::time::Duration;

use beacon_bus::{MessageBus, NatsBus};
use beacon_core::{InstanceId, StaticTokenResolver};
use beacon_server::{BroadcastHandler, DirectHandler, HandlerMap, Hub, HubConfig, ServerConfig};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Real-time WebSocket message hub")]
struct Cli {
    /// Port to listen on.
    #[arg(long, env = "BEACON_PORT", default_value_t = 9090)]
    port: u16,

    /// Per-connection outbound queue bound.
    #[arg(long, env = "BEACON_SEND_QUEUE", default_value_t = 256)]
    send_queue: usize,

    /// Seconds a client gets to send its auth frame.
    #[arg(long, env = "BEACON_AUTH_DEADLINE_SECS", default_value_t = 10)]
    auth_deadline_secs: u64,

    /// Seconds to let outbound queues drain on shutdown.
    #[arg(long, env = "BEACON_DRAIN_TIMEOUT_SECS", default_value_t = 5)]
    drain_timeout_secs: u64,

    /// Bus URL (e.g. nats://localhost:4222). Unset runs local-only.
    #[arg(long, env = "BEACON_BUS_URL")]
    bus_url: Option<String>,

    /// Bus subject shared by all instances.
    #[arg(long, env = "BEACON_BUS_SUBJECT", default_value = "beacon.broadcast")]
    bus_subject: String,

    /// Instance identifier override; generated when unset.
    #[arg(long, env = "BEACON_INSTANCE_ID")]
    instance_id: Option<String>,

    /// Static auth tokens as `token=subject,token2=subject2`.
    #[arg(long, env = "BEACON_AUTH_TOKENS", default_value = "")]
    auth_tokens: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("starting beacon");

    let resolver = Arc::new(StaticTokenResolver::from_table(&cli.auth_tokens));
    if resolver.is_empty() {
        tracing::warn!("no auth tokens configured, every connection will be rejected");
    }

    let bus: Option<Arc<dyn MessageBus>> = match &cli.bus_url {
        Some(url) => match NatsBus::connect(url, "beacon").await {
            Ok(bus) => Some(Arc::new(bus)),
            Err(err) => {
                // Local delivery still works; cross-instance visibility is off.
                tracing::warn!(error = %err, "bus connect failed, running local-only");
                None
            }
        },
        None => None,
    };

    let instance = match &cli.instance_id {
        Some(id) => InstanceId::from_raw(id.clone()),
        None => InstanceId::new(),
    };

    let hub = Hub::start(
        HubConfig {
            instance,
            relay_subject: cli.bus_subject.clone(),
            ..Default::default()
        },
        bus,
    );

    let handlers = Arc::new(
        HandlerMap::builder()
            .register(
                "broadcast",
                Arc::new(BroadcastHandler::new(Arc::clone(hub.router()))) as _,
            )
            .register(
                "direct",
                Arc::new(DirectHandler::new(Arc::clone(hub.router()))) as _,
            )
            .build(),
    );

    let config = ServerConfig {
        port: cli.port,
        max_send_queue: cli.send_queue,
        auth_deadline: Duration::from_secs(cli.auth_deadline_secs),
        ..Default::default()
    };
    let server = beacon_server::start(config, Arc::clone(&hub), resolver, handlers).await?;
    tracing::info!(port = server.port, "beacon ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    hub.stop(Duration::from_secs(cli.drain_timeout_secs)).await;
    server.shutdown().await;

    Ok(())
}
