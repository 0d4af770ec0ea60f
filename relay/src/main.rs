use anyhow::Context;
use axum::{routing::get, Router};
use relay::config::Config;
use relay::db::PgStore;
use relay::identity::HttpIdentityVerifier;
use relay::ingest::{run_ingest, TelemetryIngestor};
use relay::metrics;
use relay::mqtt::ConnectionSupervisor;
use relay::publisher::{command_channel, run_publisher, CommandPublisher};
use relay::registry::DeviceRegistry;
use relay::rest::{self, AppState};
use relay::store::{DeviceStore, ReadingStore};
use relay::topics::TopicRouter;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting telemetry relay");
    info!("MQTT broker: {}:{} (tls: {})", config.broker.host, config.broker.port, config.broker.tls);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_host());

    metrics::init_metrics().context("failed to register metrics")?;

    let store = Arc::new(
        PgStore::connect(&config.database_url)
            .await
            .context("failed to connect to database")?,
    );
    let devices: Arc<dyn DeviceStore> = store.clone();
    let readings: Arc<dyn ReadingStore> = store;

    let registry = Arc::new(DeviceRegistry::new(devices));
    let identity = Arc::new(HttpIdentityVerifier::new(config.identity_validate_url.clone())?);
    let router = TopicRouter::new(
        config.topics.telemetry_namespace.clone(),
        config.topics.telemetry_suffix.clone(),
        config.topics.status_namespace.clone(),
    );
    let supervisor = ConnectionSupervisor::new(
        config.broker.clone(),
        config.reconnect,
        config.publish_timeout,
    );
    let shutdown = CancellationToken::new();

    // Inbound: subscriber session -> channel -> ingest task
    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let subscriber = supervisor.subscriber(router.subscriptions())?;
    let subscriber_handle = tokio::spawn(subscriber.run(tx, shutdown.clone()));

    let ingestor = Arc::new(
        TelemetryIngestor::new(router, registry.clone(), readings.clone())
            .require_pairing_token(config.require_pairing_on_transport),
    );
    let ingest_handle = tokio::spawn(run_ingest(rx, ingestor));

    // Outbound: command queue -> publisher task, on its own session
    let (commands, command_rx) = command_channel(config.channel_capacity);
    let publisher = CommandPublisher::new(supervisor.publisher()?, config.topics.command_topic.clone());
    let publisher_handle = tokio::spawn(run_publisher(publisher, command_rx, shutdown.clone()));

    let state = AppState {
        registry,
        readings,
        identity,
        commands,
    };
    let app = Router::new()
        .route("/", get(|| async { "relay ok" }))
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    let server_token = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down");
    shutdown.cancel();
    for (name, handle) in [
        ("subscriber", subscriber_handle),
        ("ingest", ingest_handle),
        ("publisher", publisher_handle),
    ] {
        if let Err(e) = handle.await {
            error!("{} task failed: {}", name, e);
        }
    }
    info!("Shutdown complete");

    Ok(())
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}
