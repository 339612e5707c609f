//! Fleet monitor entry point.
//!
//! Connects to the fleet streaming server, keeps merged position, status and
//! command-response tables, and serves them over HTTP.

use anyhow::Result;
use common::stream::Topic;
use connection::{ConnectionEvent, ConnectionManager, WsTransport};
use fleet_monitor::{create_router, AppState, MonitorConfig};
use merge::{HttpBaselineSource, MergeEngine};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use subscription::SubscriptionRegistry;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting fleet monitor");

    let config = MonitorConfig::from_env()?;
    config.log();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let engine = MergeEngine::new(config.merge.clone());
    engine.start_eviction();
    let updates = engine.on_update(|update| {
        debug!(
            "Merged {} changes ({} dropped) into {:?}",
            update.applied, update.dropped, update.topics
        );
    });

    // Seed before streaming so live events supersede the baseline
    if let Some(url) = &config.baseline_url {
        let source = HttpBaselineSource::new(url.as_str())?;
        for topic in [Topic::Positions, Topic::Statuses] {
            match engine.load_baseline(&source, topic).await {
                Ok(count) => info!("Loaded {} {} baseline records", count, topic),
                Err(e) => warn!("Baseline for {} unavailable: {}", topic, e),
            }
        }
    }

    let connection = ConnectionManager::new(config.connection.clone(), Arc::new(WsTransport::new()));
    let lifecycle = connection.on_event(|event| match event {
        ConnectionEvent::StateChanged { from, to } => info!("Connection {} -> {}", from, to),
        ConnectionEvent::Error { kind, message } => warn!("Connection {} error: {}", kind, message),
        _ => {}
    });

    let registry = SubscriptionRegistry::new(connection.clone(), Arc::new(engine.clone()));
    for topic in Topic::ALL {
        registry.subscribe(topic, config.scope.clone());
    }
    // With auto-connect the manager started connecting on construction
    if !config.connection.auto_connect {
        connection.connect();
    }

    let app = create_router(AppState {
        registry: registry.clone(),
        engine: engine.clone(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Fleet monitor listening on {}", addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("HTTP server error: {}", e);
    }

    info!("Shutting down connection...");
    registry.close();
    lifecycle.unsubscribe();
    updates.unsubscribe();
    connection.disconnect();
    engine.flush();

    info!("Fleet monitor stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
