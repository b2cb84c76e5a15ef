//! roomlinkd - the roomlink server binary.

use roomlink::config::Config;
use roomlink::http::{self, HealthState};
use roomlink::metrics;
use roomlink::network::{Gateway, QuerySessionResolver};
use roomlink::service::Service;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ROOMLINK_LOG_FORMAT").is_ok_and(|format| format == "json");
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path, error = %e, "Failed to load config");
        e
    })?;

    info!(
        server = %config.server.name,
        instance = %config.server.instance,
        listen = %config.listen.address,
        "Starting roomlink"
    );

    let service = Service::build(&config).await?;
    let shutdown = CancellationToken::new();

    // Metrics are optional; no port means no HTTP endpoint.
    if let Some(port) = config.server.metrics_port {
        metrics::init();
        let state = HealthState {
            instance: config.server.instance.clone(),
            backend: service.bus.backend(),
            admission: Arc::clone(&service.admission),
            hub: Arc::clone(&service.hub),
        };
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            http::run_http_server(port, state, shutdown).await;
        });
        info!(port, "Prometheus HTTP server started");
    }

    let gateway = Gateway::bind(
        &config.listen,
        service.gateway_context(Arc::new(QuerySessionResolver)),
    )
    .await?;
    let mut gateway_task = tokio::spawn(gateway.run(shutdown.clone()));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
        result = &mut gateway_task => {
            error!("Gateway exited unexpectedly");
            result??;
        }
    }

    shutdown.cancel();
    if !gateway_task.is_finished() {
        gateway_task.await??;
    }
    service.shutdown().await;
    info!("roomlink stopped");
    Ok(())
}
