use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use ara_push_service::config::Settings;
use ara_push_service::guard::{create_guard_store, DeliveryGuard};
use ara_push_service::health::HealthRegistry;
use ara_push_service::notification::{DeliveryOrchestrator, HttpPushGateway};
use ara_push_service::queue::{create_broker, QueueTransport};
use ara_push_service::resilience::{CircuitBreaker, CircuitBreakerConfig, RetryPolicy};
use ara_push_service::server::{create_app, AppState};
use ara_push_service::telemetry::init_telemetry;
use ara_push_service::template::HttpTemplateClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Arc::new(Settings::new().context("failed to load configuration")?);

    // Keep the guard alive so spans are flushed on exit
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let shutdown = CancellationToken::new();

    // Delivery collaborators
    let breaker = Arc::new(CircuitBreaker::with_config(
        "push_gateway",
        CircuitBreakerConfig::from(&settings.circuit_breaker),
    ));
    let guard = Arc::new(DeliveryGuard::new(
        create_guard_store(&settings.redis)?,
        &settings.rate_limit,
    ));
    let gateway = Arc::new(HttpPushGateway::new(&settings.push)?);
    let templates = Arc::new(HttpTemplateClient::new(&settings.template)?);

    // Broker connection; the supervisor keeps it alive from here on
    let transport = Arc::new(QueueTransport::from_config(
        create_broker(&settings.rabbitmq),
        &settings.rabbitmq,
        shutdown.clone(),
    ));
    transport
        .connect()
        .await
        .context("failed to connect to message broker")?;
    let supervisor = transport.start_supervisor();

    let orchestrator = Arc::new(DeliveryOrchestrator::new(
        guard.clone(),
        templates,
        gateway,
        breaker.clone(),
        transport.clone(),
        RetryPolicy::from(&settings.retry),
    ));

    let mut health = HealthRegistry::new();
    health.register(breaker);
    health.register(transport.clone());
    health.register(guard);

    // Start consuming in background
    let consumer = {
        let transport = transport.clone();
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { transport.consume(orchestrator).await })
    };

    // Operational HTTP surface
    let state = AppState::new(settings.clone(), health, orchestrator, transport.clone());
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(address = %addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(shutdown.clone()))
        .await?;

    // Drain in-flight jobs before closing the broker connection
    shutdown.cancel();
    if let Err(e) = consumer.await {
        tracing::error!(error = %e, "Consumer task failed");
    }
    if let Err(e) = supervisor.await {
        tracing::error!(error = %e, "Broker supervisor task failed");
    }
    transport.close().await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
        _ = shutdown.cancelled() => {}
    }

    shutdown.cancel();
}
