use clinipay_gateway::api::{self, AppState};
use clinipay_gateway::config::AppConfig;
use clinipay_gateway::database::{init_pool_from_config, memory::InMemoryStore, Stores};
use clinipay_gateway::health::HealthChecker;
use clinipay_gateway::logging::init_tracing;
use clinipay_gateway::middleware::logging::{request_logging_middleware, UuidRequestId};
use clinipay_gateway::payments::ProviderRegistry;
use clinipay_gateway::services::events::HttpEventPublisher;
use clinipay_gateway::services::notification::LogNotifier;
use clinipay_gateway::services::{
    EventPublisher, FeeCalculationService, PaymentOrchestrator, ReconciliationService,
    RefundService, RiskService, SideEffects, VerificationService,
};
use clinipay_gateway::workers::settlement_monitor::SettlementMonitorWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
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
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        "🚀 Starting CliniPay payment gateway"
    );

    // Initialize database connection pool
    let db_pool = match &config.database {
        Some(database) => {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(database).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                e
            })?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "✅ Database connection pool initialized"
            );
            Some(pool)
        }
        None => {
            warn!("⏭️  Skipping database initialization (SKIP_EXTERNALS=true), using in-memory store");
            None
        }
    };

    let stores = match &db_pool {
        Some(pool) => Stores::postgres(pool.clone()),
        None => Stores::in_memory(InMemoryStore::permissive()),
    };

    let registry = ProviderRegistry::from_env()?;

    let events: Arc<dyn EventPublisher> = match HttpEventPublisher::from_env()? {
        Some(publisher) => Arc::new(publisher),
        None => Arc::new(clinipay_gateway::services::events::TracingEventPublisher),
    };
    let side_effects = SideEffects::new(events, Arc::new(LogNotifier::new()));

    let orchestrator = PaymentOrchestrator::new(
        registry.clone(),
        stores.clone(),
        FeeCalculationService::new(&config.gateway),
        RiskService::new(config.risk.clone()),
        config.gateway.clone(),
        side_effects.clone(),
    );
    let verification = VerificationService::new(
        registry.clone(),
        stores.clone(),
        &config.gateway,
        side_effects.clone(),
    );
    let refunds = RefundService::new(
        registry.clone(),
        stores.clone(),
        &config.gateway,
        side_effects.clone(),
    );
    let reconciliation = ReconciliationService::new(registry.clone(), stores.clone());

    let mut health_checker = HealthChecker::new(registry.list_available_providers());
    if let Some(pool) = &db_pool {
        health_checker = health_checker.with_database(pool.clone());
    }

    // Background workers
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let monitor_handle = if config.settlement_monitor.enabled {
        let worker = SettlementMonitorWorker::new(
            registry.clone(),
            stores.clone(),
            verification.clone(),
            side_effects.clone(),
            config.settlement_monitor.clone(),
        );
        info!("✅ Settlement monitor worker started");
        Some(tokio::spawn(worker.run(worker_shutdown_rx)))
    } else {
        info!("⏭️  Settlement monitor disabled");
        None
    };

    info!("🛣️  Setting up application routes...");
    let app = api::router(AppState {
        orchestrator: Arc::new(orchestrator),
        verification: Arc::new(verification),
        reconciliation: Arc::new(reconciliation),
        refunds: Arc::new(refunds),
        health_checker,
    })
    .layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("❌ Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = monitor_handle {
        if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for settlement monitor shutdown");
        }
    }

    if let Some(pool) = db_pool {
        pool.close().await;
    }

    info!("👋 Server shutdown complete");

    Ok(())
}
