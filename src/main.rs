use paybutton_sync::{
    api,
    blockchain::{ClientRegistry, SyncEngine, SyncOptions},
    cache::PaymentCache,
    config::Config,
    db,
    dispatch::{LogMailer, TriggerDispatcher},
    models::Network,
    scheduler::{self, SyncJob},
    state::AppState,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting paybutton-sync");

    let config = Config::from_env();
    tracing::info!("Configuration loaded: {:?}", config);

    let db_pool = db::connection::establish_connection(&config.database_url).await?;
    tracing::info!("Database connection established");

    let shutdown = CancellationToken::new();
    let registry = Arc::new(ClientRegistry::from_config(&config, &shutdown)?);
    let cache = PaymentCache::new(db_pool.clone(), config.cache_ttl, config.cache_max_capacity);
    let dispatcher = TriggerDispatcher::new(db_pool.clone(), config.webhook_timeout, Arc::new(LogMailer))?;
    let engine = Arc::new(SyncEngine::new(
        db_pool.clone(),
        registry,
        cache,
        dispatcher,
        SyncOptions::from_config(&config),
    ));

    // live updates for known addresses first, then catch up on what was missed
    match engine.subscribe_all_addresses().await {
        Ok(report) => tracing::info!("Subscribed {} synced addresses", report.successful.len()),
        Err(e) => tracing::error!("Initial subscription failed: {}", e),
    }
    for network in Network::ALL {
        let engine = engine.clone();
        let policy = config.retry_policy();
        tokio::spawn(async move {
            if let Err(e) = scheduler::run_job(&engine, SyncJob::SyncAllAddressesForNetwork(network), &policy).await {
                tracing::error!("Startup sync of {} gave up: {}", network, e);
            }
        });
    }

    tokio::spawn(scheduler::run_periodic_sweep(
        engine.clone(),
        config.sweep_interval,
        config.retry_policy(),
        shutdown.clone(),
    ));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let app_state = Arc::new(AppState::new(config, db_pool, engine));
    let app = api::create_router(app_state).layer(CorsLayer::permissive());

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    Ok(())
}
