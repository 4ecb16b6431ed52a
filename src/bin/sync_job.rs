//! One-shot sync job for an external queue.
//!
//! Usage: `sync_job unsynced` or `sync_job network <ecash|bitcoincash>`.
//! Exits non-zero when the job gives up, so the queue can retry it.

use paybutton_sync::{
    blockchain::{ClientRegistry, SyncEngine, SyncOptions},
    cache::PaymentCache,
    config::Config,
    db,
    dispatch::{LogMailer, TriggerDispatcher},
    models::Network,
    scheduler::{self, SyncJob},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn parse_job(args: &[String]) -> Option<SyncJob> {
    match args {
        [kind] if kind == "unsynced" => Some(SyncJob::SyncUnsyncedAddresses),
        [kind, network] if kind == "network" => Network::from_prefix(network).map(SyncJob::SyncAllAddressesForNetwork),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(job) = parse_job(&args) else {
        eprintln!("usage: sync_job unsynced | sync_job network <ecash|bitcoincash>");
        std::process::exit(2);
    };

    let config = Config::from_env();
    let pool = db::connection::establish_connection(&config.database_url).await?;
    let shutdown = CancellationToken::new();
    let registry = Arc::new(ClientRegistry::from_config(&config, &shutdown)?);
    let cache = PaymentCache::new(pool.clone(), config.cache_ttl, config.cache_max_capacity);
    let dispatcher = TriggerDispatcher::new(pool.clone(), config.webhook_timeout, Arc::new(LogMailer))?;
    let engine = SyncEngine::new(pool, registry, cache, dispatcher, SyncOptions::from_config(&config));

    let result = scheduler::run_job(&engine, job, &config.retry_policy()).await;
    shutdown.cancel();

    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}
