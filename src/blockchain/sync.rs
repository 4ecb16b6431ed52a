//! Backfill and subscription of watched addresses.

use crate::blockchain::client::{address_history, ClientError, HistoryCursor, IndexerClient, TxListener};
use crate::blockchain::pipeline::IngestPipeline;
use crate::blockchain::registry::ClientRegistry;
use crate::cache::PaymentCache;
use crate::config::Config;
use crate::db::{self, address as address_db};
use crate::dispatch::TriggerDispatcher;
use crate::models::{Address, AddressState, Network, SyncReport};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Indexer error: {0}")]
    Client(#[from] ClientError),

    #[error("Address {0} is already being synced")]
    Busy(String),
}

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub page_size: u32,
    pub concurrency: usize,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            page_size: config.history_page_size.max(1),
            concurrency: config.address_sync_concurrency.max(1),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            page_size: 200,
            concurrency: 4,
        }
    }
}

pub struct SyncEngine {
    pool: SqlitePool,
    registry: Arc<ClientRegistry>,
    cache: PaymentCache,
    pipeline: IngestPipeline,
    listener: Arc<dyn TxListener>,
    states: RwLock<HashMap<String, AddressState>>,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        pool: SqlitePool,
        registry: Arc<ClientRegistry>,
        cache: PaymentCache,
        dispatcher: TriggerDispatcher,
        options: SyncOptions,
    ) -> Self {
        let pipeline = IngestPipeline::new(pool.clone(), cache.clone(), dispatcher);
        let listener: Arc<dyn TxListener> = Arc::new(pipeline.clone());
        Self {
            pool,
            registry,
            cache,
            pipeline,
            listener,
            states: RwLock::new(HashMap::new()),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &PaymentCache {
        &self.cache
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn state(&self, address: &str) -> AddressState {
        self.states
            .read()
            .ok()
            .and_then(|states| states.get(address).cloned())
            .unwrap_or(AddressState::Unsynced)
    }

    pub fn states(&self) -> BTreeMap<String, AddressState> {
        match self.states.read() {
            Ok(states) => states.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(_) => BTreeMap::new(),
        }
    }

    fn set_state(&self, address: &str, state: AddressState) {
        if let Ok(mut states) = self.states.write() {
            states.insert(address.to_string(), state);
        }
    }

    /// Marks the address as backfilling unless another backfill holds it.
    fn try_claim(&self, address: &str) -> bool {
        let Ok(mut states) = self.states.write() else {
            return false;
        };
        if states.get(address) == Some(&AddressState::Backfilling) {
            return false;
        }
        states.insert(address.to_string(), AddressState::Backfilling);
        true
    }

    /// Pulls the address's history into the store and marks it synced.
    ///
    /// Addresses never synced before get their full history without firing
    /// triggers. Already synced addresses resume from `last_synced` and fire
    /// triggers for transactions seen for the first time.
    pub async fn backfill_address(&self, client: &dyn IndexerClient, address: &Address) -> Result<usize, SyncError> {
        if !self.try_claim(&address.address) {
            return Err(SyncError::Busy(address.address.clone()));
        }

        let result = self.backfill_claimed(client, address).await;
        match &result {
            Ok(count) => {
                debug!("Backfilled {} transactions for {}", count, address.address);
                self.set_state(&address.address, AddressState::Synced);
            }
            Err(e) => {
                warn!("Backfill of {} failed: {}", address.address, e);
                self.set_state(&address.address, AddressState::SyncFailed(e.to_string()));
            }
        }
        result
    }

    async fn backfill_claimed(&self, client: &dyn IndexerClient, address: &Address) -> Result<usize, SyncError> {
        let catch_up = address.synced;
        let cursor = HistoryCursor {
            since: if catch_up { address.last_synced } else { None },
            start_page: 0,
        };
        let started_at = db::now_secs();

        let mut pages = Box::pin(address_history(client, &address.address, cursor, self.options.page_size));
        let mut stored = 0;
        while let Some(page) = pages.try_next().await? {
            let summary = self
                .pipeline
                .ingest_for_address(address, &page, false, catch_up)
                .await?;
            stored += summary.stored;
            if !summary.triggers.is_empty() {
                debug!("Fired {} trigger executions for {}", summary.triggers.len(), address.address);
            }
        }

        address_db::mark_synced(&self.pool, address.id, started_at).await?;
        Ok(stored)
    }

    /// Backfills `addresses` concurrently, then subscribes the ones that
    /// made it. An address is never subscribed before its backfill ends.
    pub async fn sync_addresses(&self, client: Arc<dyn IndexerClient>, addresses: Vec<Address>) -> SyncReport {
        let mut report = SyncReport::default();
        if addresses.is_empty() {
            return report;
        }
        let network = client.network();
        info!("Syncing {} {} addresses", addresses.len(), network);

        let results: Vec<(Address, Result<usize, SyncError>)> = stream::iter(addresses)
            .map(|address| {
                let client = client.clone();
                async move {
                    let result = self.backfill_address(client.as_ref(), &address).await;
                    (address, result)
                }
            })
            .buffer_unordered(self.options.concurrency)
            .collect()
            .await;

        let mut synced = Vec::new();
        for (address, result) in results {
            match result {
                Ok(count) => {
                    report.record_success(&address.address, count);
                    synced.push(address.address);
                }
                Err(e) => report.record_failure(&address.address, e.to_string()),
            }
        }

        self.subscribe(client.as_ref(), &synced, &mut report).await;

        let total: usize = report.successful.values().sum();
        info!(
            "Finished syncing {} {} transactions for {} addresses with {} errors",
            total,
            network,
            report.successful.len(),
            report.failed.len()
        );
        report
    }

    /// Registers the pipeline for addresses not yet subscribed on `client`.
    async fn subscribe(&self, client: &dyn IndexerClient, addresses: &[String], report: &mut SyncReport) {
        let already: HashSet<String> = client.subscribed_addresses().into_iter().collect();
        let fresh: Vec<String> = addresses.iter().filter(|a| !already.contains(*a)).cloned().collect();

        for address in addresses.iter().filter(|a| already.contains(*a)) {
            self.set_state(address, AddressState::Subscribed);
        }
        if fresh.is_empty() {
            return;
        }

        let outcome = client.subscribe(&fresh, self.listener.clone()).await;
        for address in &outcome.subscribed {
            self.set_state(address, AddressState::Subscribed);
        }
        for (address, reason) in outcome.failed {
            error!("Could not subscribe {}: {}", address, reason);
            report.successful.remove(&address);
            report.record_failure(&address, format!("Subscription failed: {}", reason));
        }
    }

    /// Backfills and subscribes every address of `network`.
    pub async fn sync_all_addresses_for_network(&self, network: Network) -> Result<SyncReport, SyncError> {
        let Some(client) = self.registry.client(network) else {
            warn!("No indexer client for {}, nothing to sync", network);
            return Ok(SyncReport::default());
        };
        let mut addresses = address_db::fetch_addresses_by_sync_state(&self.pool, Some(network), false).await?;
        addresses.extend(address_db::fetch_addresses_by_sync_state(&self.pool, Some(network), true).await?);

        Ok(self.sync_addresses(client, addresses).await)
    }

    /// Retries every address whose first backfill has not succeeded yet.
    pub async fn sync_unsynced_addresses(&self) -> Result<SyncReport, SyncError> {
        let addresses = address_db::fetch_addresses_by_sync_state(&self.pool, None, false).await?;
        if addresses.is_empty() {
            debug!("No unsynced addresses");
            return Ok(SyncReport::default());
        }
        let (groups, mut report) = self.registry.group_by_network(addresses);
        report.merge(
            self.registry
                .fan_out(groups, |client, addresses| self.sync_addresses(client, addresses))
                .await,
        );
        Ok(report)
    }

    /// Subscribes every synced address without backfilling.
    pub async fn subscribe_all_addresses(&self) -> Result<SyncReport, SyncError> {
        let addresses = address_db::fetch_addresses_by_sync_state(&self.pool, None, true).await?;
        let (groups, mut report) = self.registry.group_by_network(addresses);
        let subscribed = self
            .registry
            .fan_out(groups, |client, addresses: Vec<Address>| async move {
                let mut report = SyncReport::default();
                let strings: Vec<String> = addresses.into_iter().map(|a| a.address).collect();
                for address in &strings {
                    report.record_success(address, 0);
                }
                self.subscribe(client.as_ref(), &strings, &mut report).await;
                report
            })
            .await;
        report.merge(subscribed);
        info!("Subscribed {} addresses", report.successful.len());
        Ok(report)
    }

    /// Registers unknown addresses, then backfills and subscribes all of
    /// them.
    pub async fn sync_and_subscribe_addresses(&self, addresses: Vec<String>) -> Result<SyncReport, SyncError> {
        let addresses: Vec<String> = addresses.into_iter().map(|a| a.trim().to_lowercase()).collect();
        let (groups, mut report) = self.registry.group_by_network(addresses);
        let synced = self
            .registry
            .fan_out(groups, |client, addresses: Vec<String>| async move {
                let mut report = SyncReport::default();
                let mut stored = Vec::new();
                for address in &addresses {
                    if let Err(e) = crate::validation::validate_address_for(address, client.network()) {
                        report.record_failure(address, e.to_string());
                        continue;
                    }
                    match address_db::upsert_address(&self.pool, address, client.network()).await {
                        Ok(row) => stored.push(row),
                        Err(e) => report.record_failure(address, e.to_string()),
                    }
                }
                report.merge(self.sync_addresses(client, stored).await);
                report
            })
            .await;
        report.merge(synced);
        Ok(report)
    }
}
