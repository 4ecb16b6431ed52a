//! Path every indexer transaction takes into the store.

use crate::blockchain::client::TxListener;
use crate::blockchain::models::NativeTx;
use crate::blockchain::normalizer::{normalize, related_addresses};
use crate::cache::PaymentCache;
use crate::db::{address as address_db, transaction as tx_db};
use crate::dispatch::{TriggerBatch, TriggerDispatcher};
use crate::models::{Address, BroadcastTxData, BroadcastType, Network, SimplifiedTransaction, Transaction};
use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, error, info};

/// Result of pushing a batch of indexer transactions for one address.
#[derive(Debug, Default)]
pub struct IngestSummary {
    /// Transactions that produced a record for the address.
    pub stored: usize,
    pub created: usize,
    pub triggers: TriggerBatch,
}

#[derive(Clone)]
pub struct IngestPipeline {
    pool: SqlitePool,
    cache: PaymentCache,
    dispatcher: TriggerDispatcher,
}

impl IngestPipeline {
    pub fn new(pool: SqlitePool, cache: PaymentCache, dispatcher: TriggerDispatcher) -> Self {
        Self { pool, cache, dispatcher }
    }

    /// Normalizes, stores and caches `txs` for `address`. Triggers are fired
    /// for newly created rows only, and only when `fire_triggers` is set.
    pub async fn ingest_for_address(
        &self,
        address: &Address,
        txs: &[NativeTx],
        confirmed: bool,
        fire_triggers: bool,
    ) -> Result<IngestSummary, sqlx::Error> {
        let mut summary = IngestSummary::default();
        let mut touched: Vec<Transaction> = Vec::new();
        let mut fresh: Vec<SimplifiedTransaction> = Vec::new();

        for native in txs {
            let Some(canonical) = normalize(native, address, confirmed) else {
                continue;
            };
            let outcome = tx_db::upsert_transaction(&self.pool, &canonical, address).await?;
            summary.stored += 1;
            if outcome.created {
                summary.created += 1;
                fresh.push(SimplifiedTransaction::from_canonical(&canonical, &address.address));
            }
            if outcome.created || outcome.newly_confirmed {
                touched.push(outcome.transaction);
            }
        }

        if !touched.is_empty() {
            self.cache.cache_many_txs(address, &touched).await?;
        }

        if fire_triggers && !fresh.is_empty() {
            let broadcast = BroadcastTxData {
                address: address.address.clone(),
                message_type: BroadcastType::NewTx,
                txs: fresh,
            };
            summary.triggers = self.dispatcher.execute_address_triggers(&broadcast, address.network).await?;
        }

        Ok(summary)
    }

    /// Stores a pushed transaction for every watched address it touches.
    ///
    /// Addresses whose first backfill has not finished are left to that
    /// backfill, which will pick the transaction up from the history.
    pub async fn ingest_pushed(&self, native: &NativeTx, confirmed: bool) -> Result<IngestSummary, sqlx::Error> {
        let related = related_addresses(native);
        let watched = address_db::fetch_addresses(&self.pool, &related).await?;
        let mut total = IngestSummary::default();

        for address in watched.iter().filter(|a| a.network == native.network()) {
            if !address.synced {
                debug!("Deferring {} for {} until its backfill completes", native.txid(), address.address);
                continue;
            }
            let summary = self
                .ingest_for_address(address, std::slice::from_ref(native), confirmed, true)
                .await?;
            total.stored += summary.stored;
            total.created += summary.created;
            total.triggers.extend(summary.triggers);
        }

        debug!(
            "Pushed {} touched {} watched addresses, {} new rows",
            native.txid(),
            watched.len(),
            total.created
        );
        Ok(total)
    }

    /// Drops unconfirmed rows of an evicted mempool transaction on `network`.
    pub async fn remove_unconfirmed(&self, network: Network, txid: &str) -> Result<usize, sqlx::Error> {
        let removed = tx_db::delete_unconfirmed_by_hash(&self.pool, network, txid).await?;
        for tx in &removed {
            if let Some(address) = address_db::fetch_address_by_id(&self.pool, tx.address_id).await? {
                self.cache.uncache_many_txs(&address, std::slice::from_ref(tx)).await;
            }
        }
        if !removed.is_empty() {
            info!("Removed {} unconfirmed rows of {}", removed.len(), txid);
        }
        Ok(removed.len())
    }

    async fn handle_pushed(&self, tx: NativeTx, confirmed: bool) {
        if let Err(e) = self.ingest_pushed(&tx, confirmed).await {
            error!("Failed to ingest {} transaction {}: {}", tx.network(), tx.txid(), e);
        }
    }
}

#[async_trait]
impl TxListener for IngestPipeline {
    async fn on_unconfirmed(&self, tx: NativeTx) {
        self.handle_pushed(tx, false).await;
    }

    async fn on_confirmed(&self, tx: NativeTx) {
        self.handle_pushed(tx, true).await;
    }

    async fn on_removed_from_mempool(&self, network: Network, txid: &str) {
        if let Err(e) = self.remove_unconfirmed(network, txid).await {
            error!("Failed to remove {} transaction {}: {}", network, txid, e);
        }
    }
}
