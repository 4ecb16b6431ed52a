//! Weekly payment buckets and address balances.
//!
//! Everything here is derived from the store and can be thrown away and
//! rebuilt at any time. Week buckets of an address are built from the
//! store on first read; incremental updates only touch addresses whose
//! buckets already exist.

use super::keys::CacheKey;
use crate::db::{address as address_db, paybutton as paybutton_db, price as price_db, transaction as tx_db};
use crate::models::{Address, AddressBalance, ButtonDisplayData, Payment, QuoteValues, Transaction};
use moka::future::Cache;
use rust_decimal::Decimal;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Clone)]
pub struct PaymentCache {
    pool: SqlitePool,
    /// Payments per address and ISO week
    weeks: Cache<CacheKey, Vec<Payment>>,
    /// Week keys held per address; presence marks the address as built
    index: Cache<String, BTreeSet<CacheKey>>,
    balances: Cache<CacheKey, AddressBalance>,
    write_lock: std::sync::Arc<Mutex<()>>,
}

fn payment_value(amount: Decimal, prices: Option<&QuoteValues>) -> QuoteValues {
    match prices {
        Some(p) => QuoteValues {
            usd: amount * p.usd,
            cad: amount * p.cad,
        },
        None => QuoteValues::default(),
    }
}

fn sort_payments(payments: &mut [Payment]) {
    payments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.hash.cmp(&b.hash)));
}

fn is_payment(tx: &Transaction) -> bool {
    tx.confirmed && tx.amount > Decimal::ZERO
}

impl PaymentCache {
    pub fn new(pool: SqlitePool, balance_ttl: Duration, balance_capacity: u64) -> Self {
        Self {
            pool,
            weeks: Cache::builder().build(),
            index: Cache::builder().build(),
            balances: Cache::builder()
                .max_capacity(balance_capacity)
                .time_to_live(balance_ttl)
                .build(),
            write_lock: std::sync::Arc::new(Mutex::new(())),
        }
    }

    pub fn is_initialized(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    fn build_payment(
        tx: &Transaction,
        address: &Address,
        prices: Option<&QuoteValues>,
        paybuttons: &[ButtonDisplayData],
    ) -> Payment {
        Payment {
            hash: tx.hash.clone(),
            timestamp: tx.timestamp,
            amount: tx.amount,
            value: payment_value(tx.amount, prices),
            network: address.network,
            address: address.address.clone(),
            paybuttons: paybuttons.to_vec(),
        }
    }

    /// Drops and rebuilds the week buckets of one address from the store.
    /// Returns the number of cached payments.
    pub async fn rebuild_address(&self, address: &Address) -> Result<usize, sqlx::Error> {
        let _guard = self.write_lock.lock().await;
        self.rebuild_address_locked(address).await
    }

    async fn rebuild_address_locked(&self, address: &Address) -> Result<usize, sqlx::Error> {
        let txs = tx_db::fetch_payment_transactions(&self.pool, address.id).await?;
        let prices = price_db::fetch_network_prices(&self.pool, address.network).await?;
        let buttons = paybutton_db::fetch_button_display_data(&self.pool, &[address.id])
            .await?
            .remove(&address.id)
            .unwrap_or_default();

        if let Some(old_keys) = self.index.get(&address.address).await {
            for key in old_keys {
                self.weeks.invalidate(&key).await;
            }
        }

        let mut buckets: BTreeMap<CacheKey, Vec<Payment>> = BTreeMap::new();
        for tx in &txs {
            let day = price_db::flatten_timestamp(tx.timestamp);
            let payment = Self::build_payment(tx, address, prices.get(&day), &buttons);
            buckets
                .entry(CacheKey::payment_week(&address.address, tx.timestamp))
                .or_default()
                .push(payment);
        }

        let keys: BTreeSet<CacheKey> = buckets.keys().cloned().collect();
        for (key, mut payments) in buckets {
            sort_payments(&mut payments);
            self.weeks.insert(key, payments).await;
        }
        self.index.insert(address.address.clone(), keys).await;
        self.balances.invalidate(&CacheKey::balance(&address.address)).await;

        debug!("Rebuilt payment cache for {} with {} payments", address.address, txs.len());
        Ok(txs.len())
    }

    /// Clears the cache and rebuilds it for every stored address.
    pub async fn rebuild_all(&self) -> Result<usize, sqlx::Error> {
        self.clear().await;
        let addresses = address_db::fetch_all_addresses(&self.pool).await?;
        let _guard = self.write_lock.lock().await;
        let mut total = 0;
        for address in &addresses {
            total += self.rebuild_address_locked(address).await?;
        }
        info!("Rebuilt payment cache: {} addresses, {} payments", addresses.len(), total);
        Ok(total)
    }

    pub async fn clear(&self) {
        let _guard = self.write_lock.lock().await;
        self.weeks.invalidate_all();
        self.index.invalidate_all();
        self.balances.invalidate_all();
        self.weeks.run_pending_tasks().await;
        self.index.run_pending_tasks().await;
        self.balances.run_pending_tasks().await;
    }

    /// Adds confirmed, positive-value transactions of `address` to their
    /// week buckets, replacing entries with the same hash. Addresses whose
    /// buckets were never built are left alone. Returns how many payments
    /// were written.
    pub async fn cache_many_txs(&self, address: &Address, txs: &[Transaction]) -> Result<usize, sqlx::Error> {
        self.balances.invalidate(&CacheKey::balance(&address.address)).await;

        let payments: Vec<&Transaction> = txs.iter().filter(|t| is_payment(t)).collect();
        if payments.is_empty() {
            return Ok(0);
        }

        let _guard = self.write_lock.lock().await;
        let Some(mut keys) = self.index.get(&address.address).await else {
            debug!("Payment cache for {} not built yet, skipping append", address.address);
            return Ok(0);
        };

        let buttons: Vec<ButtonDisplayData> = paybutton_db::fetch_paybuttons_for_address(&self.pool, address.id)
            .await?
            .iter()
            .map(ButtonDisplayData::from)
            .collect();
        let mut day_prices: HashMap<i64, Option<QuoteValues>> = HashMap::new();

        for tx in &payments {
            let day = price_db::flatten_timestamp(tx.timestamp);
            if !day_prices.contains_key(&day) {
                let prices = price_db::fetch_day_prices(&self.pool, address.network, tx.timestamp).await?;
                day_prices.insert(day, prices);
            }
            let prices = day_prices.get(&day).and_then(|p| p.as_ref());
            let payment = Self::build_payment(tx, address, prices, &buttons);

            let key = CacheKey::payment_week(&address.address, tx.timestamp);
            let mut bucket = self.weeks.get(&key).await.unwrap_or_default();
            bucket.retain(|p| p.hash != payment.hash);
            bucket.push(payment);
            sort_payments(&mut bucket);
            self.weeks.insert(key.clone(), bucket).await;
            keys.insert(key);
        }
        self.index.insert(address.address.clone(), keys).await;

        debug!("Cached {} payments for {}", payments.len(), address.address);
        Ok(payments.len())
    }

    /// Removes transactions of `address` from the week buckets by hash.
    pub async fn uncache_many_txs(&self, address: &Address, txs: &[Transaction]) {
        self.balances.invalidate(&CacheKey::balance(&address.address)).await;

        let _guard = self.write_lock.lock().await;
        let Some(mut keys) = self.index.get(&address.address).await else {
            return;
        };

        for tx in txs {
            let key = CacheKey::payment_week(&address.address, tx.timestamp);
            let Some(mut bucket) = self.weeks.get(&key).await else {
                continue;
            };
            bucket.retain(|p| p.hash != tx.hash);
            if bucket.is_empty() {
                self.weeks.invalidate(&key).await;
                keys.remove(&key);
            } else {
                self.weeks.insert(key, bucket).await;
            }
        }
        self.index.insert(address.address.clone(), keys).await;
    }

    async fn update_paybuttons<F>(&self, addresses: &[Address], mut update: F)
    where
        F: FnMut(&mut Vec<ButtonDisplayData>),
    {
        let _guard = self.write_lock.lock().await;
        for address in addresses {
            let Some(keys) = self.index.get(&address.address).await else {
                continue;
            };
            for key in keys {
                if let Some(mut bucket) = self.weeks.get(&key).await {
                    for payment in bucket.iter_mut() {
                        update(&mut payment.paybuttons);
                    }
                    self.weeks.insert(key, bucket).await;
                }
            }
        }
    }

    /// Adds `button` to every cached payment of `addresses`.
    pub async fn append_paybutton_to_addresses_cache(&self, addresses: &[Address], button: &ButtonDisplayData) {
        self.update_paybuttons(addresses, |buttons| {
            if !buttons.iter().any(|b| b.id == button.id) {
                buttons.push(button.clone());
                buttons.sort_by_key(|b| b.id);
            }
        })
        .await;
    }

    pub async fn remove_paybutton_from_addresses_cache(&self, addresses: &[Address], button_id: i64) {
        self.update_paybuttons(addresses, |buttons| buttons.retain(|b| b.id != button_id))
            .await;
    }

    /// All cached payments of an address, newest first. Builds the
    /// address's buckets on first use.
    pub async fn payments_for_address(&self, address: &Address) -> Result<Vec<Payment>, sqlx::Error> {
        if !self.is_initialized(&address.address) {
            self.rebuild_address(address).await?;
        }

        let keys = self.index.get(&address.address).await.unwrap_or_default();
        let mut payments = Vec::new();
        for key in keys.iter().rev() {
            if let Some(bucket) = self.weeks.get(key).await {
                payments.extend(bucket.into_iter().rev());
            }
        }
        Ok(payments)
    }

    /// Contents of every built bucket keyed by its string form.
    pub async fn snapshot(&self) -> BTreeMap<String, Vec<Payment>> {
        let _guard = self.write_lock.lock().await;
        let all_keys: Vec<BTreeSet<CacheKey>> = self.index.iter().map(|(_, keys)| keys).collect();
        let mut out = BTreeMap::new();
        for keys in all_keys {
            for key in keys {
                if let Some(bucket) = self.weeks.get(&key).await {
                    out.insert(key.to_string(), bucket);
                }
            }
        }
        out
    }

    /// Received total and payment count of an address, computed from the
    /// store on a miss.
    pub async fn balance(&self, address: &Address) -> Result<AddressBalance, sqlx::Error> {
        let key = CacheKey::balance(&address.address);
        if let Some(balance) = self.balances.get(&key).await {
            return Ok(balance);
        }

        let txs = tx_db::fetch_transactions_for_address(&self.pool, address.id).await?;
        let balance = AddressBalance {
            balance: txs.iter().map(|t| t.amount).sum(),
            payment_count: txs.iter().filter(|t| t.amount > Decimal::ZERO).count(),
        };
        self.balances.insert(key, balance).await;
        Ok(balance)
    }
}
