//! Shared fixtures: in-memory store, transaction builders and a scripted
//! indexer.

use crate::blockchain::cashaddr::{self, AddressKind};
use crate::blockchain::client::{
    ClientError, ConnectionStatus, IndexerClient, SubscribeOutcome, SubscriptionHandle, TxListener,
};
use crate::blockchain::models::{BlockMeta, ChronikTx, NativeTx, TxInput, TxOutput};
use crate::blockchain::normalizer::related_addresses;
use crate::blockchain::registry::ClientRegistry;
use crate::blockchain::sync::{SyncEngine, SyncOptions};
use crate::cache::PaymentCache;
use crate::db::connection::establish_connection;
use crate::dispatch::{LogMailer, TriggerDispatcher};
use crate::models::Network;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const BASE_TS: i64 = 1_700_000_000;

pub async fn test_pool() -> SqlitePool {
    establish_connection("sqlite::memory:")
        .await
        .expect("in-memory database")
}

/// Deterministic P2PKH address whose hash is `byte` repeated.
pub fn addr(network: Network, byte: u8) -> String {
    cashaddr::encode(network, AddressKind::P2pkh, &[byte; 20])
}

pub fn script(address: &str) -> String {
    cashaddr::decode(address).expect("valid address").output_script()
}

/// `inputs` spend from and `outputs` pay to the given addresses.
pub fn chronik_tx(txid: &str, inputs: &[(&str, i64)], outputs: &[(&str, i64)], block_ts: Option<i64>) -> ChronikTx {
    ChronikTx {
        txid: txid.to_string(),
        inputs: inputs
            .iter()
            .map(|(a, sats)| TxInput {
                output_script: Some(script(a)),
                sats: *sats,
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(a, sats)| TxOutput {
                output_script: script(a),
                sats: *sats,
            })
            .collect(),
        block: block_ts.map(|ts| BlockMeta {
            height: 800_000,
            hash: format!("block-{}", ts),
            timestamp: ts,
        }),
        time_first_seen: block_ts.unwrap_or(BASE_TS),
    }
}

pub fn native(network: Network, tx: ChronikTx) -> NativeTx {
    NativeTx::new(network, tx)
}

/// Indexer double driven entirely by test data.
pub struct MockIndexer {
    network: Network,
    history: Mutex<HashMap<String, Vec<NativeTx>>>,
    failing: Mutex<HashSet<String>>,
    registrations: Mutex<Vec<(SubscriptionHandle, Vec<String>, Arc<dyn TxListener>)>>,
    next_handle: AtomicU64,
    pub history_calls: AtomicUsize,
    /// "history:<address>" and "subscribe:<address>" in call order
    pub events: Mutex<Vec<String>>,
}

impl MockIndexer {
    pub fn new(network: Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            history: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            registrations: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            history_calls: AtomicUsize::new(0),
            events: Mutex::new(Vec::new()),
        })
    }

    /// Sets the history of `address`, newest first.
    pub fn set_history(&self, address: &str, txs: Vec<ChronikTx>) {
        let txs = txs.into_iter().map(|t| NativeTx::new(self.network, t)).collect();
        self.history.lock().unwrap().insert(address.to_string(), txs);
    }

    pub fn fail_history_for(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn listeners_for(&self, tx: &NativeTx) -> Vec<Arc<dyn TxListener>> {
        let related = related_addresses(tx);
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, addresses, _)| addresses.iter().any(|a| related.contains(a)))
            .map(|(_, _, l)| l.clone())
            .collect()
    }

    /// Delivers `tx` the way the websocket would.
    pub async fn push(&self, tx: ChronikTx) {
        let native = NativeTx::new(self.network, tx);
        let confirmed = native.is_confirmed();
        for listener in self.listeners_for(&native) {
            if confirmed {
                listener.on_confirmed(native.clone()).await;
            } else {
                listener.on_unconfirmed(native.clone()).await;
            }
        }
    }
}

#[async_trait]
impl IndexerClient for MockIndexer {
    fn network(&self) -> Network {
        self.network
    }

    fn urls(&self) -> Vec<String> {
        vec![format!("mock://{}", self.network)]
    }

    async fn history_page(&self, address: &str, page: u32, page_size: u32) -> Result<Vec<NativeTx>, ClientError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(format!("history:{}", address));
        if self.failing.lock().unwrap().contains(address) {
            return Err(ClientError::Status {
                url: "mock".to_string(),
                status: 503,
            });
        }
        let history = self.history.lock().unwrap();
        let txs = history.get(address).cloned().unwrap_or_default();
        Ok(txs
            .into_iter()
            .skip((page * page_size) as usize)
            .take(page_size as usize)
            .collect())
    }

    async fn transaction(&self, txid: &str) -> Result<NativeTx, ClientError> {
        let history = self.history.lock().unwrap();
        history
            .values()
            .flatten()
            .find(|t| t.txid() == txid)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(txid.to_string()))
    }

    async fn last_block_timestamp(&self) -> Result<i64, ClientError> {
        Ok(BASE_TS)
    }

    async fn subscribe(&self, addresses: &[String], listener: Arc<dyn TxListener>) -> SubscribeOutcome {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let mut subscribed = Vec::new();
        let mut failed = Vec::new();
        for address in addresses {
            if Network::from_address(address) == Some(self.network) {
                self.events.lock().unwrap().push(format!("subscribe:{}", address));
                subscribed.push(address.clone());
            } else {
                failed.push((address.clone(), "wrong network".to_string()));
            }
        }
        self.registrations
            .lock()
            .unwrap()
            .push((handle, subscribed.clone(), listener));
        SubscribeOutcome { handle, subscribed, failed }
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.registrations.lock().unwrap().retain(|(h, _, _)| *h != handle);
    }

    fn subscribed_addresses(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .registrations
            .lock()
            .unwrap()
            .iter()
            .flat_map(|(_, addresses, _)| addresses.clone())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    fn connection_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            active_url: Some(format!("mock://{}", self.network)),
            connected: true,
        }
    }
}

pub struct Harness {
    pub pool: SqlitePool,
    pub engine: Arc<SyncEngine>,
    pub ecash: Arc<MockIndexer>,
    pub bch: Arc<MockIndexer>,
}

pub async fn harness() -> Harness {
    let pool = test_pool().await;
    let ecash = MockIndexer::new(Network::Ecash);
    let bch = MockIndexer::new(Network::BitcoinCash);
    let registry = Arc::new(ClientRegistry::new(vec![
        ecash.clone() as Arc<dyn IndexerClient>,
        bch.clone() as Arc<dyn IndexerClient>,
    ]));
    let engine = Arc::new(engine_for(&pool, registry));
    Harness { pool, engine, ecash, bch }
}

pub fn engine_for(pool: &SqlitePool, registry: Arc<ClientRegistry>) -> SyncEngine {
    let cache = PaymentCache::new(pool.clone(), Duration::from_secs(60), 1_000);
    let dispatcher =
        TriggerDispatcher::new(pool.clone(), Duration::from_secs(2), Arc::new(LogMailer)).expect("http client");
    SyncEngine::new(
        pool.clone(),
        registry,
        cache,
        dispatcher,
        SyncOptions {
            page_size: 2,
            concurrency: 4,
        },
    )
}
