use crate::blockchain::cashaddr::{self, CashAddrError, DecodedAddress};
use crate::blockchain::models::{BlockResponse, BlockchainInfo, ChronikTx, NativeTx, TxHistoryPage};
use crate::blockchain::subscription::{HubOptions, SubscriptionHub};
use crate::config::Config;
use crate::models::Network;
use async_trait::async_trait;
use futures::stream::{self, Stream};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Indexer {url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid address {address}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: CashAddrError,
    },

    #[error("Address {address} does not belong to {network}")]
    WrongNetwork { address: String, network: Network },

    #[error("No indexer URLs configured for {0}")]
    NoUrls(Network),

    #[error("Indexer returned malformed data: {0}")]
    Decode(String),
}

/// Receives pushed transactions for subscribed addresses.
#[async_trait]
pub trait TxListener: Send + Sync {
    async fn on_unconfirmed(&self, tx: NativeTx);
    async fn on_confirmed(&self, tx: NativeTx);
    async fn on_removed_from_mempool(&self, network: Network, txid: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOutcome {
    pub handle: SubscriptionHandle,
    pub subscribed: Vec<String>,
    /// Addresses that could not be registered, with the reason.
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub active_url: Option<String>,
    pub connected: bool,
}

/// Where a history walk resumes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HistoryCursor {
    /// Confirmed transactions older than this are skipped and end the walk.
    pub since: Option<i64>,
    pub start_page: u32,
}

#[async_trait]
pub trait IndexerClient: Send + Sync {
    fn network(&self) -> Network;

    fn urls(&self) -> Vec<String>;

    /// One page of an address's history, newest first.
    async fn history_page(&self, address: &str, page: u32, page_size: u32) -> Result<Vec<NativeTx>, ClientError>;

    async fn transaction(&self, txid: &str) -> Result<NativeTx, ClientError>;

    async fn last_block_timestamp(&self) -> Result<i64, ClientError>;

    async fn subscribe(&self, addresses: &[String], listener: Arc<dyn TxListener>) -> SubscribeOutcome;

    async fn unsubscribe(&self, handle: SubscriptionHandle);

    fn subscribed_addresses(&self) -> Vec<String>;

    fn connection_status(&self) -> ConnectionStatus;
}

/// Lazily pages through an address's history, newest first.
///
/// Unconfirmed transactions are always yielded. Confirmed ones older than
/// the cursor or the network's fork threshold are dropped, and the first
/// page reaching that far back is the last one fetched.
pub fn address_history<'a>(
    client: &'a dyn IndexerClient,
    address: &'a str,
    cursor: HistoryCursor,
    page_size: u32,
) -> impl Stream<Item = Result<Vec<NativeTx>, ClientError>> + Send + 'a {
    let floor = cursor
        .since
        .unwrap_or(i64::MIN)
        .max(client.network().timestamp_threshold());

    stream::try_unfold(Some(cursor.start_page), move |page| async move {
        let Some(page) = page else {
            return Ok(None);
        };

        let txs = client.history_page(address, page, page_size).await?;
        if txs.is_empty() {
            return Ok(None);
        }

        let fetched = txs.len();
        let oldest_confirmed = txs
            .iter()
            .filter(|t| t.is_confirmed())
            .map(|t| t.tx().timestamp())
            .min();
        let kept: Vec<NativeTx> = txs
            .into_iter()
            .filter(|t| !t.is_confirmed() || t.tx().timestamp() >= floor)
            .collect();

        let reached_floor = oldest_confirmed.map_or(false, |ts| ts < floor);
        let next = if fetched as u32 >= page_size && !reached_floor {
            Some(page + 1)
        } else {
            None
        };
        debug!("History page {} of {}: {} fetched, {} kept", page, address, fetched, kept.len());

        Ok(Some((kept, next)))
    })
}

pub(crate) fn decode_for(network: Network, address: &str) -> Result<DecodedAddress, ClientError> {
    let decoded = cashaddr::decode(address).map_err(|source| ClientError::InvalidAddress {
        address: address.to_string(),
        source,
    })?;
    if decoded.network != network {
        return Err(ClientError::WrongNetwork {
            address: address.to_string(),
            network,
        });
    }
    Ok(decoded)
}

/// HTTP side of a Chronik indexer with ordered URL failover.
#[derive(Clone)]
pub struct ChronikHttp {
    network: Network,
    urls: Arc<Vec<String>>,
    active: Arc<AtomicUsize>,
    client: reqwest::Client,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl ChronikHttp {
    pub fn new(
        network: Network,
        urls: Vec<String>,
        timeout: Duration,
        rate_limit: Option<u32>,
    ) -> Result<Self, ClientError> {
        if urls.is_empty() {
            return Err(ClientError::NoUrls(network));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let limiter = rate_limit
            .and_then(NonZeroU32::new)
            .map(|per_sec| Arc::new(RateLimiter::direct(Quota::per_second(per_sec))));

        Ok(Self {
            network,
            urls: Arc::new(urls),
            active: Arc::new(AtomicUsize::new(0)),
            client,
            limiter,
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    pub fn active_url(&self) -> &str {
        &self.urls[self.active.load(Ordering::Relaxed) % self.urls.len()]
    }

    /// GETs `path` from the active URL, moving on to the next URL when a
    /// server is unreachable or failing.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let count = self.urls.len();
        let start = self.active.load(Ordering::Relaxed) % count;
        let mut last_error = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let url = format!("{}{}", self.urls[index], path);
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_server_error() {
                        warn!("Indexer {} answered {} for {}", self.urls[index], status, path);
                        last_error = Some(ClientError::Status { url, status: status.as_u16() });
                        continue;
                    }
                    if index != start {
                        info!("{} indexer failed over to {}", self.network, self.urls[index]);
                        self.active.store(index, Ordering::Relaxed);
                    }
                    if status == reqwest::StatusCode::NOT_FOUND {
                        return Err(ClientError::NotFound(path.to_string()));
                    }
                    if !status.is_success() {
                        return Err(ClientError::Status { url, status: status.as_u16() });
                    }
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| ClientError::Decode(format!("{}: {}", path, e)));
                }
                Err(e) => {
                    warn!("Indexer {} unreachable: {}", self.urls[index], e);
                    last_error = Some(ClientError::Http(e));
                }
            }
        }

        Err(last_error.unwrap_or(ClientError::NoUrls(self.network)))
    }

    pub async fn history_page(&self, address: &str, page: u32, page_size: u32) -> Result<Vec<NativeTx>, ClientError> {
        let decoded = decode_for(self.network, address)?;
        let path = format!(
            "/script/{}/{}/history?page={}&page_size={}",
            decoded.kind.script_type(),
            decoded.hash_hex(),
            page,
            page_size
        );
        let history: TxHistoryPage = self.get_json(&path).await?;
        Ok(history
            .txs
            .into_iter()
            .map(|tx| NativeTx::new(self.network, tx))
            .collect())
    }

    pub async fn transaction(&self, txid: &str) -> Result<NativeTx, ClientError> {
        let tx: ChronikTx = self.get_json(&format!("/tx/{}", txid)).await?;
        Ok(NativeTx::new(self.network, tx))
    }

    pub async fn last_block_timestamp(&self) -> Result<i64, ClientError> {
        let info: BlockchainInfo = self.get_json("/blockchain-info").await?;
        let block: BlockResponse = self.get_json(&format!("/block/{}", info.tip_height)).await?;
        Ok(block.block_info.timestamp)
    }
}

/// Tuning of one Chronik client.
#[derive(Debug, Clone)]
pub struct ChronikOptions {
    pub timeout: Duration,
    pub rate_limit: Option<u32>,
    pub hub: HubOptions,
}

impl ChronikOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.indexer_timeout,
            rate_limit: config.indexer_rate_limit,
            hub: HubOptions {
                reconnect: config.reconnect_policy(),
                dedupe_ttl: config.message_dedupe_ttl,
                max_mempool_in_flight: config.max_mempool_txs_in_flight,
            },
        }
    }
}

/// Indexer client for one network backed by Chronik HTTP and websocket
/// endpoints.
pub struct ChronikClient {
    http: ChronikHttp,
    hub: SubscriptionHub,
}

impl ChronikClient {
    pub fn new(network: Network, urls: Vec<String>, options: ChronikOptions) -> Result<Self, ClientError> {
        let http = ChronikHttp::new(network, urls, options.timeout, options.rate_limit)?;
        let hub = SubscriptionHub::new(network, options.hub);
        info!("Initialized {} indexer client with {:?}", network, http.urls());
        Ok(Self { http, hub })
    }

    /// Starts the websocket connection task. Subscriptions made before this
    /// are sent once the first connection is up.
    pub fn start(&self, shutdown: CancellationToken) {
        self.hub.start(self.http.clone(), shutdown);
    }
}

#[async_trait]
impl IndexerClient for ChronikClient {
    fn network(&self) -> Network {
        self.http.network
    }

    fn urls(&self) -> Vec<String> {
        self.http.urls().to_vec()
    }

    async fn history_page(&self, address: &str, page: u32, page_size: u32) -> Result<Vec<NativeTx>, ClientError> {
        self.http.history_page(address, page, page_size).await
    }

    async fn transaction(&self, txid: &str) -> Result<NativeTx, ClientError> {
        self.http.transaction(txid).await
    }

    async fn last_block_timestamp(&self) -> Result<i64, ClientError> {
        self.http.last_block_timestamp().await
    }

    async fn subscribe(&self, addresses: &[String], listener: Arc<dyn TxListener>) -> SubscribeOutcome {
        self.hub.subscribe(addresses, listener)
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.hub.unsubscribe(handle)
    }

    fn subscribed_addresses(&self) -> Vec<String> {
        self.hub.subscribed_addresses()
    }

    fn connection_status(&self) -> ConnectionStatus {
        self.hub.status()
    }
}
