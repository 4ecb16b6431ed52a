//! Live address subscriptions over the Chronik websocket.

use crate::blockchain::cashaddr;
use crate::blockchain::client::{decode_for, ChronikHttp, ClientError, ConnectionStatus, SubscribeOutcome, SubscriptionHandle, TxListener};
use crate::blockchain::models::{NativeTx, TxMsgType, WsMessage, WsRequest};
use crate::blockchain::normalizer::related_addresses;
use crate::models::Network;
use crate::scheduler::{with_retry, RetryPolicy};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use moka::future::Cache;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub reconnect: RetryPolicy,
    pub dedupe_ttl: Duration,
    pub max_mempool_in_flight: usize,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            reconnect: RetryPolicy {
                max_attempts: usize::MAX,
                base_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(60),
            },
            dedupe_ttl: Duration::from_secs(600),
            max_mempool_in_flight: 16,
        }
    }
}

struct Registration {
    addresses: Vec<String>,
    listener: Arc<dyn TxListener>,
}

enum HubCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct HubInner {
    network: Network,
    options: HubOptions,
    registrations: RwLock<HashMap<SubscriptionHandle, Registration>>,
    next_handle: AtomicU64,
    connected: AtomicBool,
    active_url: RwLock<Option<String>>,
    seen: Cache<String, ()>,
    mempool: Arc<Semaphore>,
    commands: mpsc::UnboundedSender<HubCommand>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<HubCommand>>>,
}

/// Tracks which addresses are subscribed and owns the websocket task that
/// delivers their transactions to listeners.
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl SubscriptionHub {
    pub fn new(network: Network, options: HubOptions) -> Self {
        let (commands, receiver) = mpsc::unbounded_channel();
        let seen = Cache::builder()
            .time_to_live(options.dedupe_ttl)
            .max_capacity(100_000)
            .build();
        let mempool = Arc::new(Semaphore::new(options.max_mempool_in_flight.max(1)));

        Self {
            inner: Arc::new(HubInner {
                network,
                options,
                registrations: RwLock::new(HashMap::new()),
                next_handle: AtomicU64::new(1),
                connected: AtomicBool::new(false),
                active_url: RwLock::new(None),
                seen,
                mempool,
                commands,
                pending: Mutex::new(Some(receiver)),
            }),
        }
    }

    /// Spawns the connection task. Only the first call has any effect.
    pub fn start(&self, http: ChronikHttp, shutdown: CancellationToken) {
        let receiver = match self.inner.pending.lock() {
            Ok(mut pending) => pending.take(),
            Err(_) => None,
        };
        let Some(receiver) = receiver else {
            warn!("{} subscription hub already started", self.inner.network);
            return;
        };
        let hub = self.clone();
        tokio::spawn(async move { hub.run(http, receiver, shutdown).await });
    }

    pub fn subscribe(&self, addresses: &[String], listener: Arc<dyn TxListener>) -> SubscribeOutcome {
        let mut subscribed = Vec::new();
        let mut failed = Vec::new();
        for address in addresses {
            match decode_for(self.inner.network, address) {
                Ok(_) => subscribed.push(address.trim().to_ascii_lowercase()),
                Err(e) => failed.push((address.clone(), e.to_string())),
            }
        }
        subscribed.sort();
        subscribed.dedup();

        let handle = SubscriptionHandle(self.inner.next_handle.fetch_add(1, Ordering::Relaxed));
        let fresh: Vec<String> = {
            let already: BTreeSet<String> = self.subscribed_addresses().into_iter().collect();
            subscribed.iter().filter(|a| !already.contains(*a)).cloned().collect()
        };
        if let Ok(mut registrations) = self.inner.registrations.write() {
            registrations.insert(
                handle,
                Registration {
                    addresses: subscribed.clone(),
                    listener,
                },
            );
        }
        if !fresh.is_empty() {
            let _ = self.inner.commands.send(HubCommand::Subscribe(fresh));
        }

        info!(
            "Subscribed {} {} addresses ({} failed)",
            subscribed.len(),
            self.inner.network,
            failed.len()
        );
        SubscribeOutcome { handle, subscribed, failed }
    }

    pub fn unsubscribe(&self, handle: SubscriptionHandle) {
        let removed = match self.inner.registrations.write() {
            Ok(mut registrations) => registrations.remove(&handle),
            Err(_) => None,
        };
        let Some(removed) = removed else {
            return;
        };
        let remaining: BTreeSet<String> = self.subscribed_addresses().into_iter().collect();
        let dropped: Vec<String> = removed
            .addresses
            .into_iter()
            .filter(|a| !remaining.contains(a))
            .collect();
        if !dropped.is_empty() {
            debug!("Unsubscribing {} {} addresses", dropped.len(), self.inner.network);
            let _ = self.inner.commands.send(HubCommand::Unsubscribe(dropped));
        }
    }

    pub fn subscribed_addresses(&self) -> Vec<String> {
        let Ok(registrations) = self.inner.registrations.read() else {
            return Vec::new();
        };
        let all: BTreeSet<&String> = registrations.values().flat_map(|r| r.addresses.iter()).collect();
        all.into_iter().cloned().collect()
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            active_url: self.inner.active_url.read().ok().and_then(|url| url.clone()),
            connected: self.inner.connected.load(Ordering::Relaxed),
        }
    }

    fn set_connected(&self, url: Option<String>) {
        self.inner.connected.store(url.is_some(), Ordering::Relaxed);
        if let Ok(mut active) = self.inner.active_url.write() {
            if url.is_some() {
                *active = url;
            }
        }
    }

    /// Listeners interested in any of `addresses`, each listed once.
    fn listeners_for(&self, addresses: &[String]) -> Vec<Arc<dyn TxListener>> {
        let Ok(registrations) = self.inner.registrations.read() else {
            return Vec::new();
        };
        let mut out: Vec<Arc<dyn TxListener>> = Vec::new();
        for registration in registrations.values() {
            if registration.addresses.iter().any(|a| addresses.contains(a)) {
                push_unique(&mut out, &registration.listener);
            }
        }
        out
    }

    fn all_listeners(&self) -> Vec<Arc<dyn TxListener>> {
        let Ok(registrations) = self.inner.registrations.read() else {
            return Vec::new();
        };
        let mut out: Vec<Arc<dyn TxListener>> = Vec::new();
        for registration in registrations.values() {
            push_unique(&mut out, &registration.listener);
        }
        out
    }

    async fn run(
        self,
        http: ChronikHttp,
        mut commands: mpsc::UnboundedReceiver<HubCommand>,
        shutdown: CancellationToken,
    ) {
        let network = self.inner.network;
        let urls = http.urls().to_vec();
        let mut url_index = 0usize;
        let mut attempt = 0u32;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let url = websocket_url(&urls[url_index % urls.len()]);
            info!("Connecting {} websocket to {}", network, url);
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    attempt = 0;
                    self.set_connected(Some(url.clone()));
                    info!("{} websocket connected to {}", network, url);
                    let end = self.session(stream, &http, &mut commands, &shutdown).await;
                    self.set_connected(None);
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => warn!("{} websocket {} lost: {}", network, url, reason),
                    }
                }
                Err(e) => {
                    error!("{} websocket connection to {} failed: {}", network, url, e);
                    url_index += 1;
                }
            }

            let delay = self.inner.options.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            debug!("Reconnecting {} websocket in {:?}", network, delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!("{} websocket task stopped", network);
    }

    async fn session(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
        http: &ChronikHttp,
        commands: &mut mpsc::UnboundedReceiver<HubCommand>,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        // the full set is re-sent below, queued deltas are stale
        while commands.try_recv().is_ok() {}

        if let Err(e) = send_request(&mut write, &WsRequest::Blocks { subscribe: true }).await {
            return SessionEnd::Lost(e);
        }
        let addresses = self.subscribed_addresses();
        for address in &addresses {
            if let Err(e) = send_script(&mut write, address, true).await {
                return SessionEnd::Lost(e);
            }
        }
        info!("Resubscribed {} {} addresses", addresses.len(), self.inner.network);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.close().await;
                    return SessionEnd::Shutdown;
                }
                Some(command) = commands.recv() => {
                    let (addresses, subscribe) = match command {
                        HubCommand::Subscribe(addresses) => (addresses, true),
                        HubCommand::Unsubscribe(addresses) => (addresses, false),
                    };
                    for address in &addresses {
                        if let Err(e) = send_script(&mut write, address, subscribe).await {
                            return SessionEnd::Lost(e);
                        }
                    }
                }
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text, http),
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                }
            }
        }
    }

    fn handle_text(&self, text: &str, http: &ChronikHttp) {
        let message: WsMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed {} websocket message: {}", self.inner.network, e);
                return;
            }
        };

        match message {
            WsMessage::Tx { msg_type, txid } => {
                let hub = self.clone();
                let http = http.clone();
                tokio::spawn(async move { hub.process_tx(&http, msg_type, txid).await });
            }
            WsMessage::Block { msg_type, block_hash, block_height } => {
                info!("{} [{}] height {} hash {}", self.inner.network, msg_type, block_height, block_hash);
            }
            WsMessage::Error { msg } => {
                error!("{} indexer reported: {}", self.inner.network, msg);
            }
        }
    }

    /// Routes one transaction notification to its listeners. Errors stay
    /// inside this task.
    pub(crate) async fn process_tx<F>(&self, fetcher: &F, msg_type: TxMsgType, txid: String)
    where
        F: TxFetcher + ?Sized,
    {
        let network = self.inner.network;
        let key = format!("{}:{:?}", txid, msg_type);
        if !self.inner.seen.entry(key).or_insert(()).await.is_fresh() {
            debug!("Dropping duplicate {:?} for {}", msg_type, txid);
            return;
        }
        info!("{} [{:?}] {}", network, msg_type, txid);

        match msg_type {
            TxMsgType::TxRemovedFromMempool => {
                for listener in self.all_listeners() {
                    listener.on_removed_from_mempool(network, &txid).await;
                }
            }
            TxMsgType::TxAddedToMempool => {
                let Ok(_permit) = self.inner.mempool.clone().acquire_owned().await else {
                    return;
                };
                if let Some(tx) = self.fetch(fetcher, &txid).await {
                    for listener in self.listeners_for(&related_addresses(&tx)) {
                        listener.on_unconfirmed(tx.clone()).await;
                    }
                }
            }
            TxMsgType::TxConfirmed => {
                if let Some(tx) = self.fetch(fetcher, &txid).await {
                    for listener in self.listeners_for(&related_addresses(&tx)) {
                        listener.on_confirmed(tx.clone()).await;
                    }
                }
            }
            TxMsgType::TxFinalized => {}
        }
    }

    /// Fresh mempool transactions may not be served yet; a few retries
    /// cover that window.
    async fn fetch<F>(&self, fetcher: &F, txid: &str) -> Option<NativeTx>
    where
        F: TxFetcher + ?Sized,
    {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        };
        match with_retry(&policy, "fetchTx", move || async move { fetcher.fetch_tx(txid).await }).await {
            Ok(tx) => Some(tx),
            Err(e) => {
                error!("Could not fetch {} transaction {}: {}", self.inner.network, txid, e);
                None
            }
        }
    }
}

/// Source of full transactions for notifications that only carry a txid.
#[async_trait::async_trait]
pub(crate) trait TxFetcher: Send + Sync {
    async fn fetch_tx(&self, txid: &str) -> Result<NativeTx, ClientError>;
}

#[async_trait::async_trait]
impl TxFetcher for ChronikHttp {
    async fn fetch_tx(&self, txid: &str) -> Result<NativeTx, ClientError> {
        self.transaction(txid).await
    }
}

fn push_unique(out: &mut Vec<Arc<dyn TxListener>>, listener: &Arc<dyn TxListener>) {
    let ptr = Arc::as_ptr(listener) as *const ();
    if !out.iter().any(|l| Arc::as_ptr(l) as *const () == ptr) {
        out.push(listener.clone());
    }
}

fn websocket_url(http_url: &str) -> String {
    let base = if let Some(rest) = http_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = http_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        http_url.to_string()
    };
    format!("{}/ws", base.trim_end_matches('/'))
}

async fn send_request(write: &mut WsSink, request: &WsRequest) -> Result<(), String> {
    let text = serde_json::to_string(request).map_err(|e| e.to_string())?;
    write.send(Message::Text(text)).await.map_err(|e| e.to_string())
}

async fn send_script(write: &mut WsSink, address: &str, subscribe: bool) -> Result<(), String> {
    let decoded = match cashaddr::decode(address) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Not sending subscription for {}: {}", address, e);
            return Ok(());
        }
    };
    let request = WsRequest::Script {
        subscribe,
        script_type: decoded.kind.script_type().to_string(),
        payload: decoded.hash_hex(),
    };
    send_request(write, &request).await
}
