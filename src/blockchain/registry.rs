use crate::blockchain::client::{ChronikClient, ChronikOptions, ClientError, IndexerClient};
use crate::config::Config;
use crate::models::{Address, Network, SyncReport};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub network: Network,
    pub urls: Vec<String>,
    pub active_url: Option<String>,
    pub connected: bool,
    pub last_block_timestamp: Option<i64>,
}

/// Anything carrying a prefixed cashaddr.
pub trait AddressLike {
    fn address_str(&self) -> &str;
}

impl AddressLike for String {
    fn address_str(&self) -> &str {
        self
    }
}

impl AddressLike for Address {
    fn address_str(&self) -> &str {
        &self.address
    }
}

/// One indexer client per configured network.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<Network, Arc<dyn IndexerClient>>,
}

impl ClientRegistry {
    pub fn new(clients: Vec<Arc<dyn IndexerClient>>) -> Self {
        let clients = clients.into_iter().map(|c| (c.network(), c)).collect();
        Self { clients }
    }

    /// Builds and starts a Chronik client for every network with URLs.
    pub fn from_config(config: &Config, shutdown: &CancellationToken) -> Result<Self, ClientError> {
        let options = ChronikOptions::from_config(config);
        let mut clients: Vec<Arc<dyn IndexerClient>> = Vec::new();
        for network in Network::ALL {
            let urls = config.indexer_urls(network).to_vec();
            if urls.is_empty() {
                warn!("No indexer URLs for {}, network disabled", network);
                continue;
            }
            let client = ChronikClient::new(network, urls, options.clone())?;
            client.start(shutdown.child_token());
            clients.push(Arc::new(client));
        }
        info!("Client registry ready for {} networks", clients.len());
        Ok(Self::new(clients))
    }

    pub fn client(&self, network: Network) -> Option<Arc<dyn IndexerClient>> {
        self.clients.get(&network).cloned()
    }

    pub fn networks(&self) -> Vec<Network> {
        let mut networks: Vec<Network> = self.clients.keys().copied().collect();
        networks.sort_by_key(|n| n.id());
        networks
    }

    /// Splits addresses by cashaddr prefix. Addresses with no known prefix
    /// come back in the failure report.
    pub fn group_by_network<T: AddressLike>(&self, items: Vec<T>) -> (HashMap<Network, Vec<T>>, SyncReport) {
        let mut groups: HashMap<Network, Vec<T>> = HashMap::new();
        let mut report = SyncReport::default();
        for item in items {
            let address = item.address_str();
            match Network::from_address(address) {
                Some(network) => groups.entry(network).or_default().push(item),
                None => report.record_failure(address, "Address has no known network prefix"),
            }
        }
        (groups, report)
    }

    /// Runs `op` for every group concurrently. A network without a client
    /// fails its own addresses and nothing else.
    pub async fn fan_out<T, F, Fut>(&self, groups: HashMap<Network, Vec<T>>, op: F) -> SyncReport
    where
        T: AddressLike,
        F: Fn(Arc<dyn IndexerClient>, Vec<T>) -> Fut,
        Fut: Future<Output = SyncReport>,
    {
        let mut report = SyncReport::default();
        let mut pending = Vec::new();
        for (network, items) in groups {
            match self.client(network) {
                Some(client) => pending.push(op(client, items)),
                None => {
                    for item in &items {
                        report.record_failure(item.address_str(), format!("No indexer client for {}", network));
                    }
                }
            }
        }
        for partial in join_all(pending).await {
            report.merge(partial);
        }
        report
    }

    pub fn all_subscribed_addresses(&self) -> BTreeMap<Network, Vec<String>> {
        self.clients
            .iter()
            .map(|(network, client)| (*network, client.subscribed_addresses()))
            .collect()
    }

    pub async fn status(&self) -> Vec<NetworkStatus> {
        let mut out = Vec::new();
        for network in self.networks() {
            let Some(client) = self.client(network) else {
                continue;
            };
            let connection = client.connection_status();
            let last_block_timestamp = match client.last_block_timestamp().await {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!("Could not read {} tip: {}", network, e);
                    None
                }
            };
            out.push(NetworkStatus {
                network,
                urls: client.urls(),
                active_url: connection.active_url,
                connected: connection.connected,
                last_block_timestamp,
            });
        }
        out
    }
}
