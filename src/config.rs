use crate::models::Network;
use crate::scheduler::RetryPolicy;
use dotenv::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub server_host: String,
    pub server_port: u16,
    pub ecash_indexer_urls: Vec<String>,
    pub bitcoincash_indexer_urls: Vec<String>,
    pub indexer_timeout: Duration,
    pub indexer_rate_limit: Option<u32>,
    pub history_page_size: u32,
    pub address_sync_concurrency: usize,
    pub sweep_interval: Duration,
    pub webhook_timeout: Duration,
    pub cache_ttl: Duration,
    pub cache_max_capacity: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay: Duration,
    pub retry_multiplier: f32,
    pub retry_max_delay: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub message_dedupe_ttl: Duration,
    pub max_mempool_txs_in_flight: usize,
}

fn var_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn url_list(name: &str, default: &str) -> Vec<String> {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|u| u.trim().trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:paybutton.db".to_string());
        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let server_port = var_or("SERVER_PORT", 8080);
        let ecash_indexer_urls = url_list("ECASH_INDEXER_URLS", "https://chronik.e.cash");
        let bitcoincash_indexer_urls = url_list("BITCOINCASH_INDEXER_URLS", "https://chronik.pay2stay.com/bch");
        let indexer_timeout = Duration::from_secs(var_or("INDEXER_TIMEOUT_SECS", 30));
        let indexer_rate_limit = env::var("INDEXER_RATE_LIMIT")
            .map(|v| v.parse().ok())
            .unwrap_or(None);
        let history_page_size = var_or("HISTORY_PAGE_SIZE", 200);
        let address_sync_concurrency = var_or("ADDRESS_SYNC_CONCURRENCY", num_cpus::get().max(2) * 2);
        let sweep_interval = Duration::from_secs(var_or("SWEEP_INTERVAL_SECS", 300));
        let webhook_timeout = Duration::from_millis(var_or("WEBHOOK_TIMEOUT_MS", 3000));
        let cache_ttl = Duration::from_secs(var_or("CACHE_TTL", 60));
        let cache_max_capacity = var_or("CACHE_MAX_CAPACITY", 10_000);
        let retry_max_attempts = var_or("RETRY_MAX_ATTEMPTS", 3);
        let retry_base_delay = Duration::from_millis(var_or("RETRY_BASE_DELAY_MS", 2000));
        let retry_multiplier = var_or("RETRY_MULTIPLIER", 2.0);
        let retry_max_delay = Duration::from_millis(var_or("RETRY_MAX_DELAY_MS", 60_000));
        let reconnect_base_delay = Duration::from_millis(var_or("RECONNECT_BASE_DELAY_MS", 1000));
        let reconnect_max_delay = Duration::from_millis(var_or("RECONNECT_MAX_DELAY_MS", 60_000));
        let message_dedupe_ttl = Duration::from_secs(var_or("MESSAGE_DEDUP_TTL_SECS", 600));
        let max_mempool_txs_in_flight = var_or("MAX_MEMPOOL_TXS_IN_FLIGHT", 16);

        Self {
            database_url,
            server_host,
            server_port,
            ecash_indexer_urls,
            bitcoincash_indexer_urls,
            indexer_timeout,
            indexer_rate_limit,
            history_page_size,
            address_sync_concurrency,
            sweep_interval,
            webhook_timeout,
            cache_ttl,
            cache_max_capacity,
            retry_max_attempts,
            retry_base_delay,
            retry_multiplier,
            retry_max_delay,
            reconnect_base_delay,
            reconnect_max_delay,
            message_dedupe_ttl,
            max_mempool_txs_in_flight,
        }
    }

    /// Indexer URLs of a network in failover order.
    pub fn indexer_urls(&self, network: Network) -> &[String] {
        match network {
            Network::Ecash => &self.ecash_indexer_urls,
            Network::BitcoinCash => &self.bitcoincash_indexer_urls,
        }
    }

    /// Policy wrapped around scheduler-invoked sync jobs.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: self.retry_base_delay,
            multiplier: self.retry_multiplier,
            max_delay: self.retry_max_delay,
        }
    }

    /// Backoff between websocket reconnects; attempts are unbounded.
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: usize::MAX,
            base_delay: self.reconnect_base_delay,
            multiplier: 2.0,
            max_delay: self.reconnect_max_delay,
        }
    }
}
