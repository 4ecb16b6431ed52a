//! Recurring and one-shot invocation of the sync entry points.

use crate::blockchain::sync::{SyncEngine, SyncError};
use crate::models::{Network, SyncReport};
use backon::{ExponentialBuilder, Retryable};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exponential backoff parameters. `max_attempts` counts the first try.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub multiplier: f32,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }

    /// Delay before retry number `attempt` (zero based), capped at
    /// `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = f64::from(self.multiplier).powi(attempt.min(64) as i32);
        let nanos = self.base_delay.as_nanos() as f64 * factor;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(nanos as u64)
        }
    }
}

/// Runs `f` until it succeeds or the policy gives up, logging each retry.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, job: &str, f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    f.retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .notify(|e: &E, delay: Duration| {
            warn!("Job {} failed: {}. Retrying in {:?}", job, e, delay);
        })
        .await
}

/// Jobs an external queue may enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncJob {
    SyncAllAddressesForNetwork(Network),
    SyncUnsyncedAddresses,
}

impl SyncJob {
    pub fn name(&self) -> String {
        match self {
            SyncJob::SyncAllAddressesForNetwork(network) => format!("syncAllAddressesForNetwork:{}", network),
            SyncJob::SyncUnsyncedAddresses => "syncUnsyncedAddresses".to_string(),
        }
    }
}

pub async fn run_job(engine: &SyncEngine, job: SyncJob, policy: &RetryPolicy) -> Result<SyncReport, SyncError> {
    let name = job.name();
    let report = with_retry(policy, &name, move || async move {
        match job {
            SyncJob::SyncAllAddressesForNetwork(network) => engine.sync_all_addresses_for_network(network).await,
            SyncJob::SyncUnsyncedAddresses => engine.sync_unsynced_addresses().await,
        }
    })
    .await?;

    info!(
        "Job {} finished: {} addresses synced, {} failed",
        name,
        report.successful.len(),
        report.failed.len()
    );
    if !report.is_clean() {
        warn!("Job {} left failures for the next run: {:?}", name, report.failed);
    }
    Ok(report)
}

/// Re-runs the unsynced-address sweep every `interval` until shutdown.
pub async fn run_periodic_sweep(
    engine: Arc<SyncEngine>,
    interval: Duration,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    info!("Starting periodic sync sweep every {:?}", interval);
    let mut ticker = tokio::time::interval(interval);
    // the first tick fires immediately; startup already ran a full sync
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = run_job(&engine, SyncJob::SyncUnsyncedAddresses, &policy).await {
                    error!("Periodic sweep gave up: {}", e);
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutting down periodic sync sweep");
                break;
            }
        }
    }
}
