//! Paybutton address management on top of the store, cache and engine.

use crate::blockchain::sync::{SyncEngine, SyncError};
use crate::cache::PaymentCache;
use crate::db::{address as address_db, paybutton as paybutton_db, trigger as trigger_db};
use crate::models::{Address, ButtonDisplayData, SyncReport, Trigger};
use crate::validation::{validate_address, validate_addresses, validate_trigger, ValidationError};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Paybutton {0} not found")]
    PaybuttonNotFound(i64),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkOutcome {
    pub paybutton_id: i64,
    pub addresses: Vec<Address>,
    pub sync: SyncReport,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrigger {
    #[serde(default)]
    pub send_email: bool,
    #[serde(default, rename = "postURL")]
    pub post_url: String,
    #[serde(default)]
    pub post_data: String,
}

/// Links `addresses` to a paybutton, creating unknown ones. Cached payments
/// of those addresses pick up the button, and addresses not synced yet are
/// backfilled and subscribed.
pub async fn link_paybutton_addresses(
    pool: &SqlitePool,
    cache: &PaymentCache,
    engine: &SyncEngine,
    paybutton_id: i64,
    addresses: &[String],
) -> Result<LinkOutcome, ServiceError> {
    validate_addresses(addresses)?;
    let paybutton = paybutton_db::fetch_paybutton(pool, paybutton_id)
        .await?
        .ok_or(ServiceError::PaybuttonNotFound(paybutton_id))?;

    let mut rows = Vec::with_capacity(addresses.len());
    for address in addresses {
        let network = validate_address(address)?;
        rows.push(address_db::upsert_address(pool, address, network).await?);
    }

    paybutton_db::link_addresses(pool, paybutton_id, &rows).await?;
    cache
        .append_paybutton_to_addresses_cache(&rows, &ButtonDisplayData::from(&paybutton))
        .await;
    info!("Linked {} addresses to paybutton {}", rows.len(), paybutton_id);

    let unsynced: Vec<String> = rows.iter().filter(|a| !a.synced).map(|a| a.address.clone()).collect();
    let sync = if unsynced.is_empty() {
        SyncReport::default()
    } else {
        engine.sync_and_subscribe_addresses(unsynced).await?
    };

    // re-read so the response carries the post-sync flags
    let refreshed = address_db::fetch_addresses(pool, &rows.iter().map(|a| a.address.clone()).collect::<Vec<_>>()).await?;

    Ok(LinkOutcome {
        paybutton_id,
        addresses: refreshed,
        sync,
    })
}

/// Drops the association and strips the button from cached payments.
/// Addresses and their transactions stay.
pub async fn unlink_paybutton_addresses(
    pool: &SqlitePool,
    cache: &PaymentCache,
    paybutton_id: i64,
    addresses: &[String],
) -> Result<Vec<Address>, ServiceError> {
    validate_addresses(addresses)?;
    if paybutton_db::fetch_paybutton(pool, paybutton_id).await?.is_none() {
        return Err(ServiceError::PaybuttonNotFound(paybutton_id));
    }

    let rows = address_db::fetch_addresses(pool, addresses).await?;
    paybutton_db::unlink_addresses(pool, paybutton_id, &rows).await?;
    cache.remove_paybutton_from_addresses_cache(&rows, paybutton_id).await;
    info!("Unlinked {} addresses from paybutton {}", rows.len(), paybutton_id);
    Ok(rows)
}

/// Attaches a trigger to a paybutton after checking that its post data
/// renders to a JSON object.
pub async fn create_trigger(pool: &SqlitePool, paybutton_id: i64, input: &NewTrigger) -> Result<Trigger, ServiceError> {
    validate_trigger(input.send_email, &input.post_url, &input.post_data)?;
    if paybutton_db::fetch_paybutton(pool, paybutton_id).await?.is_none() {
        return Err(ServiceError::PaybuttonNotFound(paybutton_id));
    }

    let trigger = trigger_db::create_trigger(
        pool,
        paybutton_id,
        input.send_email,
        input.post_url.trim(),
        &input.post_data,
    )
    .await?;
    info!("Created trigger {} for paybutton {}", trigger.id, paybutton_id);
    Ok(trigger)
}
