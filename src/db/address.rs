use crate::db::{decode_error, now_secs};
use crate::models::{Address, Network};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};

const ADDRESS_COLUMNS: &str = "id, address, network_id, synced, last_synced, created_at";

fn address_from_row(row: &SqliteRow) -> Result<Address, sqlx::Error> {
    let network_id: i64 = row.try_get("network_id")?;
    let network = Network::from_id(network_id)
        .ok_or_else(|| decode_error(format!("unknown network id {}", network_id)))?;
    Ok(Address {
        id: row.try_get("id")?,
        address: row.try_get("address")?,
        network,
        synced: row.try_get::<i64, _>("synced")? != 0,
        last_synced: row.try_get("last_synced")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Creates the address on first reference and returns the stored row.
pub async fn upsert_address(pool: &Pool<Sqlite>, address: &str, network: Network) -> Result<Address, sqlx::Error> {
    let address = address.trim().to_lowercase();

    sqlx::query(
        "INSERT INTO addresses (address, network_id, created_at) VALUES (?, ?, ?)
         ON CONFLICT(network_id, address) DO NOTHING",
    )
    .bind(&address)
    .bind(network.id())
    .bind(now_secs())
    .execute(pool)
    .await?;

    let row = sqlx::query(&format!(
        "SELECT {} FROM addresses WHERE network_id = ? AND address = ?",
        ADDRESS_COLUMNS
    ))
    .bind(network.id())
    .bind(&address)
    .fetch_one(pool)
    .await?;

    address_from_row(&row)
}

pub async fn fetch_address(pool: &Pool<Sqlite>, address: &str) -> Result<Option<Address>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {} FROM addresses WHERE address = ?", ADDRESS_COLUMNS))
        .bind(address.trim().to_lowercase())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(address_from_row).transpose()
}

pub async fn fetch_address_by_id(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Address>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {} FROM addresses WHERE id = ?", ADDRESS_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(address_from_row).transpose()
}

/// Addresses among `addresses` that are stored, in no particular order.
pub async fn fetch_addresses(pool: &Pool<Sqlite>, addresses: &[String]) -> Result<Vec<Address>, sqlx::Error> {
    if addresses.is_empty() {
        return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new(format!("SELECT {} FROM addresses WHERE address IN (", ADDRESS_COLUMNS));
    let mut separated = builder.separated(", ");
    for address in addresses {
        separated.push_bind(address.trim().to_lowercase());
    }
    separated.push_unseparated(")");

    let rows = builder.build().fetch_all(pool).await?;
    rows.iter().map(address_from_row).collect()
}

/// Addresses filtered by sync flag, optionally restricted to one network.
pub async fn fetch_addresses_by_sync_state(
    pool: &Pool<Sqlite>,
    network: Option<Network>,
    synced: bool,
) -> Result<Vec<Address>, sqlx::Error> {
    let rows = match network {
        Some(network) => {
            sqlx::query(&format!(
                "SELECT {} FROM addresses WHERE network_id = ? AND synced = ? ORDER BY id",
                ADDRESS_COLUMNS
            ))
            .bind(network.id())
            .bind(synced)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {} FROM addresses WHERE synced = ? ORDER BY id",
                ADDRESS_COLUMNS
            ))
            .bind(synced)
            .fetch_all(pool)
            .await?
        }
    };

    rows.iter().map(address_from_row).collect()
}

pub async fn fetch_all_addresses(pool: &Pool<Sqlite>) -> Result<Vec<Address>, sqlx::Error> {
    let rows = sqlx::query(&format!("SELECT {} FROM addresses ORDER BY id", ADDRESS_COLUMNS))
        .fetch_all(pool)
        .await?;

    rows.iter().map(address_from_row).collect()
}

/// Records a completed backfill. `at` becomes the cursor of the next
/// incremental sync.
pub async fn mark_synced(pool: &Pool<Sqlite>, address_id: i64, at: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE addresses SET synced = 1, last_synced = ? WHERE id = ?")
        .bind(at)
        .bind(address_id)
        .execute(pool)
        .await?;

    Ok(())
}
