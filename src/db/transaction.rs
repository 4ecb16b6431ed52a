use crate::db::decode_error;
use crate::models::{Address, CanonicalTransaction, Network, OpReturnData, Transaction};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

const TX_COLUMNS: &str = "id, hash, amount, timestamp, confirmed, op_return, address_id";

/// Result of storing one canonical transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub transaction: Transaction,
    /// The row did not exist before this call.
    pub created: bool,
    /// An existing unconfirmed row was flipped to confirmed by this call.
    pub newly_confirmed: bool,
}

fn transaction_from_row(row: &SqliteRow) -> Result<Transaction, sqlx::Error> {
    let amount: String = row.try_get("amount")?;
    let amount = Decimal::from_str(&amount).map_err(|e| decode_error(format!("bad amount {}: {}", amount, e)))?;
    let op_return: Option<String> = row.try_get("op_return")?;
    let op_return = match op_return {
        Some(json) => Some(
            serde_json::from_str::<OpReturnData>(&json).map_err(|e| decode_error(format!("bad op_return: {}", e)))?,
        ),
        None => None,
    };

    Ok(Transaction {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        amount,
        timestamp: row.try_get("timestamp")?,
        confirmed: row.try_get::<i64, _>("confirmed")? != 0,
        address_id: row.try_get("address_id")?,
        op_return,
    })
}

/// Idempotent write of `tx` for `address`.
///
/// The `(hash, address_id)` unique constraint is the only guard against
/// concurrent writers: the insert is a no-op when the row exists, the
/// confirmation flip only matches unconfirmed rows, and the final read
/// returns whatever the winning writer stored. Amount and timestamp are
/// never rewritten.
pub async fn upsert_transaction(
    pool: &Pool<Sqlite>,
    tx: &CanonicalTransaction,
    address: &Address,
) -> Result<UpsertOutcome, sqlx::Error> {
    let op_return = match &tx.op_return {
        Some(data) => Some(serde_json::to_string(data).map_err(|e| sqlx::Error::Encode(Box::new(e)))?),
        None => None,
    };

    let inserted = sqlx::query(&format!(
        "INSERT INTO transactions (hash, amount, timestamp, confirmed, op_return, address_id)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT(hash, address_id) DO NOTHING
         RETURNING {}",
        TX_COLUMNS
    ))
    .bind(&tx.hash)
    .bind(tx.amount.to_string())
    .bind(tx.timestamp)
    .bind(tx.confirmed)
    .bind(op_return.as_deref())
    .bind(address.id)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = inserted {
        return Ok(UpsertOutcome {
            transaction: transaction_from_row(&row)?,
            created: true,
            newly_confirmed: false,
        });
    }

    if tx.confirmed {
        let confirmed = sqlx::query(&format!(
            "UPDATE transactions SET confirmed = 1
             WHERE hash = ? AND address_id = ? AND confirmed = 0
             RETURNING {}",
            TX_COLUMNS
        ))
        .bind(&tx.hash)
        .bind(address.id)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = confirmed {
            return Ok(UpsertOutcome {
                transaction: transaction_from_row(&row)?,
                created: false,
                newly_confirmed: true,
            });
        }
    }

    let existing = fetch_transaction(pool, &tx.hash, address.id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;

    Ok(UpsertOutcome {
        transaction: existing,
        created: false,
        newly_confirmed: false,
    })
}

pub async fn fetch_transaction(
    pool: &Pool<Sqlite>,
    hash: &str,
    address_id: i64,
) -> Result<Option<Transaction>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE hash = ? AND address_id = ?",
        TX_COLUMNS
    ))
    .bind(hash)
    .bind(address_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(transaction_from_row).transpose()
}

/// All transactions of an address, newest first.
pub async fn fetch_transactions_for_address(
    pool: &Pool<Sqlite>,
    address_id: i64,
) -> Result<Vec<Transaction>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE address_id = ? ORDER BY timestamp DESC, id DESC",
        TX_COLUMNS
    ))
    .bind(address_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(transaction_from_row).collect()
}

/// Confirmed transactions with a positive amount; the rows the payment
/// cache is derived from.
pub async fn fetch_payment_transactions(
    pool: &Pool<Sqlite>,
    address_id: i64,
) -> Result<Vec<Transaction>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM transactions WHERE address_id = ? AND confirmed = 1 ORDER BY timestamp ASC, id ASC",
        TX_COLUMNS
    ))
    .bind(address_id)
    .fetch_all(pool)
    .await?;

    let txs: Vec<Transaction> = rows.iter().map(transaction_from_row).collect::<Result<_, _>>()?;
    Ok(txs.into_iter().filter(|t| t.amount > Decimal::ZERO).collect())
}

pub async fn count_transactions(pool: &Pool<Sqlite>, address_id: i64) -> Result<i64, sqlx::Error> {
    let count = sqlx::query("SELECT COUNT(*) FROM transactions WHERE address_id = ?")
        .bind(address_id)
        .fetch_one(pool)
        .await?
        .get::<i64, _>(0);

    Ok(count)
}

/// Removes unconfirmed rows for a hash that left `network`'s mempool and
/// returns what was removed.
pub async fn delete_unconfirmed_by_hash(
    pool: &Pool<Sqlite>,
    network: Network,
    hash: &str,
) -> Result<Vec<Transaction>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "DELETE FROM transactions
         WHERE hash = ? AND confirmed = 0
           AND address_id IN (SELECT id FROM addresses WHERE network_id = ?)
         RETURNING {}",
        TX_COLUMNS
    ))
    .bind(hash)
    .bind(network.id())
    .fetch_all(pool)
    .await?;

    rows.iter().map(transaction_from_row).collect()
}
