use crate::db::decode_error;
use crate::models::{Network, Quote, QuoteValues};
use rust_decimal::Decimal;
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;
use std::str::FromStr;

const DAY_SECS: i64 = 86_400;

/// Start of the UTC day containing `timestamp`.
pub fn flatten_timestamp(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(DAY_SECS)
}

fn set_quote(values: &mut QuoteValues, quote: &str, value: Decimal) {
    match quote {
        "usd" => values.usd = value,
        "cad" => values.cad = value,
        _ => {}
    }
}

/// Stores the price of one coin for the day of `timestamp`, replacing any
/// previous value for that day.
pub async fn upsert_price(
    pool: &Pool<Sqlite>,
    network: Network,
    quote: Quote,
    timestamp: i64,
    value: Decimal,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO prices (network_id, quote, timestamp, value) VALUES (?, ?, ?, ?)
         ON CONFLICT(network_id, quote, timestamp) DO UPDATE SET value = excluded.value",
    )
    .bind(network.id())
    .bind(quote.slug())
    .bind(flatten_timestamp(timestamp))
    .bind(value.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Prices for the day of `timestamp`, or `None` when no quote is stored.
pub async fn fetch_day_prices(
    pool: &Pool<Sqlite>,
    network: Network,
    timestamp: i64,
) -> Result<Option<QuoteValues>, sqlx::Error> {
    let rows = sqlx::query("SELECT quote, value FROM prices WHERE network_id = ? AND timestamp = ?")
        .bind(network.id())
        .bind(flatten_timestamp(timestamp))
        .fetch_all(pool)
        .await?;

    if rows.is_empty() {
        return Ok(None);
    }

    let mut values = QuoteValues::default();
    for row in rows {
        let quote: String = row.try_get("quote")?;
        let raw: String = row.try_get("value")?;
        let value = Decimal::from_str(&raw).map_err(|e| decode_error(format!("bad price {}: {}", raw, e)))?;
        set_quote(&mut values, &quote, value);
    }
    Ok(Some(values))
}

/// Every stored price of a network keyed by flattened day.
pub async fn fetch_network_prices(
    pool: &Pool<Sqlite>,
    network: Network,
) -> Result<HashMap<i64, QuoteValues>, sqlx::Error> {
    let rows = sqlx::query("SELECT quote, timestamp, value FROM prices WHERE network_id = ?")
        .bind(network.id())
        .fetch_all(pool)
        .await?;

    let mut out: HashMap<i64, QuoteValues> = HashMap::new();
    for row in rows {
        let quote: String = row.try_get("quote")?;
        let day: i64 = row.try_get("timestamp")?;
        let raw: String = row.try_get("value")?;
        let value = Decimal::from_str(&raw).map_err(|e| decode_error(format!("bad price {}: {}", raw, e)))?;
        set_quote(out.entry(day).or_default(), &quote, value);
    }
    Ok(out)
}
