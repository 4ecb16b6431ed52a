use crate::models::{Address, ButtonDisplayData, Paybutton};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use std::collections::HashMap;

fn paybutton_from_row(row: &SqliteRow) -> Result<Paybutton, sqlx::Error> {
    Ok(Paybutton {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        provider_user_id: row.try_get("provider_user_id")?,
        owner_email: row.try_get("owner_email")?,
    })
}

pub async fn create_paybutton(
    pool: &Pool<Sqlite>,
    name: &str,
    provider_user_id: &str,
    owner_email: Option<&str>,
) -> Result<Paybutton, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO paybuttons (name, provider_user_id, owner_email) VALUES (?, ?, ?)
         RETURNING id, name, provider_user_id, owner_email",
    )
    .bind(name)
    .bind(provider_user_id)
    .bind(owner_email)
    .fetch_one(pool)
    .await?;

    paybutton_from_row(&row)
}

pub async fn fetch_paybutton(pool: &Pool<Sqlite>, id: i64) -> Result<Option<Paybutton>, sqlx::Error> {
    let row = sqlx::query("SELECT id, name, provider_user_id, owner_email FROM paybuttons WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(paybutton_from_row).transpose()
}

/// Associates addresses with a paybutton; existing links are kept.
pub async fn link_addresses(pool: &Pool<Sqlite>, paybutton_id: i64, addresses: &[Address]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for address in addresses {
        sqlx::query("INSERT OR IGNORE INTO paybutton_addresses (paybutton_id, address_id) VALUES (?, ?)")
            .bind(paybutton_id)
            .bind(address.id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

pub async fn unlink_addresses(pool: &Pool<Sqlite>, paybutton_id: i64, addresses: &[Address]) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for address in addresses {
        sqlx::query("DELETE FROM paybutton_addresses WHERE paybutton_id = ? AND address_id = ?")
            .bind(paybutton_id)
            .bind(address.id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    Ok(())
}

pub async fn fetch_paybuttons_for_address(pool: &Pool<Sqlite>, address_id: i64) -> Result<Vec<Paybutton>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT p.id, p.name, p.provider_user_id, p.owner_email
         FROM paybuttons p
         JOIN paybutton_addresses pa ON pa.paybutton_id = p.id
         WHERE pa.address_id = ?
         ORDER BY p.id",
    )
    .bind(address_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(paybutton_from_row).collect()
}

/// Display data of every paybutton referencing each of `address_ids`.
pub async fn fetch_button_display_data(
    pool: &Pool<Sqlite>,
    address_ids: &[i64],
) -> Result<HashMap<i64, Vec<ButtonDisplayData>>, sqlx::Error> {
    let mut out: HashMap<i64, Vec<ButtonDisplayData>> = HashMap::new();
    if address_ids.is_empty() {
        return Ok(out);
    }

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT pa.address_id, p.id, p.name, p.provider_user_id, p.owner_email
         FROM paybuttons p
         JOIN paybutton_addresses pa ON pa.paybutton_id = p.id
         WHERE pa.address_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in address_ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY p.id");

    let rows = builder.build().fetch_all(pool).await?;
    for row in rows {
        let address_id: i64 = row.try_get("address_id")?;
        let button = paybutton_from_row(&row)?;
        out.entry(address_id).or_default().push(ButtonDisplayData::from(&button));
    }
    Ok(out)
}
