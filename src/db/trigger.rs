use crate::models::{Paybutton, Trigger, TriggerAction, TriggerLog};
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};

fn trigger_from_row(row: &SqliteRow) -> Result<Trigger, sqlx::Error> {
    Ok(Trigger {
        id: row.try_get("id")?,
        paybutton_id: row.try_get("paybutton_id")?,
        send_email: row.try_get::<i64, _>("send_email")? != 0,
        post_url: row.try_get("post_url")?,
        post_data: row.try_get("post_data")?,
    })
}

pub async fn create_trigger(
    pool: &Pool<Sqlite>,
    paybutton_id: i64,
    send_email: bool,
    post_url: &str,
    post_data: &str,
) -> Result<Trigger, sqlx::Error> {
    let row = sqlx::query(
        "INSERT INTO paybutton_triggers (paybutton_id, send_email, post_url, post_data) VALUES (?, ?, ?, ?)
         RETURNING id, paybutton_id, send_email, post_url, post_data",
    )
    .bind(paybutton_id)
    .bind(send_email)
    .bind(post_url)
    .bind(post_data)
    .fetch_one(pool)
    .await?;

    trigger_from_row(&row)
}

/// Triggers of every paybutton that owns `address`, with the owning button.
pub async fn fetch_triggers_for_address(
    pool: &Pool<Sqlite>,
    address: &str,
) -> Result<Vec<(Trigger, Paybutton)>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT t.id, t.paybutton_id, t.send_email, t.post_url, t.post_data,
                p.name, p.provider_user_id, p.owner_email
         FROM paybutton_triggers t
         JOIN paybuttons p ON p.id = t.paybutton_id
         JOIN paybutton_addresses pa ON pa.paybutton_id = p.id
         JOIN addresses a ON a.id = pa.address_id
         WHERE a.address = ?
         ORDER BY t.id",
    )
    .bind(address)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<(Trigger, Paybutton), sqlx::Error> {
            let trigger = trigger_from_row(row)?;
            let paybutton = Paybutton {
                id: trigger.paybutton_id,
                name: row.try_get("name")?,
                provider_user_id: row.try_get("provider_user_id")?,
                owner_email: row.try_get("owner_email")?,
            };
            Ok((trigger, paybutton))
        })
        .collect()
}

pub async fn insert_trigger_log(
    pool: &Pool<Sqlite>,
    trigger_id: i64,
    action: TriggerAction,
    is_error: bool,
    data: &serde_json::Value,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO trigger_logs (trigger_id, action, is_error, data) VALUES (?, ?, ?, ?)")
        .bind(trigger_id)
        .bind(action.as_str())
        .bind(is_error)
        .bind(data.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn fetch_trigger_logs(pool: &Pool<Sqlite>, trigger_id: i64) -> Result<Vec<TriggerLog>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, trigger_id, action, is_error, data, created_at FROM trigger_logs
         WHERE trigger_id = ? ORDER BY id",
    )
    .bind(trigger_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| -> Result<TriggerLog, sqlx::Error> {
            let data: String = row.try_get("data")?;
            Ok(TriggerLog {
                id: row.try_get("id")?,
                trigger_id: row.try_get("trigger_id")?,
                action: row.try_get("action")?,
                is_error: row.try_get::<i64, _>("is_error")? != 0,
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::String(data)),
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}
