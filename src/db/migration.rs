use crate::db::INIT_SCHEMA;
use sqlx::SqlitePool;
use tracing::info;

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    info!("Running database migrations...");

    sqlx::raw_sql(INIT_SCHEMA).execute(pool).await?;

    // Indexes for the sync sweeps and cache rebuilds
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_addresses_network_synced
         ON addresses(network_id, synced)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_address_time
         ON transactions(address_id, timestamp)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_hash
         ON transactions(hash)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_paybutton_addresses_address
         ON paybutton_addresses(address_id)",
    )
    .execute(pool)
    .await?;

    info!("Database migrations completed successfully");
    Ok(())
}
