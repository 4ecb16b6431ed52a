use crate::blockchain::registry::ClientRegistry;
use crate::blockchain::sync::SyncEngine;
use crate::cache::PaymentCache;
use crate::config::Config;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    pub db_pool: SqlitePool,
    pub cache: PaymentCache,
    pub registry: Arc<ClientRegistry>,
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(config: Config, db_pool: SqlitePool, engine: Arc<SyncEngine>) -> Self {
        Self {
            config,
            db_pool,
            cache: engine.cache().clone(),
            registry: engine.registry().clone(),
            engine,
        }
    }
}
