pub mod api;
pub mod blockchain;
pub mod cache;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod models;
pub mod scheduler;
pub mod service;
pub mod state;
pub mod validation;

#[cfg(test)]
pub mod tests;

pub use api::error::ApiError;
pub use api::response::ApiResponse;
pub use api::route::create_router;
pub use blockchain::{ClientRegistry, SyncEngine};
pub use config::Config;
pub use db::connection::establish_connection;
pub use models::{Network, SyncReport};
