pub mod cashaddr;
pub mod client;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod registry;
pub mod subscription;
pub mod sync;

pub use client::{ChronikClient, ClientError, IndexerClient, TxListener};
pub use pipeline::IngestPipeline;
pub use registry::ClientRegistry;
pub use sync::{SyncEngine, SyncError, SyncOptions};
