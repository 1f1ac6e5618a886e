pub mod memory;
pub mod sqlite;
pub mod versioned;

use std::sync::Arc;

use trellis_core::config::{EngineConfig, StoreBackend};
use trellis_core::error::Result;
use trellis_core::traits::NodeStore;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use versioned::{BulkOutcome, Change, NodeExecutionStore, UpdateOutcome};

/// Open the backend selected by `config.store` and wrap it in the versioned layer.
pub fn open_store(config: &EngineConfig) -> Result<NodeExecutionStore> {
    let backend: Arc<dyn NodeStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store_path())?),
    };
    Ok(NodeExecutionStore::new(backend, config.concurrency.clone()))
}
