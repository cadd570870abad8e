pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::InMemoryLeadStore;
pub use sqlite::SqliteLeadStore;
pub use traits::{
    AppConfig, Lead, LeadRef, LeadStore, MediaType, MessageRecord, NewLead, Sender, ServerStatus,
    StoredMessage,
};

use crate::config::Config;
use std::sync::Arc;

/// Factory: create the record store named by `[store].backend`.
pub fn create_store(config: &Config) -> anyhow::Result<Arc<dyn LeadStore>> {
    match config.store.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteLeadStore::open(&config.db_path())?)),
        "memory" => {
            tracing::warn!("Using in-memory record store; leads are lost on restart");
            Ok(Arc::new(InMemoryLeadStore::new()))
        }
        other => anyhow::bail!("Unknown record store backend: {other}"),
    }
}
