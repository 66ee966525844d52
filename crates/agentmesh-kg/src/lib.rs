//! agentmesh-kg - typed triple store with indices, query cache and HTTP access
//!
//! The store is the runtime's durable state and audit log. Every backend
//! implements [`TripleStore`]; [`CachedStore`] wraps any of them.

pub mod cache;
pub mod graph;
pub mod index;
pub mod memory;
pub mod query;
pub mod remote;
pub mod server;
pub mod store;
pub mod term;
pub mod wire;

pub use cache::{CacheStats, CachedStore, QueryCache};
pub use graph::Graph;
pub use index::GraphIndex;
pub use memory::MemoryStore;
pub use query::{iri, lit, var, BindingRow, CompareOp, Query, Term};
pub use remote::RemoteStore;
pub use store::{TripleStore, Update, UpdateReceipt};
pub use term::{Iri, Triple, Value, Vocab};

use agentmesh_core::config::StoreConfig;
use std::sync::Arc;

/// Open the in-process store described by `config`, behind a query cache.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<CachedStore<MemoryStore>>, agentmesh_core::StoreError> {
    let backend = match &config.log_path {
        Some(path) => MemoryStore::open(path).await?,
        None => MemoryStore::new(),
    };
    Ok(Arc::new(CachedStore::new(
        backend,
        config.cache_capacity,
        config.cache_ttl(),
    )))
}
