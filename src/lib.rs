//! Multi-backend cache library
//!
//! One key/value contract served by three interchangeable engines:
//! - an in-process memory store with TTL and LRU eviction (also exported
//!   over a stable C ABI),
//! - an asynchronous Redis-protocol engine over a cluster-aware
//!   connection pool,
//! - a sharded-directory file store with exclusive-lock writes.
//!
//! The [`selector::EngineSelector`] ranks engines by availability and
//! performance and the [`facade::Cache`] dispatches validated, typed
//! operations through it. Above the facade, [`session::SessionStore`]
//! turns the cache contract into an exclusive-write session handler.

pub mod config;
pub mod engine;
pub mod entry;
pub mod errors;
pub mod facade;
pub mod ffi;
pub mod file;
pub mod keys;
pub mod memory;
pub mod remote;
pub mod selector;
pub mod serialization;
pub mod session;

pub use config::{ClusterConfig, Config, FileConfig, MemoryConfig, RedisConfig};
pub use engine::CacheEngine;
pub use errors::{CacheError, Result};
pub use facade::{Cache, CacheStats, Ttl};
pub use file::FileEngine;
pub use memory::MemoryEngine;
pub use remote::router::{
    ClusterRouter, NodeDescriptor, NodeDiscovery, NodeRole, NodeStatus, ReadPreference,
};
pub use remote::RemoteEngine;
pub use selector::{BenchmarkResult, EngineSelector};
pub use serialization::{Codec, SerializerRegistry};
pub use session::{SessionRecord, SessionStore};

use std::sync::Arc;

/// Build the standard stack from configuration: construct and register
/// every engine that can be configured, then wrap the selector in a facade.
///
/// The remote engine is registered only when the pool can be constructed
/// from the configuration; cluster layout errors are fatal here, matching
/// the construction-time contract.
pub async fn build(config: &Config) -> Result<Arc<Cache>> {
    // An explicit engine choice wins; otherwise the configured default
    // store is preferred, with selection falling back to performance
    // ranking whenever the preference is unavailable.
    let preferred = config
        .preferred_engine
        .clone()
        .or_else(|| Some(config.default_store.clone()));
    let selector = Arc::new(EngineSelector::new(preferred));

    selector
        .register(Arc::new(MemoryEngine::new(&config.memory)) as Arc<dyn CacheEngine>)
        .await;

    match FileEngine::new(&config.file) {
        Ok(engine) => {
            selector
                .register(Arc::new(engine) as Arc<dyn CacheEngine>)
                .await;
        }
        Err(e) => tracing::warn!(error = %e, "file engine unavailable"),
    }

    let remote = RemoteEngine::new(&config.redis, config.cluster.as_ref())?;
    remote.initialize(None).await?;
    selector
        .register(Arc::new(remote) as Arc<dyn CacheEngine>)
        .await;

    Ok(Arc::new(Cache::new(selector, config.default_ttl)))
}
