//! Engine registration and selection
//!
//! The selector is the sole registry of engines and has an explicit
//! lifecycle: engines are registered after construction, availability is
//! probed once at registration and cached until `refresh`, and `shutdown`
//! releases every engine's resources. `best` prefers the configured engine
//! when it is available and otherwise ranks by performance level with an
//! alphabetical tie-break.

use crate::engine::CacheEngine;
use crate::errors::{CacheError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

struct Registered {
    name: &'static str,
    level: u8,
    engine: Arc<dyn CacheEngine>,
}

/// Result of timing one engine through set/get/delete cycles
#[derive(Debug, Clone)]
pub struct BenchmarkResult {
    pub engine: &'static str,
    pub ops_per_second: f64,
}

/// Registry and ranking of the available engines
pub struct EngineSelector {
    engines: RwLock<Vec<Registered>>,
    availability: RwLock<HashMap<&'static str, bool>>,
    preferred: Option<String>,
}

impl EngineSelector {
    pub fn new(preferred: Option<String>) -> Self {
        EngineSelector {
            engines: RwLock::new(Vec::new()),
            availability: RwLock::new(HashMap::new()),
            preferred,
        }
    }

    /// Register an engine, probing its availability once
    pub async fn register(&self, engine: Arc<dyn CacheEngine>) {
        let name = engine.name();
        let level = engine.performance_level();
        let available = engine.is_available().await;

        self.availability.write().insert(name, available);
        let mut engines = self.engines.write();
        engines.retain(|r| r.name != name);
        engines.push(Registered {
            name,
            level,
            engine,
        });
        tracing::debug!(engine = name, level, available, "engine registered");
    }

    /// Re-probe every engine's availability
    pub async fn refresh(&self) {
        let engines: Vec<(&'static str, Arc<dyn CacheEngine>)> = self
            .engines
            .read()
            .iter()
            .map(|r| (r.name, Arc::clone(&r.engine)))
            .collect();

        for (name, engine) in engines {
            let available = engine.is_available().await;
            self.availability.write().insert(name, available);
        }
    }

    /// The best available engine: the preferred one when available, else
    /// the highest performance level (alphabetical on ties)
    pub fn best(&self) -> Result<Arc<dyn CacheEngine>> {
        let engines = self.engines.read();
        let availability = self.availability.read();
        let is_available = |name: &str| availability.get(name).copied().unwrap_or(false);

        if let Some(preferred) = &self.preferred {
            if let Some(found) = engines
                .iter()
                .find(|r| r.name == preferred && is_available(r.name))
            {
                return Ok(Arc::clone(&found.engine));
            }
        }

        let mut ranked: Vec<&Registered> =
            engines.iter().filter(|r| is_available(r.name)).collect();
        ranked.sort_by(|a, b| b.level.cmp(&a.level).then(a.name.cmp(b.name)));

        ranked
            .first()
            .map(|r| Arc::clone(&r.engine))
            .ok_or_else(|| CacheError::EngineUnavailable {
                engine: "all registered engines".to_string(),
            })
    }

    /// Look up one engine by name, available or not
    pub fn engine(&self, name: &str) -> Option<Arc<dyn CacheEngine>> {
        self.engines
            .read()
            .iter()
            .find(|r| r.name == name)
            .map(|r| Arc::clone(&r.engine))
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.engines.read().iter().map(|r| r.name).collect()
    }

    /// Time `cycles` set/get/delete rounds on every available engine
    pub async fn benchmark(&self, cycles: u64) -> Vec<BenchmarkResult> {
        let engines: Vec<(&'static str, Arc<dyn CacheEngine>)> = {
            let availability = self.availability.read();
            self.engines
                .read()
                .iter()
                .filter(|r| availability.get(r.name).copied().unwrap_or(false))
                .map(|r| (r.name, Arc::clone(&r.engine)))
                .collect()
        };

        let mut results = Vec::with_capacity(engines.len());
        for (name, engine) in engines {
            let start = Instant::now();
            for i in 0..cycles {
                let key = format!("bench.{name}.{i}");
                let _ = engine.set(&key, b"benchmark-payload", 60).await;
                let _ = engine.get(&key).await;
                let _ = engine.delete(&key).await;
            }
            let elapsed = start.elapsed().as_secs_f64();
            let ops = (cycles * 3) as f64;
            results.push(BenchmarkResult {
                engine: name,
                ops_per_second: if elapsed > 0.0 { ops / elapsed } else { ops },
            });
        }
        results
    }

    /// Release every engine's resources and clear the registry
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<dyn CacheEngine>> = {
            let mut guard = self.engines.write();
            self.availability.write().clear();
            guard.drain(..).map(|r| r.engine).collect()
        };
        for engine in engines {
            engine.shutdown().await;
        }
        tracing::debug!("engine selector shut down");
    }
}
