//! Connection pool for the remote engine
//!
//! Idle connections live either in the shared queue (non-cluster mode) or
//! in a per-node map keyed by `host:port`. Acquisition pings idle
//! connections before handing them out and creates new ones while the pool
//! is under its maximum; at the maximum the caller fails fast with
//! `PoolExhausted`. Release probes health: healthy connections return to
//! the pool, unhealthy ones are destroyed.
//!
//! Live-connection accounting rides on an RAII slot guard, so a caller
//! whose future is dropped mid-operation (cancellation during the response
//! wait) still gives its capacity back when the connection is destroyed.

use crate::config::RedisConfig;
use crate::errors::{CacheError, Result};
use crate::remote::connection::Connection;
use futures::future::join_all;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Reservation of one pool slot; dropping it releases the capacity
#[derive(Debug)]
struct SlotGuard(Arc<AtomicUsize>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A pooled connection. Destroying it (drop) releases its pool slot;
/// returning it through [`ConnectionPool::release`] keeps the slot and
/// parks the connection for reuse.
#[derive(Debug)]
pub struct PooledConnection {
    conn: Connection,
    _slot: SlotGuard,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

#[derive(Debug, Default)]
struct IdleSet {
    shared: VecDeque<PooledConnection>,
    per_node: HashMap<String, VecDeque<PooledConnection>>,
}

impl IdleSet {
    fn len(&self) -> usize {
        self.shared.len() + self.per_node.values().map(VecDeque::len).sum::<usize>()
    }
}

/// Bounded pool of remote connections
#[derive(Debug)]
pub struct ConnectionPool {
    default_addr: String,
    password: Option<String>,
    database: u32,
    min: usize,
    max: usize,
    connect_timeout: Duration,
    read_timeout: Duration,
    idle: Mutex<IdleSet>,
    /// Connections alive anywhere: idle here plus lent to callers
    total: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Build a pool; inverted bounds are a configuration error
    pub fn new(
        config: &RedisConfig,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self> {
        config.validate()?;
        Ok(ConnectionPool {
            default_addr: config.addr(),
            password: config.password.clone(),
            database: config.database,
            min: config.pool_min,
            max: config.pool_max,
            connect_timeout,
            read_timeout,
            idle: Mutex::new(IdleSet::default()),
            total: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Populate the shared pool up to `pool_min`. Failures are logged and
    /// tolerated; the pool lazily creates connections later.
    pub async fn warm_up(&self) {
        let connects = (0..self.min).filter_map(|_| {
            self.reserve_slot()
                .map(|slot| self.open(self.default_addr.clone(), slot))
        });
        let connections = join_all(connects).await;

        let mut idle = self.idle.lock().await;
        for result in connections {
            match result {
                Ok(conn) => idle.shared.push_back(conn),
                Err(e) => tracing::warn!(error = %e, "pool warm-up connection failed"),
            }
        }
        tracing::debug!(idle = idle.len(), "pool warmed up");
    }

    /// Acquire a connection to the default backend
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_from(None).await
    }

    /// Acquire a connection to one specific node
    pub async fn acquire_node(&self, addr: &str) -> Result<PooledConnection> {
        self.acquire_from(Some(addr)).await
    }

    async fn acquire_from(&self, addr: Option<&str>) -> Result<PooledConnection> {
        // Drain idle candidates until one answers a ping; stale idle
        // connections are destroyed rather than handed out.
        loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                match addr {
                    Some(addr) => idle.per_node.get_mut(addr).and_then(VecDeque::pop_front),
                    None => idle.shared.pop_front(),
                }
            };

            match candidate {
                Some(mut conn) => {
                    if conn.ping(self.read_timeout).await {
                        return Ok(conn);
                    }
                    tracing::debug!(id = conn.id(), "dropping stale idle connection");
                }
                None => break,
            }
        }

        // Nothing idle: create while under the cap, else fail fast.
        let Some(slot) = self.reserve_slot() else {
            let idle = self.idle.lock().await.len();
            return Err(CacheError::PoolExhausted {
                in_use: self.total.load(Ordering::Acquire).saturating_sub(idle),
                max: self.max,
            });
        };

        let target = addr.unwrap_or(&self.default_addr).to_string();
        self.open(target, slot).await
    }

    /// Return a connection after use. The connection is health-probed;
    /// healthy ones go back to the idle set (trimmed to the maximum),
    /// unhealthy ones are destroyed.
    pub async fn release(&self, mut conn: PooledConnection) {
        if !conn.ping(self.read_timeout).await {
            tracing::debug!(id = conn.id(), "destroying unhealthy connection on release");
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max {
            return; // Dropped: idle set already at capacity.
        }
        if conn.addr() == self.default_addr {
            idle.shared.push_back(conn);
        } else {
            let addr = conn.addr().to_string();
            idle.per_node.entry(addr).or_default().push_back(conn);
        }
    }

    /// Destroy a connection that must not be reused (for example after a
    /// failed or cancelled response wait)
    pub async fn discard(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Drop every idle connection
    pub async fn shutdown(&self) {
        let mut idle = self.idle.lock().await;
        let destroyed = idle.len();
        idle.shared.clear();
        idle.per_node.clear();
        tracing::debug!(destroyed, "pool shut down");
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Claim one unit of capacity, or `None` at the maximum
    fn reserve_slot(&self) -> Option<SlotGuard> {
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |total| {
                (total < self.max).then_some(total + 1)
            })
            .ok()
            .map(|_| SlotGuard(Arc::clone(&self.total)))
    }

    async fn open(&self, addr: String, slot: SlotGuard) -> Result<PooledConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Connection::connect(
            id,
            &addr,
            self.connect_timeout,
            self.read_timeout,
            self.password.as_deref(),
            self.database,
        )
        .await?;
        Ok(PooledConnection { conn, _slot: slot })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(min: usize, max: usize) -> RedisConfig {
        RedisConfig {
            pool_min: min,
            pool_max: max,
            ..RedisConfig::default()
        }
    }

    #[test]
    fn rejects_inverted_bounds() {
        let err = ConnectionPool::new(
            &test_config(8, 2),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ClusterMisconfigured");
    }

    #[tokio::test]
    async fn exhaustion_fails_fast() {
        let pool = ConnectionPool::new(
            &test_config(0, 0),
            Duration::from_millis(100),
            Duration::from_millis(100),
        )
        .unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err.kind(), "PoolExhausted");
    }

    #[tokio::test]
    async fn failed_creation_releases_the_slot() {
        // Nothing listens on this port, so creation fails; the reserved
        // slot must be returned so the pool does not leak capacity.
        let config = RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            pool_min: 0,
            pool_max: 1,
            ..RedisConfig::default()
        };
        let pool = ConnectionPool::new(
            &config,
            Duration::from_millis(200),
            Duration::from_millis(200),
        )
        .unwrap();

        for _ in 0..3 {
            let err = pool.acquire().await.unwrap_err();
            assert_ne!(err.kind(), "PoolExhausted");
        }
        assert_eq!(pool.total(), 0);
    }
}
