//! Asynchronous remote-backend engine
//!
//! Wraps the connection pool and cluster router behind the uniform engine
//! contract. Reads route through the configured read preference and fall
//! through to the generic acquire path when no healthy node of that class
//! remains; writes always target the master and fail with `NoHealthyNode`
//! once every master is exhausted. Transient faults retry up to the
//! configured attempt budget.

pub mod connection;
pub mod pool;
pub mod resp;
pub mod router;

use crate::config::{ClusterConfig, RedisConfig};
use crate::engine::CacheEngine;
use crate::errors::{CacheError, Result};
use async_trait::async_trait;
use pool::{ConnectionPool, PooledConnection};
use resp::Reply;
use router::{ClusterRouter, NodeDiscovery};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

/// Redis-protocol engine over a pooled, cluster-aware transport
#[derive(Debug)]
pub struct RemoteEngine {
    pool: ConnectionPool,
    router: Option<ClusterRouter>,
    connect_timeout: Duration,
    read_timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl RemoteEngine {
    /// Build the engine. In cluster mode the router is constructed (and
    /// the layout validated) here; invalid layouts are fatal.
    pub fn new(redis: &RedisConfig, cluster: Option<&ClusterConfig>) -> Result<Self> {
        let (connect_timeout, read_timeout, retry_attempts, retry_delay) = match cluster {
            Some(c) => (
                c.connect_timeout,
                c.read_timeout,
                c.retry_attempts,
                c.retry_delay,
            ),
            None => (redis.timeout, redis.timeout, 3, redis.retry_delay),
        };

        let router = match cluster {
            Some(c) => Some(ClusterRouter::new(
                c.cluster_type,
                c.read_preference,
                c.nodes.clone(),
                c.health_check_interval,
            )?),
            None => None,
        };

        Ok(RemoteEngine {
            pool: ConnectionPool::new(redis, connect_timeout, read_timeout)?,
            router,
            connect_timeout,
            read_timeout,
            retry_attempts,
            retry_delay,
        })
    }

    /// Warm the pool and, when enabled, run topology discovery once
    pub async fn initialize(
        &self,
        discovery: Option<&dyn NodeDiscovery>,
    ) -> Result<()> {
        if let (Some(router), Some(discovery)) = (&self.router, discovery) {
            router.auto_discover(discovery).await?;
        }
        self.pool.warm_up().await;
        Ok(())
    }

    pub fn router(&self) -> Option<&ClusterRouter> {
        self.router.as_ref()
    }

    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    pub async fn ping(&self) -> bool {
        match self.pool.acquire().await {
            Ok(mut conn) => {
                let alive = conn.ping(self.read_timeout).await;
                if alive {
                    self.pool.release(conn).await;
                } else {
                    self.pool.discard(conn).await;
                }
                alive
            }
            Err(_) => false,
        }
    }

    /// Acquire a connection for a read, walking the preferred class first.
    /// Connect failures mark the node unhealthy and move on; an empty or
    /// exhausted class falls through to the generic acquire path.
    async fn acquire_read(&self) -> Result<PooledConnection> {
        let Some(router) = &self.router else {
            return self.pool.acquire().await;
        };
        self.maybe_health_check(router).await;

        let mut targets: Vec<String> = Vec::new();
        if let Some(first) = router.read_node() {
            targets.push(first.addr());
        }
        for node in router.read_candidates() {
            let addr = node.addr();
            if !targets.contains(&addr) {
                targets.push(addr);
            }
        }

        for addr in &targets {
            match self.pool.acquire_node(addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) if node_fault(&e) => {
                    tracing::warn!(addr = %addr, error = %e, "read node unreachable, failing over");
                    router.mark_unhealthy(addr);
                }
                Err(e) => return Err(e),
            }
        }
        self.pool.acquire().await
    }

    /// Acquire a connection to the master, failing with `NoHealthyNode`
    /// once every master has been exhausted
    async fn acquire_write(&self) -> Result<PooledConnection> {
        let Some(router) = &self.router else {
            return self.pool.acquire().await;
        };
        self.maybe_health_check(router).await;

        while let Some(node) = router.write_node() {
            let addr = node.addr();
            match self.pool.acquire_node(&addr).await {
                Ok(conn) => return Ok(conn),
                Err(e) if node_fault(&e) => {
                    tracing::warn!(addr = %addr, error = %e, "master unreachable, failing over");
                    router.mark_unhealthy(&addr);
                }
                Err(e) => return Err(e),
            }
        }
        Err(CacheError::NoHealthyNode { role: "master" })
    }

    /// Opportunistic out-of-band health sweep once the interval elapses
    async fn maybe_health_check(&self, router: &ClusterRouter) {
        if !router.health_check_due() {
            return;
        }
        let connect_timeout = self.connect_timeout;
        router
            .run_health_checks(move |addr| async move {
                matches!(
                    tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await,
                    Ok(Ok(_))
                )
            })
            .await;
    }

    async fn run_read(&self, args: &[&[u8]]) -> Result<Reply> {
        let conn = self.acquire_read().await?;
        self.run_on(conn, args).await
    }

    async fn run_write(&self, args: &[&[u8]]) -> Result<Reply> {
        let conn = self.acquire_write().await?;
        self.run_on(conn, args).await
    }

    async fn run_on(&self, mut conn: PooledConnection, args: &[&[u8]]) -> Result<Reply> {
        match conn.execute(args, self.read_timeout).await {
            Ok(reply) => {
                self.pool.release(conn).await;
                Ok(reply)
            }
            Err(e) => {
                // Mid-protocol failures leave the stream in an unknown
                // state; the connection cannot be safely reused.
                self.pool.discard(conn).await;
                Err(e)
            }
        }
    }

    /// Retry transient faults up to the configured budget
    async fn retry<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.retry_attempts => {
                    attempt += 1;
                    tracing::debug!(operation, attempt, error = %e, "retrying after transient fault");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Whether an acquire failure indicts the node (as opposed to the pool)
fn node_fault(e: &CacheError) -> bool {
    matches!(
        e,
        CacheError::ConnectionFailed { .. } | CacheError::Timeout { .. }
    )
}

/// Map a server error reply onto a domain error
fn reply_error(key: &str, message: &str, addr: &str) -> CacheError {
    if message.contains("not an integer") || message.starts_with("WRONGTYPE") {
        CacheError::TypeMismatch {
            key: key.to_string(),
            detail: message.to_string(),
        }
    } else {
        // Routing and transient server states (READONLY, LOADING, MOVED)
        // surface as connection faults so the retry loop re-routes them.
        CacheError::ConnectionFailed {
            addr: addr.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, message.to_string()),
        }
    }
}

#[async_trait]
impl CacheEngine for RemoteEngine {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn performance_level(&self) -> u8 {
        3
    }

    async fn is_available(&self) -> bool {
        self.ping().await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.retry("GET", move || async move {
            let args: [&[u8]; 2] = [b"GET", key.as_bytes()];
            let reply = self.run_read(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "read node")),
                other => Ok(other.into_bytes()),
            }
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: u64) -> Result<()> {
        self.retry("SET", move || async move {
            let ttl_text = ttl.to_string();
            let args: Vec<&[u8]> = if ttl > 0 {
                vec![b"SETEX", key.as_bytes(), ttl_text.as_bytes(), value]
            } else {
                vec![b"SET", key.as_bytes(), value]
            };
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "write node")),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.retry("DEL", move || async move {
            let args: [&[u8]; 2] = [b"DEL", key.as_bytes()];
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "write node")),
                other => Ok(other.as_integer().unwrap_or(0) > 0),
            }
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.retry("EXISTS", move || async move {
            let args: [&[u8]; 2] = [b"EXISTS", key.as_bytes()];
            let reply = self.run_read(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "read node")),
                other => Ok(other.as_integer().unwrap_or(0) > 0),
            }
        })
        .await
    }

    async fn add(&self, key: &str, value: &[u8], ttl: u64) -> Result<bool> {
        self.retry("SETNX", move || async move {
            let ttl_text = ttl.to_string();
            let mut args: Vec<&[u8]> = vec![b"SET", key.as_bytes(), value, b"NX"];
            if ttl > 0 {
                args.push(b"EX");
                args.push(ttl_text.as_bytes());
            }
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "write node")),
                // NX miss answers with a null bulk; success with +OK.
                other => Ok(other.is_ok()),
            }
        })
        .await
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        self.retry("INCRBY", move || async move {
            let delta_text = delta.to_string();
            let args: [&[u8]; 3] = [b"INCRBY", key.as_bytes(), delta_text.as_bytes()];
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error(key, &message, "write node")),
                other => other.as_integer().ok_or_else(|| {
                    CacheError::serialization(key, "INCRBY reply was not an integer")
                }),
            }
        })
        .await
    }

    async fn touch(&self, key: &str, ttl: u64) -> Result<bool> {
        self.retry("EXPIRE", move || async move {
            if ttl > 0 {
                let ttl_text = ttl.to_string();
                let args: [&[u8]; 3] = [b"EXPIRE", key.as_bytes(), ttl_text.as_bytes()];
                let reply = self.run_write(&args).await?;
                match reply {
                    Reply::Error(message) => Err(reply_error(key, &message, "write node")),
                    other => Ok(other.as_integer().unwrap_or(0) > 0),
                }
            } else {
                let args: [&[u8]; 2] = [b"PERSIST", key.as_bytes()];
                let reply = self.run_write(&args).await?;
                if let Reply::Error(message) = reply {
                    return Err(reply_error(key, &message, "write node"));
                }
                // PERSIST answers 0 both for "no expiry" and "no key";
                // report presence explicitly.
                self.exists(key).await
            }
        })
        .await
    }

    async fn clear(&self) -> Result<()> {
        self.retry("FLUSHDB", move || async move {
            let args: [&[u8]; 1] = [b"FLUSHDB"];
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error("*", &message, "write node")),
                _ => Ok(()),
            }
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.retry("DBSIZE", move || async move {
            let args: [&[u8]; 1] = [b"DBSIZE"];
            let reply = self.run_read(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error("*", &message, "read node")),
                other => Ok(other.as_integer().unwrap_or(0).max(0) as usize),
            }
        })
        .await
    }

    /// The server expires entries natively; nothing to sweep client-side
    async fn cleanup(&self) -> Result<usize> {
        Ok(0)
    }

    async fn shutdown(&self) {
        RemoteEngine::shutdown(self).await;
    }

    async fn get_multiple(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mget = self
            .retry("MGET", move || async move {
                let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
                args.push(b"MGET");
                args.extend(keys.iter().map(|k| k.as_bytes()));
                let reply = self.run_read(&args).await?;
                match reply {
                    Reply::Array(Some(replies)) if replies.len() == keys.len() => Ok(replies
                        .into_iter()
                        .map(Reply::into_bytes)
                        .collect::<Vec<_>>()),
                    Reply::Error(message) => Err(reply_error("*", &message, "read node")),
                    other => Err(CacheError::serialization(
                        "MGET",
                        format!("unexpected reply shape: {other:?}"),
                    )),
                }
            })
            .await;

        match mget {
            Ok(values) => Ok(values),
            Err(e) => {
                // Degrade to per-key reads; failing keys read as absent.
                tracing::warn!(error = %e, "MGET failed, falling back to per-key reads");
                let mut values = Vec::with_capacity(keys.len());
                for key in keys {
                    values.push(self.get(key).await.unwrap_or(None));
                }
                Ok(values)
            }
        }
    }

    async fn set_multiple(&self, entries: &[(String, Vec<u8>)], ttl: u64) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        if ttl == 0 {
            // One MSET covers the whole batch when nothing expires.
            let mset = self
                .retry("MSET", move || async move {
                    let mut args: Vec<&[u8]> = Vec::with_capacity(entries.len() * 2 + 1);
                    args.push(b"MSET");
                    for (key, value) in entries {
                        args.push(key.as_bytes());
                        args.push(value);
                    }
                    let reply = self.run_write(&args).await?;
                    match reply {
                        Reply::Error(message) => Err(reply_error("*", &message, "write node")),
                        _ => Ok(entries.len()),
                    }
                })
                .await;
            if let Ok(stored) = mset {
                return Ok(stored);
            }
        } else {
            // Expiring batches go out as one pipelined burst of SETEX.
            let ttl_text = ttl.to_string();
            let commands: Vec<Vec<Vec<u8>>> = entries
                .iter()
                .map(|(key, value)| {
                    vec![
                        b"SETEX".to_vec(),
                        key.as_bytes().to_vec(),
                        ttl_text.as_bytes().to_vec(),
                        value.clone(),
                    ]
                })
                .collect();

            let commands = &commands;
            let pipelined = self
                .retry("SETEX pipeline", move || async move {
                    let mut conn = self.acquire_write().await?;
                    match conn.pipeline(&commands, self.read_timeout).await {
                        Ok(replies) => {
                            self.pool.release(conn).await;
                            Ok(replies)
                        }
                        Err(e) => {
                            self.pool.discard(conn).await;
                            Err(e)
                        }
                    }
                })
                .await;

            if let Ok(replies) = pipelined {
                let mut stored = replies.iter().filter(|r| r.is_ok()).count();
                // Retry only the keys whose command was rejected.
                for (i, reply) in replies.iter().enumerate() {
                    if !reply.is_ok() {
                        let (key, value) = &entries[i];
                        if self.set(key, value, ttl).await.is_ok() {
                            stored += 1;
                        }
                    }
                }
                return Ok(stored);
            }
        }

        // Batched path failed outright: degrade to per-key sets.
        tracing::warn!("batched set failed, falling back to per-key sets");
        let mut stored = 0;
        for (key, value) in entries {
            if self.set(key, value, ttl).await.is_ok() {
                stored += 1;
            }
        }
        Ok(stored)
    }

    async fn delete_multiple(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.retry("DEL", move || async move {
            let mut args: Vec<&[u8]> = Vec::with_capacity(keys.len() + 1);
            args.push(b"DEL");
            args.extend(keys.iter().map(|k| k.as_bytes()));
            let reply = self.run_write(&args).await?;
            match reply {
                Reply::Error(message) => Err(reply_error("*", &message, "write node")),
                other => Ok(other.as_integer().unwrap_or(0).max(0) as usize),
            }
        })
        .await
    }
}
