//! Configuration records and environment loading
//!
//! Every tunable lives in a closed record here; the loader reads the
//! documented environment keys and falls back to defaults for anything
//! absent or unparseable. The only fatal condition at load time is an
//! invalid cluster layout, which surfaces as `ClusterMisconfigured`.

use crate::errors::{CacheError, Result};
use crate::remote::router::{ClusterType, NodeDescriptor, NodeRole, ReadPreference};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the whole cache stack
#[derive(Debug, Clone)]
pub struct Config {
    /// Preferred engine name; `None` lets the selector rank by level
    pub preferred_engine: Option<String>,
    /// Store the selector falls back to when the preference is unavailable
    pub default_store: String,
    /// Default TTL in seconds applied when a caller passes no TTL
    pub default_ttl: u64,
    /// Operation count above which callers should batch
    pub async_threshold: usize,
    /// Chunk size for batched operations
    pub batch_size: usize,
    /// Soft process-wide memory ceiling for cache payloads, in bytes
    pub memory_limit: u64,
    pub memory: MemoryConfig,
    pub file: FileConfig,
    pub redis: RedisConfig,
    /// Present only when cluster mode is enabled
    pub cluster: Option<ClusterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            preferred_engine: None,
            default_store: "redis".to_string(),
            default_ttl: 3600,
            async_threshold: 1000,
            batch_size: 100,
            memory_limit: 256 * 1024 * 1024,
            memory: MemoryConfig::default(),
            file: FileConfig::default(),
            redis: RedisConfig::default(),
            cluster: None,
        }
    }
}

impl Config {
    /// Load configuration from the environment, validating the result
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(engine) = env::var("CACHE_ENGINE") {
            if !engine.is_empty() && engine != "auto" {
                config.preferred_engine = Some(engine);
            }
        }
        if let Ok(store) = env::var("CACHE_DEFAULT_STORE") {
            config.default_store = store;
        }
        read_env_number("CACHE_TTL_DEFAULT", &mut config.default_ttl);
        read_env_number("CACHE_ASYNC_THRESHOLD", &mut config.async_threshold);
        read_env_number("CACHE_BATCH_SIZE", &mut config.batch_size);
        read_env_size("CACHE_MEMORY_LIMIT", &mut config.memory_limit);

        config.memory = MemoryConfig::from_env();
        config.file = FileConfig::from_env();
        config.redis = RedisConfig::from_env()?;
        config.cluster = ClusterConfig::from_env()?;

        Ok(config)
    }
}

/// Memory engine tunables
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Hard byte budget for the memory engine
    pub max_size: u64,
    /// Seconds between synchronous expiry sweeps
    pub cleanup_interval: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            max_size: 100 * 1024 * 1024,
            cleanup_interval: 300,
        }
    }
}

impl MemoryConfig {
    pub fn from_env() -> Self {
        let mut config = MemoryConfig::default();
        read_env_size("CACHE_MEMORY_MAX_SIZE", &mut config.max_size);
        read_env_number("CACHE_MEMORY_CLEANUP_INTERVAL", &mut config.cleanup_interval);
        config
    }
}

/// File engine tunables
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Root directory for cache files
    pub root: PathBuf,
    /// Filename prefix ahead of the hashed key
    pub prefix: String,
    /// Unix mode applied to created directories
    pub permissions: u32,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            root: PathBuf::from("storage/cache"),
            prefix: String::new(),
            permissions: 0o755,
        }
    }
}

impl FileConfig {
    pub fn from_env() -> Self {
        let mut config = FileConfig::default();
        if let Ok(path) = env::var("CACHE_FILE_PATH") {
            if !path.is_empty() {
                config.root = PathBuf::from(path);
            }
        }
        if let Ok(mode) = env::var("CACHE_FILE_PERMISSIONS") {
            match u32::from_str_radix(mode.trim_start_matches("0o"), 8) {
                Ok(parsed) => config.permissions = parsed,
                Err(_) => {
                    tracing::warn!(value = %mode, "ignoring unparseable CACHE_FILE_PERMISSIONS")
                }
            }
        }
        config
    }
}

/// Remote backend connection settings
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u32,
    pub pool_min: usize,
    pub pool_max: usize,
    /// Bounds both TCP establishment and single-command responses when the
    /// cluster configuration does not override them
    pub timeout: Duration,
    pub retry_delay: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            database: 0,
            pool_min: 5,
            pool_max: 20,
            timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl RedisConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = RedisConfig::default();
        if let Ok(host) = env::var("CACHE_REDIS_HOST") {
            if !host.is_empty() {
                config.host = host;
            }
        }
        read_env_number("CACHE_REDIS_PORT", &mut config.port);
        if let Ok(password) = env::var("CACHE_REDIS_PASSWORD") {
            if !password.is_empty() {
                config.password = Some(password);
            }
        }
        read_env_number("CACHE_REDIS_DATABASE", &mut config.database);
        read_env_number("CACHE_REDIS_POOL_MIN", &mut config.pool_min);
        read_env_number("CACHE_REDIS_POOL_MAX", &mut config.pool_max);

        let mut timeout_secs = config.timeout.as_secs();
        read_env_number("CACHE_REDIS_TIMEOUT", &mut timeout_secs);
        config.timeout = Duration::from_secs(timeout_secs);

        let mut retry_ms = config.retry_delay.as_millis() as u64;
        read_env_number("CACHE_REDIS_RETRY_DELAY", &mut retry_ms);
        config.retry_delay = Duration::from_millis(retry_ms);

        config.validate()?;
        Ok(config)
    }

    /// Pool bounds must be ordered; an inverted range is rejected outright
    pub fn validate(&self) -> Result<()> {
        if self.pool_min > self.pool_max {
            return Err(CacheError::ClusterMisconfigured {
                reason: format!(
                    "pool_min ({}) exceeds pool_max ({})",
                    self.pool_min, self.pool_max
                ),
            });
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Cluster topology and routing settings
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub cluster_type: ClusterType,
    pub nodes: Vec<NodeDescriptor>,
    pub read_preference: ReadPreference,
    pub write_concern: u32,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub health_check_interval: Duration,
    pub auto_discovery: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cluster_type: ClusterType::Cluster,
            nodes: Vec::new(),
            read_preference: ReadPreference::Any,
            write_concern: 1,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            health_check_interval: Duration::from_secs(30),
            auto_discovery: false,
        }
    }
}

impl ClusterConfig {
    /// Read cluster settings; returns `None` unless cluster mode is enabled
    pub fn from_env() -> Result<Option<Self>> {
        if !env_flag("REDIS_CLUSTER_ENABLED") {
            return Ok(None);
        }

        let mut config = ClusterConfig::default();
        if let Ok(kind) = env::var("REDIS_CLUSTER_TYPE") {
            config.cluster_type = kind.parse().map_err(|_| CacheError::ClusterMisconfigured {
                reason: format!("unknown cluster type {kind:?}"),
            })?;
        }
        if let Ok(pref) = env::var("REDIS_CLUSTER_READ_PREFERENCE") {
            config.read_preference =
                pref.parse().map_err(|_| CacheError::ClusterMisconfigured {
                    reason: format!("unknown read preference {pref:?}"),
                })?;
        }
        config.auto_discovery = env_flag("REDIS_CLUSTER_AUTO_DISCOVERY");
        read_env_number("REDIS_CLUSTER_WRITE_CONCERN", &mut config.write_concern);
        read_env_number("REDIS_CLUSTER_RETRY_ATTEMPTS", &mut config.retry_attempts);

        let mut connect_secs = config.connect_timeout.as_secs();
        read_env_number("REDIS_CLUSTER_CONNECT_TIMEOUT", &mut connect_secs);
        config.connect_timeout = Duration::from_secs(connect_secs);

        let mut read_secs = config.read_timeout.as_secs();
        read_env_number("REDIS_CLUSTER_READ_TIMEOUT", &mut read_secs);
        config.read_timeout = Duration::from_secs(read_secs);

        let mut retry_ms = config.retry_delay.as_millis() as u64;
        read_env_number("REDIS_CLUSTER_RETRY_DELAY", &mut retry_ms);
        config.retry_delay = Duration::from_millis(retry_ms);

        let mut health_secs = config.health_check_interval.as_secs();
        read_env_number("REDIS_CLUSTER_HEALTH_CHECK_INTERVAL", &mut health_secs);
        config.health_check_interval = Duration::from_secs(health_secs);

        config.nodes = load_cluster_nodes()?;
        if config.nodes.is_empty() && !config.auto_discovery {
            return Err(CacheError::ClusterMisconfigured {
                reason: "cluster mode enabled but no nodes configured".to_string(),
            });
        }

        Ok(Some(config))
    }
}

/// Parse the compact `host:port[:role[:priority[:weight]]],…` node list
pub fn parse_node_list(spec: &str) -> Result<Vec<NodeDescriptor>> {
    let mut nodes = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        nodes.push(parse_node_spec(part)?);
    }
    Ok(nodes)
}

fn parse_node_spec(spec: &str) -> Result<NodeDescriptor> {
    let mut fields = spec.split(':');
    let host = fields.next().unwrap_or_default();
    if host.is_empty() {
        return Err(CacheError::ClusterMisconfigured {
            reason: format!("node spec {spec:?} has no host"),
        });
    }

    let port: u16 = fields
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| CacheError::ClusterMisconfigured {
            reason: format!("node spec {spec:?} has no valid port"),
        })?;

    let role = match fields.next() {
        Some(role) => role.parse().map_err(|_| CacheError::ClusterMisconfigured {
            reason: format!("node spec {spec:?} has unknown role"),
        })?,
        None => NodeRole::Unknown,
    };

    let priority: i32 = fields.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let weight: u32 = fields
        .next()
        .and_then(|w| w.parse().ok())
        .filter(|w| *w > 0)
        .unwrap_or(1);

    Ok(NodeDescriptor::new(host, port, role, priority, weight))
}

fn load_cluster_nodes() -> Result<Vec<NodeDescriptor>> {
    if let Ok(spec) = env::var("REDIS_CLUSTER_NODES") {
        if !spec.is_empty() {
            return parse_node_list(&spec);
        }
    }

    // Indexed form: REDIS_CLUSTER_NODE_<i>_HOST and friends
    let mut nodes = Vec::new();
    for i in 0.. {
        let host = match env::var(format!("REDIS_CLUSTER_NODE_{i}_HOST")) {
            Ok(host) if !host.is_empty() => host,
            _ => break,
        };
        let port: u16 = env::var(format!("REDIS_CLUSTER_NODE_{i}_PORT"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(6379);
        let role = env::var(format!("REDIS_CLUSTER_NODE_{i}_ROLE"))
            .ok()
            .and_then(|r| r.parse().ok())
            .unwrap_or(NodeRole::Unknown);
        let priority: i32 = env::var(format!("REDIS_CLUSTER_NODE_{i}_PRIORITY"))
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(0);
        let weight: u32 = env::var(format!("REDIS_CLUSTER_NODE_{i}_WEIGHT"))
            .ok()
            .and_then(|w| w.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1);
        nodes.push(NodeDescriptor::new(host, port, role, priority, weight));
    }
    Ok(nodes)
}

/// Parse a `<int>{K,M,G}` or bare-bytes size string
pub fn parse_size_limit(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (digits, multiplier) = match raw.chars().last() {
        Some('k') | Some('K') => (&raw[..raw.len() - 1], 1024),
        Some('m') | Some('M') => (&raw[..raw.len() - 1], 1024 * 1024),
        Some('g') | Some('G') => (&raw[..raw.len() - 1], 1024 * 1024 * 1024),
        _ => (raw, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .map(|n| n.saturating_mul(multiplier))
}

/// Serializable view of the config for diagnostics endpoints and dumps
#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigSummary {
    pub preferred_engine: Option<String>,
    pub default_store: String,
    pub default_ttl: u64,
    pub memory_max_size: u64,
    pub file_root: PathBuf,
    pub cluster_enabled: bool,
}

impl From<&Config> for ConfigSummary {
    fn from(config: &Config) -> Self {
        ConfigSummary {
            preferred_engine: config.preferred_engine.clone(),
            default_store: config.default_store.clone(),
            default_ttl: config.default_ttl,
            memory_max_size: config.memory.max_size,
            file_root: config.file.root.clone(),
            cluster_enabled: config.cluster.is_some(),
        }
    }
}

fn env_flag(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn read_env_number<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = env::var(key) {
        match raw.parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable numeric setting"),
        }
    }
}

fn read_env_size(key: &str, target: &mut u64) {
    if let Ok(raw) = env::var(key) {
        match parse_size_limit(&raw) {
            Some(parsed) => *target = parsed,
            None => tracing::warn!(key, value = %raw, "ignoring unparseable size setting"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_limit_suffixes() {
        assert_eq!(parse_size_limit("1024"), Some(1024));
        assert_eq!(parse_size_limit("100K"), Some(100 * 1024));
        assert_eq!(parse_size_limit("256m"), Some(256 * 1024 * 1024));
        assert_eq!(parse_size_limit("1G"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size_limit("12 M"), Some(12 * 1024 * 1024));
        assert_eq!(parse_size_limit(""), None);
        assert_eq!(parse_size_limit("lots"), None);
    }

    #[test]
    fn node_list_full_form() {
        let nodes =
            parse_node_list("10.0.0.1:7000:master:1:5, 10.0.0.2:7001:slave, 10.0.0.3:7002")
                .unwrap();
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].host, "10.0.0.1");
        assert_eq!(nodes[0].port, 7000);
        assert_eq!(nodes[0].role, NodeRole::Master);
        assert_eq!(nodes[0].priority, 1);
        assert_eq!(nodes[0].weight, 5);
        assert_eq!(nodes[1].role, NodeRole::Slave);
        assert_eq!(nodes[1].weight, 1);
        assert_eq!(nodes[2].role, NodeRole::Unknown);
    }

    #[test]
    fn node_list_rejects_missing_port() {
        assert!(parse_node_list("justahost").is_err());
        assert!(parse_node_list("host:notaport").is_err());
    }

    #[test]
    fn zero_weight_falls_back_to_one() {
        let nodes = parse_node_list("h:7000:slave:0:0").unwrap();
        assert_eq!(nodes[0].weight, 1);
    }

    #[test]
    fn inverted_pool_bounds_are_rejected() {
        let config = RedisConfig {
            pool_min: 10,
            pool_max: 5,
            ..RedisConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "ClusterMisconfigured");
    }

    #[test]
    fn defaults_match_documented_table() {
        let config = Config::default();
        assert_eq!(config.default_ttl, 3600);
        assert_eq!(config.async_threshold, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.memory.max_size, 100 * 1024 * 1024);
        assert_eq!(config.memory.cleanup_interval, 300);
        assert_eq!(config.redis.addr(), "127.0.0.1:6379");
        assert_eq!(config.redis.pool_min, 5);
        assert_eq!(config.redis.pool_max, 20);
        assert_eq!(config.file.root, PathBuf::from("storage/cache"));
        assert_eq!(config.file.permissions, 0o755);
        assert!(config.cluster.is_none());
    }
}
