//! Cluster topology and node routing
//!
//! The router owns the node set: it classifies nodes by role, picks read
//! and write targets, tracks health, and validates the configured layout
//! against the cluster type's minimums. Reads honor the configured
//! preference with weighted-random selection among healthy candidates;
//! writes always target the master.

use crate::errors::{CacheError, Result};
use crate::entry::unix_now;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::str::FromStr;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Master,
    Slave,
    Sentinel,
    Unknown,
}

impl FromStr for NodeRole {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "master" | "primary" => Ok(NodeRole::Master),
            "slave" | "replica" | "secondary" => Ok(NodeRole::Slave),
            "sentinel" => Ok(NodeRole::Sentinel),
            "unknown" => Ok(NodeRole::Unknown),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Active,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreference {
    Primary,
    Secondary,
    Any,
}

impl FromStr for ReadPreference {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "primary" | "master" => Ok(ReadPreference::Primary),
            "secondary" | "slave" | "replica" => Ok(ReadPreference::Secondary),
            "any" => Ok(ReadPreference::Any),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Cluster,
    Sentinel,
    Replica,
}

impl FromStr for ClusterType {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_lowercase().as_str() {
            "cluster" => Ok(ClusterType::Cluster),
            "sentinel" => Ok(ClusterType::Sentinel),
            "replica" | "replication" => Ok(ClusterType::Replica),
            _ => Err(()),
        }
    }
}

/// One remote node; unique per `host:port`
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    pub role: NodeRole,
    pub priority: i32,
    /// Weighted-random selection weight; always positive
    pub weight: u32,
    pub status: NodeStatus,
    /// Seconds since epoch of the last health probe
    pub last_check: u64,
}

impl NodeDescriptor {
    pub fn new(host: impl Into<String>, port: u16, role: NodeRole, priority: i32, weight: u32) -> Self {
        NodeDescriptor {
            host: host.into(),
            port,
            role,
            priority,
            weight: weight.max(1),
            status: NodeStatus::Active,
            last_check: 0,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Active
    }
}

/// Pluggable topology discovery. Backend-specific implementations (for
/// example `CLUSTER NODES` or `SENTINEL masters`) are injected by the
/// embedder; the router only guarantees a single invocation at
/// initialization when auto-discovery is enabled.
#[async_trait]
pub trait NodeDiscovery: Send + Sync {
    async fn discover(&self, seeds: &[NodeDescriptor]) -> Result<Vec<NodeDescriptor>>;
}

/// Routes operations across the configured node set
#[derive(Debug)]
pub struct ClusterRouter {
    cluster_type: ClusterType,
    read_preference: ReadPreference,
    nodes: RwLock<Vec<NodeDescriptor>>,
    health_check_interval: Duration,
    last_health_check: Mutex<Instant>,
}

impl ClusterRouter {
    /// Build a router over the configured nodes. Layout errors are fatal;
    /// layout warnings are logged and returned by `validate`.
    pub fn new(
        cluster_type: ClusterType,
        read_preference: ReadPreference,
        nodes: Vec<NodeDescriptor>,
        health_check_interval: Duration,
    ) -> Result<Self> {
        let router = ClusterRouter {
            cluster_type,
            read_preference,
            nodes: RwLock::new(dedupe(nodes)),
            health_check_interval,
            last_health_check: Mutex::new(Instant::now()),
        };
        for warning in router.validate()? {
            tracing::warn!(%warning, "cluster layout warning");
        }
        Ok(router)
    }

    /// Run auto-discovery once, replacing the node set with its result
    pub async fn auto_discover(&self, discovery: &dyn NodeDiscovery) -> Result<()> {
        let seeds = self.nodes.read().clone();
        let discovered = discovery.discover(&seeds).await?;
        if discovered.is_empty() {
            return Err(CacheError::ClusterMisconfigured {
                reason: "auto-discovery returned no nodes".to_string(),
            });
        }
        let count = discovered.len();
        *self.nodes.write() = dedupe(discovered);
        tracing::debug!(nodes = count, "cluster topology discovered");
        Ok(())
    }

    /// Check the layout against the cluster type's minimums.
    ///
    /// Returns warnings; hard violations (a required master missing, or a
    /// sentinel layout without sentinels) are errors.
    pub fn validate(&self) -> Result<Vec<String>> {
        let nodes = self.nodes.read();
        let masters = nodes.iter().filter(|n| n.role == NodeRole::Master).count();
        let slaves = nodes.iter().filter(|n| n.role == NodeRole::Slave).count();
        let sentinels = nodes.iter().filter(|n| n.role == NodeRole::Sentinel).count();
        let mut warnings = Vec::new();

        match self.cluster_type {
            ClusterType::Cluster => {
                if nodes.len() < 3 {
                    warnings.push(format!(
                        "cluster layouts expect at least 3 nodes, found {}",
                        nodes.len()
                    ));
                }
            }
            ClusterType::Sentinel => {
                if masters == 0 {
                    return Err(CacheError::ClusterMisconfigured {
                        reason: "sentinel layout requires a master".to_string(),
                    });
                }
                if sentinels < 3 {
                    warnings.push(format!(
                        "sentinel layouts expect at least 3 sentinels, found {sentinels}"
                    ));
                }
            }
            ClusterType::Replica => {
                if masters == 0 {
                    return Err(CacheError::ClusterMisconfigured {
                        reason: "replica layout requires a master".to_string(),
                    });
                }
                if slaves == 0 {
                    warnings.push("replica layout has no slaves".to_string());
                }
            }
        }
        Ok(warnings)
    }

    /// Pick the node a read should target, honoring the read preference.
    /// Returns `None` when no healthy node of the preferred class exists;
    /// callers fall through to the generic acquire path in that case.
    pub fn read_node(&self) -> Option<NodeDescriptor> {
        let nodes = self.nodes.read();
        match self.read_preference {
            ReadPreference::Primary => nodes
                .iter()
                .find(|n| n.role == NodeRole::Master && n.is_healthy())
                .cloned(),
            ReadPreference::Secondary => {
                let slaves: Vec<&NodeDescriptor> = nodes
                    .iter()
                    .filter(|n| n.role == NodeRole::Slave && n.is_healthy())
                    .collect();
                weighted_pick(&slaves).cloned()
            }
            ReadPreference::Any => {
                let healthy: Vec<&NodeDescriptor> = nodes
                    .iter()
                    .filter(|n| n.role != NodeRole::Sentinel && n.is_healthy())
                    .collect();
                weighted_pick(&healthy).cloned()
            }
        }
    }

    /// Writes always target the master
    pub fn write_node(&self) -> Option<NodeDescriptor> {
        self.nodes
            .read()
            .iter()
            .find(|n| n.role == NodeRole::Master && n.is_healthy())
            .cloned()
    }

    /// Healthy read candidates in preference order, for failover walks
    pub fn read_candidates(&self) -> Vec<NodeDescriptor> {
        let nodes = self.nodes.read();
        let mut candidates: Vec<NodeDescriptor> = match self.read_preference {
            ReadPreference::Primary => nodes
                .iter()
                .filter(|n| n.role == NodeRole::Master && n.is_healthy())
                .cloned()
                .collect(),
            ReadPreference::Secondary => nodes
                .iter()
                .filter(|n| n.role == NodeRole::Slave && n.is_healthy())
                .cloned()
                .collect(),
            ReadPreference::Any => nodes
                .iter()
                .filter(|n| n.role != NodeRole::Sentinel && n.is_healthy())
                .cloned()
                .collect(),
        };
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority));
        candidates
    }

    pub fn mark_unhealthy(&self, addr: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter_mut().find(|n| n.addr() == addr) {
            node.status = NodeStatus::Unhealthy;
            node.last_check = unix_now();
            tracing::warn!(addr, "node marked unhealthy");
        }
    }

    pub fn mark_active(&self, addr: &str) {
        let mut nodes = self.nodes.write();
        if let Some(node) = nodes.iter_mut().find(|n| n.addr() == addr) {
            node.status = NodeStatus::Active;
            node.last_check = unix_now();
            tracing::debug!(addr, "node restored to active");
        }
    }

    pub fn add_node(&self, node: NodeDescriptor) {
        let mut nodes = self.nodes.write();
        if !nodes.iter().any(|n| n.addr() == node.addr()) {
            nodes.push(node);
        }
    }

    pub fn remove_node(&self, addr: &str) -> bool {
        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|n| n.addr() != addr);
        nodes.len() != before
    }

    pub fn nodes(&self) -> Vec<NodeDescriptor> {
        self.nodes.read().clone()
    }

    /// Whether the out-of-band health sweep is due; claiming the tick
    /// resets the interval so concurrent callers do not double-probe
    pub fn health_check_due(&self) -> bool {
        let mut last = self.last_health_check.lock();
        if last.elapsed() >= self.health_check_interval {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    /// Probe every node and flip status in both directions
    pub async fn run_health_checks<F, Fut>(&self, probe: F)
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let targets: Vec<String> = self.nodes.read().iter().map(NodeDescriptor::addr).collect();
        for addr in targets {
            if probe(addr.clone()).await {
                self.mark_active(&addr);
            } else {
                self.mark_unhealthy(&addr);
            }
        }
    }
}

/// Weighted-random selection: draw `r` in `[1, Σweights]` and take the
/// first node whose cumulative weight reaches it
fn weighted_pick<'a>(candidates: &[&'a NodeDescriptor]) -> Option<&'a NodeDescriptor> {
    if candidates.is_empty() {
        return None;
    }
    let total: u64 = candidates.iter().map(|n| u64::from(n.weight)).sum();
    let draw = rand::thread_rng().gen_range(1..=total);
    let mut cumulative = 0u64;
    for node in candidates {
        cumulative += u64::from(node.weight);
        if cumulative >= draw {
            return Some(node);
        }
    }
    candidates.last().copied()
}

/// Keep the first descriptor for each `host:port`
fn dedupe(nodes: Vec<NodeDescriptor>) -> Vec<NodeDescriptor> {
    let mut seen = std::collections::HashSet::new();
    nodes
        .into_iter()
        .filter(|n| seen.insert(n.addr()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_node_replica() -> Vec<NodeDescriptor> {
        vec![
            NodeDescriptor::new("m", 7000, NodeRole::Master, 10, 1),
            NodeDescriptor::new("s", 7001, NodeRole::Slave, 0, 1),
            NodeDescriptor::new("s", 7002, NodeRole::Slave, 0, 1),
        ]
    }

    fn router(
        cluster_type: ClusterType,
        preference: ReadPreference,
        nodes: Vec<NodeDescriptor>,
    ) -> ClusterRouter {
        ClusterRouter::new(cluster_type, preference, nodes, Duration::from_secs(30)).unwrap()
    }

    #[test]
    fn writes_always_target_master() {
        let router = router(
            ClusterType::Replica,
            ReadPreference::Secondary,
            three_node_replica(),
        );
        assert_eq!(router.write_node().unwrap().addr(), "m:7000");
    }

    #[test]
    fn secondary_reads_avoid_unhealthy_slaves() {
        let router = router(
            ClusterType::Replica,
            ReadPreference::Secondary,
            three_node_replica(),
        );

        router.mark_unhealthy("s:7001");
        for _ in 0..100 {
            let node = router.read_node().expect("one slave is healthy");
            assert_eq!(node.addr(), "s:7002");
        }

        router.mark_unhealthy("s:7002");
        assert!(router.read_node().is_none());
    }

    #[test]
    fn recovered_nodes_are_selectable_again() {
        let router = router(
            ClusterType::Replica,
            ReadPreference::Secondary,
            three_node_replica(),
        );
        router.mark_unhealthy("s:7001");
        router.mark_unhealthy("s:7002");
        assert!(router.read_node().is_none());

        router.mark_active("s:7001");
        assert_eq!(router.read_node().unwrap().addr(), "s:7001");
    }

    #[test]
    fn any_preference_skips_sentinels() {
        let mut nodes = three_node_replica();
        nodes.push(NodeDescriptor::new("watch", 26379, NodeRole::Sentinel, 0, 1));
        let router = router(ClusterType::Replica, ReadPreference::Any, nodes);

        for _ in 0..50 {
            let node = router.read_node().unwrap();
            assert_ne!(node.role, NodeRole::Sentinel);
        }
    }

    #[test]
    fn weighted_pick_respects_weights() {
        let heavy = NodeDescriptor::new("heavy", 1, NodeRole::Slave, 0, 9);
        let light = NodeDescriptor::new("light", 2, NodeRole::Slave, 0, 1);
        let candidates = vec![&heavy, &light];

        let mut heavy_hits = 0;
        for _ in 0..1000 {
            if weighted_pick(&candidates).unwrap().host == "heavy" {
                heavy_hits += 1;
            }
        }
        // 90% expected; allow a generous band for randomness.
        assert!(heavy_hits > 700, "heavy node picked only {heavy_hits}/1000");
    }

    #[test]
    fn sentinel_layout_requires_master() {
        let nodes = vec![NodeDescriptor::new("watch", 26379, NodeRole::Sentinel, 0, 1)];
        let err = ClusterRouter::new(
            ClusterType::Sentinel,
            ReadPreference::Any,
            nodes,
            Duration::from_secs(30),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "ClusterMisconfigured");
    }

    #[test]
    fn small_cluster_is_a_warning_not_an_error() {
        let nodes = vec![NodeDescriptor::new("only", 7000, NodeRole::Master, 0, 1)];
        let router = router(ClusterType::Cluster, ReadPreference::Any, nodes);
        let warnings = router.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("at least 3 nodes"));
    }

    #[test]
    fn replica_without_slaves_warns() {
        let nodes = vec![NodeDescriptor::new("m", 7000, NodeRole::Master, 0, 1)];
        let router = router(ClusterType::Replica, ReadPreference::Primary, nodes);
        assert_eq!(router.validate().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_addrs_are_dropped() {
        let nodes = vec![
            NodeDescriptor::new("m", 7000, NodeRole::Master, 0, 1),
            NodeDescriptor::new("m", 7000, NodeRole::Slave, 0, 1),
        ];
        let router = router(ClusterType::Replica, ReadPreference::Primary, nodes);
        assert_eq!(router.nodes().len(), 1);
        assert_eq!(router.nodes()[0].role, NodeRole::Master);
    }

    #[test]
    fn remove_node_forgets_the_descriptor() {
        let router = router(
            ClusterType::Replica,
            ReadPreference::Secondary,
            three_node_replica(),
        );
        assert!(router.remove_node("s:7001"));
        assert!(!router.remove_node("s:7001"));
        assert_eq!(router.nodes().len(), 2);
    }

    #[test]
    fn role_and_preference_parsing() {
        assert_eq!("master".parse::<NodeRole>().unwrap(), NodeRole::Master);
        assert_eq!("replica".parse::<NodeRole>().unwrap(), NodeRole::Slave);
        assert!("czar".parse::<NodeRole>().is_err());
        assert_eq!(
            "secondary".parse::<ReadPreference>().unwrap(),
            ReadPreference::Secondary
        );
        assert_eq!("cluster".parse::<ClusterType>().unwrap(), ClusterType::Cluster);
    }

    #[tokio::test]
    async fn health_checks_flip_status_both_ways() {
        let router = router(
            ClusterType::Replica,
            ReadPreference::Secondary,
            three_node_replica(),
        );
        router.mark_unhealthy("s:7001");

        // Probe reports every node healthy again.
        router.run_health_checks(|_| async { true }).await;
        assert!(router.nodes().iter().all(NodeDescriptor::is_healthy));

        // Probe reports everything down.
        router.run_health_checks(|_| async { false }).await;
        assert!(router.nodes().iter().all(|n| !n.is_healthy()));
    }
}
