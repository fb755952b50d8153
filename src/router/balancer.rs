//! Load balancing algorithms, sticky sessions, and per-node metrics.
//! Selection works over `&[Node]` candidate slices so it stays a pure
//! function the router can unit test without a live registry.

use std::collections::HashMap;
use std::collections::VecDeque;

use parking_lot::RwLock;

use crate::cluster::node::Node;
use crate::config::LoadBalancingAlgorithm;

const RESPONSE_TIME_WINDOW: usize = 100;

#[derive(Default)]
struct NodeMetrics {
    active_connections: u32,
    response_times: VecDeque<f64>,
    total_requests: u64,
}

pub struct LoadBalancer {
    algorithm: LoadBalancingAlgorithm,
    round_robin_index: RwLock<usize>,
    metrics: RwLock<HashMap<String, NodeMetrics>>,
    sticky_sessions: RwLock<HashMap<String, String>>,
    sticky_enabled: bool,
}

impl LoadBalancer {
    pub fn new(algorithm: LoadBalancingAlgorithm, sticky_enabled: bool) -> Self {
        Self {
            algorithm,
            round_robin_index: RwLock::new(0),
            metrics: RwLock::new(HashMap::new()),
            sticky_sessions: RwLock::new(HashMap::new()),
            sticky_enabled,
        }
    }

    fn avg_response_time(&self, node_id: &str) -> f64 {
        let metrics = self.metrics.read();
        match metrics.get(node_id) {
            Some(m) if !m.response_times.is_empty() => {
                m.response_times.iter().sum::<f64>() / m.response_times.len() as f64
            }
            _ => 0.0,
        }
    }

    fn connection_count(&self, node_id: &str) -> u32 {
        self.metrics
            .read()
            .get(node_id)
            .map(|m| m.active_connections)
            .unwrap_or(0)
    }

    /// Selects a candidate from `candidates` (already filtered to healthy,
    /// role-eligible, circuit-closed nodes by the caller). Honors sticky
    /// sessions first when `client_id` is given.
    pub fn select_node<'a>(&self, candidates: &'a [Node], client_id: Option<&str>) -> Option<&'a Node> {
        if candidates.is_empty() {
            return None;
        }
        if self.sticky_enabled {
            if let Some(client_id) = client_id {
                if let Some(sticky_id) = self.sticky_sessions.read().get(client_id).cloned() {
                    if let Some(node) = candidates.iter().find(|n| n.node_id == sticky_id) {
                        return Some(node);
                    }
                }
            }
        }

        let selected = match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => self.round_robin(candidates),
            LoadBalancingAlgorithm::LeastConnections => self.least_connections(candidates),
            LoadBalancingAlgorithm::WeightedRoundRobin => self.weighted_round_robin(candidates),
            LoadBalancingAlgorithm::IpHash => self.ip_hash(candidates, client_id.unwrap_or("default")),
            LoadBalancingAlgorithm::LeastResponseTime => self.least_response_time(candidates),
        };

        if self.sticky_enabled {
            if let (Some(client_id), Some(node)) = (client_id, selected) {
                self.sticky_sessions
                    .write()
                    .insert(client_id.to_string(), node.node_id.clone());
            }
        }
        selected
    }

    fn round_robin<'a>(&self, candidates: &'a [Node]) -> Option<&'a Node> {
        let mut index = self.round_robin_index.write();
        let node = &candidates[*index % candidates.len()];
        *index += 1;
        Some(node)
    }

    fn least_connections<'a>(&self, candidates: &'a [Node]) -> Option<&'a Node> {
        candidates.iter().min_by_key(|n| self.connection_count(&n.node_id))
    }

    fn weighted_round_robin<'a>(&self, candidates: &'a [Node]) -> Option<&'a Node> {
        let total_weight: u32 = candidates.iter().map(|n| n.capabilities.priority as u32).sum();
        if total_weight == 0 {
            return self.round_robin(candidates);
        }
        let mut weighted: Vec<&Node> = Vec::new();
        for node in candidates {
            for _ in 0..node.capabilities.priority {
                weighted.push(node);
            }
        }
        if weighted.is_empty() {
            return candidates.first();
        }
        let mut index = self.round_robin_index.write();
        let node = weighted[*index % weighted.len()];
        *index += 1;
        Some(node)
    }

    fn ip_hash<'a>(&self, candidates: &'a [Node], client_id: &str) -> Option<&'a Node> {
        let digest = crate::util::sha256_hex(client_id.as_bytes());
        let hash_value = u64::from_str_radix(&digest[..16], 16).unwrap_or(0);
        let index = (hash_value as usize) % candidates.len();
        candidates.get(index)
    }

    fn least_response_time<'a>(&self, candidates: &'a [Node]) -> Option<&'a Node> {
        candidates.iter().min_by(|a, b| {
            self.avg_response_time(&a.node_id)
                .partial_cmp(&self.avg_response_time(&b.node_id))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
    }

    pub fn increment_connection(&self, node_id: &str) {
        self.metrics
            .write()
            .entry(node_id.to_string())
            .or_default()
            .active_connections += 1;
    }

    /// Records request outcome metrics (connection count, rolling response
    /// time). Circuit breaker bookkeeping is the router's job, not the
    /// balancer's, so callers invoke `CircuitBreaker::record_success/failure`
    /// alongside this.
    pub fn record_request(&self, node_id: &str, duration_secs: f64) {
        let mut metrics = self.metrics.write();
        let entry = metrics.entry(node_id.to_string()).or_default();
        if entry.active_connections > 0 {
            entry.active_connections -= 1;
        }
        entry.response_times.push_back(duration_secs);
        if entry.response_times.len() > RESPONSE_TIME_WINDOW {
            entry.response_times.pop_front();
        }
        entry.total_requests += 1;
    }

    pub fn node_stats(&self, node_id: &str) -> NodeStats {
        let metrics = self.metrics.read();
        match metrics.get(node_id) {
            Some(m) => NodeStats {
                active_connections: m.active_connections,
                avg_response_time_secs: if m.response_times.is_empty() {
                    0.0
                } else {
                    m.response_times.iter().sum::<f64>() / m.response_times.len() as f64
                },
                total_requests: m.total_requests,
            },
            None => NodeStats::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeStats {
    pub active_connections: u32,
    pub avg_response_time_secs: f64,
    pub total_requests: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{HealthMetrics, NodeCapabilities, NodeRole, NodeStatus, ReplicationMetrics};

    fn node(id: &str, priority: u8) -> Node {
        Node {
            node_id: id.to_string(),
            hostname: "h".to_string(),
            port: 1,
            role: NodeRole::Replica,
            status: NodeStatus::Healthy,
            capabilities: NodeCapabilities {
                priority,
                ..Default::default()
            },
            health: HealthMetrics::default(),
            replication: ReplicationMetrics::default(),
            owner_user_id: None,
            hashed_cluster_token: String::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn round_robin_advances_through_candidates() {
        let lb = LoadBalancer::new(LoadBalancingAlgorithm::RoundRobin, false);
        let nodes = vec![node("a", 50), node("b", 50), node("c", 50)];
        let picks: Vec<String> = (0..4)
            .map(|_| lb.select_node(&nodes, None).unwrap().node_id.clone())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn least_connections_picks_minimum() {
        let lb = LoadBalancer::new(LoadBalancingAlgorithm::LeastConnections, false);
        let nodes = vec![node("r1", 50), node("r2", 50), node("r3", 50)];
        lb.increment_connection("r1");
        lb.increment_connection("r1");
        lb.increment_connection("r1");
        lb.increment_connection("r1");
        lb.increment_connection("r1");
        lb.increment_connection("r2");
        lb.increment_connection("r2");
        lb.increment_connection("r3");
        for _ in 0..7 {
            lb.increment_connection("r3");
        }
        let picked = lb.select_node(&nodes, None).unwrap();
        assert_eq!(picked.node_id, "r2");

        lb.increment_connection("r2");
        lb.increment_connection("r2");
        let picked = lb.select_node(&nodes, None).unwrap();
        assert_eq!(picked.node_id, "r2");
    }

    #[test]
    fn sticky_sessions_keep_client_on_same_node() {
        let lb = LoadBalancer::new(LoadBalancingAlgorithm::RoundRobin, true);
        let nodes = vec![node("a", 50), node("b", 50)];
        let first = lb.select_node(&nodes, Some("client-1")).unwrap().node_id.clone();
        for _ in 0..5 {
            let picked = lb.select_node(&nodes, Some("client-1")).unwrap();
            assert_eq!(picked.node_id, first);
        }
    }

    #[test]
    fn ip_hash_is_stable_for_same_client() {
        let lb = LoadBalancer::new(LoadBalancingAlgorithm::IpHash, false);
        let nodes = vec![node("a", 50), node("b", 50), node("c", 50)];
        let first = lb.select_node(&nodes, Some("1.2.3.4")).unwrap().node_id.clone();
        let second = lb.select_node(&nodes, Some("1.2.3.4")).unwrap().node_id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn least_response_time_prefers_unmeasured_nodes() {
        let lb = LoadBalancer::new(LoadBalancingAlgorithm::LeastResponseTime, false);
        let nodes = vec![node("a", 50), node("b", 50)];
        lb.record_request("a", 0.5);
        let picked = lb.select_node(&nodes, None).unwrap();
        assert_eq!(picked.node_id, "b");
    }
}
