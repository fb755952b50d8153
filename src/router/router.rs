//! Request router: routing decisions, forwarding, and the glue between
//! the load balancer and circuit breaker. Writes route to masters, reads
//! route to any healthy reader, filtered first by node availability and
//! then by circuit breaker state before the balancing algorithm runs.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::{Client, Method};

use crate::cluster::node::{Node, NodeRole};
use crate::cluster::registry::NodeRegistry;
use crate::error::{ClusterError, Result};
use crate::router::balancer::{LoadBalancer, NodeStats};
use crate::router::circuit_breaker::CircuitBreaker;

/// Headers that describe a single hop and must not be copied across one,
/// in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn from_method(method: &Method) -> Self {
        match *method {
            Method::GET | Method::HEAD | Method::OPTIONS => Operation::Read,
            _ => Operation::Write,
        }
    }
}

/// A request awaiting a routing decision. Only the fields the router needs
/// to decide and forward are modeled; the HTTP layer owns the rest.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub target_node_id: String,
    pub url: String,
    pub method: Method,
    pub forwarded_from: String,
}

pub struct Router {
    this_node_id: String,
    registry: Arc<NodeRegistry>,
    balancer: LoadBalancer,
    circuit_breaker: CircuitBreaker,
    read_preference_secondary: bool,
    cluster_token: String,
    client: Client,
}

impl Router {
    pub fn new(
        this_node_id: String,
        registry: Arc<NodeRegistry>,
        balancer: LoadBalancer,
        circuit_breaker: CircuitBreaker,
        read_preference_secondary: bool,
        cluster_token: String,
    ) -> Self {
        Self {
            this_node_id,
            registry,
            balancer,
            circuit_breaker,
            read_preference_secondary,
            cluster_token,
            client: Client::new(),
        }
    }

    async fn available_candidates(&self, operation: Operation) -> Result<Vec<Node>> {
        let nodes = self
            .registry
            .list_nodes(None, Some(crate::cluster::node::NodeStatus::Healthy))
            .await?;
        let mut candidates: Vec<Node> = match operation {
            Operation::Write => nodes
                .into_iter()
                .filter(|n| n.role == NodeRole::Master && n.capabilities.supports_writes)
                .collect(),
            Operation::Read => nodes.into_iter().filter(|n| n.capabilities.supports_reads).collect(),
        };
        if operation == Operation::Read && self.read_preference_secondary {
            candidates.retain(|n| n.node_id != self.this_node_id || n.role != NodeRole::Master);
        }
        candidates.retain(|n| self.circuit_breaker.is_available(&n.node_id));
        Ok(candidates)
    }

    /// Chooses a target node from `candidates` (or all available candidates
    /// for `operation` if `None`).
    pub async fn select_node(
        &self,
        candidates: Option<Vec<Node>>,
        client_id: Option<&str>,
        operation: Operation,
    ) -> Result<Option<Node>> {
        let candidates = match candidates {
            Some(c) => c,
            None => self.available_candidates(operation).await?,
        };
        Ok(self.balancer.select_node(&candidates, client_id).cloned())
    }

    /// Returns `None` when the request should be handled locally, or the
    /// forwarding plan when it must go to another node. Writes with no
    /// candidate raise `Unavailable`; reads with no candidate also resolve
    /// to local handling.
    pub async fn route(&self, request: &RouteRequest) -> Result<Option<ForwardedRequest>> {
        let operation = Operation::from_method(&request.method);
        let target = self
            .select_node(None, request.client_id.as_deref(), operation)
            .await?;

        let target = match target {
            Some(t) => t,
            None => {
                return match operation {
                    Operation::Write => Err(ClusterError::Unavailable(
                        "no healthy master available to accept the write".to_string(),
                    )),
                    Operation::Read => Ok(None),
                };
            }
        };

        if target.node_id == self.this_node_id {
            return Ok(None);
        }

        self.balancer.increment_connection(&target.node_id);
        let mut url = format!("http://{}:{}{}", target.hostname, target.port, request.path);
        if let Some(query) = &request.query {
            url.push('?');
            url.push_str(query);
        }
        Ok(Some(ForwardedRequest {
            target_node_id: target.node_id,
            url,
            method: request.method.clone(),
            forwarded_from: self.this_node_id.clone(),
        }))
    }

    /// Sends a request `route` decided must be forwarded to its target
    /// node, carrying over the original method, URL, and headers (minus
    /// hop-by-hop) plus the body, and adds `X-Forwarded-From` and the
    /// cluster token. Returns the upstream status, headers, and body
    /// verbatim for the caller to relay back to the client.
    pub async fn forward_request(
        &self,
        forwarded: &ForwardedRequest,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut forward_headers = HeaderMap::new();
        for (name, value) in headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            forward_headers.append(name.clone(), value.clone());
        }
        forward_headers.insert(
            HeaderName::from_static("x-forwarded-from"),
            HeaderValue::from_str(&forwarded.forwarded_from)
                .map_err(|e| ClusterError::Internal(e.to_string()))?,
        );
        forward_headers.insert(
            HeaderName::from_static("x-cluster-token"),
            HeaderValue::from_str(&self.cluster_token).map_err(|e| ClusterError::Internal(e.to_string()))?,
        );

        let response = self
            .client
            .request(forwarded.method.clone(), &forwarded.url)
            .headers(forward_headers)
            .body(body)
            .send()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;

        let status = response.status();
        let mut response_headers = response.headers().clone();
        for name in HOP_BY_HOP_HEADERS {
            response_headers.remove(*name);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ClusterError::Transport(e.to_string()))?;
        Ok((status, response_headers, body))
    }

    pub fn cluster_token(&self) -> &str {
        &self.cluster_token
    }

    pub fn record_request(&self, node_id: &str, success: bool, duration: Duration) {
        self.balancer.record_request(node_id, duration.as_secs_f64());
        if success {
            self.circuit_breaker.record_success(node_id);
        } else {
            self.circuit_breaker.record_failure(node_id);
        }
    }

    pub fn increment_connection(&self, node_id: &str) {
        self.balancer.increment_connection(node_id);
    }

    pub fn reset_circuit(&self, node_id: &str) {
        self.circuit_breaker.reset(node_id);
    }

    pub fn node_stats(&self, node_id: &str) -> NodeStats {
        self.balancer.node_stats(node_id)
    }
}
