//! Network collaborator contract for distributed fan-out.
//!
//! The core never performs I/O itself: it hands a batch of prepared
//! requests to a [`NetworkClient`] and gets back raw bytes with timing.
//! Observability goes through an injected [`MetricsSink`] rather than any
//! process-wide state, so the core has no hidden side effects.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::model::PostingRecord;

// ── Wire types ───────────────────────────────────────────────────────────

/// Query envelope posted to each remote index node per round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEnvelope {
    pub query: String,
    /// Start of the shared pagination window.
    pub limit: u64,
    /// Rows requested from this node this round.
    pub num: u64,
}

/// Rows returned by one node for one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    pub rows: Vec<PostingRecord>,
    /// Set by a node whose local evaluation hit its sync budget.
    #[serde(default)]
    pub hard_query: bool,
}

/// One prepared request for a remote node.
#[derive(Debug, Clone)]
pub struct NodeRequest {
    pub url: String,
    pub body: Vec<u8>,
}

/// One node's reply. `body` is `None` when the node errored or never
/// responded; the fan-out treats that as "no rows, not yet exhausted".
#[derive(Debug, Clone)]
pub struct NodeReply {
    pub url: String,
    pub body: Option<Vec<u8>>,
    pub duration_ms: u64,
}

// ── NetworkClient trait ──────────────────────────────────────────────────

/// Batch fetch contract. All requests of one round are issued together and
/// the round completes once every node has responded or errored; replies
/// come back in request order.
pub trait NetworkClient: Send + Sync {
    fn fetch_batch(&self, requests: Vec<NodeRequest>) -> Vec<NodeReply>;
}

// ── Metrics sink ─────────────────────────────────────────────────────────

/// A single fan-out round's record for one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOp {
    pub url: String,
    pub bytes: u64,
    pub duration_ms: u64,
    pub rows: u64,
    pub hard_query: bool,
}

/// Snapshot of fan-out activity.
#[derive(Debug, Clone, Serialize)]
pub struct FanoutStats {
    pub total_requests: u64,
    pub total_bytes: u64,
    pub operations: Vec<NodeOp>,
}

/// Observability sink threaded through the fan-out iterator.
pub trait MetricsSink: Send + Sync {
    fn record(&self, op: NodeOp);
}

/// Sink that drops everything.
pub struct NullMetrics;

impl MetricsSink for NullMetrics {
    fn record(&self, _op: NodeOp) {}
}

/// In-memory sink with a snapshot/reset API.
#[derive(Default)]
pub struct MemoryMetrics {
    operations: RwLock<Vec<NodeOp>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> FanoutStats {
        let operations = self.operations.read().clone();
        FanoutStats {
            total_requests: operations.len() as u64,
            total_bytes: operations.iter().map(|op| op.bytes).sum(),
            operations,
        }
    }

    pub fn reset(&self) {
        self.operations.write().clear();
    }
}

impl MetricsSink for MemoryMetrics {
    fn record(&self, op: NodeOp) {
        self.operations.write().push(op);
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_metrics_snapshot() {
        let metrics = MemoryMetrics::new();
        metrics.record(NodeOp {
            url: "http://a".into(),
            bytes: 100,
            duration_ms: 5,
            rows: 3,
            hard_query: false,
        });
        metrics.record(NodeOp {
            url: "http://b".into(),
            bytes: 50,
            duration_ms: 9,
            rows: 0,
            hard_query: true,
        });

        let stats = metrics.snapshot();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_bytes, 150);
        assert_eq!(stats.operations.len(), 2);

        metrics.reset();
        assert_eq!(metrics.snapshot().total_requests, 0);
    }

    #[test]
    fn test_query_envelope_roundtrip() {
        let envelope = QueryEnvelope {
            query: "lang:rust iterators".into(),
            limit: 200,
            num: 50,
        };
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let back: QueryEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.query, envelope.query);
        assert_eq!(back.limit, 200);
        assert_eq!(back.num, 50);
    }
}
