//! Distributed fan-out: the same query posed to N remote index nodes.
//!
//! Each fetch issues one batched request per still-live node over a
//! shared pagination window. A node returning fewer rows than asked is
//! marked exhausted; a node that errors counts as "no rows, not yet
//! exhausted" so a transient fault degrades completeness instead of
//! failing the query. As nodes drain, the per-node ask grows to keep the
//! total page size roughly constant.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::{contract_violation, Result};
use crate::fetch::{MetricsSink, NetworkClient, NodeOp, NodeRequest, NodeResponse, NullMetrics, QueryEnvelope};
use crate::iterator::{IteratorCore, QueryIterator, DEFAULT_RESULTS_PER_BLOCK};
use crate::model::{GenerationOffset, ResultBlock};

pub struct FanoutIterator {
    client: Arc<dyn NetworkClient>,
    nodes: Vec<String>,
    query: String,
    /// Client-side domain filter, re-applied after merging as defense in
    /// depth and for filters the remote nodes do not know about.
    filter: Option<Arc<FxHashSet<u64>>>,
    metrics: Arc<dyn MetricsSink>,
    /// `false` once a node has signalled exhaustion.
    more_flags: Vec<bool>,
    /// Start of the shared pagination window, advanced uniformly.
    limit: u64,
    /// Per-node ask of the last issued round.
    last_num: u64,
    /// Total rows requested across nodes in the last issued round.
    last_requested: u64,
    hard_query: bool,
    core: IteratorCore,
}

impl FanoutIterator {
    pub fn new(
        client: Arc<dyn NetworkClient>,
        nodes: Vec<String>,
        query: impl Into<String>,
    ) -> Result<Self> {
        if nodes.is_empty() {
            return Err(contract_violation("fan-out iterator requires nodes"));
        }
        let more_flags = vec![true; nodes.len()];
        Ok(Self {
            client,
            nodes,
            query: query.into(),
            filter: None,
            metrics: Arc::new(NullMetrics),
            more_flags,
            limit: 0,
            last_num: 0,
            last_requested: 0,
            hard_query: false,
            core: IteratorCore::new(DEFAULT_RESULTS_PER_BLOCK),
        })
    }

    pub fn with_filter(mut self, filter: Arc<FxHashSet<u64>>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether any node reported its local evaluation as a hard query.
    pub fn hard_query(&self) -> bool {
        self.hard_query
    }

    fn live_nodes(&self) -> Vec<usize> {
        self.more_flags
            .iter()
            .enumerate()
            .filter(|(_, &live)| live)
            .map(|(i, _)| i)
            .collect()
    }
}

impl QueryIterator for FanoutIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        let live = self.live_nodes();
        if live.is_empty() {
            return Ok(None);
        }
        let num = self.core.results_per_block as u64;
        self.last_num = num;
        self.last_requested = num * live.len() as u64;

        let mut requests = Vec::with_capacity(live.len());
        for &i in &live {
            let envelope = QueryEnvelope {
                query: self.query.clone(),
                limit: self.limit,
                num,
            };
            requests.push(NodeRequest {
                url: self.nodes[i].clone(),
                body: serde_json::to_vec(&envelope)?,
            });
        }
        let replies = self.client.fetch_batch(requests);

        let mut block = ResultBlock::new();
        for (&i, reply) in live.iter().zip(replies) {
            let Some(bytes) = reply.body else {
                // Errored or missing node: no rows this round, but it may
                // still have data, so it stays live
                log::debug!("fan-out node {} returned no response", reply.url);
                self.metrics.record(NodeOp {
                    url: reply.url,
                    bytes: 0,
                    duration_ms: reply.duration_ms,
                    rows: 0,
                    hard_query: false,
                });
                continue;
            };
            let response: NodeResponse = match serde_json::from_slice(&bytes) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("fan-out node {} sent malformed rows: {}", reply.url, e);
                    continue;
                }
            };
            if (response.rows.len() as u64) < num {
                self.more_flags[i] = false;
            }
            self.hard_query |= response.hard_query;
            self.metrics.record(NodeOp {
                url: reply.url,
                bytes: bytes.len() as u64,
                duration_ms: reply.duration_ms,
                rows: response.rows.len() as u64,
                hard_query: response.hard_query,
            });
            for mut record in response.rows {
                if let Some(filter) = &self.filter {
                    if filter.contains(&record.key.host_hash) {
                        continue;
                    }
                }
                match block.get_mut(&record.key) {
                    Some(existing) => {
                        existing.relevance += record.relevance;
                        existing.score += record.score;
                        existing.proximity = existing.proximity.max(record.proximity);
                    }
                    None => {
                        record.origin = i;
                        block.insert(record);
                    }
                }
            }
        }
        self.core.num_docs_estimate = self
            .core
            .num_docs_estimate
            .max(self.core.seen_docs + block.len() as u64);
        Ok(Some(block))
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reset_counters();
        self.more_flags = vec![true; self.nodes.len()];
        self.limit = 0;
        self.last_num = 0;
        self.last_requested = 0;
        self.hard_query = false;
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        if bound.is_some() {
            log::trace!("fan-out iterator has no offset space; bound ignored");
        }
        self.core.seen_docs += self.core.cached_len() as u64;
        self.core.invalidate();
        self.limit += self.last_num;
        // Adaptive batch sizing: remaining nodes are asked for
        // proportionally more so the total page stays roughly constant
        let live = self.live_nodes().len() as u64;
        if live > 0 && self.last_requested > 0 {
            self.core.results_per_block = self.last_requested.div_ceil(live) as usize;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        Err(contract_violation(
            "current_position on a fan-out iterator: there is no single \
             linear offset space across nodes",
        ))
    }

    fn plan_label(&self) -> String {
        format!("fanout ({} nodes)", self.nodes.len())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
