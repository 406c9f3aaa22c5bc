//! Post-merge grouping: deduplicate and aggregate duplicate
//! representations of a page.
//!
//! Accumulates a grouping window of records across possibly several child
//! advances (groupable duplicates are scattered across many small child
//! blocks), buckets them by URL hash with the page record first, sums
//! scores with per-domain repetition decay, folds mirror buckets that
//! share a content hash, and emits one representative record per
//! surviving bucket with a deferred summary-source list.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Result;
use crate::iterator::{IteratorCore, QueryIterator, DEFAULT_RESULTS_PER_BLOCK};
use crate::model::{
    GenerationOffset, PostingRecord, ResultBlock, SummaryMachine, SummaryRef, SummarySource,
};

/// Baseline grouping window; divided by the node-count hint since each
/// node of a distributed deployment only needs to over-scan its share.
pub const MIN_GROUP_WINDOW: usize = 200;

/// Weight decay for successive records from the same inlink domain
/// within one bucket.
pub const DOMAIN_REPEAT_DECAY: f64 = 0.5;

/// Relevance boost for a bucket whose URL hash equals its own host hash
/// (a site's homepage linking to itself).
pub const HOME_PAGE_BOOST: f64 = 2.0;

struct Bucket {
    url_hash: u64,
    records: Vec<PostingRecord>,
}

pub struct GroupIterator {
    child: Box<dyn QueryIterator>,
    /// Minimum records accumulated from the child before grouping.
    group_window: usize,
    distributed: bool,
    /// URL hashes finalized by earlier fetches; cross-call dedup.
    grouped_keys: FxHashSet<u64>,
    child_exhausted: bool,
    core: IteratorCore,
}

impl GroupIterator {
    pub fn new(child: Box<dyn QueryIterator>, node_count_hint: usize, distributed: bool) -> Self {
        let group_window = MIN_GROUP_WINDOW.div_ceil(node_count_hint.max(1));
        let mut core = IteratorCore::new(DEFAULT_RESULTS_PER_BLOCK);
        core.num_docs_estimate = child.core().num_docs_estimate;
        Self {
            child,
            group_window,
            distributed,
            grouped_keys: FxHashSet::default(),
            child_exhausted: false,
            core,
        }
    }

    /// Override the grouping window (tuning and tests).
    pub fn with_group_window(mut self, window: usize) -> Self {
        self.group_window = window.max(1);
        self
    }

    /// Pass 1: bucket records by URL hash, page records prepended so the
    /// primary page is always position 0, link records appended. Buckets
    /// already finalized by a prior call are dropped.
    fn group_by_hash_url(&mut self, pending: Vec<PostingRecord>) -> Vec<Bucket> {
        let mut buckets: Vec<Bucket> = Vec::new();
        let mut index: FxHashMap<u64, usize> = FxHashMap::default();
        for record in pending {
            let url_hash = record.key.url_hash;
            if self.grouped_keys.contains(&url_hash) {
                continue;
            }
            let at = *index.entry(url_hash).or_insert_with(|| {
                buckets.push(Bucket {
                    url_hash,
                    records: Vec::new(),
                });
                buckets.len() - 1
            });
            if record.is_doc {
                buckets[at].records.insert(0, record);
            } else {
                buckets[at].records.push(record);
            }
        }
        buckets
    }

    /// Pass 2: fold each bucket's scores into its primary record.
    ///
    /// Successive records from the same inlink domain contribute at half
    /// the weight of the previous one from that domain; a bucket whose
    /// URL hash equals its own host hash gets the homepage relevance
    /// boost.
    fn aggregate_scores(bucket: &mut Bucket) {
        let mut domain_weight: FxHashMap<u64, f64> = FxHashMap::default();
        let mut rank_sum = 0.0;
        let mut relevance_sum = 0.0;
        let mut score_sum = 0.0;
        let mut proximity_max = 0.0f64;
        for record in &bucket.records {
            let weight = domain_weight.entry(record.key.host_hash).or_insert(1.0);
            rank_sum += record.doc_rank * *weight;
            relevance_sum += record.relevance * *weight;
            score_sum += record.score * *weight;
            proximity_max = proximity_max.max(record.proximity);
            *weight *= DOMAIN_REPEAT_DECAY;
        }
        let primary = &mut bucket.records[0];
        if primary.key.url_hash == primary.key.host_hash {
            relevance_sum *= HOME_PAGE_BOOST;
        }
        primary.doc_rank = rank_sum;
        primary.relevance = relevance_sum;
        primary.score = score_sum;
        primary.proximity = proximity_max;
    }

    /// Across different URL hashes sharing one content hash (mirrors),
    /// keep only the highest-aggregate bucket and fold the others' rank,
    /// relevance and proximity into it. Ties break toward the
    /// earlier-inserted bucket; this tie-break is implementation-defined
    /// but relied on by tests.
    fn dedup_content_hashes(buckets: Vec<Bucket>) -> Vec<Bucket> {
        let mut winner_of: FxHashMap<u64, usize> = FxHashMap::default();
        for (i, bucket) in buckets.iter().enumerate() {
            let content = bucket.records[0].key.content_hash;
            match winner_of.get(&content) {
                Some(&w) if buckets[w].records[0].score >= bucket.records[0].score => {}
                _ => {
                    winner_of.insert(content, i);
                }
            }
        }
        let mut folded: FxHashMap<usize, (f64, f64, f64, f64)> = FxHashMap::default();
        for (i, bucket) in buckets.iter().enumerate() {
            let content = bucket.records[0].key.content_hash;
            let w = winner_of[&content];
            if w != i {
                let entry = folded.entry(w).or_insert((0.0, 0.0, 0.0, 0.0f64));
                let loser = &bucket.records[0];
                entry.0 += loser.doc_rank;
                entry.1 += loser.relevance;
                entry.2 += loser.score;
                entry.3 = entry.3.max(loser.proximity);
            }
        }
        let mut out = Vec::new();
        for (i, mut bucket) in buckets.into_iter().enumerate() {
            let content = bucket.records[0].key.content_hash;
            if winner_of[&content] != i {
                continue;
            }
            if let Some((rank, relevance, score, proximity)) = folded.get(&i) {
                let primary = &mut bucket.records[0];
                primary.doc_rank += rank;
                primary.relevance += relevance;
                primary.score += score;
                primary.proximity = primary.proximity.max(*proximity);
            }
            out.push(bucket);
        }
        out
    }

    /// Output pass: flatten each surviving bucket into one representative
    /// record whose summary becomes a deferred source list, resolved
    /// later by the summary-fetching collaborator.
    fn compute_out_pages(&self, buckets: Vec<Bucket>) -> ResultBlock {
        let mut block = ResultBlock::with_capacity(buckets.len());
        for bucket in buckets {
            let mut sources = Vec::with_capacity(bucket.records.len());
            let representative = bucket.records[0].clone();
            if self.distributed && representative.is_special {
                // Special location:/info: pages also resolve against the
                // name server in a distributed deployment
                sources.push(SummarySource {
                    machine: SummaryMachine::NameServer,
                    key: representative.key,
                    crawl_time: representative.crawl_time,
                    generation: 0,
                    offset: 0,
                });
            }
            for record in &bucket.records {
                match &record.summary {
                    SummaryRef::Offset(offset) => sources.push(SummarySource {
                        machine: SummaryMachine::Local,
                        key: record.key,
                        crawl_time: record.crawl_time,
                        generation: record.generation,
                        offset: *offset,
                    }),
                    SummaryRef::Resolved(existing) => sources.extend(existing.iter().cloned()),
                }
            }
            let mut out = representative;
            out.summary = SummaryRef::Resolved(sources);
            block.insert(out);
        }
        block
    }
}

impl QueryIterator for GroupIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        if self.child_exhausted {
            return Ok(None);
        }
        let mut pending: Vec<PostingRecord> = Vec::new();
        while pending.len() < self.group_window {
            match self.child.next_block_advancing(None)? {
                Some(block) => pending.extend(block.iter().cloned()),
                None => {
                    self.child_exhausted = true;
                    break;
                }
            }
        }
        if pending.is_empty() {
            return Ok(if self.child_exhausted {
                None
            } else {
                Some(ResultBlock::new())
            });
        }

        let mut buckets = self.group_by_hash_url(pending);
        for bucket in &mut buckets {
            Self::aggregate_scores(bucket);
        }
        // Everything in this window is final after this call, including
        // buckets folded away as mirrors
        for bucket in &buckets {
            self.grouped_keys.insert(bucket.url_hash);
        }
        let survivors = Self::dedup_content_hashes(buckets);
        Ok(Some(self.compute_out_pages(survivors)))
    }

    fn reset(&mut self) -> Result<()> {
        self.child.reset()?;
        self.core.reset_counters();
        self.core.num_docs_estimate = self.child.core().num_docs_estimate;
        self.grouped_keys.clear();
        self.child_exhausted = false;
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        self.core.seen_docs += self.core.cached_len() as u64;
        self.core.invalidate();
        // The child was already advanced while accumulating the window;
        // only an explicit bound needs forwarding
        if bound.is_some() && !self.child_exhausted {
            self.child.advance(bound)?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        if self.child_exhausted {
            return Ok(GenerationOffset::TERMINAL);
        }
        self.child.current_position()
    }

    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        self.child.compute_relevance(generation, posting_offset)
    }

    fn plan_label(&self) -> String {
        format!(
            "group (window {}{})",
            self.group_window,
            if self.distributed { ", distributed" } else { "" }
        )
    }

    fn children(&self) -> &[Box<dyn QueryIterator>] {
        std::slice::from_ref(&self.child)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
