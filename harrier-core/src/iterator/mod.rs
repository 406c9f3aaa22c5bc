//! The shared iterator contract and common bookkeeping.
//!
//! `QueryIterator` is the surface every node of a query tree exposes:
//! leaves walk posting shards, composites merge their children, and the
//! whole tree nests recursively behind `Box<dyn QueryIterator>` without
//! callers knowing concrete types. Common state (block-freshness cache,
//! seen-document counters, block sizing) lives in [`IteratorCore`],
//! embedded by every implementation.

mod disjoint;
mod doc;
mod group;
mod intersect;
mod network;
mod term;
mod union;

pub use disjoint::DisjointIterator;
pub use doc::DocIterator;
pub use group::GroupIterator;
pub use intersect::IntersectIterator;
pub use network::FanoutIterator;
pub use term::TermIterator;
pub use union::UnionIterator;

use crate::error::Result;
use crate::model::{DocKey, GenerationOffset, ResultBlock};

/// Default number of records per fetched block for leaf iterators.
pub const DEFAULT_RESULTS_PER_BLOCK: usize = 200;

// ── Block cache ──────────────────────────────────────────────────────────

/// Cached outcome of the last fetch. `Exhausted` is distinct from an
/// empty-but-valid block: an empty block can still mean "more may come
/// from other generations"; `Exhausted` means this subtree will never
/// produce data again.
#[derive(Debug, Clone, Default)]
enum CachedBlock {
    #[default]
    Stale,
    Ready(ResultBlock),
    Exhausted,
}

/// Bookkeeping shared by every iterator.
#[derive(Debug, Default)]
pub struct IteratorCore {
    /// Continuously revised estimate of total matching documents. Used
    /// only for pagination, never for merge correctness.
    pub num_docs_estimate: u64,
    /// Documents this iterator has yielded so far.
    pub seen_docs: u64,
    /// Maximum records per fetched block. Merge composites force this
    /// to 1 and refuse changes.
    pub results_per_block: usize,
    cache: CachedBlock,
}

impl IteratorCore {
    pub fn new(results_per_block: usize) -> Self {
        Self {
            results_per_block,
            ..Self::default()
        }
    }

    /// Whether the cache reflects the current cursor position. When true,
    /// the cached block equals what a fresh read would produce.
    #[inline]
    pub fn is_fresh(&self) -> bool {
        !matches!(self.cache, CachedBlock::Stale)
    }

    /// Drop the cache. Every mutating advance calls this before moving
    /// the cursor.
    #[inline]
    pub fn invalidate(&mut self) {
        self.cache = CachedBlock::Stale;
    }

    pub fn set_cache(&mut self, block: Option<ResultBlock>) {
        self.cache = match block {
            Some(b) => CachedBlock::Ready(b),
            None => CachedBlock::Exhausted,
        };
    }

    pub fn cached_block(&self) -> Option<&ResultBlock> {
        match &self.cache {
            CachedBlock::Ready(b) => Some(b),
            _ => None,
        }
    }

    /// Records in the cached block, 0 when stale or exhausted.
    pub fn cached_len(&self) -> usize {
        self.cached_block().map(|b| b.len()).unwrap_or(0)
    }

    /// Clear counters and cache when the cursor returns to the start.
    pub fn reset_counters(&mut self) {
        self.seen_docs = 0;
        self.invalidate();
    }
}

// ── QueryIterator trait ──────────────────────────────────────────────────

/// Contract implemented by every node of a query tree.
pub trait QueryIterator: Send {
    fn core(&self) -> &IteratorCore;
    fn core_mut(&mut self) -> &mut IteratorCore;

    /// Type-specific fetch of the block at the current cursor position.
    /// `None` means exhausted; `Some` of an empty block means "nothing
    /// here, but advancing may still find more".
    fn fetch_block(&mut self) -> Result<Option<ResultBlock>>;

    /// Return the cursor to the first block, clearing counters and any
    /// dictionary state that depends on shard growth. Idempotent.
    fn reset(&mut self) -> Result<()>;

    /// Invalidate the cache and move the cursor past the current block.
    /// With a bound, skip forward to the first position >= `bound`; every
    /// composite must propagate bounds to its children so sorted merges
    /// terminate and stay synchronized.
    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()>;

    /// Position of the next record without consuming it.
    /// [`GenerationOffset::TERMINAL`] once exhausted. Fails with
    /// `ContractViolation` on iterators with no single linear position
    /// (union, fan-out).
    fn current_position(&mut self) -> Result<GenerationOffset>;

    /// On-demand relevance recomputation for one stored posting. 1.0 for
    /// iterators with no per-posting relevance concept.
    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        let _ = (generation, posting_offset);
        Ok(1.0)
    }

    /// Set `results_per_block`. Fails with `ContractViolation` on merge
    /// composites whose correctness depends on a fixed block size of 1.
    fn set_block_size(&mut self, n: usize) -> Result<()> {
        let core = self.core_mut();
        core.results_per_block = n;
        core.invalidate();
        Ok(())
    }

    /// One line of plan description for this node.
    fn plan_label(&self) -> String;

    /// Child iterators, for plan recursion. Empty for leaves.
    fn children(&self) -> &[Box<dyn QueryIterator>] {
        &[]
    }

    /// Cached block if fresh, otherwise fetch, cache, and mark fresh.
    fn current_block(&mut self) -> Result<Option<&ResultBlock>> {
        if !self.core().is_fresh() {
            let fetched = self.fetch_block()?;
            self.core_mut().set_cache(fetched);
        }
        Ok(self.core().cached_block())
    }

    /// Read-then-advance convenience: clone the current block, then move
    /// past it. `None` once exhausted.
    fn next_block_advancing(
        &mut self,
        bound: Option<GenerationOffset>,
    ) -> Result<Option<ResultBlock>> {
        let block = self.current_block()?.cloned();
        if block.is_some() {
            self.advance(bound)?;
        }
        Ok(block)
    }

    /// Subset of the current block matching `keys`, used to route summary
    /// resolution. Composites with origin tagging override this to ask
    /// the owning child.
    fn current_docs_for_keys(&mut self, keys: &[DocKey]) -> Result<ResultBlock> {
        let mut out = ResultBlock::new();
        if let Some(block) = self.current_block()? {
            for key in keys {
                if let Some(record) = block.get(key) {
                    out.insert(record.clone());
                }
            }
        }
        Ok(out)
    }

    /// Recursive human-readable dump of the iterator tree. Diagnostic
    /// only; no correctness impact.
    fn describe_plan(&self) -> String {
        let mut out = String::new();
        self.write_plan(0, &mut out);
        out
    }

    fn write_plan(&self, depth: usize, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(
            out,
            "{:indent$}{} [est {}]",
            "",
            self.plan_label(),
            self.core().num_docs_estimate,
            indent = depth * 2
        );
        for child in self.children() {
            child.write_plan(depth + 1, out);
        }
    }
}

// ── EmptyIterator ────────────────────────────────────────────────────────

/// Always-exhausted leaf, used by planners for terms that do not exist.
#[derive(Default)]
pub struct EmptyIterator {
    core: IteratorCore,
}

impl EmptyIterator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueryIterator for EmptyIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        Ok(None)
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reset_counters();
        Ok(())
    }

    fn advance(&mut self, _bound: Option<GenerationOffset>) -> Result<()> {
        self.core.invalidate();
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        Ok(GenerationOffset::TERMINAL)
    }

    fn plan_label(&self) -> String {
        "empty".to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_iterator() {
        let mut it = EmptyIterator::new();
        assert!(it.current_block().unwrap().is_none());
        assert_eq!(it.current_position().unwrap(), GenerationOffset::TERMINAL);
        assert!(it.next_block_advancing(None).unwrap().is_none());
        assert_eq!(it.compute_relevance(0, 0).unwrap(), 1.0);
    }

    #[test]
    fn test_core_freshness() {
        let mut core = IteratorCore::new(10);
        assert!(!core.is_fresh());
        core.set_cache(Some(ResultBlock::new()));
        assert!(core.is_fresh());
        assert_eq!(core.cached_len(), 0);
        core.invalidate();
        assert!(!core.is_fresh());
    }

    #[test]
    fn test_core_exhausted_cache_is_fresh_but_empty() {
        let mut core = IteratorCore::new(10);
        core.set_cache(None);
        assert!(core.is_fresh());
        assert!(core.cached_block().is_none());
    }

    #[test]
    fn test_describe_plan_single_node() {
        let it = EmptyIterator::new();
        let plan = it.describe_plan();
        assert!(plan.starts_with("empty"));
    }
}
