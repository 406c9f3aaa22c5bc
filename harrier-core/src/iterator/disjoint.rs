//! Disjoint merge: OR across mutually exclusive partitions.
//!
//! Where the union merge reads every child per block, this one pulls only
//! from the single child currently holding the least position. That is
//! the right shape when the children are known-disjoint partitions of one
//! posting space (e.g. the same term across same-index shards), so no
//! cross-child deduplication is ever needed.

use crate::error::{contract_violation, Result};
use crate::iterator::{IteratorCore, QueryIterator};
use crate::model::{GenerationOffset, ResultBlock};

pub struct DisjointIterator {
    children: Vec<Box<dyn QueryIterator>>,
    core: IteratorCore,
}

impl DisjointIterator {
    pub fn new(mut children: Vec<Box<dyn QueryIterator>>) -> Result<Self> {
        if children.is_empty() {
            return Err(contract_violation("disjoint iterator requires children"));
        }
        for child in &mut children {
            child.set_block_size(1)?;
        }
        let mut core = IteratorCore::new(1);
        core.num_docs_estimate = children
            .iter()
            .map(|c| c.core().num_docs_estimate)
            .fold(0u64, u64::saturating_add);
        Ok(Self { children, core })
    }

    /// Index of the child at the least position, if any child remains.
    fn least_child(&mut self) -> Result<Option<usize>> {
        let mut best: Option<(GenerationOffset, usize)> = None;
        for (i, child) in self.children.iter_mut().enumerate() {
            let pos = child.current_position()?;
            if pos.is_terminal() {
                continue;
            }
            if best.map_or(true, |(b, _)| pos < b) {
                best = Some((pos, i));
            }
        }
        Ok(best.map(|(_, i)| i))
    }
}

impl QueryIterator for DisjointIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        let Some(i) = self.least_child()? else {
            return Ok(None);
        };
        let Some(block) = self.children[i].current_block()?.cloned() else {
            // Child turned out exhausted at fetch; an empty block lets the
            // caller advance and re-evaluate
            return Ok(Some(ResultBlock::new()));
        };
        let mut out = ResultBlock::with_capacity(block.len());
        for record in block.iter() {
            let mut tagged = record.clone();
            tagged.origin = i;
            out.insert(tagged);
        }
        Ok(Some(out))
    }

    fn reset(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.reset()?;
        }
        self.core.reset_counters();
        self.core.num_docs_estimate = self
            .children
            .iter()
            .map(|c| c.core().num_docs_estimate)
            .fold(0u64, u64::saturating_add);
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        self.core.seen_docs += self.core.cached_len() as u64;
        self.core.invalidate();
        match bound {
            Some(b) => {
                // Keep every partition at or past the bound
                for child in &mut self.children {
                    let pos = child.current_position()?;
                    if !pos.is_terminal() && pos < b {
                        child.advance(Some(b))?;
                    }
                }
            }
            None => {
                if let Some(i) = self.least_child()? {
                    self.children[i].advance(None)?;
                }
            }
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        let mut min_pos = GenerationOffset::TERMINAL;
        for child in &mut self.children {
            let pos = child.current_position()?;
            min_pos = min_pos.min(pos);
        }
        Ok(min_pos)
    }

    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        // Exactly one partition owns any given posting; the others
        // contribute zero
        let mut total = 0.0;
        for child in &mut self.children {
            total += child.compute_relevance(generation, posting_offset)?;
        }
        Ok(total)
    }

    fn set_block_size(&mut self, n: usize) -> Result<()> {
        if n != 1 {
            return Err(contract_violation(format!(
                "set_block_size({}) on a disjoint iterator: correctness \
                 depends on a fixed block size of 1",
                n
            )));
        }
        Ok(())
    }

    fn plan_label(&self) -> String {
        format!("disjoint ({} children)", self.children.len())
    }

    fn children(&self) -> &[Box<dyn QueryIterator>] {
        &self.children
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::Error;
    use crate::iterator::TermIterator;
    use crate::model::DocKey;
    use crate::store::{RamPosting, RamPostingStore};

    fn key(doc: u64) -> DocKey {
        DocKey::new(doc, doc + 1000, doc + 2000)
    }

    fn partitioned_store() -> Arc<RamPostingStore> {
        let store = Arc::new(RamPostingStore::new(7));
        // Two disjoint partitions of one posting space
        for doc in [10u64, 30, 50] {
            store.insert_posting(b"part_a", 0, RamPosting::doc(doc, key(doc)));
        }
        for doc in [20u64, 40] {
            store.insert_posting(b"part_b", 0, RamPosting::doc(doc, key(doc)));
        }
        store
    }

    fn disjoint(store: &Arc<RamPostingStore>) -> DisjointIterator {
        DisjointIterator::new(vec![
            Box::new(TermIterator::new(store.clone(), b"part_a".to_vec(), 0).unwrap())
                as Box<dyn QueryIterator>,
            Box::new(TermIterator::new(store.clone(), b"part_b".to_vec(), 0).unwrap()),
        ])
        .unwrap()
    }

    #[test]
    fn test_disjoint_yields_sorted_merge() {
        let store = partitioned_store();
        let mut it = disjoint(&store);

        let mut docs = Vec::new();
        while let Some(block) = it.next_block_advancing(None).unwrap() {
            if let Some(record) = block.first() {
                docs.push(record.key.url_hash);
            }
        }
        assert_eq!(docs, vec![10, 20, 30, 40, 50]);
        assert_eq!(it.core().seen_docs, 5);
    }

    #[test]
    fn test_disjoint_pulls_single_child_per_fetch() {
        let store = partitioned_store();
        let mut it = disjoint(&store);

        let block = it.current_block().unwrap().unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block.first().unwrap().origin, 0);
        it.advance(None).unwrap();

        // Only the consumed partition moved
        assert_eq!(it.children[0].core().seen_docs, 1);
        assert_eq!(it.children[1].core().seen_docs, 0);
    }

    #[test]
    fn test_disjoint_position_is_least_child() {
        let store = partitioned_store();
        let mut it = disjoint(&store);
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 10));
        it.advance(None).unwrap();
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 20));
    }

    #[test]
    fn test_disjoint_bound_advances_all_partitions() {
        let store = partitioned_store();
        let mut it = disjoint(&store);
        it.advance(Some(GenerationOffset::new(0, 40))).unwrap();
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 40));
        let block = it.current_block().unwrap().unwrap();
        assert_eq!(block.first().unwrap().key, key(40));
    }

    #[test]
    fn test_disjoint_set_block_size_contract() {
        let store = partitioned_store();
        let mut it = disjoint(&store);
        assert!(matches!(
            it.set_block_size(2),
            Err(Error::ContractViolation(_))
        ));
        assert!(it.set_block_size(1).is_ok());
    }
}
