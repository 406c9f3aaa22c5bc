//! Union merge: OR across arbitrary, possibly overlapping children.
//!
//! Reads a whole block from every child per fetch rather than doing a
//! sorted k-way merge, tagging each record with its origin child so
//! summary lookups can be routed back. Because of the block-at-a-time
//! shape, a single-position peek is meaningless here and `results_per_block`
//! is derived from the children, never set by callers.

use crate::error::{contract_violation, Result};
use crate::iterator::{IteratorCore, QueryIterator};
use crate::model::{DocKey, GenerationOffset, ResultBlock};

pub struct UnionIterator {
    children: Vec<Box<dyn QueryIterator>>,
    core: IteratorCore,
}

impl UnionIterator {
    pub fn new(children: Vec<Box<dyn QueryIterator>>) -> Result<Self> {
        if children.is_empty() {
            return Err(contract_violation("union iterator requires children"));
        }
        let results_per_block = children.iter().map(|c| c.core().results_per_block).sum();
        let mut core = IteratorCore::new(results_per_block);
        core.num_docs_estimate = children
            .iter()
            .map(|c| c.core().num_docs_estimate)
            .fold(0u64, u64::saturating_add);
        Ok(Self { children, core })
    }
}

impl QueryIterator for UnionIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        let mut merged = ResultBlock::new();
        let mut all_exhausted = true;
        for (origin, child) in self.children.iter_mut().enumerate() {
            let Some(block) = child.current_block()? else {
                continue;
            };
            all_exhausted = false;
            for record in block.iter() {
                match merged.get_mut(&record.key) {
                    // The same document found through two children: fold
                    // the score fields, keep the first origin for routing
                    Some(existing) => {
                        existing.relevance += record.relevance;
                        existing.score += record.score;
                        existing.proximity = existing.proximity.max(record.proximity);
                    }
                    None => {
                        let mut tagged = record.clone();
                        tagged.origin = origin;
                        merged.insert(tagged);
                    }
                }
            }
        }
        if all_exhausted {
            return Ok(None);
        }
        Ok(Some(merged))
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
        for child in &mut self.children {
            child.advance(bound)?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        Err(contract_violation(
            "current_position on a union iterator: block-at-a-time \
             semantics have no single-position peek",
        ))
    }

    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        let mut total = 0.0;
        for child in &mut self.children {
            total += child.compute_relevance(generation, posting_offset)?;
        }
        Ok(total)
    }

    fn set_block_size(&mut self, n: usize) -> Result<()> {
        if n != 1 {
            return Err(contract_violation(format!(
                "set_block_size({}) on a union iterator: block size is \
                 derived from its children",
                n
            )));
        }
        Ok(())
    }

    fn plan_label(&self) -> String {
        format!("union ({} children)", self.children.len())
    }

    fn children(&self) -> &[Box<dyn QueryIterator>] {
        &self.children
    }

    fn current_docs_for_keys(&mut self, keys: &[DocKey]) -> Result<ResultBlock> {
        // Route each key to the child it came from, per the origin tags
        let mut by_origin: Vec<Vec<DocKey>> = vec![Vec::new(); self.children.len()];
        if let Some(block) = self.current_block()? {
            for key in keys {
                if let Some(record) = block.get(key) {
                    by_origin[record.origin].push(*key);
                }
            }
        }
        let mut out = ResultBlock::new();
        for (origin, child_keys) in by_origin.into_iter().enumerate() {
            if child_keys.is_empty() {
                continue;
            }
            let subset = self.children[origin].current_docs_for_keys(&child_keys)?;
            for record in subset.iter() {
                let mut tagged = record.clone();
                tagged.origin = origin;
                out.insert(tagged);
            }
        }
        Ok(out)
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

    fn key(url: u64) -> DocKey {
        DocKey::new(url, url + 1000, url + 2000)
    }

    fn union_of_disjoint_terms() -> UnionIterator {
        let store = Arc::new(RamPostingStore::new(7));
        let mut url = 0u64;
        for (term, count) in [("alpha", 2u64), ("beta", 3), ("gamma", 5)] {
            for _ in 0..count {
                store.insert_posting(
                    term.as_bytes(),
                    0,
                    RamPosting::doc(url, key(url)),
                );
                url += 1;
            }
        }
        let children: Vec<Box<dyn QueryIterator>> = ["alpha", "beta", "gamma"]
            .iter()
            .map(|t| {
                Box::new(TermIterator::new(store.clone(), t.as_bytes().to_vec(), 0).unwrap())
                    as Box<dyn QueryIterator>
            })
            .collect();
        UnionIterator::new(children).unwrap()
    }

    #[test]
    fn test_union_completeness_with_origin_tags() {
        let mut union = union_of_disjoint_terms();
        let block = union.current_block().unwrap().unwrap();
        assert_eq!(block.len(), 10, "2 + 3 + 5 disjoint records");

        let mut per_origin = [0usize; 3];
        for record in block.iter() {
            per_origin[record.origin] += 1;
        }
        assert_eq!(per_origin, [2, 3, 5]);
    }

    #[test]
    fn test_union_exhausts_after_children() {
        let mut union = union_of_disjoint_terms();
        assert!(union.current_block().unwrap().is_some());
        union.advance(None).unwrap();
        assert!(union.current_block().unwrap().is_none());
        assert_eq!(union.core().seen_docs, 10);
    }

    #[test]
    fn test_union_set_block_size_contract() {
        let mut union = union_of_disjoint_terms();
        assert!(matches!(
            union.set_block_size(5),
            Err(Error::ContractViolation(_))
        ));
        assert!(union.set_block_size(1).is_ok());
    }

    #[test]
    fn test_union_current_position_is_violation() {
        let mut union = union_of_disjoint_terms();
        assert!(matches!(
            union.current_position(),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_union_duplicate_key_folds_scores() {
        let store = Arc::new(RamPostingStore::new(7));
        let shared = key(1);
        store.insert_posting(b"a", 0, RamPosting::doc(1, shared).with_relevance(0.5));
        store.insert_posting(b"b", 0, RamPosting::doc(1, shared).with_relevance(0.25));

        let children: Vec<Box<dyn QueryIterator>> = vec![
            Box::new(TermIterator::new(store.clone(), b"a".to_vec(), 0).unwrap()),
            Box::new(TermIterator::new(store.clone(), b"b".to_vec(), 0).unwrap()),
        ];
        let mut union = UnionIterator::new(children).unwrap();
        let block = union.current_block().unwrap().unwrap();
        assert_eq!(block.len(), 1);
        let record = block.first().unwrap();
        assert_eq!(record.relevance, 0.75);
        assert_eq!(record.origin, 0);
    }

    #[test]
    fn test_union_docs_for_keys_routes_to_children() {
        let mut union = union_of_disjoint_terms();
        union.current_block().unwrap();

        // url 0 belongs to "alpha" (origin 0), url 5 to "gamma" (origin 2)
        let subset = union.current_docs_for_keys(&[key(0), key(5)]).unwrap();
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.get(&key(0)).unwrap().origin, 0);
        assert_eq!(subset.get(&key(5)).unwrap().origin, 2);
    }

    #[test]
    fn test_union_estimate_is_sum() {
        let union = union_of_disjoint_terms();
        assert_eq!(union.core().num_docs_estimate, 10);
    }
}
