//! Intersect merge: AND with proximity and phrase scoring.
//!
//! Children are forced to a block size of 1 and kept synchronized by a
//! classic sorted-merge loop: find the maximum position among the
//! children, advance every lagging child with that position as its bound,
//! repeat until all agree or one exhausts. An optional wall-clock budget
//! bounds the loop on pathological term-frequency skew, trading
//! completeness for availability.

use std::time::{Duration, Instant};

use crate::error::{contract_violation, Result};
use crate::iterator::{IteratorCore, QueryIterator};
use crate::model::{GenerationOffset, ResultBlock};
use crate::scoring::{check_quote, combined_score, proximity_score, PhraseConstraint};

/// Default wall-clock budget for one position-synchronization attempt.
pub const DEFAULT_SYNC_BUDGET: Duration = Duration::from_secs(4);

pub struct IntersectIterator {
    children: Vec<Box<dyn QueryIterator>>,
    /// Query term position -> child index. Repeated query terms map
    /// several positions onto the same child so identical posting data is
    /// never decoded twice.
    word_map: Vec<usize>,
    quote: Option<PhraseConstraint>,
    weight: f64,
    sync_budget: Option<Duration>,
    timed_out: bool,
    exhausted: bool,
    core: IteratorCore,
}

impl IntersectIterator {
    /// Children must tolerate a block size of 1; that constraint is
    /// enforced here, at construction.
    pub fn new(
        mut children: Vec<Box<dyn QueryIterator>>,
        word_map: Option<Vec<usize>>,
        quote: Option<PhraseConstraint>,
        weight: f64,
    ) -> Result<Self> {
        if children.is_empty() {
            return Err(contract_violation("intersect iterator requires children"));
        }
        for child in &mut children {
            child.set_block_size(1)?;
        }
        let word_map = word_map.unwrap_or_else(|| (0..children.len()).collect());
        if word_map.iter().any(|&c| c >= children.len()) {
            return Err(contract_violation(
                "intersect word map references a child that does not exist",
            ));
        }
        let mut core = IteratorCore::new(1);
        core.num_docs_estimate = children
            .iter()
            .map(|c| c.core().num_docs_estimate)
            .min()
            .unwrap_or(0);
        Ok(Self {
            children,
            word_map,
            quote,
            weight,
            sync_budget: Some(DEFAULT_SYNC_BUDGET),
            timed_out: false,
            exhausted: false,
            core,
        })
    }

    /// Replace or disable the sync wall-clock budget.
    pub fn with_sync_budget(mut self, budget: Option<Duration>) -> Self {
        self.sync_budget = budget;
        self
    }

    /// Whether the last exhaustion came from the sync budget rather than
    /// genuinely running out of data.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Drive all children to a common position. `Ok(true)` when they
    /// agree; `Ok(false)` when a child exhausted or the budget ran out.
    /// The budget is cooperative, checked once per loop iteration.
    fn sync_positions(&mut self) -> Result<bool> {
        let start = Instant::now();
        loop {
            let mut max_pos: Option<GenerationOffset> = None;
            let mut min_pos: Option<GenerationOffset> = None;
            for child in &mut self.children {
                let pos = child.current_position()?;
                if pos.is_terminal() {
                    self.exhausted = true;
                    return Ok(false);
                }
                max_pos = Some(max_pos.map_or(pos, |m| m.max(pos)));
                min_pos = Some(min_pos.map_or(pos, |m| m.min(pos)));
            }
            let (Some(max_pos), Some(min_pos)) = (max_pos, min_pos) else {
                self.exhausted = true;
                return Ok(false);
            };
            if min_pos == max_pos {
                return Ok(true);
            }
            if let Some(budget) = self.sync_budget {
                if start.elapsed() >= budget {
                    log::warn!(
                        "intersect sync gave up after {:?} at {}; reporting exhaustion",
                        budget,
                        max_pos
                    );
                    self.timed_out = true;
                    self.exhausted = true;
                    return Ok(false);
                }
            }
            for child in &mut self.children {
                if child.current_position()? < max_pos {
                    child.advance(Some(max_pos))?;
                }
            }
        }
    }

    fn advance_children(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.advance(None)?;
        }
        Ok(())
    }
}

impl QueryIterator for IntersectIterator {
    fn core(&self) -> &IteratorCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut IteratorCore {
        &mut self.core
    }

    fn fetch_block(&mut self) -> Result<Option<ResultBlock>> {
        if self.exhausted {
            return Ok(None);
        }
        loop {
            if !self.sync_positions()? {
                return Ok(None);
            }

            let mut records = Vec::with_capacity(self.children.len());
            let mut missing = false;
            for child in &mut self.children {
                match child.current_block()? {
                    None => {
                        self.exhausted = true;
                        return Ok(None);
                    }
                    Some(block) => match block.first() {
                        Some(record) => records.push(record.clone()),
                        // A child's record at this position decoded to
                        // nothing (e.g. host-filtered); skip the document
                        None => {
                            missing = true;
                            break;
                        }
                    },
                }
            }
            if missing {
                self.advance_children()?;
                continue;
            }

            // One position list per query term occurrence
            let lists: Vec<Vec<u32>> = self
                .word_map
                .iter()
                .map(|&c| records[c].positions.clone())
                .collect();

            if let Some(phrase) = &self.quote {
                if !check_quote(&lists, phrase) {
                    self.advance_children()?;
                    continue;
                }
            }

            let base = &records[0];
            // A term repeated in the query contributes its relevance once
            // per occurrence, without re-decoding its postings
            let relevance: f64 = self.word_map.iter().map(|&c| records[c].relevance).sum();
            let proximity = proximity_score(&lists, base.is_doc);

            let mut record = base.clone();
            record.relevance = relevance;
            record.proximity = proximity;
            record.score = combined_score(record.doc_rank, relevance, proximity) * self.weight;

            let mut block = ResultBlock::new();
            block.insert(record);
            return Ok(Some(block));
        }
    }

    fn reset(&mut self) -> Result<()> {
        for child in &mut self.children {
            child.reset()?;
        }
        self.core.reset_counters();
        self.exhausted = false;
        self.timed_out = false;
        self.core.num_docs_estimate = self
            .children
            .iter()
            .map(|c| c.core().num_docs_estimate)
            .min()
            .unwrap_or(0);
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        self.core.seen_docs += self.core.cached_len() as u64;
        self.core.invalidate();
        if self.exhausted {
            return Ok(());
        }
        for child in &mut self.children {
            child.advance(bound)?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        if self.exhausted {
            return Ok(GenerationOffset::TERMINAL);
        }
        // The next yield can be no earlier than the furthest child
        let mut max_pos = GenerationOffset::new(i64::MIN, 0);
        for child in &mut self.children {
            let pos = child.current_position()?;
            if pos.is_terminal() {
                return Ok(GenerationOffset::TERMINAL);
            }
            max_pos = max_pos.max(pos);
        }
        Ok(max_pos)
    }

    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        let map = self.word_map.clone();
        let mut total = 0.0;
        for c in map {
            total += self.children[c].compute_relevance(generation, posting_offset)?;
        }
        Ok(total)
    }

    fn set_block_size(&mut self, n: usize) -> Result<()> {
        if n != 1 {
            return Err(contract_violation(format!(
                "set_block_size({}) on an intersect iterator: correctness \
                 depends on a fixed block size of 1",
                n
            )));
        }
        Ok(())
    }

    fn plan_label(&self) -> String {
        format!(
            "intersect ({} terms{})",
            self.word_map.len(),
            if self.quote.is_some() { ", quoted" } else { "" }
        )
    }

    fn children(&self) -> &[Box<dyn QueryIterator>] {
        &self.children
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
