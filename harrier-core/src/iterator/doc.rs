//! Whole-index document cursor.
//!
//! Enumerates every document/link entry of each numbered generation in
//! order, irrespective of term. No posting-list filtering, just raw
//! sequential item decoding bounded by `docids_len` per shard. Used for
//! administrative full-index walks, not ranked query serving.

use std::sync::Arc;

use crate::error::Result;
use crate::iterator::{IteratorCore, QueryIterator, DEFAULT_RESULTS_PER_BLOCK};
use crate::model::{CrawlTime, DocKey, GenerationOffset, PostingRecord, ResultBlock, SummaryRef};
use crate::store::PostingStore;

pub struct DocIterator {
    store: Arc<dyn PostingStore>,
    generation: i64,
    generation_count: u64,
    /// Entry index of the next unconsumed record in the current shard.
    current_offset: u64,
    /// Entry index just past the last fetched block.
    next_offset: u64,
    docids_len: u64,
    exhausted: bool,
    core: IteratorCore,
}

impl DocIterator {
    pub fn new(store: Arc<dyn PostingStore>) -> Result<Self> {
        let mut it = Self {
            store,
            generation: 0,
            generation_count: 0,
            current_offset: 0,
            next_offset: 0,
            docids_len: 0,
            exhausted: true,
            core: IteratorCore::new(DEFAULT_RESULTS_PER_BLOCK),
        };
        it.reset()?;
        Ok(it)
    }

    fn load_shard(&mut self) -> Result<()> {
        let info = self.store.shard_info(self.generation)?;
        self.docids_len = info.docids_len;
        Ok(())
    }

    fn advance_generation(&mut self) -> Result<()> {
        loop {
            // The generation set can grow mid-session
            self.generation_count = self.store.generation_count();
            if self.generation as u64 + 1 >= self.generation_count {
                self.exhausted = true;
                return Ok(());
            }
            self.generation += 1;
            self.current_offset = 0;
            self.load_shard()?;
            if self.docids_len > 0 {
                return Ok(());
            }
        }
    }
}

impl QueryIterator for DocIterator {
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
        let batch = self.store.doc_slice(
            self.generation,
            self.current_offset,
            self.core.results_per_block,
        )?;
        self.next_offset = if batch.postings.is_empty() {
            self.docids_len
        } else {
            batch.next_cursor
        };
        if batch.postings.is_empty()
            && self.generation as u64 + 1 >= self.store.generation_count()
        {
            self.exhausted = true;
            return Ok(None);
        }
        let info = self.store.shard_info(self.generation)?;
        let num_items = info.num_docs + info.num_link_docs;
        let mut block = ResultBlock::with_capacity(batch.postings.len());
        for raw in &batch.postings {
            let Some(item) = self.store.make_item(raw, num_items)? else {
                continue;
            };
            let Some(key) = DocKey::from_bytes(&item.key) else {
                continue;
            };
            block.insert(PostingRecord {
                key,
                doc_rank: item.doc_rank,
                relevance: item.relevance,
                proximity: item.proximity,
                score: item.score,
                summary: SummaryRef::Offset(item.summary_offset),
                generation: self.generation,
                crawl_time: CrawlTime::Epoch(self.store.crawl_epoch()),
                is_doc: item.is_doc,
                is_feed: false,
                is_special: item.is_special,
                positions: item.positions,
                origin: 0,
            });
        }
        Ok(Some(block))
    }

    fn reset(&mut self) -> Result<()> {
        self.core.reset_counters();
        self.generation = 0;
        self.current_offset = 0;
        self.next_offset = 0;
        self.generation_count = self.store.generation_count();
        self.exhausted = self.generation_count == 0;
        if !self.exhausted {
            self.load_shard()?;
            let mut estimate = 0u64;
            for generation in 0..self.generation_count {
                let info = self.store.shard_info(generation as i64)?;
                estimate += info.num_docs + info.num_link_docs;
            }
            self.core.num_docs_estimate = estimate;
            if self.docids_len == 0 {
                self.advance_generation()?;
            }
        }
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        if self.exhausted {
            self.core.invalidate();
            return Ok(());
        }
        let consumed_to = if self.core.is_fresh() {
            self.core.seen_docs += self.core.cached_len() as u64;
            self.next_offset.max(self.current_offset)
        } else {
            let span = self.docids_len.saturating_sub(self.current_offset);
            let n = span.min(self.core.results_per_block as u64);
            self.core.seen_docs += n;
            self.current_offset + n
        };
        self.core.invalidate();
        self.current_offset = consumed_to;

        if self.current_offset >= self.docids_len {
            self.advance_generation()?;
        }
        if let Some(b) = bound {
            while !self.exhausted && self.generation < b.generation {
                self.advance_generation()?;
            }
            if !self.exhausted && self.generation == b.generation {
                // Entry indexes are the document offsets here, so the
                // in-shard seek is plain arithmetic
                self.current_offset = self.current_offset.max(b.offset);
                if self.current_offset >= self.docids_len {
                    self.advance_generation()?;
                }
            }
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        if self.exhausted {
            return Ok(GenerationOffset::TERMINAL);
        }
        Ok(GenerationOffset::new(self.generation, self.current_offset))
    }

    fn plan_label(&self) -> String {
        "docs".to_string()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
