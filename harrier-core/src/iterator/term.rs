//! Single-term posting cursor over one index's generation sequence.
//!
//! Walks three kinds of position tracks in strict order: the live feed
//! shard (generation -1, optionally capped), then every numbered
//! generation's dictionary window. The generation dictionary is populated
//! lazily and re-queried when the cursor drains what it knows, so crawls
//! that grow while a query session is open are picked up mid-iteration.

use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::error::Result;
use crate::iterator::{IteratorCore, QueryIterator, DEFAULT_RESULTS_PER_BLOCK};
use crate::model::{
    CrawlTime, DocKey, GenerationOffset, PostingRecord, ResultBlock, SummaryRef, FEED_GENERATION,
};
use crate::store::{GenerationSlice, PostingStore};

pub struct TermIterator {
    store: Arc<dyn PostingStore>,
    term: Vec<u8>,
    mask: u64,
    /// Sorted by generation ascending, feed (-1) first.
    dictionary: Vec<GenerationSlice>,
    /// Index of the current track within the dictionary.
    track: usize,
    /// Posting offset of the next unconsumed record in the current track.
    current_offset: u64,
    /// Offset just past the last fetched block; set by `fetch_block`.
    next_offset: u64,
    /// Postings consumed in tracks before the current one.
    seen_before_track: u64,
    /// Cap on feed-track postings when the limit-feed flag is set.
    feed_limit: Option<u64>,
    /// Borrowed read-only host-hash block set; never mutated here.
    filter: Option<Arc<FxHashSet<u64>>>,
    no_more_generations: bool,
    exhausted: bool,
    core: IteratorCore,
}

impl TermIterator {
    pub fn new(
        store: Arc<dyn PostingStore>,
        term: impl Into<Vec<u8>>,
        mask: u64,
    ) -> Result<Self> {
        let mut it = Self {
            store,
            term: term.into(),
            mask,
            dictionary: Vec::new(),
            track: 0,
            current_offset: 0,
            next_offset: 0,
            seen_before_track: 0,
            feed_limit: None,
            filter: None,
            no_more_generations: true,
            exhausted: true,
            core: IteratorCore::new(DEFAULT_RESULTS_PER_BLOCK),
        };
        it.reset()?;
        Ok(it)
    }

    /// Skip any record whose inlink/domain hash is in `filter`.
    pub fn with_filter(mut self, filter: Arc<FxHashSet<u64>>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Cap the feed track at `limit` postings. Apply before iterating.
    pub fn with_feed_limit(mut self, limit: u64) -> Self {
        self.feed_limit = Some(limit);
        self
    }

    pub fn term(&self) -> &[u8] {
        &self.term
    }

    fn track_end(&self, track: usize) -> u64 {
        let slice = &self.dictionary[track];
        if slice.generation == FEED_GENERATION {
            if let Some(limit) = self.feed_limit {
                return slice.end_offset.min(slice.start_offset + limit);
            }
        }
        slice.end_offset
    }

    fn is_last_track(&self) -> bool {
        self.track + 1 >= self.dictionary.len()
    }

    fn recompute_seen_before(&mut self) {
        self.seen_before_track = (0..self.track)
            .map(|i| self.track_end(i) - self.dictionary[i].start_offset)
            .sum();
    }

    /// Re-query the dictionary for generations beyond what is known. The
    /// dictionary is fully re-sorted before reuse so no caller ever sees
    /// a partially ordered state.
    fn refresh_dictionary(&mut self) -> Result<bool> {
        let (estimate, fresh) = self.store.word_info(&self.term, self.mask)?;
        self.core.num_docs_estimate = estimate;
        let current_generation = self.dictionary.get(self.track).map(|d| d.generation);
        let mut grew = false;
        for slice in fresh {
            if !self
                .dictionary
                .iter()
                .any(|d| d.generation == slice.generation)
            {
                self.dictionary.push(slice);
                grew = true;
            }
        }
        if grew {
            self.dictionary.sort_by_key(|d| d.generation);
            if let Some(generation) = current_generation {
                self.track = self
                    .dictionary
                    .iter()
                    .position(|d| d.generation == generation)
                    .unwrap_or(self.track);
            }
        }
        let known = self
            .dictionary
            .iter()
            .map(|d| d.generation)
            .max()
            .unwrap_or(-1);
        self.no_more_generations = known + 1 >= self.store.generation_count() as i64;
        Ok(grew)
    }

    /// Switch the feed track off if active and walk the dictionary
    /// forward, lazily fetching more generation metadata when drained,
    /// until a generation >= `target` is reached or none remain.
    fn advance_generation(&mut self, target: Option<i64>) -> Result<()> {
        loop {
            if self.is_last_track() && !self.no_more_generations {
                self.refresh_dictionary()?;
            }
            if self.is_last_track() {
                log::trace!(
                    "term cursor drained all {} generation tracks",
                    self.dictionary.len()
                );
                self.exhausted = true;
                return Ok(());
            }
            self.track += 1;
            self.current_offset = self.dictionary[self.track].start_offset;
            if let Some(t) = target {
                if self.dictionary[self.track].generation < t {
                    continue;
                }
            }
            self.recompute_seen_before();
            return Ok(());
        }
    }

    /// Skip forward to the first position >= `bound`, delegating the
    /// in-shard seek to the storage collaborator so intervening postings
    /// are never decoded. Recomputes `seen_docs` exactly afterwards.
    fn seek_bound(&mut self, bound: GenerationOffset) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        if self.dictionary[self.track].generation < bound.generation {
            self.advance_generation(Some(bound.generation))?;
            if self.exhausted {
                return Ok(());
            }
        }
        let slice = self.dictionary[self.track];
        if slice.generation == bound.generation {
            let end = self.track_end(self.track);
            let cur_doc = self.store.doc_offset(slice.generation, self.current_offset)?;
            if cur_doc < bound.offset {
                match self.store.next_doc_offset(
                    &self.term,
                    slice.generation,
                    self.current_offset,
                    end,
                    bound.offset,
                )? {
                    Some((posting_offset, _)) => self.current_offset = posting_offset,
                    None => self.advance_generation(None)?,
                }
            }
        }
        if !self.exhausted {
            // Exact: the cursor's offset arithmetic knows precisely how
            // many postings were skipped.
            self.core.seen_docs = self.seen_before_track
                + (self.current_offset - self.dictionary[self.track].start_offset);
        }
        Ok(())
    }
}

impl QueryIterator for TermIterator {
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
        let slice = self.dictionary[self.track];
        let end = self.track_end(self.track);
        let batch = self.store.postings_slice(
            &self.term,
            slice.generation,
            slice.start_offset,
            self.current_offset,
            end,
            self.core.results_per_block,
        )?;
        self.next_offset = if batch.postings.is_empty() {
            end
        } else {
            batch.next_cursor
        };

        if batch.postings.is_empty() && self.is_last_track() && self.no_more_generations {
            self.exhausted = true;
            return Ok(None);
        }

        let shard = self.store.shard_info(slice.generation)?;
        let num_items = shard.num_docs + shard.num_link_docs;
        let is_feed = slice.generation == FEED_GENERATION;
        let mut block = ResultBlock::with_capacity(batch.postings.len());
        for raw in &batch.postings {
            let Some(item) = self.store.make_item(raw, num_items)? else {
                continue;
            };
            // Degenerate keys are skipped, never fatal
            let Some(key) = DocKey::from_bytes(&item.key) else {
                continue;
            };
            if let Some(filter) = &self.filter {
                if filter.contains(&key.host_hash) {
                    continue;
                }
            }
            block.insert(PostingRecord {
                key,
                doc_rank: item.doc_rank,
                relevance: item.relevance,
                proximity: item.proximity,
                score: item.score,
                summary: SummaryRef::Offset(item.summary_offset),
                generation: slice.generation,
                crawl_time: if is_feed {
                    CrawlTime::Feed
                } else {
                    CrawlTime::Epoch(self.store.crawl_epoch())
                },
                is_doc: item.is_doc,
                is_feed,
                is_special: item.is_special,
                positions: item.positions,
                origin: 0,
            });
        }
        Ok(Some(block))
    }

    fn reset(&mut self) -> Result<()> {
        let (estimate, mut dictionary) = self.store.word_info(&self.term, self.mask)?;
        dictionary.sort_by_key(|d| d.generation);
        self.dictionary = dictionary;
        self.core.reset_counters();
        self.core.num_docs_estimate = estimate;
        self.track = 0;
        self.seen_before_track = 0;
        self.next_offset = 0;
        self.current_offset = self
            .dictionary
            .first()
            .map(|d| d.start_offset)
            .unwrap_or(0);
        self.exhausted = self.dictionary.is_empty();
        let known = self
            .dictionary
            .iter()
            .map(|d| d.generation)
            .max()
            .unwrap_or(-1);
        self.no_more_generations = known + 1 >= self.store.generation_count() as i64;
        Ok(())
    }

    fn advance(&mut self, bound: Option<GenerationOffset>) -> Result<()> {
        if self.exhausted {
            self.core.invalidate();
            return Ok(());
        }
        // Seen-doc accounting for the block being left behind. A block
        // that was never materialized is sized analytically from offset
        // arithmetic instead of being decoded.
        let consumed_to = if self.core.is_fresh() {
            self.core.seen_docs += self.core.cached_len() as u64;
            self.next_offset.max(self.current_offset)
        } else {
            let end = self.track_end(self.track);
            let span = end.saturating_sub(self.current_offset);
            let n = span.min(self.core.results_per_block as u64);
            self.core.seen_docs += n;
            self.current_offset + n
        };
        self.core.invalidate();
        self.current_offset = consumed_to;

        if self.current_offset >= self.track_end(self.track) {
            self.advance_generation(bound.map(|b| b.generation))?;
        }
        if let Some(b) = bound {
            self.seek_bound(b)?;
        }
        Ok(())
    }

    fn current_position(&mut self) -> Result<GenerationOffset> {
        if self.exhausted {
            return Ok(GenerationOffset::TERMINAL);
        }
        let generation = self.dictionary[self.track].generation;
        let doc = self.store.doc_offset(generation, self.current_offset)?;
        Ok(GenerationOffset::new(generation, doc))
    }

    fn compute_relevance(&mut self, generation: i64, posting_offset: u64) -> Result<f64> {
        // Postings outside this term's windows contribute nothing, which
        // keeps composite sums well-defined over disjoint children.
        let Some(slice) = self
            .dictionary
            .iter()
            .find(|d| d.generation == generation)
            .copied()
        else {
            return Ok(0.0);
        };
        if posting_offset < slice.start_offset || posting_offset >= slice.end_offset {
            return Ok(0.0);
        }
        let batch = self.store.postings_slice(
            &self.term,
            generation,
            slice.start_offset,
            posting_offset,
            slice.end_offset,
            1,
        )?;
        let Some(raw) = batch.postings.first() else {
            return Ok(0.0);
        };
        if raw.posting_offset != posting_offset {
            return Ok(0.0);
        }
        let shard = self.store.shard_info(generation)?;
        match self
            .store
            .make_item(raw, shard.num_docs + shard.num_link_docs)?
        {
            Some(item) => Ok(item.relevance),
            None => Ok(0.0),
        }
    }

    fn plan_label(&self) -> String {
        format!(
            "term \"{}\" [mask {:#x}]",
            String::from_utf8_lossy(&self.term),
            self.mask
        )
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{RamPosting, RamPostingStore};

    fn key(url: u64) -> DocKey {
        DocKey::new(url, url + 1000, url + 2000)
    }

    fn store_with(postings: &[(i64, u64)]) -> Arc<RamPostingStore> {
        let store = Arc::new(RamPostingStore::new(99));
        for &(generation, doc) in postings {
            store.insert_posting(b"rust", generation, RamPosting::doc(doc, key(doc)));
        }
        store
    }

    fn positions_to_exhaustion(it: &mut TermIterator) -> Vec<GenerationOffset> {
        let mut out = Vec::new();
        loop {
            let pos = it.current_position().unwrap();
            if pos.is_terminal() {
                break;
            }
            out.push(pos);
            it.set_block_size(1).unwrap();
            it.advance(None).unwrap();
        }
        out
    }

    #[test]
    fn test_ordering_invariant_feed_first() {
        let store = store_with(&[(0, 10), (0, 20), (-1, 5), (1, 3)]);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        let positions = positions_to_exhaustion(&mut it);

        for pair in positions.windows(2) {
            assert!(pair[0] <= pair[1], "positions must be non-decreasing");
        }
        assert_eq!(positions[0].generation, FEED_GENERATION);
        assert_eq!(positions[0].offset, 5);
    }

    #[test]
    fn test_block_contents_and_feed_tagging() {
        let store = store_with(&[(-1, 1), (0, 2)]);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();

        let feed_block = it.current_block().unwrap().unwrap().clone();
        assert_eq!(feed_block.len(), 1);
        let rec = feed_block.first().unwrap();
        assert!(rec.is_feed);
        assert_eq!(rec.crawl_time, CrawlTime::Feed);
        assert_eq!(rec.generation, FEED_GENERATION);

        it.advance(None).unwrap();
        let block = it.current_block().unwrap().unwrap().clone();
        let rec = block.first().unwrap();
        assert!(!rec.is_feed);
        assert_eq!(rec.crawl_time, CrawlTime::Epoch(99));
        assert_eq!(rec.key, key(2));
    }

    #[test]
    fn test_bound_monotonicity() {
        let store = store_with(&[(0, 10), (0, 20), (0, 30), (1, 5)]);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        it.set_block_size(1).unwrap();

        // Seek to an existing position: lands exactly on it
        it.advance(Some(GenerationOffset::new(0, 20))).unwrap();
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 20));

        // Seek between positions: lands on the next valid one
        it.advance(Some(GenerationOffset::new(0, 25))).unwrap();
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 30));

        // Seek across a generation boundary
        it.advance(Some(GenerationOffset::new(1, 0))).unwrap();
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(1, 5));

        // Past everything: terminal
        it.advance(Some(GenerationOffset::new(1, 100))).unwrap();
        assert!(it.current_position().unwrap().is_terminal());
    }

    #[test]
    fn test_exact_seen_docs_after_bound() {
        let store = store_with(&[(0, 10), (0, 20), (0, 30), (0, 40)]);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        it.set_block_size(1).unwrap();
        it.advance(Some(GenerationOffset::new(0, 30))).unwrap();
        // Two postings (10, 20) were skipped
        assert_eq!(it.core().seen_docs, 2);
    }

    #[test]
    fn test_filter_skips_blocked_domains() {
        let store = Arc::new(RamPostingStore::new(99));
        store.insert_posting(b"rust", 0, RamPosting::doc(1, DocKey::new(1, 1, 777)));
        store.insert_posting(b"rust", 0, RamPosting::doc(2, DocKey::new(2, 2, 888)));

        let mut filter = FxHashSet::default();
        filter.insert(777u64);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0)
            .unwrap()
            .with_filter(Arc::new(filter));

        let block = it.current_block().unwrap().unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block.first().unwrap().key.host_hash, 888);
    }

    #[test]
    fn test_degenerate_key_skipped() {
        let store = Arc::new(RamPostingStore::new(99));
        store.insert_posting(b"rust", 0, RamPosting::doc(1, key(1)));
        let mut broken = RamPosting::doc(2, key(2));
        broken.key = vec![0u8; 8]; // fewer sub-fields than expected
        store.insert_posting(b"rust", 0, broken);
        store.insert_posting(b"rust", 0, RamPosting::doc(3, key(3)));

        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        let block = it.current_block().unwrap().unwrap();
        assert_eq!(block.len(), 2, "degenerate record skipped, block intact");
    }

    #[test]
    fn test_empty_filtered_block_is_not_exhaustion() {
        let store = Arc::new(RamPostingStore::new(99));
        store.insert_posting(b"rust", 0, RamPosting::doc(1, DocKey::new(1, 1, 777)));
        store.insert_posting(b"rust", 1, RamPosting::doc(2, DocKey::new(2, 2, 888)));

        let mut filter = FxHashSet::default();
        filter.insert(777u64);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0)
            .unwrap()
            .with_filter(Arc::new(filter));

        // Generation 0 filters to empty, but that is an empty block, not
        // the end of data
        let block = it.current_block().unwrap();
        assert!(block.is_some());
        assert!(block.unwrap().is_empty());

        it.advance(None).unwrap();
        let block = it.current_block().unwrap().unwrap();
        assert_eq!(block.first().unwrap().key.host_hash, 888);
    }

    #[test]
    fn test_generation_growth_mid_session() {
        let store = Arc::new(RamPostingStore::new(99));
        store.insert_posting(b"rust", 0, RamPosting::doc(1, key(1)));
        store.add_generation(1); // known to the index, no postings yet

        let mut it = TermIterator::new(store.clone(), b"rust".to_vec(), 0).unwrap();
        let first = it.current_block().unwrap().unwrap().clone();
        assert_eq!(first.len(), 1);

        // New crawl data arrives while the session is open
        store.insert_posting(b"rust", 1, RamPosting::doc(4, key(4)));

        it.advance(None).unwrap();
        let second = it.current_block().unwrap().unwrap().clone();
        assert_eq!(second.len(), 1);
        assert_eq!(second.first().unwrap().generation, 1);

        it.advance(None).unwrap();
        assert!(it.current_block().unwrap().is_none());
    }

    #[test]
    fn test_feed_limit_caps_feed_track() {
        let store = Arc::new(RamPostingStore::new(99));
        for doc in 0..5 {
            store.insert_posting(b"rust", -1, RamPosting::doc(doc, key(doc)));
        }
        store.insert_posting(b"rust", 0, RamPosting::doc(9, key(9)));

        let mut it = TermIterator::new(store, b"rust".to_vec(), 0)
            .unwrap()
            .with_feed_limit(2);
        let feed_block = it.current_block().unwrap().unwrap().clone();
        assert_eq!(feed_block.len(), 2);

        it.advance(None).unwrap();
        let block = it.current_block().unwrap().unwrap().clone();
        assert_eq!(block.first().unwrap().generation, 0);
    }

    #[test]
    fn test_absent_term_is_exhausted() {
        let store = store_with(&[(0, 1)]);
        let mut it = TermIterator::new(store, b"missing".to_vec(), 0).unwrap();
        assert!(it.current_block().unwrap().is_none());
        assert!(it.current_position().unwrap().is_terminal());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let store = store_with(&[(0, 10), (0, 20)]);
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        it.set_block_size(1).unwrap();
        it.advance(None).unwrap();
        assert_eq!(it.core().seen_docs, 1);

        it.reset().unwrap();
        it.reset().unwrap();
        assert_eq!(it.core().seen_docs, 0);
        assert_eq!(it.current_position().unwrap(), GenerationOffset::new(0, 10));
    }

    #[test]
    fn test_compute_relevance_reads_stored_posting() {
        let store = Arc::new(RamPostingStore::new(99));
        store.insert_posting(
            b"rust",
            0,
            RamPosting::doc(1, key(1)).with_relevance(0.25),
        );
        let mut it = TermIterator::new(store, b"rust".to_vec(), 0).unwrap();
        assert_eq!(it.compute_relevance(0, 0).unwrap(), 0.25);
        // Outside the known windows: zero contribution
        assert_eq!(it.compute_relevance(5, 0).unwrap(), 0.0);
    }
}
