//! Storage collaborator contract.
//!
//! The core never touches shard bytes directly: it consumes a narrow trait
//! ("get posting slice", "get shard info", "make item from posting bytes")
//! and leaves the on-disk binary layout, generation management, and any
//! retry policy to the storage engine behind it. `RamPostingStore` is an
//! in-memory implementation used by tests and small embedded deployments.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::model::DocKey;

// ── Shard metadata ───────────────────────────────────────────────────────

/// Per-generation shard statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardInfo {
    /// Number of enumerable document/link entries in the shard.
    pub docids_len: u64,
    pub num_docs: u64,
    pub num_link_docs: u64,
}

/// Where one term's postings live within one generation's shard.
///
/// Dictionaries built from these are always kept sorted by generation
/// ascending before use; the set of generations can grow while a query
/// session is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSlice {
    pub generation: i64,
    pub start_offset: u64,
    pub end_offset: u64,
    /// Approximate count of postings in the window.
    pub doc_count: u64,
}

// ── Raw postings ─────────────────────────────────────────────────────────

/// One undecoded posting as handed out by the storage engine.
#[derive(Debug, Clone)]
pub struct RawPosting {
    /// Record-indexed offset of this posting within its shard.
    pub posting_offset: u64,
    pub data: Vec<u8>,
}

/// A batch of raw postings plus the cursor just past the last one.
#[derive(Debug, Clone, Default)]
pub struct PostingsSlice {
    pub postings: Vec<RawPosting>,
    pub next_cursor: u64,
}

/// A posting decoded by the storage engine. The composite key is still
/// raw bytes at this point; the core splits it into a [`DocKey`] and skips
/// records whose key is degenerate.
#[derive(Debug, Clone)]
pub struct DecodedPosting {
    pub key: Vec<u8>,
    pub doc_rank: f64,
    pub relevance: f64,
    pub proximity: f64,
    pub score: f64,
    pub summary_offset: u64,
    pub is_doc: bool,
    pub is_special: bool,
    pub positions: Vec<u32>,
}

// ── PostingStore trait ───────────────────────────────────────────────────

/// Narrow contract the iterators consume from the shard storage engine.
///
/// Leaf-level storage errors are not retried here; the core interprets "no
/// data available now" uniformly as exhaustion or empty-block-keep-going.
pub trait PostingStore: Send + Sync {
    /// Number of numbered generations currently known to the index. Grows
    /// while a long-lived query session is open as new crawl data arrives.
    fn generation_count(&self) -> u64;

    /// Crawl identifier of this index.
    fn crawl_epoch(&self) -> u64;

    /// Estimated total posting count for `term` plus its per-generation
    /// dictionary, sorted by generation ascending. An absent term yields
    /// `(0, vec![])`. `mask` selects key variants (e.g. media-type or
    /// safe-search tagged sub-keys) and is interpreted by the store.
    fn word_info(&self, term: &[u8], mask: u64) -> Result<(u64, Vec<GenerationSlice>)>;

    /// Up to `max` raw postings for `term` in `generation`, beginning at
    /// `cursor` within the dictionary window `[start, end)`.
    fn postings_slice(
        &self,
        term: &[u8],
        generation: i64,
        start: u64,
        cursor: u64,
        end: u64,
        max: usize,
    ) -> Result<PostingsSlice>;

    /// Up to `max` raw document/link entries of `generation`, regardless of
    /// term, beginning at entry index `cursor`. Used for whole-index
    /// enumeration.
    fn doc_slice(&self, generation: i64, cursor: u64, max: usize) -> Result<PostingsSlice>;

    fn shard_info(&self, generation: i64) -> Result<ShardInfo>;

    /// Document offset of the posting stored at `posting_offset`.
    fn doc_offset(&self, generation: i64, posting_offset: u64) -> Result<u64>;

    /// First posting of `term` in `[from, to)` whose document offset is
    /// >= `target_doc_offset`, as `(posting_offset, doc_offset)`. `None`
    /// when the window holds no such posting. This is the in-shard seek
    /// used to honor advance bounds without decoding every posting.
    fn next_doc_offset(
        &self,
        term: &[u8],
        generation: i64,
        from: u64,
        to: u64,
        target_doc_offset: u64,
    ) -> Result<Option<(u64, u64)>>;

    /// Decode one raw posting. `Ok(None)` means the bytes were too short
    /// or otherwise undecodable and the record should be skipped.
    fn make_item(&self, raw: &RawPosting, num_docs_or_links: u64) -> Result<Option<DecodedPosting>>;
}

// ── RamPostingStore ──────────────────────────────────────────────────────

/// One posting held by the RAM store. `key` is raw key bytes so tests can
/// exercise degenerate keys; well-formed postings use `DocKey::to_bytes`.
#[derive(Debug, Clone)]
pub struct RamPosting {
    pub doc_offset: u64,
    pub key: Vec<u8>,
    pub doc_rank: f64,
    pub relevance: f64,
    pub proximity: f64,
    pub score: f64,
    pub summary_offset: u64,
    pub is_doc: bool,
    pub is_special: bool,
    pub positions: Vec<u32>,
}

impl RamPosting {
    /// A plain page posting with neutral scores.
    pub fn doc(doc_offset: u64, key: DocKey) -> Self {
        Self {
            doc_offset,
            key: key.to_bytes().to_vec(),
            doc_rank: 1.0,
            relevance: 1.0,
            proximity: 1.0,
            score: 1.0,
            summary_offset: 0,
            is_doc: true,
            is_special: false,
            positions: Vec::new(),
        }
    }

    pub fn with_rank(mut self, rank: f64) -> Self {
        self.doc_rank = rank;
        self
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance;
        self
    }

    pub fn with_positions(mut self, positions: Vec<u32>) -> Self {
        self.positions = positions;
        self
    }

    pub fn as_link(mut self) -> Self {
        self.is_doc = false;
        self
    }
}

#[derive(Debug, Default)]
struct TermPostings {
    start: u64,
    end: u64,
    /// (posting_offset, posting), offset and doc_offset both ascending.
    postings: Vec<(u64, RamPosting)>,
}

#[derive(Debug, Default)]
struct RamInner {
    generation_count: u64,
    terms: FxHashMap<Vec<u8>, BTreeMap<i64, TermPostings>>,
    docs: FxHashMap<i64, Vec<RamPosting>>,
    /// generation -> posting_offset -> doc_offset
    doc_offsets: FxHashMap<i64, FxHashMap<u64, u64>>,
    next_offset: FxHashMap<i64, u64>,
    doc_counts: FxHashMap<i64, (u64, u64)>,
}

/// In-memory [`PostingStore`]. Interior locking lets tests grow the
/// generation set mid-session, mimicking new crawl data arriving while a
/// query session is open.
///
/// Postings for one term in one generation should be inserted
/// consecutively so the term's dictionary window stays dense.
pub struct RamPostingStore {
    crawl_epoch: u64,
    inner: RwLock<RamInner>,
}

impl RamPostingStore {
    pub fn new(crawl_epoch: u64) -> Self {
        Self {
            crawl_epoch,
            inner: RwLock::new(RamInner::default()),
        }
    }

    /// Register a generation even if no postings are inserted for it yet.
    pub fn add_generation(&self, generation: i64) {
        let mut inner = self.inner.write();
        if generation >= 0 {
            inner.generation_count = inner.generation_count.max(generation as u64 + 1);
        }
        inner.next_offset.entry(generation).or_insert(0);
    }

    /// Append one posting for `term` in `generation`.
    pub fn insert_posting(&self, term: &[u8], generation: i64, posting: RamPosting) {
        let mut inner = self.inner.write();
        if generation >= 0 {
            inner.generation_count = inner.generation_count.max(generation as u64 + 1);
        }
        let offset = {
            let next = inner.next_offset.entry(generation).or_insert(0);
            let offset = *next;
            *next += 1;
            offset
        };
        inner
            .doc_offsets
            .entry(generation)
            .or_default()
            .insert(offset, posting.doc_offset);
        let slice = inner
            .terms
            .entry(term.to_vec())
            .or_default()
            .entry(generation)
            .or_insert_with(|| TermPostings {
                start: offset,
                end: offset,
                postings: Vec::new(),
            });
        slice.end = offset + 1;
        slice.postings.push((offset, posting));
    }

    /// Append one document/link entry to `generation`'s enumeration array.
    pub fn insert_doc(&self, generation: i64, posting: RamPosting) {
        let mut inner = self.inner.write();
        if generation >= 0 {
            inner.generation_count = inner.generation_count.max(generation as u64 + 1);
        }
        let counts = inner.doc_counts.entry(generation).or_default();
        if posting.is_doc {
            counts.0 += 1;
        } else {
            counts.1 += 1;
        }
        inner.docs.entry(generation).or_default().push(posting);
    }

    /// Wire encoding used by this store's `make_item`. Layout: u16 key
    /// length, key bytes, four f64 score fields, u64 summary offset, one
    /// flag byte, u32 position count, positions.
    pub fn encode_posting(posting: &RamPosting) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + posting.key.len() + 45 + posting.positions.len() * 4);
        let mut tmp = [0u8; 8];
        BigEndian::write_u16(&mut tmp[0..2], posting.key.len() as u16);
        buf.extend_from_slice(&tmp[0..2]);
        buf.extend_from_slice(&posting.key);
        for v in [
            posting.doc_rank,
            posting.relevance,
            posting.proximity,
            posting.score,
        ] {
            BigEndian::write_f64(&mut tmp, v);
            buf.extend_from_slice(&tmp);
        }
        BigEndian::write_u64(&mut tmp, posting.summary_offset);
        buf.extend_from_slice(&tmp);
        let mut flags = 0u8;
        if posting.is_doc {
            flags |= 1;
        }
        if posting.is_special {
            flags |= 2;
        }
        buf.push(flags);
        BigEndian::write_u32(&mut tmp[0..4], posting.positions.len() as u32);
        buf.extend_from_slice(&tmp[0..4]);
        for &p in &posting.positions {
            BigEndian::write_u32(&mut tmp[0..4], p);
            buf.extend_from_slice(&tmp[0..4]);
        }
        buf
    }

    fn raw(posting_offset: u64, posting: &RamPosting) -> RawPosting {
        RawPosting {
            posting_offset,
            data: Self::encode_posting(posting),
        }
    }
}

impl PostingStore for RamPostingStore {
    fn generation_count(&self) -> u64 {
        self.inner.read().generation_count
    }

    fn crawl_epoch(&self) -> u64 {
        self.crawl_epoch
    }

    fn word_info(&self, term: &[u8], _mask: u64) -> Result<(u64, Vec<GenerationSlice>)> {
        let inner = self.inner.read();
        let Some(generations) = inner.terms.get(term) else {
            return Ok((0, Vec::new()));
        };
        let mut slices = Vec::with_capacity(generations.len());
        let mut estimate = 0u64;
        for (&generation, slice) in generations {
            let count = slice.postings.len() as u64;
            estimate += count;
            slices.push(GenerationSlice {
                generation,
                start_offset: slice.start,
                end_offset: slice.end,
                doc_count: count,
            });
        }
        Ok((estimate, slices))
    }

    fn postings_slice(
        &self,
        term: &[u8],
        generation: i64,
        start: u64,
        cursor: u64,
        end: u64,
        max: usize,
    ) -> Result<PostingsSlice> {
        let inner = self.inner.read();
        let Some(slice) = inner.terms.get(term).and_then(|g| g.get(&generation)) else {
            return Ok(PostingsSlice::default());
        };
        let from = cursor.max(start).max(slice.start);
        let mut out = Vec::new();
        let mut next_cursor = from;
        for (offset, posting) in &slice.postings {
            if *offset < from || *offset >= end {
                continue;
            }
            if out.len() >= max {
                break;
            }
            out.push(Self::raw(*offset, posting));
            next_cursor = *offset + 1;
        }
        Ok(PostingsSlice {
            postings: out,
            next_cursor,
        })
    }

    fn doc_slice(&self, generation: i64, cursor: u64, max: usize) -> Result<PostingsSlice> {
        let inner = self.inner.read();
        let Some(docs) = inner.docs.get(&generation) else {
            return Ok(PostingsSlice::default());
        };
        let from = cursor as usize;
        let to = docs.len().min(from + max);
        let mut out = Vec::with_capacity(to.saturating_sub(from));
        for (idx, posting) in docs.iter().enumerate().take(to).skip(from) {
            out.push(Self::raw(idx as u64, posting));
        }
        Ok(PostingsSlice {
            postings: out,
            next_cursor: to as u64,
        })
    }

    fn shard_info(&self, generation: i64) -> Result<ShardInfo> {
        let inner = self.inner.read();
        let (num_docs, num_link_docs) =
            inner.doc_counts.get(&generation).copied().unwrap_or((0, 0));
        let docids_len = inner.docs.get(&generation).map(|d| d.len()).unwrap_or(0) as u64;
        Ok(ShardInfo {
            docids_len,
            num_docs,
            num_link_docs,
        })
    }

    fn doc_offset(&self, generation: i64, posting_offset: u64) -> Result<u64> {
        let inner = self.inner.read();
        inner
            .doc_offsets
            .get(&generation)
            .and_then(|m| m.get(&posting_offset).copied())
            .ok_or_else(|| {
                Error::Storage(format!(
                    "no posting at offset {} in generation {}",
                    posting_offset, generation
                ))
            })
    }

    fn next_doc_offset(
        &self,
        term: &[u8],
        generation: i64,
        from: u64,
        to: u64,
        target_doc_offset: u64,
    ) -> Result<Option<(u64, u64)>> {
        let inner = self.inner.read();
        let Some(slice) = inner.terms.get(term).and_then(|g| g.get(&generation)) else {
            return Ok(None);
        };
        for (offset, posting) in &slice.postings {
            if *offset < from || *offset >= to {
                continue;
            }
            if posting.doc_offset >= target_doc_offset {
                return Ok(Some((*offset, posting.doc_offset)));
            }
        }
        Ok(None)
    }

    fn make_item(&self, raw: &RawPosting, _num_docs_or_links: u64) -> Result<Option<DecodedPosting>> {
        let data = &raw.data;
        if data.len() < 2 {
            return Ok(None);
        }
        let key_len = BigEndian::read_u16(&data[0..2]) as usize;
        let mut at = 2;
        if data.len() < at + key_len + 45 {
            return Ok(None);
        }
        let key = data[at..at + key_len].to_vec();
        at += key_len;
        let mut fields = [0f64; 4];
        for field in &mut fields {
            *field = BigEndian::read_f64(&data[at..at + 8]);
            at += 8;
        }
        let summary_offset = BigEndian::read_u64(&data[at..at + 8]);
        at += 8;
        let flags = data[at];
        at += 1;
        let npos = BigEndian::read_u32(&data[at..at + 4]) as usize;
        at += 4;
        if data.len() < at + npos * 4 {
            return Ok(None);
        }
        let mut positions = Vec::with_capacity(npos);
        for _ in 0..npos {
            positions.push(BigEndian::read_u32(&data[at..at + 4]));
            at += 4;
        }
        Ok(Some(DecodedPosting {
            key,
            doc_rank: fields[0],
            relevance: fields[1],
            proximity: fields[2],
            score: fields[3],
            summary_offset,
            is_doc: flags & 1 != 0,
            is_special: flags & 2 != 0,
            positions,
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_word_info_sorted_with_feed_first() {
        let store = RamPostingStore::new(7);
        store.insert_posting(b"rust", 1, RamPosting::doc(0, DocKey::new(1, 1, 1)));
        store.insert_posting(b"rust", -1, RamPosting::doc(0, DocKey::new(2, 2, 2)));
        store.insert_posting(b"rust", 0, RamPosting::doc(0, DocKey::new(3, 3, 3)));

        let (estimate, slices) = store.word_info(b"rust", 0).unwrap();
        assert_eq!(estimate, 3);
        let generations: Vec<i64> = slices.iter().map(|s| s.generation).collect();
        assert_eq!(generations, vec![-1, 0, 1]);
    }

    #[test]
    fn test_word_info_absent_term() {
        let store = RamPostingStore::new(7);
        let (estimate, slices) = store.word_info(b"nope", 0).unwrap();
        assert_eq!(estimate, 0);
        assert!(slices.is_empty());
    }

    #[test]
    fn test_postings_slice_window_and_cursor() {
        let store = RamPostingStore::new(7);
        for i in 0..5 {
            store.insert_posting(
                b"term",
                0,
                RamPosting::doc(i * 10, DocKey::new(i, i, i)),
            );
        }
        let (_, slices) = store.word_info(b"term", 0).unwrap();
        let w = slices[0];
        let batch = store
            .postings_slice(b"term", 0, w.start_offset, w.start_offset, w.end_offset, 2)
            .unwrap();
        assert_eq!(batch.postings.len(), 2);
        assert_eq!(batch.next_cursor, w.start_offset + 2);

        let rest = store
            .postings_slice(b"term", 0, w.start_offset, batch.next_cursor, w.end_offset, 10)
            .unwrap();
        assert_eq!(rest.postings.len(), 3);
    }

    #[test]
    fn test_make_item_roundtrip() {
        let store = RamPostingStore::new(7);
        let key = DocKey::new(10, 20, 30);
        let posting = RamPosting::doc(4, key)
            .with_rank(2.5)
            .with_relevance(0.75)
            .with_positions(vec![3, 9, 27]);
        let raw = RawPosting {
            posting_offset: 0,
            data: RamPostingStore::encode_posting(&posting),
        };
        let item = store.make_item(&raw, 100).unwrap().unwrap();
        assert_eq!(DocKey::from_bytes(&item.key), Some(key));
        assert_eq!(item.doc_rank, 2.5);
        assert_eq!(item.relevance, 0.75);
        assert_eq!(item.positions, vec![3, 9, 27]);
        assert!(item.is_doc);
    }

    #[test]
    fn test_make_item_truncated_bytes() {
        let store = RamPostingStore::new(7);
        let raw = RawPosting {
            posting_offset: 0,
            data: vec![0, 24, 1, 2, 3],
        };
        assert!(store.make_item(&raw, 100).unwrap().is_none());
    }

    #[test]
    fn test_next_doc_offset_seek() {
        let store = RamPostingStore::new(7);
        for (i, doc) in [10u64, 20, 30, 40].iter().enumerate() {
            store.insert_posting(
                b"term",
                0,
                RamPosting::doc(*doc, DocKey::new(i as u64, 0, 0)),
            );
        }
        let (_, slices) = store.word_info(b"term", 0).unwrap();
        let w = slices[0];
        let hit = store
            .next_doc_offset(b"term", 0, w.start_offset, w.end_offset, 25)
            .unwrap();
        assert_eq!(hit.map(|(_, d)| d), Some(30));
        let miss = store
            .next_doc_offset(b"term", 0, w.start_offset, w.end_offset, 99)
            .unwrap();
        assert!(miss.is_none());
    }

    #[test]
    fn test_generation_count_grows() {
        let store = RamPostingStore::new(7);
        assert_eq!(store.generation_count(), 0);
        store.insert_posting(b"a", 0, RamPosting::doc(0, DocKey::new(1, 1, 1)));
        assert_eq!(store.generation_count(), 1);
        store.insert_posting(b"a", 3, RamPosting::doc(0, DocKey::new(2, 2, 2)));
        assert_eq!(store.generation_count(), 4);
        // Feed generation does not count toward numbered generations
        store.insert_posting(b"a", -1, RamPosting::doc(0, DocKey::new(3, 3, 3)));
        assert_eq!(store.generation_count(), 4);
    }
}
