//! Core data model: positions, document keys, posting records, result blocks.
//!
//! Everything here is produced by decoding shard bytes (via the storage
//! collaborator) and consumed by the merge iterators. Records are serde
//! serializable because they cross the wire between index nodes during
//! distributed fan-out.

use byteorder::{BigEndian, ByteOrder};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Generation number of the live feed shard. The feed is logically older
/// than every numbered generation for merge ordering: feed entries are
/// consumed before generation 0.
pub const FEED_GENERATION: i64 = -1;

/// Byte width of the composite document key: url hash, content hash and
/// host (inlink/domain) hash, each 8 bytes big-endian.
pub const DOC_KEY_LEN: usize = 24;

// ── GenerationOffset ─────────────────────────────────────────────────────

/// Ordered pair (generation, document offset within the shard).
///
/// This total order is the fundamental invariant every merge algorithm
/// relies on: offsets within a shard are non-decreasing, and generations
/// are walked in ascending numeric order with the feed's -1 first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GenerationOffset {
    pub generation: i64,
    pub offset: u64,
}

impl GenerationOffset {
    /// Exhausted-cursor sentinel, ordered after every real position.
    pub const TERMINAL: GenerationOffset = GenerationOffset {
        generation: i64::MAX,
        offset: u64::MAX,
    };

    pub fn new(generation: i64, offset: u64) -> Self {
        Self { generation, offset }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        *self == Self::TERMINAL
    }
}

impl std::fmt::Display for GenerationOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_terminal() {
            write!(f, "(terminal)")
        } else {
            write!(f, "({}, {})", self.generation, self.offset)
        }
    }
}

// ── DocKey ───────────────────────────────────────────────────────────────

/// Fixed-width composite document key split out of 24 raw key bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DocKey {
    /// Per-URL hash, used for grouping duplicate representations of a page.
    pub url_hash: u64,
    /// Content hash, used for cross-URL mirror detection.
    pub content_hash: u64,
    /// Inlink/domain hash of the host the record came from.
    pub host_hash: u64,
}

impl DocKey {
    pub fn new(url_hash: u64, content_hash: u64, host_hash: u64) -> Self {
        Self {
            url_hash,
            content_hash,
            host_hash,
        }
    }

    /// Split a raw composite key. Returns `None` for degenerate keys with
    /// fewer sub-fields than expected; callers skip such records rather
    /// than failing the whole block.
    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        if raw.len() < DOC_KEY_LEN {
            return None;
        }
        Some(Self {
            url_hash: BigEndian::read_u64(&raw[0..8]),
            content_hash: BigEndian::read_u64(&raw[8..16]),
            host_hash: BigEndian::read_u64(&raw[16..24]),
        })
    }

    pub fn to_bytes(&self) -> [u8; DOC_KEY_LEN] {
        let mut buf = [0u8; DOC_KEY_LEN];
        BigEndian::write_u64(&mut buf[0..8], self.url_hash);
        BigEndian::write_u64(&mut buf[8..16], self.content_hash);
        BigEndian::write_u64(&mut buf[16..24], self.host_hash);
        buf
    }
}

// ── CrawlTime ────────────────────────────────────────────────────────────

/// Crawl/index identifier a record originated from. Feed records carry a
/// distinct sentinel instead of a crawl epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrawlTime {
    Feed,
    Epoch(u64),
}

impl CrawlTime {
    #[inline]
    pub fn is_feed(&self) -> bool {
        matches!(self, CrawlTime::Feed)
    }
}

// ── Summary references ───────────────────────────────────────────────────

/// Where a document summary can be fetched from. Resolved later by a
/// collaborator; the core only carries the pointers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarySource {
    pub machine: SummaryMachine,
    pub key: DocKey,
    pub crawl_time: CrawlTime,
    pub generation: i64,
    pub offset: u64,
}

/// Which machine owns a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SummaryMachine {
    /// The local summary store of the node that produced the record.
    Local,
    /// The coordinating name server; used for synthetic lookup entries of
    /// special location/info pages in distributed mode.
    NameServer,
}

/// Summary-offset reference: either a byte offset into a summary store or
/// an already-resolved list of sources. Both forms must be supported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SummaryRef {
    Offset(u64),
    Resolved(Vec<SummarySource>),
}

// ── PostingRecord ────────────────────────────────────────────────────────

/// A decoded posting occurrence. Produced by the storage collaborator's
/// decode, consumed immediately into result blocks; never mutated after
/// block construction except by group aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingRecord {
    pub key: DocKey,
    pub doc_rank: f64,
    pub relevance: f64,
    pub proximity: f64,
    pub score: f64,
    pub summary: SummaryRef,
    pub generation: i64,
    pub crawl_time: CrawlTime,
    /// Page record (true) vs inlink record (false).
    pub is_doc: bool,
    pub is_feed: bool,
    /// Special location:/info: page, tagged by the storage decode.
    pub is_special: bool,
    /// Term occurrence offsets within the document.
    pub positions: Vec<u32>,
    /// Index of the child iterator this record came from. Set by the union
    /// merge so summary lookups can be routed back to the right child.
    #[serde(default)]
    pub origin: usize,
}

// ── ResultBlock ──────────────────────────────────────────────────────────

/// One batch of records returned by a single fetch, keyed by document key.
///
/// Keys are unique; iteration order is insertion order, which producers
/// keep equal to increasing `GenerationOffset` within the block. Owned by
/// the iterator that produced it until returned; callers only read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultBlock {
    records: Vec<PostingRecord>,
    #[serde(skip)]
    index: FxHashMap<DocKey, usize>,
}

impl ResultBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            records: Vec::with_capacity(n),
            index: FxHashMap::default(),
        }
    }

    /// Insert a record, replacing any record already stored under its key.
    /// Replacement keeps the original insertion position so block order
    /// stays non-decreasing in `GenerationOffset`.
    pub fn insert(&mut self, record: PostingRecord) {
        match self.index.get(&record.key) {
            Some(&pos) => self.records[pos] = record,
            None => {
                self.index.insert(record.key, self.records.len());
                self.records.push(record);
            }
        }
    }

    /// Insert only if the key is absent; returns whether it was inserted.
    pub fn insert_if_absent(&mut self, record: PostingRecord) -> bool {
        if self.index.contains_key(&record.key) {
            return false;
        }
        self.insert(record);
        true
    }

    pub fn get(&self, key: &DocKey) -> Option<&PostingRecord> {
        self.index.get(key).map(|&pos| &self.records[pos])
    }

    pub fn get_mut(&mut self, key: &DocKey) -> Option<&mut PostingRecord> {
        let pos = *self.index.get(key)?;
        Some(&mut self.records[pos])
    }

    pub fn contains_key(&self, key: &DocKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PostingRecord> {
        self.records.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocKey> {
        self.records.iter().map(|r| &r.key)
    }

    pub fn first(&self) -> Option<&PostingRecord> {
        self.records.first()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rebuild the key index after deserialization (serde skips it).
    pub fn rebuild_index(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(pos, r)| (r.key, pos))
            .collect();
    }
}

impl From<Vec<PostingRecord>> for ResultBlock {
    fn from(records: Vec<PostingRecord>) -> Self {
        let mut block = ResultBlock::with_capacity(records.len());
        for r in records {
            block.insert(r);
        }
        block
    }
}

impl<'a> IntoIterator for &'a ResultBlock {
    type Item = &'a PostingRecord;
    type IntoIter = std::slice::Iter<'a, PostingRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: u64) -> PostingRecord {
        PostingRecord {
            key: DocKey::new(url, url + 100, url + 200),
            doc_rank: 1.0,
            relevance: 1.0,
            proximity: 1.0,
            score: 1.0,
            summary: SummaryRef::Offset(0),
            generation: 0,
            crawl_time: CrawlTime::Epoch(1),
            is_doc: true,
            is_feed: false,
            is_special: false,
            positions: vec![],
            origin: 0,
        }
    }

    #[test]
    fn test_generation_offset_order() {
        let feed = GenerationOffset::new(FEED_GENERATION, 500);
        let g0 = GenerationOffset::new(0, 0);
        let g0_later = GenerationOffset::new(0, 10);
        let g2 = GenerationOffset::new(2, 0);

        assert!(feed < g0, "feed sorts before generation 0");
        assert!(g0 < g0_later);
        assert!(g0_later < g2);
        assert!(g2 < GenerationOffset::TERMINAL);
    }

    #[test]
    fn test_generation_offset_equality() {
        assert_eq!(GenerationOffset::new(1, 7), GenerationOffset::new(1, 7));
        assert!(GenerationOffset::TERMINAL.is_terminal());
        assert!(!GenerationOffset::new(0, 0).is_terminal());
    }

    #[test]
    fn test_doc_key_roundtrip() {
        let key = DocKey::new(0xAABB, 0xCCDD, 0xEEFF);
        let bytes = key.to_bytes();
        assert_eq!(DocKey::from_bytes(&bytes), Some(key));
    }

    #[test]
    fn test_doc_key_degenerate() {
        // Short key: skipped, not an error
        assert_eq!(DocKey::from_bytes(&[0u8; 8]), None);
        assert_eq!(DocKey::from_bytes(&[]), None);
    }

    #[test]
    fn test_result_block_insert_order() {
        let mut block = ResultBlock::new();
        block.insert(record(3));
        block.insert(record(1));
        block.insert(record(2));

        let urls: Vec<u64> = block.iter().map(|r| r.key.url_hash).collect();
        assert_eq!(urls, vec![3, 1, 2], "iteration follows insertion order");
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn test_result_block_replace_keeps_position() {
        let mut block = ResultBlock::new();
        block.insert(record(1));
        block.insert(record(2));

        let mut updated = record(1);
        updated.doc_rank = 9.0;
        block.insert(updated);

        assert_eq!(block.len(), 2);
        let urls: Vec<u64> = block.iter().map(|r| r.key.url_hash).collect();
        assert_eq!(urls, vec![1, 2]);
        assert_eq!(block.get(&record(1).key).unwrap().doc_rank, 9.0);
    }

    #[test]
    fn test_result_block_insert_if_absent() {
        let mut block = ResultBlock::new();
        assert!(block.insert_if_absent(record(1)));
        let mut dup = record(1);
        dup.doc_rank = 42.0;
        assert!(!block.insert_if_absent(dup));
        assert_eq!(block.get(&record(1).key).unwrap().doc_rank, 1.0);
    }
}
