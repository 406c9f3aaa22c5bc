//! Harrier - query-evaluation core over generational posting shards
//!
//! This library is the merge layer of a sharded search engine:
//! - Forward-only posting cursors keyed by (generation, offset), with the
//!   live feed shard ordered before every numbered generation
//! - Boolean merge iterators (union, intersect, disjoint) built on
//!   bound-propagating sorted-merge synchronization
//! - Proximity and quoted-phrase scoring from in-document positions
//! - Post-merge grouping by URL hash and content hash with score
//!   aggregation and domain-repetition decay
//! - Distributed fan-out across index nodes with adaptive batch sizing
//!
//! Shard storage and the network transport are external collaborators
//! consumed through the narrow traits in [`store`] and [`fetch`].

pub mod error;
pub mod fetch;
pub mod iterator;
pub mod model;
pub mod scoring;
pub mod store;

// Re-exports from model
pub use model::{
    CrawlTime, DocKey, GenerationOffset, PostingRecord, ResultBlock, SummaryMachine, SummaryRef,
    SummarySource, DOC_KEY_LEN, FEED_GENERATION,
};

// Re-exports from the iterator tree
pub use iterator::{
    DisjointIterator, DocIterator, EmptyIterator, FanoutIterator, GroupIterator,
    IntersectIterator, IteratorCore, QueryIterator, TermIterator, UnionIterator,
    DEFAULT_RESULTS_PER_BLOCK,
};

// Re-exports from collaborator contracts
pub use fetch::{
    FanoutStats, MemoryMetrics, MetricsSink, NetworkClient, NodeOp, NodeReply, NodeRequest,
    NodeResponse, NullMetrics, QueryEnvelope,
};
pub use store::{
    DecodedPosting, GenerationSlice, PostingStore, PostingsSlice, RamPosting, RamPostingStore,
    RawPosting, ShardInfo,
};

pub use error::{Error, Result};
pub use scoring::{PhraseConstraint, QuoteSlot};
