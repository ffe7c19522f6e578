//! # Engine Configuration
//!
//! This module centralizes every tunable the engine honors. Values that
//! depend on each other are documented together so a change to one can be
//! checked against the others.
//!
//! ## Tuning Relationships
//!
//! ```text
//! inner_node_page_size (4 MiB)
//!       │
//!       ├─> bigger inner nodes batch more messages per cascade, improving
//!       │   write throughput but degrading point-read latency
//!       │
//!       └─> cache_limit should be at least twice the total size of inner
//!           nodes or the flusher thrashes
//!
//! leaf_node_page_size (4 MiB)
//!       │
//!       └─> leaf_node_bucket_size (128 KiB) divides a leaf into the units
//!           of disk read for point queries; smaller buckets favor point
//!           reads but hurt compression ratio
//!
//! cache_limit (512 MiB)
//!       │
//!       ├─> cache_dirty_high_watermark (30%): above this much dirty data,
//!       │   the flusher writes back more than its per-tick goal
//!       ├─> cache_writeback_ratio (1%): per-tick writeback byte goal
//!       ├─> cache_evict_high_watermark (95%): above this, clean nodes are
//!       │   evicted in LRU order
//!       └─> cache_evict_ratio (1%): per-pass eviction byte goal
//! ```
//!
//! `inner_node_msg_count` and `leaf_node_record_count` exist so tests can
//! force cascades and splits with a handful of keys; production
//! configurations leave them unset.

use std::sync::Arc;

use crate::comparator::{Comparator, LexicalComparator};
use crate::storage::Directory;

/// Block compression applied to message buffers and leaf buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compress {
    None,
    Snappy,
}

#[derive(Clone)]
pub struct Options {
    /// Directory where the data file lives. Must be set before `open`.
    pub dir: Option<Arc<dyn Directory>>,

    /// Total order on keys.
    pub comparator: Arc<dyn Comparator>,

    /// Cascade byte threshold of an inner node.
    pub inner_node_page_size: usize,

    /// Maximum number of children of an inner node; split above this.
    pub inner_node_children_number: usize,

    /// Split byte threshold of a leaf node.
    pub leaf_node_page_size: usize,

    /// Byte cap of a single leaf bucket, the unit of disk read for point
    /// queries.
    pub leaf_node_bucket_size: usize,

    /// Cascade count threshold of an inner node. Unlimited when `None`;
    /// intended for tests.
    pub inner_node_msg_count: Option<usize>,

    /// Split count threshold of a leaf node. Unlimited when `None`;
    /// intended for tests.
    pub leaf_node_record_count: Option<usize>,

    /// Maximum total size of cached nodes, in bytes.
    pub cache_limit: usize,

    /// Percentage of `cache_limit`; above this much dirty data the flusher
    /// writes back beyond its expiry set.
    pub cache_dirty_high_watermark: usize,

    /// Age in milliseconds after which a dirty node expires and is written
    /// back.
    pub cache_dirty_expire_ms: u64,

    /// Percentage of `cache_limit` written back per flusher tick.
    pub cache_writeback_ratio: usize,

    /// Flusher tick interval in milliseconds.
    pub cache_writeback_interval_ms: u64,

    /// Percentage of `cache_limit` evicted per eviction pass.
    pub cache_evict_ratio: usize,

    /// Percentage of `cache_limit` above which eviction starts.
    pub cache_evict_high_watermark: usize,

    /// Block compression.
    pub compress: Compress,

    /// Verify checksums on read. Checksums are always computed on write.
    pub check_crc: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: None,
            comparator: Arc::new(LexicalComparator),
            inner_node_page_size: 4 << 20,
            inner_node_children_number: 16,
            leaf_node_page_size: 4 << 20,
            leaf_node_bucket_size: 128 << 10,
            inner_node_msg_count: None,
            leaf_node_record_count: None,
            cache_limit: 512 << 20,
            cache_dirty_high_watermark: 30,
            cache_dirty_expire_ms: 60_000,
            cache_writeback_ratio: 1,
            cache_writeback_interval_ms: 100,
            cache_evict_ratio: 1,
            cache_evict_high_watermark: 95,
            compress: Compress::None,
            check_crc: true,
        }
    }
}

impl Options {
    /// Count threshold that triggers a cascade, `usize::MAX` when unset.
    pub fn msg_count_limit(&self) -> usize {
        self.inner_node_msg_count.unwrap_or(usize::MAX)
    }

    /// Count threshold that triggers a leaf split, `usize::MAX` when unset.
    pub fn record_count_limit(&self) -> usize {
        self.leaf_node_record_count.unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_values() {
        let opts = Options::default();

        assert_eq!(opts.inner_node_page_size, 4 << 20);
        assert_eq!(opts.inner_node_children_number, 16);
        assert_eq!(opts.leaf_node_page_size, 4 << 20);
        assert_eq!(opts.leaf_node_bucket_size, 128 << 10);
        assert_eq!(opts.cache_limit, 512 << 20);
        assert_eq!(opts.cache_dirty_high_watermark, 30);
        assert_eq!(opts.cache_dirty_expire_ms, 60_000);
        assert_eq!(opts.compress, Compress::None);
        assert!(opts.check_crc);
    }

    #[test]
    fn unset_count_limits_are_unlimited() {
        let opts = Options::default();

        assert_eq!(opts.msg_count_limit(), usize::MAX);
        assert_eq!(opts.record_count_limit(), usize::MAX);
    }

    #[test]
    fn set_count_limits_pass_through() {
        let opts = Options {
            inner_node_msg_count: Some(4),
            leaf_node_record_count: Some(8),
            ..Options::default()
        };

        assert_eq!(opts.msg_count_limit(), 4);
        assert_eq!(opts.record_count_limit(), 8);
    }
}
