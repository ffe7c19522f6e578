//! # SluiceDB - Write-Optimized Embedded Key-Value Store
//!
//! SluiceDB is an embedded, single-process, ordered key→value store built
//! on a buffered B-tree: a fanout tree where every inner node carries a
//! per-child message buffer, so writes are batched down the tree lazily.
//! Insertion throughput lands an order of magnitude above a classical
//! B⁺-tree while point lookups stay logarithmic.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use sluicedb::{Database, FsDirectory, Options};
//!
//! let opts = Options {
//!     dir: Some(Arc::new(FsDirectory::new("./data")?)),
//!     ..Options::default()
//! };
//! let db = Database::open("mydb", opts)?;
//!
//! db.put(b"key", b"value")?;
//! assert_eq!(db.get(b"key")?.as_deref(), Some(&b"value"[..]));
//! db.flush()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Public API (Database)        │
//! ├─────────────────────────────────────┤
//! │  Buffered B-Tree (cascade/split/    │
//! │  merge, bloom-gated lookups)        │
//! ├─────────────────────────────────────┤
//! │  Node Cache (write-back flusher,    │
//! │  watermarks, LRU eviction)          │
//! ├─────────────────────────────────────┤
//! │  Layout (block index, hole reuse,   │
//! │  double-written superblock)         │
//! ├─────────────────────────────────────┤
//! │  Directory / AsyncFile (page-       │
//! │  aligned positional + async I/O)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! A write appends one message to the root's buffer for the covering
//! child. When a node buffers too much, the fullest buffer *cascades*
//! into its child in one batch; at a leaf the batch merges into bucketed
//! records, possibly splitting the leaf or merging it away. Reads walk
//! root to leaf, consulting each ancestor's buffer (bloom-gated when the
//! buffer is still on disk) before descending, and load exactly one leaf
//! bucket off disk.
//!
//! ## File Format
//!
//! One file per database: two superblock copies in the first two pages,
//! then node payloads and one index block in arbitrary order, every
//! extent page-aligned. Freed extents are quarantined on a "fly" list
//! until the next metadata flush, so a crash can never hand out bytes the
//! last durable index still references.
//!
//! ## Module Overview
//!
//! - [`btree`]: messages, records, nodes, and the tree itself
//! - [`cache`]: node registry, read-through loading, write-back, eviction
//! - [`storage`]: blocks, layout, superblocks, and the file boundary
//! - [`bloom`]: per-buffer membership filters
//! - [`config`]: engine options
//! - [`comparator`] / [`compress`]: pluggable ordering and block codecs

pub mod bloom;
pub mod btree;
pub mod cache;
pub mod comparator;
pub mod compress;
pub mod config;
pub mod db;
pub mod storage;

pub use comparator::{Comparator, LexicalComparator};
pub use config::{Compress, Options};
pub use db::Database;
pub use storage::{Directory, FsDirectory, RamDirectory};
