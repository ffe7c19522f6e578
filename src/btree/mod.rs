//! # Buffered B-Tree
//!
//! The tree that makes writes cheap: every inner node carries one message
//! buffer per child, and a write is just an append to the root's buffer for
//! the covering child. When a node holds too many buffered messages, the
//! fullest buffer *cascades* into its child in one batch, and so on down
//! the tree, so the per-key write cost on disk is amortized across whole
//! buffers. Point reads walk the same path, consulting each ancestor's
//! buffer (gated by a bloom filter) before descending.
//!
//! ## Node id space
//!
//! ```text
//! 0                 nil
//! 1                 schema node (root pointer, id counters, depth)
//! [2, 2^48]         inner nodes
//! (2^48, 2^64)      leaf nodes
//! ```
//!
//! Ids are allocated once and never reused; whether a node is a leaf is a
//! property of its id alone.
//!
//! ## Restructuring
//!
//! Leaves split when they outgrow their page or record budget, promoting a
//! separator pivot into the parent; inner nodes split when their fanout
//! bound is exceeded, possibly all the way to the root (*pileup*: a new
//! root above the old one). A leaf drained to zero records merges away:
//! its sibling links are patched, the node dies, and the parent drops its
//! pivot, cascading upward until the root itself may be replaced by a
//! fresh empty one (*collapse*).
//!
//! ## Module Organization
//!
//! - `msg`: Put/Del messages and the per-child sorted buffer
//! - `record`: leaf records partitioned into bucket I/O units
//! - `node`: node metadata, status lattice, the schema node
//! - `inner`: inner nodes (write path, cascade, split, lookup)
//! - `leaf`: leaf nodes (record merge, split, merge-away, lookup)
//! - `tree`: root ownership, id allocation, path locking

mod inner;
mod leaf;
mod msg;
mod node;
mod record;
mod tree;

pub use inner::{InnerNode, InnerState, Pivot, WriteOutcome};
pub use leaf::{LeafNode, LeafState};
pub use msg::{Msg, MsgBuf, MsgKind};
pub use node::{
    now_micros, CachedNode, NodeConfig, NodeKind, NodeMeta, NodeStatus, NodeWriteGuard,
    SchemaNode, SchemaState,
};
pub use record::{Record, RecordBuckets};
pub use tree::{Tree, TreeNodeFactory};

/// 64-bit logical node identifier.
pub type NodeId = u64;

pub const NID_NIL: NodeId = 0;
pub const NID_SCHEMA: NodeId = 1;
pub const NID_START: NodeId = 2;
pub const NID_LEAF_START: NodeId = (1 << 48) + 1;

/// Leafness is a property of the id alone.
pub fn is_leaf_id(nid: NodeId) -> bool {
    nid >= NID_LEAF_START
}
