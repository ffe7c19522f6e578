//! Node metadata, the status lattice, and the schema node.
//!
//! Every cached node pairs kind-specific state behind its latch with a
//! `NodeMeta` of atomics the cache can read without taking any lock:
//! dirty/dead/flushing flags, pin count, and the two timestamps that order
//! write-back (first dirtying) and eviction (last use).
//!
//! Status forms a lattice `New → Unloaded → SkeletonLoaded → FullLoaded`:
//! a node built by the tree is `New`; one built by the cache's factory is
//! `Unloaded` until `read_from` runs; a skeleton read leaves descriptors
//! without payloads; any mutation first promotes to `FullLoaded`.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use eyre::{bail, Result};
use parking_lot::{ArcRwLockWriteGuard, RawRwLock, RwLock, RwLockReadGuard};

use crate::compress::Compressor;
use crate::storage::{Block, BlockReader, BlockWriter};

use super::inner::{InnerNode, InnerState};
use super::leaf::{LeafNode, LeafState};
use super::msg::MsgBuf;
use super::tree::Tree;
use super::{NodeId, NID_SCHEMA};

/// Microseconds on a process-wide monotonic clock.
pub fn now_micros() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Engine parameters a node needs outside any tree operation: the cache
/// deserializes nodes without a `Tree` in hand.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub check_crc: bool,
    pub compressor: Option<Compressor>,
    pub bucket_length: usize,
}

/// Verifies and decompresses one stored section (a message buffer or a
/// bucket) against its descriptor.
pub(crate) fn decode_section(
    config: &NodeConfig,
    stored: &[u8],
    uncompressed: u32,
    crc: u16,
) -> Result<Vec<u8>> {
    if config.check_crc {
        let computed = crate::storage::crc16(stored);
        eyre::ensure!(
            computed == crc,
            "stored section is corrupt: crc {:#06x} != {:#06x}",
            computed,
            crc
        );
    }
    match &config.compressor {
        Some(compressor) => {
            let mut out = vec![0u8; uncompressed as usize];
            compressor.uncompress(stored, &mut out)?;
            Ok(out)
        }
        None => Ok(stored.to_vec()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    New = 0,
    Unloaded = 1,
    SkeletonLoaded = 2,
    FullLoaded = 3,
}

impl NodeStatus {
    fn from_u8(v: u8) -> NodeStatus {
        match v {
            0 => NodeStatus::New,
            1 => NodeStatus::Unloaded,
            2 => NodeStatus::SkeletonLoaded,
            _ => NodeStatus::FullLoaded,
        }
    }
}

#[derive(Debug)]
pub struct NodeMeta {
    pub table: Arc<str>,
    pub nid: NodeId,
    status: AtomicU8,
    dirty: AtomicBool,
    dead: AtomicBool,
    flushing: AtomicBool,
    pin: AtomicU32,
    first_write_at: AtomicU64,
    last_used_at: AtomicU64,
}

impl NodeMeta {
    fn new(table: Arc<str>, nid: NodeId, status: NodeStatus) -> NodeMeta {
        NodeMeta {
            table,
            nid,
            status: AtomicU8::new(status as u8),
            dirty: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            pin: AtomicU32::new(0),
            first_write_at: AtomicU64::new(0),
            last_used_at: AtomicU64::new(now_micros()),
        }
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: NodeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks dirty; the clean→dirty transition stamps `first_write_at`,
    /// which orders background write-back.
    pub fn set_dirty(&self, dirty: bool) {
        if dirty {
            if !self.dirty.swap(true, Ordering::AcqRel) {
                self.first_write_at.store(now_micros(), Ordering::Release);
            }
        } else {
            self.dirty.store(false, Ordering::Release);
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn set_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    pub fn pin(&self) -> u32 {
        self.pin.load(Ordering::Acquire)
    }

    pub fn inc_pin(&self) {
        self.pin.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_pin(&self) {
        let prev = self.pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "pin underflow on node {:#x}", self.nid);
    }

    pub fn first_write_at(&self) -> u64 {
        self.first_write_at.load(Ordering::Acquire)
    }

    pub fn last_used_at(&self) -> u64 {
        self.last_used_at.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        self.last_used_at.store(now_micros(), Ordering::Release);
    }
}

/// Owned write guard over a node's state, storable in a root→leaf path.
pub enum NodeWriteGuard {
    Schema(ArcRwLockWriteGuard<RawRwLock, SchemaState>),
    Inner(ArcRwLockWriteGuard<RawRwLock, InnerState>),
    Leaf(ArcRwLockWriteGuard<RawRwLock, LeafState>),
}

#[derive(Debug)]
pub enum NodeKind {
    Schema(SchemaNode),
    Inner(InnerNode),
    Leaf(LeafNode),
}

/// A node as the cache holds it: shared metadata plus the tagged variant.
#[derive(Debug)]
pub struct CachedNode {
    meta: Arc<NodeMeta>,
    kind: NodeKind,
}

impl CachedNode {
    pub fn new_schema(table: Arc<str>, status: NodeStatus) -> Arc<CachedNode> {
        let meta = Arc::new(NodeMeta::new(table, NID_SCHEMA, status));
        Arc::new(CachedNode {
            kind: NodeKind::Schema(SchemaNode::new(Arc::clone(&meta))),
            meta,
        })
    }

    pub fn new_inner(
        table: Arc<str>,
        nid: NodeId,
        config: Arc<NodeConfig>,
        status: NodeStatus,
    ) -> Arc<CachedNode> {
        let meta = Arc::new(NodeMeta::new(table, nid, status));
        Arc::new(CachedNode {
            kind: NodeKind::Inner(InnerNode::new(Arc::clone(&meta), config)),
            meta,
        })
    }

    pub fn new_leaf(
        table: Arc<str>,
        nid: NodeId,
        config: Arc<NodeConfig>,
        status: NodeStatus,
    ) -> Arc<CachedNode> {
        let meta = Arc::new(NodeMeta::new(table, nid, status));
        Arc::new(CachedNode {
            kind: NodeKind::Leaf(LeafNode::new(Arc::clone(&meta), config)),
            meta,
        })
    }

    pub fn meta(&self) -> &NodeMeta {
        &self.meta
    }

    pub fn nid(&self) -> NodeId {
        self.meta.nid
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_inner(&self) -> bool {
        matches!(self.kind, NodeKind::Inner(_))
    }

    pub fn as_inner(&self) -> &InnerNode {
        match &self.kind {
            NodeKind::Inner(inner) => inner,
            _ => panic!("node {:#x} is not an inner node", self.nid()),
        }
    }

    pub fn as_leaf(&self) -> &LeafNode {
        match &self.kind {
            NodeKind::Leaf(leaf) => leaf,
            _ => panic!("node {:#x} is not a leaf node", self.nid()),
        }
    }

    pub fn as_schema(&self) -> &SchemaNode {
        match &self.kind {
            NodeKind::Schema(schema) => schema,
            _ => panic!("node {:#x} is not the schema node", self.nid()),
        }
    }

    /// In-memory size estimate, latch-free for cache accounting.
    pub fn size(&self) -> usize {
        match &self.kind {
            NodeKind::Schema(s) => s.size(),
            NodeKind::Inner(i) => i.size(),
            NodeKind::Leaf(l) => l.size(),
        }
    }

    pub fn lock_write(&self) -> NodeWriteGuard {
        match &self.kind {
            NodeKind::Schema(s) => NodeWriteGuard::Schema(s.state.write_arc()),
            NodeKind::Inner(i) => NodeWriteGuard::Inner(i.state.write_arc()),
            NodeKind::Leaf(l) => NodeWriteGuard::Leaf(l.state.write_arc()),
        }
    }

    pub fn try_lock_write(&self) -> Option<NodeWriteGuard> {
        match &self.kind {
            NodeKind::Schema(s) => s.state.try_write_arc().map(NodeWriteGuard::Schema),
            NodeKind::Inner(i) => i.state.try_write_arc().map(NodeWriteGuard::Inner),
            NodeKind::Leaf(l) => l.state.try_write_arc().map(NodeWriteGuard::Leaf),
        }
    }

    /// Serializes under the caller-held write guard, returning the block
    /// and its skeleton length.
    pub fn serialize(&self, guard: &NodeWriteGuard) -> Result<(Block, u32)> {
        match (&self.kind, guard) {
            (NodeKind::Schema(s), NodeWriteGuard::Schema(g)) => s.serialize(g),
            (NodeKind::Inner(i), NodeWriteGuard::Inner(g)) => i.serialize(g),
            (NodeKind::Leaf(l), NodeWriteGuard::Leaf(g)) => l.serialize(g),
            _ => bail!("write guard does not belong to node {:#x}", self.nid()),
        }
    }

    /// Deserializes a freshly loaded node from its block.
    pub fn read_from(&self, block: &Block, skeleton_only: bool) -> Result<()> {
        match &self.kind {
            NodeKind::Schema(s) => s.read_from(block),
            NodeKind::Inner(i) => i.read_from(block, skeleton_only),
            NodeKind::Leaf(l) => l.read_from(block, skeleton_only),
        }?;
        self.meta.set_status(if skeleton_only {
            NodeStatus::SkeletonLoaded
        } else {
            NodeStatus::FullLoaded
        });
        Ok(())
    }

    /// Point lookup. `parent_guard` is released once this node's own latch
    /// is held (lock coupling).
    pub fn find(
        &self,
        tree: &Tree,
        key: &[u8],
        parent_guard: Option<RwLockReadGuard<'_, InnerState>>,
    ) -> Result<Option<Vec<u8>>> {
        match &self.kind {
            NodeKind::Inner(i) => i.find(tree, key, parent_guard),
            NodeKind::Leaf(l) => l.find(tree, key, parent_guard),
            NodeKind::Schema(_) => bail!("lookup descended into the schema node"),
        }
    }

    /// Receives a cascading buffer from `parent`. The parent's latch guard
    /// is released crab-walk style once the buffer has been drained.
    pub fn cascade(
        &self,
        tree: &Tree,
        buf: &Arc<RwLock<MsgBuf>>,
        parent: &InnerNode,
        parent_guard: RwLockReadGuard<'_, InnerState>,
    ) -> Result<()> {
        match &self.kind {
            NodeKind::Inner(i) => i.cascade(tree, buf, parent, parent_guard),
            NodeKind::Leaf(l) => l.cascade(tree, buf, parent, parent_guard),
            NodeKind::Schema(_) => bail!("cascade reached the schema node"),
        }
    }
}

/// Singleton bookkeeping node: the root pointer, the id allocators, and
/// the tree depth.
#[derive(Debug)]
pub struct SchemaNode {
    #[allow(dead_code)]
    meta: Arc<NodeMeta>,
    pub state: Arc<RwLock<SchemaState>>,
}

#[derive(Debug, Default)]
pub struct SchemaState {
    pub root_id: NodeId,
    pub next_inner_id: NodeId,
    pub next_leaf_id: NodeId,
    pub tree_depth: u64,
}

impl SchemaNode {
    fn new(meta: Arc<NodeMeta>) -> SchemaNode {
        SchemaNode {
            meta,
            state: Arc::new(RwLock::new(SchemaState::default())),
        }
    }

    pub fn size(&self) -> usize {
        32
    }

    fn serialize(&self, state: &SchemaState) -> Result<(Block, u32)> {
        let mut block = Block::with_capacity(self.size())?;
        {
            let mut writer = BlockWriter::new(&mut block);
            writer.write_u64(state.root_id)?;
            writer.write_u64(state.next_inner_id)?;
            writer.write_u64(state.next_leaf_id)?;
            writer.write_u64(state.tree_depth)?;
        }
        let skeleton = block.size() as u32;
        Ok((block, skeleton))
    }

    fn read_from(&self, block: &Block) -> Result<()> {
        let mut reader = BlockReader::new(block);
        let mut state = self.state.write();
        state.root_id = reader.read_u64()?;
        state.next_inner_id = reader.read_u64()?;
        state.next_leaf_id = reader.read_u64()?;
        state.tree_depth = reader.read_u64()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirty_transition_stamps_first_write() {
        let meta = NodeMeta::new("t".into(), 2, NodeStatus::New);
        assert_eq!(meta.first_write_at(), 0);

        meta.set_dirty(true);
        let stamp = meta.first_write_at();
        assert!(stamp > 0);

        // Re-dirtying keeps the original stamp.
        meta.set_dirty(true);
        assert_eq!(meta.first_write_at(), stamp);

        meta.set_dirty(false);
        meta.set_dirty(true);
        assert!(meta.first_write_at() >= stamp);
    }

    #[test]
    fn schema_serialization_round_trips() {
        let node = CachedNode::new_schema("t".into(), NodeStatus::New);
        {
            let schema = node.as_schema();
            let mut state = schema.state.write();
            state.root_id = 2;
            state.next_inner_id = 9;
            state.next_leaf_id = super::super::NID_LEAF_START + 4;
            state.tree_depth = 3;
        }

        let guard = node.lock_write();
        let (block, skeleton) = node.serialize(&guard).unwrap();
        drop(guard);
        assert_eq!(skeleton, 32);
        assert_eq!(block.size(), 32);

        let copy = CachedNode::new_schema("t".into(), NodeStatus::Unloaded);
        copy.read_from(&block, false).unwrap();
        let state = copy.as_schema().state.read();
        assert_eq!(state.root_id, 2);
        assert_eq!(state.next_inner_id, 9);
        assert_eq!(state.next_leaf_id, super::super::NID_LEAF_START + 4);
        assert_eq!(state.tree_depth, 3);
        assert_eq!(copy.meta().status(), NodeStatus::FullLoaded);
    }

    #[test]
    fn pin_tracks_balance() {
        let meta = NodeMeta::new("t".into(), 2, NodeStatus::New);
        meta.inc_pin();
        meta.inc_pin();
        assert_eq!(meta.pin(), 2);
        meta.dec_pin();
        meta.dec_pin();
        assert_eq!(meta.pin(), 0);
    }
}
