//! Leaf nodes.
//!
//! A leaf holds the actual records, bucketed so a point read pulls one
//! bucket off disk. Record mutation happens only through `cascade`: a
//! parent buffer is merged into the record set in one sorted sweep, after
//! which the leaf may split (too big) or merge away (empty).
//!
//! Split and merge re-descend from the root under write locks
//! (`lock_path`) because the ancestor chain may have changed since the
//! cascade; the `balancing` flag keeps one rebalance in flight per leaf.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tracing::trace;

use crate::comparator::Comparator;
use crate::storage::{crc16, Block, BlockReader, BlockWriter};

use super::inner::{add_pivot, rm_pivot, InnerNode, InnerState};
use super::msg::{MsgBuf, MsgKind};
use super::node::{decode_section, NodeConfig, NodeMeta, NodeStatus, NodeWriteGuard};
use super::record::{Bucket, BucketInfo, Record, RecordBuckets};
use super::tree::{release_path, Tree};
use super::{NodeId, NID_NIL};

#[derive(Debug)]
pub struct LeafState {
    pub left_sibling: NodeId,
    pub right_sibling: NodeId,
    pub buckets: RecordBuckets,
}

#[derive(Debug)]
pub struct LeafNode {
    meta: Arc<NodeMeta>,
    config: Arc<NodeConfig>,
    pub state: Arc<RwLock<LeafState>>,
    /// Total bucket payload bytes, mirrored for latch-free `size()`.
    bytes: AtomicUsize,
    /// One split or merge in flight per leaf.
    balancing: AtomicBool,
}

impl LeafNode {
    pub(crate) fn new(meta: Arc<NodeMeta>, config: Arc<NodeConfig>) -> LeafNode {
        let buckets = RecordBuckets::new(config.bucket_length);
        LeafNode {
            meta,
            config,
            state: Arc::new(RwLock::new(LeafState {
                left_sibling: NID_NIL,
                right_sibling: NID_NIL,
                buckets,
            })),
            bytes: AtomicUsize::new(0),
            balancing: AtomicBool::new(false),
        }
    }

    pub fn size(&self) -> usize {
        8 * 2 + 4 + self.bytes.load(Ordering::Relaxed)
    }

    /// Merges the parent's buffer into the record set, then rebalances if
    /// the result is oversized or empty.
    pub(crate) fn cascade(
        &self,
        tree: &Tree,
        buf: &Arc<RwLock<MsgBuf>>,
        parent: &InnerNode,
        parent_guard: RwLockReadGuard<'_, InnerState>,
    ) -> Result<()> {
        let mut state = self.state.write();
        self.ensure_full(tree, &mut state)?;
        let comp = tree.comparator();

        let anchor;
        {
            let mut b = buf.write();
            let (oldcnt, oldsz) = (b.count(), b.size());
            let msgs = b.drain();
            parent.adjust(oldcnt, b.count(), oldsz, b.size());
            drop(b);
            drop(parent_guard);

            let Some(first) = msgs.first() else {
                // A racing cascade already delivered this buffer.
                return Ok(());
            };
            anchor = first.key.clone();

            let old = state.buckets.take_records();
            let mut merged = RecordBuckets::new(self.config.bucket_length);
            let mut incoming = msgs.into_iter().peekable();
            let mut existing = old.into_iter().peekable();
            loop {
                let take_msg = match (incoming.peek(), existing.peek()) {
                    (Some(m), Some(r)) => comp.compare(&m.key, &r.key) != CmpOrdering::Greater,
                    (Some(_), None) => true,
                    (None, Some(_)) => false,
                    (None, None) => break,
                };
                if take_msg {
                    let msg = incoming.next().unwrap();
                    if let Some(r) = existing.peek() {
                        if comp.compare(&msg.key, &r.key) == CmpOrdering::Equal {
                            // The message supersedes the old record.
                            existing.next();
                        }
                    }
                    match msg.kind {
                        MsgKind::Put => merged.push_back(Record::new(msg.key, msg.value)),
                        MsgKind::Del => {}
                    }
                } else {
                    merged.push_back(existing.next().unwrap());
                }
            }
            state.buckets = merged;
        }

        self.bytes.store(state.buckets.length(), Ordering::Relaxed);
        self.meta.set_dirty(true);

        let count = state.buckets.count();
        if count == 0 {
            self.merge_away(tree, anchor, state)
        } else if count > 1
            && (count > tree.opts().record_count_limit()
                || self.size() > tree.opts().leaf_node_page_size)
        {
            self.split(tree, anchor, state)
        } else {
            Ok(())
        }
    }

    /// Splits off a right sibling and promotes its first key into the
    /// parent chain, re-descending under write locks. The balancing flag
    /// admits one rebalance at a time and is cleared on every exit.
    fn split(
        &self,
        tree: &Tree,
        anchor: Vec<u8>,
        state: RwLockWriteGuard<'_, LeafState>,
    ) -> Result<()> {
        if self.balancing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(state);

        let result = self.split_locked(tree, &anchor);
        self.balancing.store(false, Ordering::Release);
        result
    }

    fn split_locked(&self, tree: &Tree, anchor: &[u8]) -> Result<()> {
        let mut path = tree.lock_path(anchor)?;
        let reached_self =
            matches!(path.last(), Some(entry) if entry.node.nid() == self.meta.nid);
        if !reached_self {
            // The tree changed under us; the next cascade retries.
            release_path(&mut path);
            return Ok(());
        }

        let mut entry = path.pop().unwrap();
        let NodeWriteGuard::Leaf(state) = &mut entry.guard else {
            panic!("leaf path entry without a leaf guard");
        };

        // Deletions may have raced ahead of us.
        let count = state.buckets.count();
        let undersized = count <= 1
            || (count <= tree.opts().record_count_limit() / 2
                && self.size() <= tree.opts().leaf_node_page_size / 2);
        if undersized {
            drop(entry);
            release_path(&mut path);
            return Ok(());
        }

        let right = tree.new_leaf_node()?;
        let right_leaf = right.as_leaf();
        let promoted;
        {
            let mut rstate = right_leaf.state.write();
            rstate.left_sibling = self.meta.nid;
            rstate.right_sibling = state.right_sibling;

            if state.right_sibling != NID_NIL {
                let old_right = tree.load_node(state.right_sibling, false)?;
                let old_right_leaf = old_right.as_leaf();
                let mut g = old_right_leaf.state.write();
                old_right_leaf.ensure_full(tree, &mut g)?;
                g.left_sibling = right.nid();
                old_right.meta().set_dirty(true);
            }
            state.right_sibling = right.nid();

            promoted = state.buckets.split(&mut rstate.buckets);
            right_leaf
                .bytes
                .store(rstate.buckets.length(), Ordering::Relaxed);
        }
        self.bytes.store(state.buckets.length(), Ordering::Relaxed);
        self.meta.set_dirty(true);
        right.meta().set_dirty(true);
        trace!(nid = self.meta.nid, right = right.nid(), "leaf split");

        drop(entry);
        add_pivot(tree, &mut path, promoted, right.nid())
    }

    /// An emptied leaf unlinks itself from the sibling list, dies, and
    /// removes its pivot from the parent chain.
    fn merge_away(
        &self,
        tree: &Tree,
        anchor: Vec<u8>,
        state: RwLockWriteGuard<'_, LeafState>,
    ) -> Result<()> {
        if self.balancing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(state);

        let result = self.merge_locked(tree, &anchor);
        self.balancing.store(false, Ordering::Release);
        result
    }

    fn merge_locked(&self, tree: &Tree, anchor: &[u8]) -> Result<()> {
        let mut path = tree.lock_path(anchor)?;
        let reached_self =
            matches!(path.last(), Some(entry) if entry.node.nid() == self.meta.nid);
        if !reached_self {
            release_path(&mut path);
            return Ok(());
        }

        let mut entry = path.pop().unwrap();
        let NodeWriteGuard::Leaf(state) = &mut entry.guard else {
            panic!("leaf path entry without a leaf guard");
        };

        // Insertions may have raced ahead of us.
        if state.buckets.count() > 0 {
            drop(entry);
            release_path(&mut path);
            return Ok(());
        }

        if state.left_sibling != NID_NIL {
            let left = tree.load_node(state.left_sibling, false)?;
            let left_leaf = left.as_leaf();
            let mut g = left_leaf.state.write();
            left_leaf.ensure_full(tree, &mut g)?;
            g.right_sibling = state.right_sibling;
            left.meta().set_dirty(true);
        }
        if state.right_sibling != NID_NIL {
            let right = tree.load_node(state.right_sibling, false)?;
            let right_leaf = right.as_leaf();
            let mut g = right_leaf.state.write();
            right_leaf.ensure_full(tree, &mut g)?;
            g.left_sibling = state.left_sibling;
            right.meta().set_dirty(true);
        }

        self.meta.set_dead();
        trace!(nid = self.meta.nid, "leaf merged away");

        let nid = entry.node.nid();
        drop(entry);

        rm_pivot(tree, &mut path, nid)
    }

    /// Point lookup: locate the covering bucket by its first key, loading
    /// it from disk if needed (upgrading the latch to install it).
    pub(crate) fn find(
        &self,
        tree: &Tree,
        key: &[u8],
        parent_guard: Option<RwLockReadGuard<'_, InnerState>>,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.upgradable_read();
        drop(parent_guard);

        let comp = tree.comparator();
        let count = state.buckets.buckets_number();
        let mut covering = None;
        for i in 0..count {
            if comp.compare(state.buckets.bucket(i).first_key(), key) != CmpOrdering::Greater {
                covering = Some(i);
            } else {
                break;
            }
        }
        let Some(idx) = covering else {
            return Ok(None);
        };

        if state.buckets.bucket(idx).is_loaded() {
            return Ok(search_bucket(state.buckets.bucket(idx), key, comp));
        }

        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        self.load_bucket(tree, &mut state, idx)?;
        Ok(search_bucket(state.buckets.bucket(idx), key, comp))
    }

    fn load_bucket(&self, tree: &Tree, state: &mut LeafState, idx: usize) -> Result<()> {
        if state.buckets.bucket(idx).is_loaded() {
            return Ok(());
        }
        let info = state
            .buckets
            .bucket(idx)
            .info
            .clone()
            .expect("an unloaded bucket always has a descriptor");

        let block = tree.layout().read_range(self.meta.nid, info.offset, info.length)?;
        let payload = decode_section(&self.config, block.bytes(), info.uncompressed, info.crc)?;
        state.buckets.bucket_mut(idx).decode(&payload)?;
        state.buckets.note_bucket_loaded(idx);
        trace!(nid = self.meta.nid, idx, "bucket loaded");
        Ok(())
    }

    /// Promotes a skeleton-loaded leaf by pulling in every missing
    /// bucket; mutations need the whole record set.
    pub(crate) fn ensure_full(&self, tree: &Tree, state: &mut LeafState) -> Result<()> {
        if self.meta.status() != NodeStatus::SkeletonLoaded {
            return Ok(());
        }
        for idx in 0..state.buckets.buckets_number() {
            self.load_bucket(tree, state, idx)?;
        }
        self.meta.set_status(NodeStatus::FullLoaded);
        Ok(())
    }

    pub(crate) fn serialize(&self, state: &LeafState) -> Result<(Block, u32)> {
        ensure!(
            state.buckets.is_fully_loaded(),
            "cannot serialize leaf {:#x} with unloaded buckets",
            self.meta.nid
        );

        let count = state.buckets.buckets_number();
        let mut skeleton = 8 + 8 + 4;
        for i in 0..count {
            skeleton += 4 + state.buckets.bucket(i).first_key().len() + 4 + 4 + 4 + 2;
        }

        let mut estimate = skeleton;
        for i in 0..count {
            estimate += match &self.config.compressor {
                Some(c) => c.max_compressed_len(state.buckets.bucket(i).length()),
                None => state.buckets.bucket(i).length(),
            };
        }

        let mut block = Block::with_capacity(estimate.max(skeleton))?;
        let mut infos: Vec<BucketInfo> = Vec::with_capacity(count);
        {
            let mut w = BlockWriter::new(&mut block);
            w.seek(skeleton);
            for i in 0..count {
                let bucket = state.buckets.bucket(i);
                let mut payload = bucket.encode();
                let uncompressed = payload.len() as u32;
                if let Some(c) = &self.config.compressor {
                    let mut out = vec![0u8; c.max_compressed_len(payload.len())];
                    let n = c.compress(&payload, &mut out)?;
                    out.truncate(n);
                    payload = out;
                }
                let offset = w.pos() as u32;
                let crc = crc16(&payload);
                w.write_raw(&payload)?;
                infos.push(BucketInfo {
                    first_key: bucket.first_key().to_vec(),
                    offset,
                    length: payload.len() as u32,
                    uncompressed,
                    crc,
                });
            }

            w.seek(0);
            w.write_u64(state.left_sibling)?;
            w.write_u64(state.right_sibling)?;
            w.write_u32(count as u32)?;
            for info in &infos {
                w.write_slice(&info.first_key)?;
                w.write_u32(info.offset)?;
                w.write_u32(info.length)?;
                w.write_u32(info.uncompressed)?;
                w.write_u16(info.crc)?;
            }
            debug_assert_eq!(w.pos(), skeleton);
        }
        Ok((block, skeleton as u32))
    }

    pub(crate) fn read_from(&self, block: &Block, skeleton_only: bool) -> Result<()> {
        let mut state = self.state.write();
        let mut r = BlockReader::new(block);

        state.left_sibling = r.read_u64()?;
        state.right_sibling = r.read_u64()?;
        let count = r.read_u32()? as usize;

        let mut infos = Vec::with_capacity(count);
        for _ in 0..count {
            infos.push(BucketInfo {
                first_key: r.read_slice()?,
                offset: r.read_u32()?,
                length: r.read_u32()?,
                uncompressed: r.read_u32()?,
                crc: r.read_u16()?,
            });
        }

        state.buckets = RecordBuckets::new(self.config.bucket_length);
        state.buckets.install_shells(infos);

        if !skeleton_only {
            for idx in 0..count {
                let info = state.buckets.bucket(idx).info.clone().unwrap();
                let stored = block.window(info.offset as usize, info.length as usize);
                let payload =
                    decode_section(&self.config, stored, info.uncompressed, info.crc)?;
                state.buckets.bucket_mut(idx).decode(&payload)?;
                state.buckets.note_bucket_loaded(idx);
            }
        }

        self.bytes.store(state.buckets.length(), Ordering::Relaxed);
        Ok(())
    }
}

fn search_bucket(bucket: &Bucket, key: &[u8], comp: &dyn Comparator) -> Option<Vec<u8>> {
    let records = bucket.records.as_ref().expect("bucket is loaded");
    records
        .binary_search_by(|r| comp.compare(&r.key, key))
        .ok()
        .map(|i| records[i].value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{CachedNode, NodeStatus};

    fn test_config() -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            check_crc: true,
            compressor: None,
            bucket_length: 64,
        })
    }

    fn sample_leaf() -> Arc<CachedNode> {
        let node = CachedNode::new_leaf(
            "t".into(),
            crate::btree::NID_LEAF_START + 1,
            test_config(),
            NodeStatus::New,
        );
        {
            let leaf = node.as_leaf();
            let mut state = leaf.state.write();
            state.left_sibling = crate::btree::NID_LEAF_START + 7;
            state.right_sibling = NID_NIL;
            for i in 0..6u32 {
                state.buckets.push_back(Record::new(
                    format!("key{:02}", i).into_bytes(),
                    vec![b'v'; 16],
                ));
            }
            let length = state.buckets.length();
            leaf.bytes.store(length, Ordering::Relaxed);
        }
        node
    }

    #[test]
    fn serialization_round_trips_fully_loaded() {
        let node = sample_leaf();
        let guard = node.lock_write();
        let (block, skeleton) = node.serialize(&guard).unwrap();
        drop(guard);
        assert!((skeleton as usize) < block.size());

        let copy = CachedNode::new_leaf(
            "t".into(),
            crate::btree::NID_LEAF_START + 1,
            test_config(),
            NodeStatus::Unloaded,
        );
        copy.read_from(&block, false).unwrap();

        let leaf = copy.as_leaf();
        let state = leaf.state.read();
        assert_eq!(state.left_sibling, crate::btree::NID_LEAF_START + 7);
        assert_eq!(state.right_sibling, NID_NIL);
        assert_eq!(state.buckets.count(), 6);
        assert!(state.buckets.buckets_number() > 1);
        assert!(state.buckets.is_fully_loaded());

        let keys: Vec<_> = state.buckets.iter().map(|r| r.key.clone()).collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn skeleton_read_installs_shells() {
        let node = sample_leaf();
        let guard = node.lock_write();
        let (block, _) = node.serialize(&guard).unwrap();
        drop(guard);

        let copy = CachedNode::new_leaf(
            "t".into(),
            crate::btree::NID_LEAF_START + 1,
            test_config(),
            NodeStatus::Unloaded,
        );
        copy.read_from(&block, true).unwrap();
        assert_eq!(copy.meta().status(), NodeStatus::SkeletonLoaded);

        let leaf = copy.as_leaf();
        let state = leaf.state.read();
        assert!(!state.buckets.is_fully_loaded());
        assert_eq!(state.buckets.count(), 0);
        assert_eq!(state.buckets.bucket(0).first_key(), b"key00");
        // The size mirror counts on-disk payload even before loading.
        assert!(leaf.size() > 20);
    }

    #[test]
    fn empty_leaf_serializes() {
        let node = CachedNode::new_leaf(
            "t".into(),
            crate::btree::NID_LEAF_START + 2,
            test_config(),
            NodeStatus::New,
        );
        let guard = node.lock_write();
        let (block, skeleton) = node.serialize(&guard).unwrap();
        drop(guard);
        assert_eq!(skeleton, 20);
        assert_eq!(block.size(), 20);
    }
}
