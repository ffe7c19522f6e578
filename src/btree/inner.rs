//! Inner nodes.
//!
//! An inner node routes keys through its pivots and buffers writes per
//! child. The node latch is held shared for writes (per-buffer latches
//! provide the exclusion) and exclusively only for restructuring, so
//! unrelated children can absorb cascades concurrently.
//!
//! Lock discipline on the hot paths:
//!
//! - writes: node read latch, then one buffer write latch;
//! - cascade into a child: child latch first, then the parent's buffer
//!   latch; the parent's node latch is released crab-walk once the buffer
//!   is drained;
//! - restructuring (`add_pivot`, `split`, `rm_pivot`): write latches held
//!   root-down via the tree's `lock_path`.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::trace;

use crate::bloom::{bloom_matches, bloom_size};
use crate::comparator::Comparator;
use crate::storage::{crc16, Block, BlockReader, BlockWriter};

use super::msg::{Msg, MsgBuf, MsgKind};
use super::node::{decode_section, NodeConfig, NodeMeta, NodeStatus, NodeWriteGuard};
use super::tree::{release_path, LockPath, Tree};
use super::{is_leaf_id, NodeId, NID_NIL};

/// On-disk descriptor of one serialized message buffer, with the bloom
/// filter over its key set.
#[derive(Debug, Clone)]
pub struct BufDesc {
    pub offset: u32,
    pub length: u32,
    pub uncompressed: u32,
    pub crc: u16,
    pub bloom: Vec<u8>,
}

/// A child's message buffer: either live contents or an on-disk shell
/// described by `desc`. The buffer carries its own latch so cascades can
/// pass unrelated siblings.
#[derive(Debug)]
pub struct BufferSlot {
    pub buf: Arc<RwLock<MsgBuf>>,
    pub desc: Option<BufDesc>,
}

impl BufferSlot {
    fn fresh() -> BufferSlot {
        BufferSlot {
            buf: Arc::new(RwLock::new(MsgBuf::new())),
            desc: None,
        }
    }

    fn shell(desc: BufDesc) -> BufferSlot {
        BufferSlot {
            buf: Arc::new(RwLock::new(MsgBuf::unloaded())),
            desc: Some(desc),
        }
    }
}

#[derive(Debug)]
pub struct Pivot {
    pub key: Vec<u8>,
    pub child: AtomicU64,
    pub slot: BufferSlot,
}

#[derive(Debug)]
pub struct InnerState {
    /// True iff children are leaves.
    pub bottom: bool,
    pub first_child: AtomicU64,
    pub first_slot: BufferSlot,
    /// Strictly increasing separator keys; pivot `i` covers
    /// `[pivots[i].key, pivots[i+1].key)`.
    pub pivots: Vec<Pivot>,
}

impl Default for InnerState {
    fn default() -> InnerState {
        InnerState {
            bottom: false,
            first_child: AtomicU64::new(NID_NIL),
            first_slot: BufferSlot::fresh(),
            pivots: Vec::new(),
        }
    }
}

/// Result of a root write attempt.
pub enum WriteOutcome {
    Done,
    /// The root moved under us (pileup); retry at the current root.
    Stale(Msg),
}

/// Serialized footprint of one pivot entry in the size estimate: key
/// prefix, key, child id, flag.
fn pivot_size(key: &[u8]) -> usize {
    4 + key.len() + 8 + 1
}

#[derive(Debug)]
pub struct InnerNode {
    meta: Arc<NodeMeta>,
    config: Arc<NodeConfig>,
    pub state: Arc<RwLock<InnerState>>,
    msgcnt: AtomicUsize,
    msgbufsz: AtomicUsize,
    pivots_sz: AtomicUsize,
}

impl InnerNode {
    pub(crate) fn new(meta: Arc<NodeMeta>, config: Arc<NodeConfig>) -> InnerNode {
        InnerNode {
            meta,
            config,
            state: Arc::new(RwLock::new(InnerState::default())),
            msgcnt: AtomicUsize::new(0),
            msgbufsz: AtomicUsize::new(4),
            pivots_sz: AtomicUsize::new(0),
        }
    }

    /// Called on a freshly created root only: a single empty first buffer
    /// over leaf children.
    pub fn init_empty_root(&self) {
        let mut state = self.state.write();
        state.bottom = true;
        state.first_slot = BufferSlot::fresh();
        drop(state);
        self.msgbufsz.store(4, Ordering::Relaxed);
        self.meta.set_dirty(true);
    }

    pub fn msg_count(&self) -> usize {
        self.msgcnt.load(Ordering::Relaxed)
    }

    /// In-memory size estimate driving cascade thresholds and cache
    /// accounting; latch-free.
    pub fn size(&self) -> usize {
        1 + 9 + 4
            + self.pivots_sz.load(Ordering::Relaxed)
            + self.msgbufsz.load(Ordering::Relaxed)
    }

    pub(crate) fn adjust(&self, oldcnt: usize, newcnt: usize, oldsz: usize, newsz: usize) {
        self.msgcnt
            .fetch_add(newcnt.wrapping_sub(oldcnt), Ordering::Relaxed);
        self.msgbufsz
            .fetch_add(newsz.wrapping_sub(oldsz), Ordering::Relaxed);
    }

    fn slot<'a>(&self, state: &'a InnerState, idx: usize) -> &'a BufferSlot {
        if idx == 0 {
            &state.first_slot
        } else {
            &state.pivots[idx - 1].slot
        }
    }

    fn child_slot<'a>(&self, state: &'a InnerState, idx: usize) -> &'a AtomicU64 {
        if idx == 0 {
            &state.first_child
        } else {
            &state.pivots[idx - 1].child
        }
    }

    fn child(&self, state: &InnerState, idx: usize) -> NodeId {
        self.child_slot(state, idx).load(Ordering::Acquire)
    }

    /// Buffer index covering `key`: the number of pivots at or below it.
    fn find_pivot(&self, state: &InnerState, key: &[u8], comp: &dyn Comparator) -> usize {
        let n = state.pivots.len();
        // Sequential writes land past the last pivot; check it first.
        if n > 0 && comp.compare(&state.pivots[n - 1].key, key) == CmpOrdering::Less {
            return n;
        }
        state
            .pivots
            .partition_point(|p| comp.compare(&p.key, key) != CmpOrdering::Greater)
    }

    /// Child id for `key` under a caller-held guard; the lock-path descent
    /// uses this for routing.
    pub(crate) fn route(&self, state: &InnerState, key: &[u8], comp: &dyn Comparator) -> NodeId {
        let idx = self.find_pivot(state, key, comp);
        self.child(state, idx)
    }

    /// The write path: buffer the message here, then drain if over
    /// budget. Restarts at the current root when this node was demoted by
    /// a concurrent pileup.
    pub fn write(&self, tree: &Tree, msg: Msg) -> Result<WriteOutcome> {
        let state = self.state.read();
        if tree.root_id() != self.meta.nid {
            return Ok(WriteOutcome::Stale(msg));
        }
        self.ensure_full(tree, &state)?;

        let comp = tree.comparator();
        let idx = self.find_pivot(&state, &msg.key, comp);
        self.write_msgbuf(&state, idx, msg, comp);
        self.meta.set_dirty(true);

        self.maybe_cascade(tree, state)?;
        Ok(WriteOutcome::Done)
    }

    fn write_msgbuf(&self, state: &InnerState, idx: usize, msg: Msg, comp: &dyn Comparator) {
        let slot = self.slot(state, idx);
        let mut buf = slot.buf.write();
        let (oldcnt, oldsz) = (buf.count(), buf.size());
        buf.write(msg, comp);
        self.adjust(oldcnt, buf.count(), oldsz, buf.size());
    }

    fn append_run(&self, state: &InnerState, idx: usize, msgs: Vec<Msg>, comp: &dyn Comparator) {
        let slot = self.slot(state, idx);
        let mut buf = slot.buf.write();
        let (oldcnt, oldsz) = (buf.count(), buf.size());
        buf.append(msgs, comp);
        self.adjust(oldcnt, buf.count(), oldsz, buf.size());
    }

    /// Index of the fullest buffer, by message count or byte size.
    fn find_fullest(&self, state: &InnerState, by_count: bool) -> usize {
        let mut best = 0;
        let mut best_val = {
            let b = state.first_slot.buf.read();
            if by_count {
                b.count()
            } else {
                b.size()
            }
        };
        for (i, pivot) in state.pivots.iter().enumerate() {
            let b = pivot.slot.buf.read();
            let val = if by_count { b.count() } else { b.size() };
            if val > best_val {
                best_val = val;
                best = i + 1;
            }
        }
        best
    }

    /// Drains the fullest buffer into its child while either threshold is
    /// exceeded. Consumes the node's read guard.
    fn maybe_cascade(&self, tree: &Tree, state: RwLockReadGuard<'_, InnerState>) -> Result<()> {
        // With nothing buffered there is nothing to drain, however large
        // the pivot table has grown.
        let has_msgs = self.msgcnt.load(Ordering::Relaxed) > 0;
        let over_count = self.msgcnt.load(Ordering::Relaxed) >= tree.opts().msg_count_limit();
        let over_size = self.size() >= tree.opts().inner_node_page_size;
        let idx = if has_msgs && over_count {
            self.find_fullest(&state, true)
        } else if has_msgs && over_size {
            self.find_fullest(&state, false)
        } else {
            return Ok(());
        };

        let buf = Arc::clone(&self.slot(&state, idx).buf);
        let child_nid = self.child(&state, idx);
        let child = if child_nid == NID_NIL {
            // Only an empty bottom root has a nil child; materialize the
            // first leaf. Losing the install race retires our candidate.
            debug_assert!(state.bottom);
            let leaf = tree.new_leaf_node()?;
            match self.child_slot(&state, idx).compare_exchange(
                NID_NIL,
                leaf.nid(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.meta.set_dirty(true);
                    leaf
                }
                Err(winner) => {
                    leaf.meta().set_dead();
                    tree.load_node(winner, false)?
                }
            }
        } else {
            tree.load_node(child_nid, false)?
        };

        trace!(nid = self.meta.nid, child = child.nid(), idx, "cascade");
        child.cascade(tree, &buf, self, state)?;

        // The lock was released in the child; a second drain may already
        // be due.
        let state = self.state.read();
        if self.msgcnt.load(Ordering::Relaxed) > 0
            && (self.msgcnt.load(Ordering::Relaxed) >= tree.opts().msg_count_limit()
                || self.size() >= tree.opts().inner_node_page_size)
        {
            self.maybe_cascade(tree, state)
        } else {
            Ok(())
        }
    }

    /// Receives `buf` from `parent`: partition one sorted sweep of it
    /// across this node's own pivots, then consider draining further.
    pub(crate) fn cascade(
        &self,
        tree: &Tree,
        buf: &Arc<RwLock<MsgBuf>>,
        parent: &InnerNode,
        parent_guard: RwLockReadGuard<'_, InnerState>,
    ) -> Result<()> {
        let state = self.state.read();
        self.ensure_full(tree, &state)?;
        let comp = tree.comparator();

        {
            let mut b = buf.write();
            let (oldcnt, oldsz) = (b.count(), b.size());
            let msgs = b.drain();
            parent.adjust(oldcnt, b.count(), oldsz, b.size());
            drop(b);
            drop(parent_guard);

            // Linear merge: both the drained run and the pivots are
            // sorted, so the target index only moves forward.
            let mut idx = 0usize;
            let mut run: Vec<Msg> = Vec::new();
            for msg in msgs {
                while idx < state.pivots.len()
                    && comp.compare(&state.pivots[idx].key, &msg.key) != CmpOrdering::Greater
                {
                    if !run.is_empty() {
                        self.append_run(&state, idx, std::mem::take(&mut run), comp);
                    }
                    idx += 1;
                }
                run.push(msg);
            }
            if !run.is_empty() {
                self.append_run(&state, idx, run, comp);
            }
        }

        self.meta.set_dirty(true);
        self.maybe_cascade(tree, state)
    }

    /// Point lookup: consult the covering buffer (bloom-gated when it is
    /// still on disk), else descend.
    pub(crate) fn find(
        &self,
        tree: &Tree,
        key: &[u8],
        parent_guard: Option<RwLockReadGuard<'_, InnerState>>,
    ) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        drop(parent_guard); // lock coupling: at most two latches held

        let comp = tree.comparator();
        let idx = self.find_pivot(&state, key, comp);
        let slot = self.slot(&state, idx);

        {
            let b = slot.buf.read();
            if b.is_loaded() {
                if let Some(msg) = b.get(key, comp) {
                    return Ok(match msg.kind {
                        MsgKind::Put => Some(msg.value.clone()),
                        MsgKind::Del => None,
                    });
                }
            } else {
                let maybe = slot
                    .desc
                    .as_ref()
                    .map_or(true, |d| bloom_matches(key, &d.bloom));
                drop(b);
                if maybe {
                    self.load_msgbuf(tree, &state, idx)?;
                    let b = slot.buf.read();
                    if let Some(msg) = b.get(key, comp) {
                        return Ok(match msg.kind {
                            MsgKind::Put => Some(msg.value.clone()),
                            MsgKind::Del => None,
                        });
                    }
                }
            }
        }

        let child_nid = self.child(&state, idx);
        if child_nid == NID_NIL {
            // Only the first child of an empty bottom root can be nil.
            debug_assert_eq!(idx, 0);
            return Ok(None);
        }
        let child = tree.load_node(child_nid, true)?;
        child.find(tree, key, Some(state))
    }

    /// Reads one on-disk buffer into its shell. The install happens under
    /// the buffer's own write latch; a racing loader is detected by the
    /// loaded flag after the latch is held.
    fn load_msgbuf(&self, tree: &Tree, state: &InnerState, idx: usize) -> Result<()> {
        let slot = self.slot(state, idx);
        {
            let b = slot.buf.read();
            if b.is_loaded() {
                return Ok(());
            }
        }

        let mut b = slot.buf.write();
        if b.is_loaded() {
            return Ok(());
        }
        let desc = slot
            .desc
            .as_ref()
            .expect("an unloaded buffer always has a descriptor");

        let block = tree.layout().read_range(self.meta.nid, desc.offset, desc.length)?;
        let payload = decode_section(&self.config, block.bytes(), desc.uncompressed, desc.crc)?;

        let (oldcnt, oldsz) = (b.count(), b.size());
        b.decode(&payload)?;
        self.adjust(oldcnt, b.count(), oldsz, b.size());
        trace!(nid = self.meta.nid, idx, count = b.count(), "buffer loaded");
        Ok(())
    }

    /// Promotes a skeleton-loaded node: every buffer shell is filled, so
    /// mutations see the complete message set.
    pub(crate) fn ensure_full(&self, tree: &Tree, state: &InnerState) -> Result<()> {
        if self.meta.status() != NodeStatus::SkeletonLoaded {
            return Ok(());
        }
        for idx in 0..=state.pivots.len() {
            self.load_msgbuf(tree, state, idx)?;
        }
        self.meta.set_status(NodeStatus::FullLoaded);
        Ok(())
    }

    /// Serializes under the caller-held write guard: skeleton first in
    /// layout, written last so the buffer descriptors it carries are
    /// final.
    pub(crate) fn serialize(&self, state: &InnerState) -> Result<(Block, u32)> {
        let first = state.first_slot.buf.read();
        let pivot_bufs: Vec<_> = state.pivots.iter().map(|p| p.slot.buf.read()).collect();
        ensure!(
            first.is_loaded() && pivot_bufs.iter().all(|b| b.is_loaded()),
            "cannot serialize node {:#x} with unloaded buffers",
            self.meta.nid
        );

        let mut skeleton = 1 + 4 + (8 + 14) + (4 + bloom_size(first.count()));
        for (pivot, buf) in state.pivots.iter().zip(&pivot_bufs) {
            skeleton += 4 + pivot.key.len() + 8 + 14 + 4 + bloom_size(buf.count());
        }

        let mut estimate = skeleton;
        for buf in std::iter::once(&first).chain(pivot_bufs.iter()) {
            estimate += match &self.config.compressor {
                Some(c) => c.max_compressed_len(buf.size()),
                None => buf.size(),
            };
        }

        let mut block = Block::with_capacity(estimate)?;
        let mut descs: Vec<(u32, u32, u32, u16)> = Vec::with_capacity(1 + pivot_bufs.len());
        {
            let mut w = BlockWriter::new(&mut block);
            w.seek(skeleton);
            for buf in std::iter::once(&first).chain(pivot_bufs.iter()) {
                let mut payload = buf.encode();
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
                descs.push((offset, payload.len() as u32, uncompressed, crc));
            }

            w.seek(0);
            w.write_bool(state.bottom)?;
            w.write_u32(state.pivots.len() as u32)?;
            let (off, len, unc, crc) = descs[0];
            w.write_u64(state.first_child.load(Ordering::Acquire))?;
            w.write_u32(off)?;
            w.write_u32(len)?;
            w.write_u32(unc)?;
            w.write_u16(crc)?;
            w.write_slice(&first.get_filter())?;
            for (i, pivot) in state.pivots.iter().enumerate() {
                let (off, len, unc, crc) = descs[i + 1];
                w.write_slice(&pivot.key)?;
                w.write_u64(pivot.child.load(Ordering::Acquire))?;
                w.write_u32(off)?;
                w.write_u32(len)?;
                w.write_u32(unc)?;
                w.write_u16(crc)?;
                w.write_slice(&pivot_bufs[i].get_filter())?;
            }
            debug_assert_eq!(w.pos(), skeleton);
        }
        Ok((block, skeleton as u32))
    }

    pub(crate) fn read_from(&self, block: &Block, skeleton_only: bool) -> Result<()> {
        let mut state = self.state.write();
        let mut r = BlockReader::new(block);

        state.bottom = r.read_bool()?;
        let n = r.read_u32()? as usize;

        let first_child = r.read_u64()?;
        let first_desc = BufDesc {
            offset: r.read_u32()?,
            length: r.read_u32()?,
            uncompressed: r.read_u32()?,
            crc: r.read_u16()?,
            bloom: r.read_slice()?,
        };
        state.first_child.store(first_child, Ordering::Release);
        state.first_slot = BufferSlot::shell(first_desc);

        let mut pivots = Vec::with_capacity(n);
        let mut pivots_sz = 0usize;
        for _ in 0..n {
            let key = r.read_slice()?;
            let child = r.read_u64()?;
            let desc = BufDesc {
                offset: r.read_u32()?,
                length: r.read_u32()?,
                uncompressed: r.read_u32()?,
                crc: r.read_u16()?,
                bloom: r.read_slice()?,
            };
            pivots_sz += pivot_size(&key);
            pivots.push(Pivot {
                key,
                child: AtomicU64::new(child),
                slot: BufferSlot::shell(desc),
            });
        }
        state.pivots = pivots;

        self.pivots_sz.store(pivots_sz, Ordering::Relaxed);
        self.msgcnt.store(0, Ordering::Relaxed);
        self.msgbufsz.store(4 * (n + 1), Ordering::Relaxed);

        if !skeleton_only {
            for idx in 0..=n {
                let slot = self.slot(&state, idx);
                let desc = slot.desc.as_ref().unwrap();
                let stored = block.window(desc.offset as usize, desc.length as usize);
                let payload = decode_section(&self.config, stored, desc.uncompressed, desc.crc)?;
                let mut b = slot.buf.write();
                let (oldcnt, oldsz) = (b.count(), b.size());
                b.decode(&payload)?;
                self.adjust(oldcnt, b.count(), oldsz, b.size());
            }
        }
        Ok(())
    }
}

/// Inserts a separator into the inner node at the top of `path`, splitting
/// upward as fanout bounds are exceeded. Locks along the non-splitting
/// side are released here.
pub(crate) fn add_pivot(
    tree: &Tree,
    path: &mut LockPath,
    key: Vec<u8>,
    child_nid: NodeId,
) -> Result<()> {
    let entry = path
        .last_mut()
        .expect("pivot insertion needs a locked parent");
    let inner = entry.node.as_inner();
    let NodeWriteGuard::Inner(state) = &mut entry.guard else {
        panic!("pivot insertion into a non-inner node");
    };

    let comp = tree.comparator();
    let pos = state
        .pivots
        .partition_point(|p| comp.compare(&p.key, &key) == CmpOrdering::Less);
    assert!(
        pos == state.pivots.len() || comp.compare(&state.pivots[pos].key, &key) != CmpOrdering::Equal,
        "duplicate separator key"
    );

    inner.msgbufsz.fetch_add(4, Ordering::Relaxed);
    inner.pivots_sz.fetch_add(pivot_size(&key), Ordering::Relaxed);
    state.pivots.insert(
        pos,
        Pivot {
            key,
            child: AtomicU64::new(child_nid),
            slot: BufferSlot::fresh(),
        },
    );
    entry.node.meta().set_dirty(true);

    if state.pivots.len() + 1 > tree.opts().inner_node_children_number {
        split_inner(tree, path)
    } else {
        release_path(path);
        Ok(())
    }
}

/// Splits the inner node at the top of `path` around its median pivot,
/// transferring the median's buffer to the new right sibling and promoting
/// its key. A split of the root piles up a fresh root above both halves.
fn split_inner(tree: &Tree, path: &mut LockPath) -> Result<()> {
    let mut entry = path.pop().expect("split without a locked node");
    let inner = entry.node.as_inner();
    let NodeWriteGuard::Inner(state) = &mut entry.guard else {
        panic!("inner split of a non-inner node");
    };
    debug_assert!(state.pivots.len() > 1);

    let at = state.pivots.len() / 2;
    let mut moved = state.pivots.split_off(at);
    let promoted = moved.remove(0);
    let promoted_pivot_size = pivot_size(&promoted.key);

    let right = tree.new_inner_node()?;
    let right_inner = right.as_inner();
    {
        let mut rstate = right_inner.state.write();
        rstate.bottom = is_leaf_id(promoted.child.load(Ordering::Acquire));
        rstate
            .first_child
            .store(promoted.child.load(Ordering::Acquire), Ordering::Release);
        rstate.first_slot = promoted.slot;
        rstate.pivots = moved;

        let mut moved_cnt = 0usize;
        let mut moved_sz = 0usize;
        let mut moved_pivots_sz = 0usize;
        {
            let b = rstate.first_slot.buf.read();
            moved_cnt += b.count();
            moved_sz += b.size();
        }
        for pivot in &rstate.pivots {
            moved_pivots_sz += pivot_size(&pivot.key);
            let b = pivot.slot.buf.read();
            moved_cnt += b.count();
            moved_sz += b.size();
        }
        right_inner.msgcnt.store(moved_cnt, Ordering::Relaxed);
        right_inner.msgbufsz.store(moved_sz, Ordering::Relaxed);
        right_inner.pivots_sz.store(moved_pivots_sz, Ordering::Relaxed);
        inner.msgcnt.fetch_sub(moved_cnt, Ordering::Relaxed);
        inner.msgbufsz.fetch_sub(moved_sz, Ordering::Relaxed);
        inner
            .pivots_sz
            .fetch_sub(moved_pivots_sz + promoted_pivot_size, Ordering::Relaxed);
    }

    entry.node.meta().set_dirty(true);
    right.meta().set_dirty(true);
    trace!(
        nid = entry.node.nid(),
        right = right.nid(),
        "inner node split"
    );

    let old_nid = entry.node.nid();
    drop(entry);

    if path.is_empty() {
        // The split node was the root.
        let new_root = tree.new_inner_node()?;
        let root_inner = new_root.as_inner();
        {
            let mut ns = root_inner.state.write();
            ns.bottom = false;
            ns.first_child.store(old_nid, Ordering::Release);
            ns.first_slot = BufferSlot::fresh();
            ns.pivots = vec![Pivot {
                key: promoted.key,
                child: AtomicU64::new(right.nid()),
                slot: BufferSlot::fresh(),
            }];
            root_inner
                .pivots_sz
                .store(pivot_size(&ns.pivots[0].key), Ordering::Relaxed);
        }
        root_inner.msgbufsz.store(8, Ordering::Relaxed);
        new_root.meta().set_dirty(true);
        tree.pileup(new_root);
        Ok(())
    } else {
        add_pivot(tree, path, promoted.key, right.nid())
    }
}

/// Drops the pivot referencing a merged-away child from the inner node at
/// the top of `path`. An inner node that loses its last child dies and
/// propagates; at the root this collapses the tree.
pub(crate) fn rm_pivot(tree: &Tree, path: &mut LockPath, child_nid: NodeId) -> Result<()> {
    let entry = path.last_mut().expect("pivot removal needs a locked parent");
    let inner = entry.node.as_inner();
    let NodeWriteGuard::Inner(state) = &mut entry.guard else {
        panic!("pivot removal from a non-inner node");
    };

    if state.first_child.load(Ordering::Acquire) == child_nid {
        {
            let b = state.first_slot.buf.read();
            assert_eq!(b.count(), 0, "removing a child with undelivered messages");
            inner.msgbufsz.fetch_sub(b.size(), Ordering::Relaxed);
        }

        if state.pivots.is_empty() {
            // Last child gone: this node dies too.
            entry.node.meta().set_dead();
            let entry = path.pop().unwrap();
            let nid = entry.node.nid();
            drop(entry);
            return if path.is_empty() {
                tree.collapse()
            } else {
                rm_pivot(tree, path, nid)
            };
        }

        let first = state.pivots.remove(0);
        inner
            .pivots_sz
            .fetch_sub(pivot_size(&first.key), Ordering::Relaxed);
        state
            .first_child
            .store(first.child.load(Ordering::Acquire), Ordering::Release);
        state.first_slot = first.slot;
    } else {
        let pos = state
            .pivots
            .iter()
            .position(|p| p.child.load(Ordering::Acquire) == child_nid)
            .expect("no pivot references the removed child");
        {
            let b = state.pivots[pos].slot.buf.read();
            assert_eq!(b.count(), 0, "removing a child with undelivered messages");
            inner.msgbufsz.fetch_sub(b.size(), Ordering::Relaxed);
        }
        inner
            .pivots_sz
            .fetch_sub(pivot_size(&state.pivots[pos].key), Ordering::Relaxed);
        state.pivots.remove(pos);
    }

    entry.node.meta().set_dirty(true);
    release_path(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::node::{CachedNode, NodeStatus};

    fn test_config() -> Arc<NodeConfig> {
        Arc::new(NodeConfig {
            check_crc: true,
            compressor: None,
            bucket_length: 4096,
        })
    }

    fn sample_inner() -> Arc<CachedNode> {
        let node = CachedNode::new_inner("t".into(), 2, test_config(), NodeStatus::New);
        {
            let inner = node.as_inner();
            let mut state = inner.state.write();
            state.bottom = true;
            state.first_child.store(crate::btree::NID_LEAF_START + 1, Ordering::Release);
            {
                let mut b = state.first_slot.buf.write();
                b.write(Msg::put(b"aa".to_vec(), b"1".to_vec()), &crate::comparator::LexicalComparator);
            }
            state.pivots.push(Pivot {
                key: b"mm".to_vec(),
                child: AtomicU64::new(crate::btree::NID_LEAF_START + 2),
                slot: BufferSlot::fresh(),
            });
            {
                let mut b = state.pivots[0].slot.buf.write();
                b.write(Msg::del(b"zz".to_vec()), &crate::comparator::LexicalComparator);
            }
        }
        node
    }

    #[test]
    fn serialization_round_trips_fully_loaded() {
        let node = sample_inner();
        let guard = node.lock_write();
        let (block, skeleton) = node.serialize(&guard).unwrap();
        drop(guard);
        assert!(skeleton > 0 && (skeleton as usize) < block.size());

        let copy = CachedNode::new_inner("t".into(), 2, test_config(), NodeStatus::Unloaded);
        copy.read_from(&block, false).unwrap();
        assert_eq!(copy.meta().status(), NodeStatus::FullLoaded);

        let inner = copy.as_inner();
        let state = inner.state.read();
        assert!(state.bottom);
        assert_eq!(state.pivots.len(), 1);
        assert_eq!(state.pivots[0].key, b"mm".to_vec());
        assert_eq!(
            state.first_child.load(Ordering::Acquire),
            crate::btree::NID_LEAF_START + 1
        );

        let comp = crate::comparator::LexicalComparator;
        let first = state.first_slot.buf.read();
        assert!(first.is_loaded());
        assert_eq!(first.get(b"aa", &comp).unwrap().value, b"1");
        let second = state.pivots[0].slot.buf.read();
        assert_eq!(second.get(b"zz", &comp).unwrap().kind, MsgKind::Del);
    }

    #[test]
    fn skeleton_read_leaves_shells_with_blooms() {
        let node = sample_inner();
        let guard = node.lock_write();
        let (block, _) = node.serialize(&guard).unwrap();
        drop(guard);

        let copy = CachedNode::new_inner("t".into(), 2, test_config(), NodeStatus::Unloaded);
        copy.read_from(&block, true).unwrap();
        assert_eq!(copy.meta().status(), NodeStatus::SkeletonLoaded);

        let inner = copy.as_inner();
        let state = inner.state.read();
        assert!(!state.first_slot.buf.read().is_loaded());

        // The bloom on the shell covers the keys that were serialized.
        let desc = state.first_slot.desc.as_ref().unwrap();
        assert!(bloom_matches(b"aa", &desc.bloom));
        let desc = state.pivots[0].slot.desc.as_ref().unwrap();
        assert!(bloom_matches(b"zz", &desc.bloom));
    }

    #[test]
    fn find_pivot_routes_ranges() {
        let node = CachedNode::new_inner("t".into(), 2, test_config(), NodeStatus::New);
        let inner = node.as_inner();
        let comp = crate::comparator::LexicalComparator;
        {
            let mut state = inner.state.write();
            for key in [b"d".to_vec(), b"m".to_vec(), b"t".to_vec()] {
                state.pivots.push(Pivot {
                    key,
                    child: AtomicU64::new(0),
                    slot: BufferSlot::fresh(),
                });
            }
        }

        let state = inner.state.read();
        assert_eq!(inner.find_pivot(&state, b"a", &comp), 0);
        assert_eq!(inner.find_pivot(&state, b"d", &comp), 1);
        assert_eq!(inner.find_pivot(&state, b"k", &comp), 1);
        assert_eq!(inner.find_pivot(&state, b"m", &comp), 2);
        assert_eq!(inner.find_pivot(&state, b"z", &comp), 3);
    }

    #[test]
    fn size_tracks_buffered_bytes() {
        let node = CachedNode::new_inner("t".into(), 2, test_config(), NodeStatus::New);
        let inner = node.as_inner();
        let before = inner.size();

        let comp = crate::comparator::LexicalComparator;
        let state = inner.state.read();
        let msg = Msg::put(b"key".to_vec(), b"value".to_vec());
        let msg_size = msg.size();
        inner.write_msgbuf(&state, 0, msg, &comp);

        assert_eq!(inner.size(), before + msg_size);
        assert_eq!(inner.msg_count(), 1);
    }
}
