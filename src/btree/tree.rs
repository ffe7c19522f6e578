//! The tree: root ownership, id allocation, and path locking.
//!
//! The tree holds permanent references to the schema node and the current
//! root, routes every operation through the root, and is the only party
//! that allocates node ids or swaps the root pointer (*pileup* on root
//! split, *collapse* when the root dies).
//!
//! Nodes never point back at the tree; tree operations pass `&Tree` down
//! explicitly, so ownership stays acyclic: the cache owns nodes, the tree
//! owns the root and schema handles.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, eyre, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;
use tracing::{info, trace};

use crate::cache::{Cache, NodeFactory};
use crate::comparator::Comparator;
use crate::compress::Compressor;
use crate::config::Options;
use crate::storage::Layout;

use super::msg::Msg;
use super::node::{CachedNode, NodeConfig, NodeStatus, NodeWriteGuard};
use super::{is_leaf_id, NodeId, NID_LEAF_START, NID_NIL, NID_SCHEMA, NID_START};

/// One write-locked node on a root→leaf path. The pin taken by
/// `lock_path` is returned when the entry drops, so early exits and error
/// paths cannot leak pins.
pub struct PathEntry {
    pub node: Arc<CachedNode>,
    pub guard: NodeWriteGuard,
}

impl Drop for PathEntry {
    fn drop(&mut self) {
        self.node.meta().dec_pin();
    }
}

/// Root→leaf lock chains are as deep as the tree, which is shallow.
pub type LockPath = SmallVec<[PathEntry; 8]>;

/// Unlocks and unpins a path bottom-up.
pub fn release_path(path: &mut LockPath) {
    while path.pop().is_some() {}
}

/// Builds nodes for the cache's read-through loader.
pub struct TreeNodeFactory {
    table: Arc<str>,
    config: Arc<NodeConfig>,
}

impl TreeNodeFactory {
    pub fn new(table: &str, config: Arc<NodeConfig>) -> TreeNodeFactory {
        TreeNodeFactory {
            table: Arc::from(table),
            config,
        }
    }
}

impl NodeFactory for TreeNodeFactory {
    fn new_node(&self, nid: NodeId) -> Arc<CachedNode> {
        if nid == NID_SCHEMA {
            CachedNode::new_schema(Arc::clone(&self.table), NodeStatus::Unloaded)
        } else if is_leaf_id(nid) {
            CachedNode::new_leaf(
                Arc::clone(&self.table),
                nid,
                Arc::clone(&self.config),
                NodeStatus::Unloaded,
            )
        } else {
            CachedNode::new_inner(
                Arc::clone(&self.table),
                nid,
                Arc::clone(&self.config),
                NodeStatus::Unloaded,
            )
        }
    }
}

pub struct Tree {
    table: Arc<str>,
    opts: Options,
    config: Arc<NodeConfig>,
    cache: Arc<Cache>,
    layout: Arc<Layout>,
    schema: Arc<CachedNode>,
    root: RwLock<Arc<CachedNode>>,
    root_id: AtomicU64,
}

impl Tree {
    /// Registers the table with the cache, loads or creates the schema
    /// node, and loads or creates the root.
    pub fn open(
        table: &str,
        opts: Options,
        cache: Arc<Cache>,
        layout: Arc<Layout>,
    ) -> Result<Arc<Tree>> {
        let table: Arc<str> = Arc::from(table);
        let config = Arc::new(NodeConfig {
            check_crc: opts.check_crc,
            compressor: Compressor::from_options(opts.compress),
            bucket_length: opts.leaf_node_bucket_size,
        });

        let factory = Arc::new(TreeNodeFactory {
            table: Arc::clone(&table),
            config: Arc::clone(&config),
        });
        cache.add_table(&table, factory, Arc::clone(&layout))?;

        let schema = match cache.get(&table, NID_SCHEMA, false)? {
            Some(node) => node,
            None => {
                info!(table = &*table, "no schema node, initializing empty tree");
                let node = CachedNode::new_schema(Arc::clone(&table), NodeStatus::New);
                {
                    let mut state = node.as_schema().state.write();
                    state.root_id = NID_NIL;
                    state.next_inner_id = NID_START;
                    state.next_leaf_id = NID_LEAF_START;
                    state.tree_depth = 2;
                }
                node.meta().set_dirty(true);
                cache.put(&table, NID_SCHEMA, Arc::clone(&node))?;
                node
            }
        };

        let root_nid = schema.as_schema().state.read().root_id;
        let root = if root_nid == NID_NIL {
            let nid = {
                let mut state = schema.as_schema().state.write();
                let nid = state.next_inner_id;
                state.next_inner_id += 1;
                state.root_id = nid;
                nid
            };
            schema.meta().set_dirty(true);

            let node = CachedNode::new_inner(
                Arc::clone(&table),
                nid,
                Arc::clone(&config),
                NodeStatus::New,
            );
            node.as_inner().init_empty_root();
            cache.put(&table, nid, Arc::clone(&node))?;
            node
        } else {
            info!(table = &*table, root = root_nid, "loading root node");
            cache
                .get(&table, root_nid, false)?
                .ok_or_else(|| eyre!("root node {:#x} has no block", root_nid))?
        };
        ensure!(root.is_inner(), "root node {:#x} is not inner", root.nid());

        Ok(Arc::new(Tree {
            root_id: AtomicU64::new(root.nid()),
            root: RwLock::new(root),
            table,
            opts,
            config,
            cache,
            layout,
            schema,
        }))
    }

    pub fn opts(&self) -> &Options {
        &self.opts
    }

    pub fn comparator(&self) -> &dyn Comparator {
        &*self.opts.comparator
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id.load(Ordering::Acquire)
    }

    fn current_root(&self) -> Arc<CachedNode> {
        Arc::clone(&self.root.read())
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write(Msg::put(key.to_vec(), value.to_vec()))
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.write(Msg::del(key.to_vec()))
    }

    fn write(&self, mut msg: Msg) -> Result<()> {
        loop {
            let root = self.current_root();
            match root.as_inner().write(self, msg)? {
                super::inner::WriteOutcome::Done => return Ok(()),
                super::inner::WriteOutcome::Stale(back) => {
                    trace!("root moved during write, retrying");
                    msg = back;
                }
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        // No retry needed: the reference keeps a demoted root alive and
        // correct for the whole descent.
        let root = self.current_root();
        root.find(self, key, None)
    }

    /// Allocates an id under the schema latch and registers a fresh inner
    /// node with the cache.
    pub fn new_inner_node(&self) -> Result<Arc<CachedNode>> {
        let nid = {
            let mut state = self.schema.as_schema().state.write();
            let nid = state.next_inner_id;
            state.next_inner_id += 1;
            nid
        };
        self.schema.meta().set_dirty(true);

        let node = CachedNode::new_inner(
            Arc::clone(&self.table),
            nid,
            Arc::clone(&self.config),
            NodeStatus::New,
        );
        self.cache.put(&self.table, nid, Arc::clone(&node))?;
        Ok(node)
    }

    pub fn new_leaf_node(&self) -> Result<Arc<CachedNode>> {
        let nid = {
            let mut state = self.schema.as_schema().state.write();
            let nid = state.next_leaf_id;
            state.next_leaf_id += 1;
            nid
        };
        self.schema.meta().set_dirty(true);

        let node = CachedNode::new_leaf(
            Arc::clone(&self.table),
            nid,
            Arc::clone(&self.config),
            NodeStatus::New,
        );
        self.cache.put(&self.table, nid, Arc::clone(&node))?;
        Ok(node)
    }

    /// Fetches a node through the cache's read-through loader.
    pub fn load_node(&self, nid: NodeId, skeleton_only: bool) -> Result<Arc<CachedNode>> {
        debug_assert!(nid != NID_NIL && nid != NID_SCHEMA);
        self.cache
            .get(&self.table, nid, skeleton_only)?
            .ok_or_else(|| eyre!("node {:#x} has no block", nid))
    }

    /// Installs the new root created by a root split.
    pub fn pileup(&self, new_root: Arc<CachedNode>) {
        let nid = new_root.nid();
        trace!(root = nid, "pileup");
        {
            let mut root = self.root.write();
            debug_assert!(root.nid() != nid);
            *root = new_root;
        }
        self.root_id.store(nid, Ordering::Release);

        {
            let mut state = self.schema.as_schema().state.write();
            state.root_id = nid;
            state.tree_depth += 1;
        }
        self.schema.meta().set_dirty(true);
    }

    /// Replaces a dead root with a fresh empty one.
    pub fn collapse(&self) -> Result<()> {
        let node = self.new_inner_node()?;
        node.as_inner().init_empty_root();
        let nid = node.nid();
        trace!(root = nid, "collapse");

        {
            let mut root = self.root.write();
            *root = node;
        }
        self.root_id.store(nid, Ordering::Release);

        {
            let mut state = self.schema.as_schema().state.write();
            state.root_id = nid;
            state.tree_depth = 2;
        }
        self.schema.meta().set_dirty(true);
        Ok(())
    }

    /// Write-locks and pins the root→leaf path covering `key`, top-down,
    /// for an atomic rebalance. On failure every acquired lock is
    /// released.
    pub fn lock_path(&self, key: &[u8]) -> Result<LockPath> {
        let mut path = LockPath::new();
        let root = self.current_root();
        root.meta().inc_pin();
        let guard = root.lock_write();
        path.push(PathEntry { node: root, guard });

        loop {
            let routed = {
                let entry = path.last().unwrap();
                match &entry.guard {
                    NodeWriteGuard::Inner(state) => {
                        let inner = entry.node.as_inner();
                        // Rebalancing mutates pivots and serializes the
                        // result; promote skeletons before touching them.
                        inner
                            .ensure_full(self, state)
                            .map(|()| inner.route(state, key, self.comparator()))
                    }
                    _ => break,
                }
            };
            let child_nid = match routed {
                Ok(nid) => nid,
                Err(e) => {
                    release_path(&mut path);
                    return Err(e);
                }
            };
            if child_nid == NID_NIL {
                break;
            }

            let child = match self.load_node(child_nid, false) {
                Ok(child) => child,
                Err(e) => {
                    release_path(&mut path);
                    return Err(e);
                }
            };
            child.meta().inc_pin();
            let guard = child.lock_write();
            let reached_leaf = matches!(guard, NodeWriteGuard::Leaf(_));
            path.push(PathEntry { node: child, guard });
            if reached_leaf {
                break;
            }
        }
        Ok(path)
    }
}
