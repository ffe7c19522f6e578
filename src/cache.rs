//! # Node Cache
//!
//! Registry of every live node, the read-through loader, and the
//! write-back machinery.
//!
//! ## Ownership
//!
//! The cache's map holds the owning reference to each node; everything
//! else (the tree's root/schema handles, in-flight operations) holds
//! counted clones. "No outside references" is therefore a strong-count of
//! one, checked under the map's write lock, where no new clone can be
//! handed out.
//!
//! ## Write-back
//!
//! One flusher thread per cache instance ticks every
//! `cache_writeback_interval`:
//!
//! 1. rebuild the observed total size from a latch-free scan;
//! 2. write back *expired* dirty nodes (dirty longer than
//!    `cache_dirty_expire`), oldest first, up to the per-tick byte goal
//!    `cache_limit × cache_writeback_ratio / 100`;
//! 3. if dirty bytes still exceed `cache_dirty_high_watermark`, keep
//!    going with all unflushed dirty nodes in first-write order;
//! 4. if the observed size exceeds `cache_evict_high_watermark`, evict
//!    clean nodes in LRU order and reap dead ones, freeing their blocks.
//!
//! A node's `flushing` flag guarantees at most one write in flight per
//! node; the completion callback clears it and drops the serialization
//! block. A failed write re-marks the node dirty so the next tick
//! retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, trace, warn};

use crate::btree::{now_micros, CachedNode, NodeId, NodeWriteGuard};
use crate::config::Options;
use crate::storage::Layout;

/// Builds an empty node of the right kind for deserialization.
pub trait NodeFactory: Send + Sync {
    fn new_node(&self, nid: NodeId) -> Arc<CachedNode>;
}

#[derive(Clone)]
struct TableEntry {
    factory: Arc<dyn NodeFactory>,
    layout: Arc<Layout>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    table: Arc<str>,
    nid: NodeId,
}

struct CachePolicy {
    limit: usize,
    dirty_high_watermark: usize,
    dirty_expire_us: u64,
    writeback_ratio: usize,
    writeback_interval: Duration,
    evict_ratio: usize,
    evict_high_watermark: usize,
}

pub struct Cache {
    policy: CachePolicy,
    tables: RwLock<HashMap<Arc<str>, TableEntry>>,
    nodes: RwLock<HashMap<CacheKey, Arc<CachedNode>>>,
    observed: Mutex<usize>,
    alive: AtomicBool,
    signal: Arc<(Mutex<bool>, Condvar)>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl Cache {
    pub fn new(opts: &Options) -> Arc<Cache> {
        let cache = Arc::new(Cache {
            policy: CachePolicy {
                limit: opts.cache_limit,
                dirty_high_watermark: opts.cache_dirty_high_watermark,
                dirty_expire_us: opts.cache_dirty_expire_ms * 1000,
                writeback_ratio: opts.cache_writeback_ratio,
                writeback_interval: Duration::from_millis(opts.cache_writeback_interval_ms),
                evict_ratio: opts.cache_evict_ratio,
                evict_high_watermark: opts.cache_evict_high_watermark,
            },
            tables: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            observed: Mutex::new(0),
            alive: AtomicBool::new(true),
            signal: Arc::new((Mutex::new(false), Condvar::new())),
            flusher: Mutex::new(None),
        });

        let weak = Arc::downgrade(&cache);
        let signal = Arc::clone(&cache.signal);
        let interval = cache.policy.writeback_interval;
        let handle = std::thread::Builder::new()
            .name("sluicedb-flusher".into())
            .spawn(move || loop {
                {
                    let Some(cache) = weak.upgrade() else { break };
                    if !cache.alive.load(Ordering::Acquire) {
                        break;
                    }
                    cache.tick();
                }
                let (stop_lock, cv) = &*signal;
                let mut stop = stop_lock.lock();
                if *stop {
                    break;
                }
                let _ = cv.wait_for(&mut stop, interval);
                if *stop {
                    break;
                }
            })
            .expect("cannot spawn flusher thread");
        *cache.flusher.lock() = Some(handle);
        cache
    }

    /// Stops and joins the flusher thread. Idempotent.
    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::Release);
        {
            let (stop_lock, cv) = &*self.signal;
            *stop_lock.lock() = true;
            cv.notify_all();
        }
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn add_table(
        &self,
        table: &str,
        factory: Arc<dyn NodeFactory>,
        layout: Arc<Layout>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        ensure!(
            !tables.contains_key(table),
            "table {:?} already registered",
            table
        );
        tables.insert(Arc::from(table), TableEntry { factory, layout });
        Ok(())
    }

    /// Drops a table's registration and every cached node, optionally
    /// flushing first.
    pub fn del_table(&self, table: &str, flush: bool) -> Result<()> {
        if flush {
            self.flush_table(table)?;
        }

        if self.tables.write().remove(table).is_none() {
            return Ok(());
        }

        let mut nodes = self.nodes.write();
        let before = nodes.len();
        nodes.retain(|key, _| &*key.table != table);
        debug!(table, released = before - nodes.len(), "table dropped");
        Ok(())
    }

    fn table_entry(&self, table: &str) -> Result<TableEntry> {
        match self.tables.read().get(table) {
            Some(entry) => Ok(entry.clone()),
            None => bail!("table {:?} is not registered", table),
        }
    }

    /// Inserts a freshly created node. The caller keeps its own handle.
    pub fn put(&self, table: &str, nid: NodeId, node: Arc<CachedNode>) -> Result<()> {
        self.table_entry(table)?;
        while self.must_evict() {
            if self.evict() == 0 {
                // Everything left is pinned, dirty, or referenced; caps
                // are advisory rather than deadlock-worthy.
                break;
            }
        }

        let key = CacheKey {
            table: Arc::from(table),
            nid,
        };
        let size = node.size();
        node.meta().touch();
        let prev = self.nodes.write().insert(key, node);
        assert!(prev.is_none(), "node {:#x} is already cached", nid);
        *self.observed.lock() += size;
        Ok(())
    }

    /// Returns the cached node, or loads it through the layout.
    /// `Ok(None)` means the id has no on-disk block.
    pub fn get(
        &self,
        table: &str,
        nid: NodeId,
        skeleton_only: bool,
    ) -> Result<Option<Arc<CachedNode>>> {
        let key = CacheKey {
            table: Arc::from(table),
            nid,
        };

        {
            let nodes = self.nodes.read();
            if let Some(node) = nodes.get(&key) {
                node.meta().touch();
                return Ok(Some(Arc::clone(node)));
            }
        }

        while self.must_evict() {
            if self.evict() == 0 {
                break;
            }
        }

        let entry = self.table_entry(table)?;
        let Some(block) = entry.layout.read(nid, skeleton_only)? else {
            return Ok(None);
        };
        let node = entry.factory.new_node(nid);
        node.read_from(&block, skeleton_only)?;

        let mut nodes = self.nodes.write();
        if let Some(existing) = nodes.get(&key) {
            // A peer loader won the race; ours is discarded.
            warn!(nid, "concurrent node load detected");
            existing.meta().touch();
            return Ok(Some(Arc::clone(existing)));
        }
        let size = node.size();
        node.meta().touch();
        nodes.insert(key, Arc::clone(&node));
        drop(nodes);
        *self.observed.lock() += size;
        Ok(Some(node))
    }

    fn must_evict(&self) -> bool {
        *self.observed.lock() >= self.policy.limit
    }

    fn need_evict(&self) -> bool {
        *self.observed.lock() > self.policy.limit * self.policy.evict_high_watermark / 100
    }

    /// Evicts clean LRU nodes up to the per-pass goal and reaps dead
    /// ones. Returns the bytes evicted.
    fn evict(&self) -> usize {
        let mut zombies: Vec<(CacheKey, Arc<CachedNode>)> = Vec::new();
        let mut evicted = 0usize;

        {
            let mut nodes = self.nodes.write();
            let mut total = 0usize;
            let mut clean: Vec<(CacheKey, u64, usize)> = Vec::new();

            for (key, node) in nodes.iter() {
                if node.meta().is_dead() {
                    if Arc::strong_count(node) == 1 {
                        zombies.push((key.clone(), Arc::clone(node)));
                    }
                    continue;
                }
                let size = node.size();
                total += size;

                if Arc::strong_count(node) == 1
                    && !node.meta().is_dirty()
                    && !node.meta().is_flushing()
                    && node.meta().pin() == 0
                {
                    clean.push((key.clone(), node.meta().last_used_at(), size));
                }
            }

            for (key, _) in &zombies {
                nodes.remove(key);
            }

            clean.sort_by_key(|(_, last_used, _)| *last_used);
            let goal = self.policy.limit * self.policy.evict_ratio / 100;
            for (key, _, size) in clean {
                if evicted >= goal {
                    break;
                }
                nodes.remove(&key);
                evicted += size;
            }

            *self.observed.lock() = total.saturating_sub(evicted);
        }

        // Free zombie blocks outside the map lock.
        let reaped = zombies.len();
        for (key, node) in zombies {
            if let Ok(entry) = self.table_entry(&key.table) {
                entry.layout.delete_block(node.nid());
            }
        }
        if evicted > 0 || reaped > 0 {
            debug!(evicted, reaped, "cache eviction pass");
        }
        evicted
    }

    /// Writes back every flushable dirty node of `table`, reaps its dead
    /// nodes, and flushes the layout metadata. Blocks until the in-flight
    /// writes have drained.
    pub fn flush_table(&self, table: &str) -> Result<()> {
        let entry = self.table_entry(table)?;

        loop {
            let candidates: Vec<Arc<CachedNode>> = {
                let nodes = self.nodes.read();
                nodes
                    .iter()
                    .filter(|(key, node)| {
                        &*key.table == table
                            && !node.meta().is_dead()
                            && node.meta().is_dirty()
                            && !node.meta().is_flushing()
                            && node.meta().pin() == 0
                    })
                    .map(|(_, node)| Arc::clone(node))
                    .collect()
            };
            if candidates.is_empty() {
                break;
            }

            let mut batch = Vec::new();
            let mut dirty_size = 0usize;
            for node in candidates {
                // Locks are taken opportunistically: an in-flight
                // rebalance holds path locks top-down and must not wait
                // on us.
                let Some(guard) = node.try_lock_write() else {
                    continue;
                };
                if node.meta().is_dirty()
                    && !node.meta().is_flushing()
                    && node.meta().pin() == 0
                    && !node.meta().is_dead()
                {
                    node.meta().set_flushing(true);
                    dirty_size += node.size();
                    batch.push((node, guard));
                }
            }
            if batch.is_empty() {
                // Candidates were locked by someone else; let them finish.
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            debug!(table, nodes = batch.len(), bytes = dirty_size, "flush table");
            self.flush_nodes(batch);
        }

        self.reap_dead(table);
        entry.layout.flush()
    }

    fn reap_dead(&self, table: &str) {
        let mut zombies: Vec<(CacheKey, Arc<CachedNode>)> = Vec::new();
        {
            let mut nodes = self.nodes.write();
            for (key, node) in nodes.iter() {
                if &*key.table == table
                    && node.meta().is_dead()
                    && Arc::strong_count(node) == 1
                {
                    zombies.push((key.clone(), Arc::clone(node)));
                }
            }
            for (key, _) in &zombies {
                nodes.remove(key);
            }
        }
        let reaped = zombies.len();
        for (key, node) in zombies {
            if let Ok(entry) = self.table_entry(&key.table) {
                entry.layout.delete_block(node.nid());
            }
        }
        if reaped > 0 {
            debug!(table, reaped, "dead nodes reaped");
        }
    }

    /// Serializes each locked node and submits its write. Guards are
    /// released as soon as serialization finishes; completions clear the
    /// flushing flag.
    fn flush_nodes(&self, batch: Vec<(Arc<CachedNode>, NodeWriteGuard)>) {
        for (node, guard) in batch {
            let entry = match self.table_entry(&node.meta().table) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(nid = node.nid(), "flush without table: {e:#}");
                    node.meta().set_flushing(false);
                    continue;
                }
            };

            // The dirty bit clears before the latch drops, so a mutation
            // racing in right behind us re-dirties the node.
            let (block, skeleton) = match node.serialize(&guard) {
                Ok((block, skeleton)) => {
                    node.meta().set_dirty(false);
                    drop(guard);
                    match block.into_exact() {
                        Ok(block) => (block, skeleton),
                        Err(e) => {
                            error!(nid = node.nid(), "write buffer repack failed: {e:#}");
                            node.meta().set_dirty(true);
                            node.meta().set_flushing(false);
                            continue;
                        }
                    }
                }
                Err(e) => {
                    error!(nid = node.nid(), "node serialization failed: {e:#}");
                    drop(guard);
                    node.meta().set_flushing(false);
                    continue;
                }
            };

            trace!(nid = node.nid(), size = block.size(), "write-back submit");
            let completion_node = Arc::clone(&node);
            let submit = entry.layout.async_write(
                node.nid(),
                block,
                skeleton,
                Box::new(move |ok| {
                    if !ok {
                        error!(nid = completion_node.nid(), "write-back failed");
                        completion_node.meta().set_dirty(true);
                    }
                    completion_node.meta().set_flushing(false);
                }),
            );
            if let Err(e) = submit {
                error!(nid = node.nid(), "write submission failed: {e:#}");
                node.meta().set_dirty(true);
                node.meta().set_flushing(false);
            }
        }
    }

    /// One flusher pass; see the module docs for the policy.
    fn tick(&self) {
        let now = now_micros();
        let goal = self.policy.limit * self.policy.writeback_ratio / 100;

        let mut total = 0usize;
        let mut dirty_size = 0usize;
        let mut expired: Vec<(Arc<CachedNode>, u64)> = Vec::new();
        {
            let nodes = self.nodes.read();
            for node in nodes.values() {
                if node.meta().is_dead() {
                    continue;
                }
                let size = node.size();
                total += size;
                if node.meta().is_dirty() {
                    dirty_size += size;
                    let age = now.saturating_sub(node.meta().first_write_at());
                    if age > self.policy.dirty_expire_us
                        && !node.meta().is_flushing()
                        && node.meta().pin() == 0
                    {
                        expired.push((Arc::clone(node), node.meta().first_write_at()));
                    }
                }
            }
        }
        *self.observed.lock() = total;

        expired.sort_by_key(|(_, first_write)| *first_write);
        let mut batch: Vec<(Arc<CachedNode>, NodeWriteGuard)> = Vec::new();
        let mut flushed_size = 0usize;
        for (node, _) in expired {
            if flushed_size >= goal {
                break;
            }
            if let Some(guard) = node.try_lock_write() {
                if node.meta().pin() == 0
                    && !node.meta().is_dead()
                    && node.meta().is_dirty()
                    && !node.meta().is_flushing()
                {
                    node.meta().set_flushing(true);
                    flushed_size += node.size();
                    batch.push((node, guard));
                }
            }
        }

        // Past the dirty high watermark the expiry clock stops mattering.
        let high = self.policy.limit * self.policy.dirty_high_watermark / 100;
        if dirty_size.saturating_sub(flushed_size) >= high && flushed_size < goal {
            let mut candidates: Vec<(Arc<CachedNode>, u64)> = {
                let nodes = self.nodes.read();
                nodes
                    .values()
                    .filter(|node| {
                        node.meta().is_dirty()
                            && !node.meta().is_flushing()
                            && !node.meta().is_dead()
                            && node.meta().pin() == 0
                    })
                    .map(|node| (Arc::clone(node), node.meta().first_write_at()))
                    .collect()
            };
            candidates.sort_by_key(|(_, first_write)| *first_write);

            for (node, _) in candidates {
                if flushed_size >= goal {
                    break;
                }
                if node.meta().is_flushing() {
                    continue;
                }
                if let Some(guard) = node.try_lock_write() {
                    if node.meta().pin() == 0
                        && !node.meta().is_dead()
                        && node.meta().is_dirty()
                        && !node.meta().is_flushing()
                    {
                        node.meta().set_flushing(true);
                        flushed_size += node.size();
                        batch.push((node, guard));
                    }
                }
            }
        }

        if !batch.is_empty() {
            debug!(nodes = batch.len(), bytes = flushed_size, "write-back tick");
            self.flush_nodes(batch);
        }

        if self.need_evict() {
            self.evict();
        }
    }

    /// Current observed size; for tests and accounting.
    pub fn observed_size(&self) -> usize {
        *self.observed.lock()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether a node is resident, without loading or touching it.
    pub fn contains(&self, table: &str, nid: NodeId) -> bool {
        let key = CacheKey {
            table: Arc::from(table),
            nid,
        };
        self.nodes.read().contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::{NodeConfig, NodeStatus, TreeNodeFactory, NID_LEAF_START};
    use crate::storage::{Directory, RamDirectory};

    fn test_factory() -> Arc<TreeNodeFactory> {
        let config = Arc::new(NodeConfig {
            check_crc: true,
            compressor: None,
            bucket_length: 4096,
        });
        Arc::new(TreeNodeFactory::new("t", config))
    }

    fn setup(opts: &Options) -> (Arc<RamDirectory>, Arc<Layout>, Arc<Cache>) {
        let dir = Arc::new(RamDirectory::new());
        let file = dir.open_aio_file("t.slu").unwrap();
        let layout = Arc::new(Layout::new(file, 0, true));
        layout.init(true).unwrap();
        let cache = Cache::new(opts);
        cache.add_table("t", test_factory(), Arc::clone(&layout)).unwrap();
        (dir, layout, cache)
    }

    fn quiet_options() -> Options {
        Options {
            cache_writeback_interval_ms: 60_000,
            ..Options::default()
        }
    }

    #[test]
    fn get_of_unwritten_node_is_none() {
        let opts = quiet_options();
        let (_dir, _layout, cache) = setup(&opts);

        assert!(cache.get("t", 2, false).unwrap().is_none());
        cache.shutdown();
    }

    #[test]
    fn put_then_get_returns_same_node() {
        let opts = quiet_options();
        let (_dir, _layout, cache) = setup(&opts);

        let node = CachedNode::new_schema("t".into(), NodeStatus::New);
        cache.put("t", 1, Arc::clone(&node)).unwrap();

        let got = cache.get("t", 1, false).unwrap().unwrap();
        assert!(Arc::ptr_eq(&node, &got));
        cache.shutdown();
    }

    #[test]
    fn flush_persists_dirty_nodes_for_reload() {
        let opts = quiet_options();
        let (_dir, layout, cache) = setup(&opts);

        let node = CachedNode::new_schema("t".into(), NodeStatus::New);
        {
            let mut state = node.as_schema().state.write();
            state.root_id = 17;
            state.tree_depth = 5;
        }
        node.meta().set_dirty(true);
        cache.put("t", 1, node).unwrap();

        cache.flush_table("t").unwrap();
        cache.shutdown();

        // A second cache instance sees the node via the layout.
        let cache2 = Cache::new(&opts);
        cache2.add_table("t", test_factory(), layout).unwrap();
        let node = cache2.get("t", 1, false).unwrap().unwrap();
        let state = node.as_schema().state.read();
        assert_eq!(state.root_id, 17);
        assert_eq!(state.tree_depth, 5);
        drop(state);
        cache2.shutdown();
    }

    #[test]
    fn flush_clears_dirty_and_flushing() {
        let opts = quiet_options();
        let (_dir, _layout, cache) = setup(&opts);

        let node = CachedNode::new_schema("t".into(), NodeStatus::New);
        node.meta().set_dirty(true);
        cache.put("t", 1, Arc::clone(&node)).unwrap();

        cache.flush_table("t").unwrap();
        assert!(!node.meta().is_dirty());
        assert!(!node.meta().is_flushing());
        cache.shutdown();
    }

    #[test]
    fn dead_nodes_are_reaped_on_flush() {
        let opts = quiet_options();
        let (_dir, _layout, cache) = setup(&opts);

        let node = CachedNode::new_schema("t".into(), NodeStatus::New);
        node.meta().set_dirty(true);
        cache.put("t", 1, Arc::clone(&node)).unwrap();
        cache.flush_table("t").unwrap();

        node.meta().set_dead();
        drop(node);
        cache.flush_table("t").unwrap();
        assert_eq!(cache.node_count(), 0);
        cache.shutdown();
    }

    #[test]
    fn eviction_prefers_least_recently_used_clean_nodes() {
        // Empty leaves are 20 bytes each; a 50-byte cap with a 40% evict
        // ratio drops exactly one node per pass.
        let opts = Options {
            cache_limit: 50,
            cache_evict_ratio: 40,
            ..quiet_options()
        };
        let (_dir, _layout, cache) = setup(&opts);
        let factory = test_factory();

        let nid_a = NID_LEAF_START + 1;
        let nid_b = NID_LEAF_START + 2;
        let nid_c = NID_LEAF_START + 3;
        let nid_d = NID_LEAF_START + 4;

        for nid in [nid_a, nid_b] {
            cache.put("t", nid, factory.new_node(nid)).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        // Touch A so B becomes the least recently used.
        let _ = cache.get("t", nid_a, false).unwrap();
        std::thread::sleep(Duration::from_millis(2));

        cache.put("t", nid_c, factory.new_node(nid_c)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.observed_size(), 60);

        // This insert crosses the cap and evicts the LRU clean node: B.
        cache.put("t", nid_d, factory.new_node(nid_d)).unwrap();
        assert_eq!(cache.node_count(), 3);
        assert!(!cache.contains("t", nid_b));
        assert!(cache.contains("t", nid_a));
        assert!(cache.contains("t", nid_c));
        assert!(cache.contains("t", nid_d));
        cache.shutdown();
    }

    #[test]
    fn duplicate_table_registration_fails() {
        let opts = quiet_options();
        let (_dir, layout, cache) = setup(&opts);

        assert!(cache.add_table("t", test_factory(), layout).is_err());
        cache.shutdown();
    }
}
