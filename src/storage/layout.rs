//! Block layout over one data file.
//!
//! The layout owns the mapping from node ids to file extents and all file
//! space accounting. Every extent is page-aligned in offset and length.
//!
//! Space reuse goes through two lists. The *hole* list holds extents that
//! are free and durably unreachable: allocations carve from it front-first
//! and adjacent holes coalesce. The *fly-hole* list holds extents that were
//! superseded by a write or delete whose metadata has not been flushed yet;
//! they graduate to the hole list only after the next successful metadata
//! flush. A crash after a payload write but before the flush therefore
//! cannot reallocate bytes the last durable index still references.
//!
//! A hole that ends exactly at the allocation cursor retracts the cursor
//! instead of joining the list, so the file can shrink on `truncate`.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::{bail, ensure, Result};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::btree::{is_leaf_id, NodeId};

use super::block::{AlignedBuf, Block, BlockReader, BlockWriter};
use super::file::AsyncFile;
use super::superblock::{BlockMeta, SuperBlock, BLOCK_META_SIZE};
use super::{crc16, page_round_down, page_round_up, SUPER_BLOCK_SIZE};

/// Invoked when an asynchronous block write finishes.
pub type WriteComplete = Box<dyn FnOnce(bool) + Send + 'static>;

/// Invoked when an asynchronous block read finishes.
pub type ReadComplete = Box<dyn FnOnce(Option<Block>) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Hole {
    offset: u64,
    size: u64,
}

#[derive(Debug)]
struct AllocState {
    /// High-water allocation cursor.
    offset: u64,
    /// Known file length; may exceed `offset` after holes are retracted.
    length: u64,
}

#[derive(Debug, Default)]
struct IndexState {
    by_id: BTreeMap<NodeId, BlockMeta>,
    /// Extent start → page-rounded extent length, including the index
    /// block. Supports hole discovery on open.
    by_offset: BTreeMap<u64, u64>,
}

pub struct Layout {
    file: Arc<dyn AsyncFile>,
    check_crc: bool,
    alloc: Mutex<AllocState>,
    index: Mutex<IndexState>,
    holes: Mutex<VecDeque<Hole>>,
    fly_holes: Mutex<VecDeque<Hole>>,
    superblock: Mutex<SuperBlock>,
    /// Serializes whole metadata flushes against each other.
    flush_mutex: Mutex<()>,
    fly_writes: AtomicUsize,
    fly_reads: AtomicUsize,
}

impl Layout {
    pub fn new(file: Arc<dyn AsyncFile>, length: u64, check_crc: bool) -> Layout {
        Layout {
            file,
            check_crc,
            alloc: Mutex::new(AllocState { offset: 0, length }),
            index: Mutex::new(IndexState::default()),
            holes: Mutex::new(VecDeque::new()),
            fly_holes: Mutex::new(VecDeque::new()),
            superblock: Mutex::new(SuperBlock::default()),
            flush_mutex: Mutex::new(()),
            fly_writes: AtomicUsize::new(0),
            fly_reads: AtomicUsize::new(0),
        }
    }

    /// Sets up a fresh file or recovers the index of an existing one.
    pub fn init(&self, create: bool) -> Result<()> {
        if create {
            self.flush_superblock()?;

            let mut alloc = self.alloc.lock();
            alloc.offset = (SUPER_BLOCK_SIZE * 2) as u64;
            alloc.length = alloc.offset;
        } else {
            {
                let alloc = self.alloc.lock();
                ensure!(
                    alloc.length >= (SUPER_BLOCK_SIZE * 2) as u64,
                    "data file is too short: {} bytes",
                    alloc.length
                );
            }
            self.load_superblock()?;
            let index_meta = self.superblock.lock().index_meta;
            if let Some(meta) = index_meta {
                self.load_index(meta)?;
            }
            self.init_offset_index();
            self.init_holes();

            let index = self.index.lock();
            let (inner, leaves) = index
                .by_id
                .keys()
                .fold((0usize, 0usize), |(i, l), &nid| {
                    if is_leaf_id(nid) {
                        (i, l + 1)
                    } else {
                        (i + 1, l)
                    }
                });
            info!(inner, leaves, "block index loaded");
        }

        self.truncate()?;
        Ok(())
    }

    fn get_block_meta(&self, nid: NodeId) -> Option<BlockMeta> {
        self.index.lock().by_id.get(&nid).copied()
    }

    /// Records where `nid` now lives; the previous extent, if any, becomes
    /// a fly hole.
    fn set_block_meta(&self, nid: NodeId, meta: BlockMeta) {
        let old = {
            let mut index = self.index.lock();
            let old = index.by_id.insert(nid, meta);
            if let Some(old) = old {
                index.by_offset.remove(&old.offset);
            }
            index
                .by_offset
                .insert(meta.offset, page_round_up(meta.total_size as usize) as u64);
            old
        };
        if let Some(old) = old {
            self.add_fly_hole(old.offset, page_round_up(old.total_size as usize) as u64);
        }
    }

    fn del_block_meta(&self, nid: NodeId) -> Option<BlockMeta> {
        let old = {
            let mut index = self.index.lock();
            let old = index.by_id.remove(&nid);
            if let Some(old) = old {
                index.by_offset.remove(&old.offset);
            }
            old
        };
        if let Some(old) = old {
            self.add_fly_hole(old.offset, page_round_up(old.total_size as usize) as u64);
        }
        old
    }

    /// Blocking read of a node block, the skeleton prefix or the whole
    /// extent. `Ok(None)` means the id has no block; I/O and corruption
    /// failures are errors.
    pub fn read(&self, nid: NodeId, skeleton_only: bool) -> Result<Option<Block>> {
        let Some(meta) = self.get_block_meta(nid) else {
            return Ok(None);
        };

        let read = if skeleton_only {
            meta.skeleton_size
        } else {
            meta.total_size
        } as usize;

        let mut buf = AlignedBuf::alloc(page_round_up(read))?;
        self.read_data(meta.offset, &mut buf)?;

        if self.check_crc {
            let computed = crc16(&buf[..meta.skeleton_size as usize]);
            ensure!(
                computed == meta.crc,
                "block {:#x} is corrupt: crc {:#06x} != {:#06x}",
                nid,
                computed,
                meta.crc
            );
        }

        trace!(nid, offset = meta.offset, read, "block read");
        Ok(Some(Block::new(buf, 0, read)))
    }

    /// Blocking read of a sub-range of a node block, page-aligning the
    /// transfer and exposing only the requested window. Used for lazy
    /// message-buffer and bucket loads; the caller verifies the section's
    /// own descriptor checksum.
    pub fn read_range(&self, nid: NodeId, sub_offset: u32, sub_size: u32) -> Result<Block> {
        let Some(meta) = self.get_block_meta(nid) else {
            bail!("no block for node {:#x}", nid);
        };
        ensure!(
            sub_offset <= meta.total_size && sub_offset + sub_size <= meta.total_size,
            "sub-range [{}, {}) outside block of {} bytes",
            sub_offset,
            sub_offset + sub_size,
            meta.total_size
        );

        let aligned = page_round_down(sub_offset as usize);
        let span = sub_offset as usize - aligned + sub_size as usize;

        let mut buf = AlignedBuf::alloc(page_round_up(span))?;
        self.read_data(meta.offset + aligned as u64, &mut buf)?;

        trace!(nid, sub_offset, sub_size, "block range read");
        Ok(Block::new(buf, sub_offset as usize - aligned, sub_size as usize))
    }

    /// Asynchronous full read; the completion receives the block or `None`
    /// on failure.
    pub fn async_read(self: &Arc<Layout>, nid: NodeId, completion: ReadComplete) {
        let Some(meta) = self.get_block_meta(nid) else {
            error!(nid, "async read of unindexed block");
            completion(None);
            return;
        };

        let buf = match AlignedBuf::alloc(page_round_up(meta.total_size as usize)) {
            Ok(buf) => buf,
            Err(e) => {
                error!(nid, "async read allocation failed: {e:#}");
                completion(None);
                return;
            }
        };

        self.fly_reads.fetch_add(1, Ordering::AcqRel);
        let layout = Arc::clone(self);
        self.file.async_read(
            meta.offset,
            buf,
            Box::new(move |ok, buf| {
                layout.fly_reads.fetch_sub(1, Ordering::AcqRel);
                if !ok {
                    error!(nid, "async read failed");
                    completion(None);
                    return;
                }
                if layout.check_crc {
                    let computed = crc16(&buf[..meta.skeleton_size as usize]);
                    if computed != meta.crc {
                        error!(nid, "async read found corrupt block");
                        completion(None);
                        return;
                    }
                }
                completion(Some(Block::new(buf, 0, meta.total_size as usize)));
            }),
        );
    }

    /// Asynchronous write of a node block. The block's capacity must be
    /// the page-rounded used size. On success the index points at the new
    /// extent and the superseded one rides the fly list; on failure the
    /// just-allocated extent rides the fly list instead.
    pub fn async_write(
        self: &Arc<Layout>,
        nid: NodeId,
        block: Block,
        skeleton_size: u32,
        completion: WriteComplete,
    ) -> Result<()> {
        ensure!(
            block.capacity() == page_round_up(block.size()),
            "block capacity {} is not the rounded size of {}",
            block.capacity(),
            block.size()
        );

        let total_size = block.size() as u32;
        let crc = crc16(block.window(0, skeleton_size as usize));
        let buf = block.into_buffer();
        let rounded = buf.len() as u64;
        let offset = self.get_offset(rounded);

        let meta = BlockMeta {
            offset,
            skeleton_size,
            total_size,
            crc,
        };

        self.fly_writes.fetch_add(1, Ordering::AcqRel);
        let layout = Arc::clone(self);
        self.file.async_write(
            offset,
            buf,
            Box::new(move |ok, buf| {
                if ok {
                    trace!(nid, offset, total_size, "block written");
                    layout.set_block_meta(nid, meta);
                } else {
                    error!(nid, offset, "block write failed");
                    layout.add_fly_hole(offset, rounded);
                }
                layout.fly_writes.fetch_sub(1, Ordering::AcqRel);
                drop(buf);
                completion(ok);
            }),
        );
        Ok(())
    }

    /// Drops a node's extent. Reusable only after the next metadata flush.
    pub fn delete_block(&self, nid: NodeId) {
        if self.del_block_meta(nid).is_none() {
            trace!(nid, "delete of unwritten block");
        } else {
            trace!(nid, "block deleted");
        }
    }

    /// Waits for in-flight writes, persists the index and superblocks, and
    /// releases retired extents for reuse.
    pub fn flush(&self) -> Result<()> {
        let _flush = self.flush_mutex.lock();
        while self.fly_writes.load(Ordering::Acquire) > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }

        self.flush_meta()?;
        self.retract_tail_holes();
        self.truncate()?;
        Ok(())
    }

    /// Folds holes that reach the allocation cursor back into it, so the
    /// following truncate can reclaim a freed tail.
    fn retract_tail_holes(&self) {
        let mut alloc = self.alloc.lock();
        let mut holes = self.holes.lock();
        while let Some(last) = holes.back() {
            if last.offset + last.size == alloc.offset {
                alloc.offset = last.offset;
                holes.pop_back();
            } else {
                break;
            }
        }
    }

    fn flush_meta(&self) -> Result<()> {
        // Only holes retired before this flush graduate; extents freed by
        // writes racing past this point stay on the fly list for the next
        // one.
        let fly_count = self.fly_holes.lock().len();

        self.flush_index()?;
        self.flush_superblock()?;

        for _ in 0..fly_count {
            let hole = self.fly_holes.lock().pop_front();
            match hole {
                Some(hole) => self.add_hole(hole.offset, hole.size),
                None => break,
            }
        }
        Ok(())
    }

    fn flush_index(&self) -> Result<()> {
        let (block, size) = {
            let index = self.index.lock();
            let size = 4 + index.by_id.len() * (8 + BLOCK_META_SIZE);
            let mut block = Block::with_capacity(size)?;
            let mut writer = BlockWriter::new(&mut block);
            writer.write_u32(index.by_id.len() as u32)?;
            for (nid, meta) in &index.by_id {
                writer.write_u64(*nid)?;
                meta.write_to(&mut writer)?;
            }
            (block, size)
        };
        debug_assert_eq!(block.size(), size);

        let crc = crc16(block.bytes());
        let rounded = page_round_up(size) as u64;
        let offset = self.get_offset(rounded);
        let buf = block.into_buffer();

        if let Err(e) = self.write_data(offset, &buf) {
            error!(offset, "index block write failed: {e:#}");
            self.add_hole(offset, rounded);
            return Err(e);
        }
        trace!(offset, size, "index block written");

        let mut superblock = self.superblock.lock();
        if let Some(old) = superblock.index_meta.take() {
            self.add_fly_hole(old.offset, page_round_up(old.total_size as usize) as u64);
            self.index.lock().by_offset.remove(&old.offset);
        }
        superblock.index_meta = Some(BlockMeta {
            offset,
            skeleton_size: size as u32,
            total_size: size as u32,
            crc,
        });
        self.index.lock().by_offset.insert(offset, rounded);
        Ok(())
    }

    fn flush_superblock(&self) -> Result<()> {
        let mut block = Block::with_capacity(SUPER_BLOCK_SIZE)?;
        self.superblock.lock().write_to(&mut block)?;
        let buf = block.into_buffer();

        // Double write: either copy alone must recover the file.
        self.write_data(0, &buf)?;
        self.write_data(SUPER_BLOCK_SIZE as u64, &buf)?;
        trace!("superblocks written");
        Ok(())
    }

    fn load_superblock(&self) -> Result<()> {
        for copy in 0..2u64 {
            let mut buf = AlignedBuf::alloc(SUPER_BLOCK_SIZE)?;
            if let Err(e) = self.read_data(copy * SUPER_BLOCK_SIZE as u64, &mut buf) {
                error!(copy, "superblock read failed: {e:#}");
                continue;
            }
            let block = Block::new(buf, 0, SUPER_BLOCK_SIZE);
            match SuperBlock::read_from(&block) {
                Ok(sb) => {
                    debug!(copy, "superblock loaded");
                    *self.superblock.lock() = sb;
                    return Ok(());
                }
                Err(e) => error!(copy, "superblock is invalid: {e:#}"),
            }
        }
        bail!("both superblock copies are invalid");
    }

    fn load_index(&self, meta: BlockMeta) -> Result<()> {
        let size = meta.total_size as usize;
        let mut buf = AlignedBuf::alloc(page_round_up(size))?;
        self.read_data(meta.offset, &mut buf)?;

        if self.check_crc {
            let computed = crc16(&buf[..size]);
            ensure!(
                computed == meta.crc,
                "index block is corrupt: crc {:#06x} != {:#06x}",
                computed,
                meta.crc
            );
        }

        let block = Block::new(buf, 0, size);
        let mut reader = BlockReader::new(&block);
        let count = reader.read_u32()?;

        let mut index = self.index.lock();
        debug_assert!(index.by_id.is_empty());
        for _ in 0..count {
            let nid = reader.read_u64()?;
            let meta = BlockMeta::read_from(&mut reader)?;
            index.by_id.insert(nid, meta);
        }
        Ok(())
    }

    fn init_offset_index(&self) {
        let index_meta = self.superblock.lock().index_meta;
        let mut index = self.index.lock();
        let mut mirror = BTreeMap::new();
        for meta in index.by_id.values() {
            mirror.insert(meta.offset, page_round_up(meta.total_size as usize) as u64);
        }
        if let Some(meta) = index_meta {
            mirror.insert(meta.offset, page_round_up(meta.total_size as usize) as u64);
        }
        index.by_offset = mirror;
    }

    /// Rebuilds the hole list from the gaps between extents and parks the
    /// allocation cursor after the last one.
    fn init_holes(&self) {
        let index = self.index.lock();

        let mut last = (SUPER_BLOCK_SIZE * 2) as u64;
        let mut holes = Vec::new();
        for (&offset, &size) in &index.by_offset {
            if offset > last {
                holes.push(Hole {
                    offset: last,
                    size: offset - last,
                });
            }
            last = offset + size;
        }
        drop(index);

        for hole in holes {
            self.add_hole(hole.offset, hole.size);
        }

        let mut alloc = self.alloc.lock();
        alloc.offset = last;
    }

    /// Finds space for a page-rounded allocation: a hole that fits, or the
    /// end of the file.
    fn get_offset(&self, size: u64) -> u64 {
        if let Some(offset) = self.get_hole(size) {
            return offset;
        }

        let mut alloc = self.alloc.lock();
        let offset = alloc.offset;
        alloc.offset += size;
        if alloc.offset > alloc.length {
            alloc.length = alloc.offset;
        }
        offset
    }

    fn get_hole(&self, size: u64) -> Option<u64> {
        let mut holes = self.holes.lock();
        for i in 0..holes.len() {
            if holes[i].size > size {
                let offset = holes[i].offset;
                holes[i].offset += size;
                holes[i].size -= size;
                return Some(offset);
            } else if holes[i].size == size {
                let offset = holes[i].offset;
                let _ = holes.remove(i);
                return Some(offset);
            }
        }
        None
    }

    fn add_hole(&self, offset: u64, size: u64) {
        {
            let mut alloc = self.alloc.lock();
            if offset + size == alloc.offset {
                // The hole ends at the cursor; retract instead of listing.
                alloc.offset = offset;
                return;
            }
        }

        let mut holes = self.holes.lock();
        let at = holes.partition_point(|h| h.offset < offset);

        debug_assert!(at == 0 || {
            let prev = &holes[at - 1];
            prev.offset + prev.size <= offset
        });
        debug_assert!(at == holes.len() || offset + size <= holes[at].offset);

        let merged_prev = at > 0 && holes[at - 1].offset + holes[at - 1].size == offset;
        if merged_prev {
            holes[at - 1].size += size;
            if at < holes.len() && holes[at - 1].offset + holes[at - 1].size == holes[at].offset {
                let next = holes.remove(at).unwrap();
                holes[at - 1].size += next.size;
            }
            return;
        }

        if at < holes.len() && offset + size == holes[at].offset {
            holes[at].offset = offset;
            holes[at].size += size;
            return;
        }

        holes.insert(at, Hole { offset, size });
    }

    fn add_fly_hole(&self, offset: u64, size: u64) {
        self.fly_holes.lock().push_back(Hole { offset, size });
    }

    /// Shrinks the file when the allocation cursor fell below its length.
    pub fn truncate(&self) -> Result<()> {
        let mut alloc = self.alloc.lock();
        if alloc.offset < alloc.length {
            self.file.truncate(alloc.offset)?;
            alloc.length = alloc.offset;
        }
        Ok(())
    }

    /// Current high-water length, for tests and accounting.
    pub fn file_length(&self) -> u64 {
        self.alloc.lock().length
    }

    fn read_data(&self, offset: u64, buf: &mut AlignedBuf) -> Result<()> {
        self.fly_reads.fetch_add(1, Ordering::AcqRel);
        let res = self.file.read(offset, buf);
        self.fly_reads.fetch_sub(1, Ordering::AcqRel);
        res
    }

    fn write_data(&self, offset: u64, buf: &AlignedBuf) -> Result<()> {
        self.fly_writes.fetch_add(1, Ordering::AcqRel);
        let res = self.file.write(offset, buf);
        self.fly_writes.fetch_sub(1, Ordering::AcqRel);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Directory, RamDirectory};
    use std::sync::mpsc::sync_channel;

    fn fresh_layout() -> (Arc<RamDirectory>, Arc<Layout>) {
        let dir = Arc::new(RamDirectory::new());
        let file = dir.open_aio_file("t.slu").unwrap();
        let layout = Arc::new(Layout::new(file, 0, true));
        layout.init(true).unwrap();
        (dir, layout)
    }

    fn block_of(bytes: &[u8]) -> Block {
        let mut block = Block::with_capacity(bytes.len()).unwrap();
        let mut writer = BlockWriter::new(&mut block);
        writer.write_raw(bytes).unwrap();
        block
    }

    fn write_block(layout: &Arc<Layout>, nid: NodeId, bytes: &[u8], skeleton: u32) {
        let (tx, rx) = sync_channel(1);
        layout
            .async_write(
                nid,
                block_of(bytes),
                skeleton,
                Box::new(move |ok| tx.send(ok).unwrap()),
            )
            .unwrap();
        assert!(rx.recv().unwrap());
    }

    #[test]
    fn write_flush_read_round_trips() {
        let (_dir, layout) = fresh_layout();

        write_block(&layout, 2, b"hello block", 11);
        layout.flush().unwrap();

        let block = layout.read(2, false).unwrap().unwrap();
        assert_eq!(block.bytes(), b"hello block");
    }

    #[test]
    fn skeleton_read_returns_prefix() {
        let (_dir, layout) = fresh_layout();

        write_block(&layout, 2, b"skeleton-and-body", 8);
        let block = layout.read(2, true).unwrap().unwrap();
        assert_eq!(block.bytes(), b"skeleton");
    }

    #[test]
    fn range_read_exposes_window() {
        let (_dir, layout) = fresh_layout();

        write_block(&layout, 2, b"0123456789", 10);
        let block = layout.read_range(2, 4, 3).unwrap();
        assert_eq!(block.bytes(), b"456");
    }

    #[test]
    fn missing_block_fails() {
        let (_dir, layout) = fresh_layout();
        assert!(layout.read(42, false).unwrap().is_none());
    }

    #[test]
    fn async_read_returns_block() {
        let (_dir, layout) = fresh_layout();
        write_block(&layout, 2, b"async payload", 13);

        let (tx, rx) = sync_channel(1);
        layout.async_read(
            2,
            Box::new(move |block| {
                tx.send(block.map(|b| b.bytes().to_vec())).unwrap();
            }),
        );
        assert_eq!(rx.recv().unwrap().unwrap(), b"async payload");
    }

    #[test]
    fn reopen_recovers_index_and_holes() {
        let dir = Arc::new(RamDirectory::new());
        {
            let file = dir.open_aio_file("t.slu").unwrap();
            let layout = Arc::new(Layout::new(file, 0, true));
            layout.init(true).unwrap();
            write_block(&layout, 2, &[1u8; 5000], 100);
            write_block(&layout, 3, &[2u8; 100], 100);
            layout.flush().unwrap();
        }

        let length = dir.file_length("t.slu").unwrap();
        let file = dir.open_aio_file("t.slu").unwrap();
        let layout = Arc::new(Layout::new(file, length, true));
        layout.init(false).unwrap();

        assert_eq!(layout.read(2, false).unwrap().unwrap().bytes(), &[1u8; 5000][..]);
        assert_eq!(layout.read(3, false).unwrap().unwrap().bytes(), &[2u8; 100][..]);
    }

    #[test]
    fn second_superblock_recovers_when_first_is_corrupt() {
        let dir = Arc::new(RamDirectory::new());
        {
            let file = dir.open_aio_file("t.slu").unwrap();
            let layout = Arc::new(Layout::new(file, 0, true));
            layout.init(true).unwrap();
            write_block(&layout, 2, b"survives", 8);
            layout.flush().unwrap();
        }

        // Trash superblock copy 0.
        {
            let file = dir.open_aio_file("t.slu").unwrap();
            let garbage = AlignedBuf::alloc(SUPER_BLOCK_SIZE).unwrap();
            file.write(0, &garbage).unwrap();
        }

        let length = dir.file_length("t.slu").unwrap();
        let file = dir.open_aio_file("t.slu").unwrap();
        let layout = Arc::new(Layout::new(file, length, true));
        layout.init(false).unwrap();
        assert_eq!(layout.read(2, false).unwrap().unwrap().bytes(), b"survives");
    }

    #[test]
    fn rewrite_releases_old_extent_after_flush() {
        let (_dir, layout) = fresh_layout();

        write_block(&layout, 2, &[7u8; 100], 100);
        let first = layout.get_block_meta(2).unwrap();

        write_block(&layout, 2, &[8u8; 100], 100);
        let second = layout.get_block_meta(2).unwrap();
        assert_ne!(first.offset, second.offset);

        // The old extent is still fenced until a flush graduates it.
        assert_eq!(layout.holes.lock().len(), 0);
        assert!(!layout.fly_holes.lock().is_empty());

        layout.flush().unwrap();
        // After the flush, a same-sized allocation may land on it again.
        write_block(&layout, 3, &[9u8; 100], 100);
        let third = layout.get_block_meta(3).unwrap();
        assert_eq!(third.offset, first.offset);
    }

    #[test]
    fn delete_block_frees_space_and_file_shrinks() {
        let (dir, layout) = fresh_layout();

        for nid in 2..6u64 {
            write_block(&layout, nid, &[nid as u8; 3000], 100);
        }
        layout.flush().unwrap();
        let full_len = dir.file_length("t.slu").unwrap();

        for nid in 2..6u64 {
            layout.delete_block(nid);
        }
        // Each flush graduates the extents the previous one retired and
        // relocates the index block; a few rounds drain the tail.
        for _ in 0..3 {
            layout.flush().unwrap();
        }

        let shrunk = dir.file_length("t.slu").unwrap();
        assert!(shrunk < full_len, "{} !< {}", shrunk, full_len);
    }

    #[test]
    fn holes_coalesce_with_neighbors() {
        let (_dir, layout) = fresh_layout();

        layout.add_hole(8192, 4096);
        layout.add_hole(16384, 4096);
        assert_eq!(layout.holes.lock().len(), 2);

        layout.add_hole(12288, 4096);
        let holes = layout.holes.lock();
        assert_eq!(holes.len(), 1);
        assert_eq!(holes[0], Hole { offset: 8192, size: 3 * 4096 });
    }

    #[test]
    fn hole_at_cursor_retracts_allocation() {
        let (_dir, layout) = fresh_layout();

        let offset = layout.get_offset(4096);
        assert_eq!(offset, 8192);
        layout.add_hole(offset, 4096);

        assert!(layout.holes.lock().is_empty());
        assert_eq!(layout.get_offset(4096), 8192);
    }

    #[test]
    fn exact_and_oversized_holes_are_reused() {
        let (_dir, layout) = fresh_layout();
        let base = layout.get_offset(3 * 4096);
        layout.get_offset(4096); // fence the hole away from the cursor
        layout.add_hole(base, 3 * 4096);

        // Oversized: shrink from the front.
        assert_eq!(layout.get_offset(4096), base);
        // Exact fit: removed.
        assert_eq!(layout.get_offset(2 * 4096), base + 4096);
        assert!(layout.holes.lock().is_empty());
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let dir = Arc::new(RamDirectory::new());
        let file = dir.open_aio_file("t.slu").unwrap();
        let layout = Arc::new(Layout::new(Arc::clone(&file), 0, true));
        layout.init(true).unwrap();

        write_block(&layout, 2, b"fragile bytes", 13);
        let meta = layout.get_block_meta(2).unwrap();

        let mut garbage = AlignedBuf::alloc(4096).unwrap();
        garbage[..4].copy_from_slice(b"oops");
        file.write(meta.offset, &garbage).unwrap();

        assert!(layout.read(2, false).is_err());
    }
}
