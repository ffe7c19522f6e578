//! Page-aligned buffers and cursor serialization.
//!
//! Every buffer handed to the file layer is page-aligned and exclusively
//! owned by its current holder; deserialized byte strings that need to
//! outlive the buffer are explicit copies. `BlockReader` and `BlockWriter`
//! fail cursor overflows without moving the cursor, so a failed parse
//! leaves the position meaningful.

use std::alloc::{alloc_zeroed, dealloc, Layout as MemLayout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use eyre::{bail, ensure, Result};

use super::{page_round_up, PAGE_SIZE};

/// An owned, page-aligned, zero-initialized byte buffer. Not clonable: the
/// holder is the sole owner, as all I/O paths hand buffers off by value.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: AlignedBuf uniquely owns its allocation; moving it between
// threads transfers that ownership like a Vec<u8>.
unsafe impl Send for AlignedBuf {}
// SAFETY: shared access only exposes &[u8].
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    /// Allocates a zeroed buffer of `size` rounded up to a whole number of
    /// pages. Fails if the allocator does.
    pub fn alloc(size: usize) -> Result<AlignedBuf> {
        ensure!(size > 0, "cannot allocate an empty aligned buffer");
        let len = page_round_up(size);
        let layout = MemLayout::from_size_align(len, PAGE_SIZE)
            .expect("page-aligned layout is always valid");

        // SAFETY: layout has non-zero size and valid power-of-two alignment.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            bail!("aligned allocation of {} bytes failed", len);
        };
        Ok(AlignedBuf { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: exclusive access via &mut self; ptr valid for len bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = MemLayout::from_size_align(self.len, PAGE_SIZE)
            .expect("page-aligned layout is always valid");
        // SAFETY: ptr was allocated with exactly this layout.
        unsafe { dealloc(self.ptr.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// A sized window into an aligned buffer. `start` lets a sub-range read
/// expose only the requested bytes of a page-rounded transfer.
#[derive(Debug)]
pub struct Block {
    buf: AlignedBuf,
    start: usize,
    size: usize,
}

impl Block {
    pub fn new(buf: AlignedBuf, start: usize, size: usize) -> Block {
        assert!(start <= buf.len());
        assert!(start + size <= buf.len());
        Block { buf, start, size }
    }

    /// Allocates an empty block with capacity for `size` bytes.
    pub fn with_capacity(size: usize) -> Result<Block> {
        Ok(Block::new(AlignedBuf::alloc(size)?, 0, 0))
    }

    /// Bytes used so far.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Writable bytes from `start` to the end of the buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len() - self.start
    }

    /// The visible window.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.size]
    }

    /// A sub-range of the visible window.
    pub fn window(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[self.start + offset..self.start + offset + len]
    }

    pub fn set_size(&mut self, size: usize) {
        assert!(self.start + size <= self.buf.len());
        self.size = size;
    }

    pub fn clear(&mut self) {
        self.size = 0;
    }

    /// The whole underlying aligned buffer, for handing to the file layer.
    pub fn buffer(&self) -> &AlignedBuf {
        &self.buf
    }

    /// Repackages the used bytes into a block whose capacity is exactly the
    /// page-rounded used size, as the layout's write path requires. A block
    /// serialized into an oversized estimate shrinks here; a tight one is
    /// returned as-is.
    pub fn into_exact(self) -> Result<Block> {
        if self.start == 0 && self.buf.len() == page_round_up(self.size) {
            return Ok(self);
        }
        let size = self.size;
        let mut buf = AlignedBuf::alloc(size.max(1))?;
        buf[..size].copy_from_slice(self.bytes());
        Ok(Block::new(buf, 0, size))
    }

    pub fn into_buffer(self) -> AlignedBuf {
        self.buf
    }

    fn slot(&mut self, offset: usize, len: usize) -> Option<&mut [u8]> {
        let at = self.start + offset;
        if at + len <= self.buf.len() {
            Some(&mut self.buf[at..at + len])
        } else {
            None
        }
    }
}

/// Cursor reads against a block's used window.
pub struct BlockReader<'a> {
    block: &'a Block,
    offset: usize,
}

impl<'a> BlockReader<'a> {
    pub fn new(block: &'a Block) -> BlockReader<'a> {
        BlockReader { block, offset: 0 }
    }

    pub fn pos(&self) -> usize {
        self.offset
    }

    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remain(&self) -> usize {
        self.block.size() - self.offset
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        ensure!(
            self.offset + len <= self.block.size(),
            "skip of {} bytes overruns block ({} of {} used)",
            len,
            self.offset,
            self.block.size()
        );
        self.offset += len;
        Ok(())
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        ensure!(
            self.offset + len <= self.block.size(),
            "read of {} bytes overruns block ({} of {} used)",
            len,
            self.offset,
            self.block.size()
        );
        let bytes = self.block.window(self.offset, len);
        self.offset += len;
        Ok(bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(b.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().unwrap()))
    }

    /// Length-prefixed byte string, copied into a fresh owned buffer.
    pub fn read_slice(&mut self) -> Result<Vec<u8>> {
        let saved = self.offset;
        let len = self.read_u32()? as usize;
        match self.read_bytes(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => {
                self.offset = saved;
                Err(e)
            }
        }
    }
}

/// Cursor writes against a block's capacity. The used size grows to the
/// cursor high-water mark on every successful write.
pub struct BlockWriter<'a> {
    block: &'a mut Block,
    offset: usize,
}

impl<'a> BlockWriter<'a> {
    pub fn new(block: &'a mut Block) -> BlockWriter<'a> {
        BlockWriter { block, offset: 0 }
    }

    pub fn pos(&self) -> usize {
        self.offset
    }

    pub fn seek(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn remain(&self) -> usize {
        self.block.capacity() - self.offset
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        ensure!(
            self.offset + len <= self.block.capacity(),
            "skip of {} bytes overruns capacity {}",
            len,
            self.block.capacity()
        );
        self.offset += len;
        self.bump_size();
        Ok(())
    }

    fn bump_size(&mut self) {
        if self.block.size() < self.offset {
            self.block.set_size(self.offset);
        }
    }

    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(slot) = self.block.slot(self.offset, bytes.len()) else {
            bail!(
                "write of {} bytes overruns capacity {}",
                bytes.len(),
                self.block.capacity()
            );
        };
        slot.copy_from_slice(bytes);
        self.offset += bytes.len();
        self.bump_size();
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_raw(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> Result<()> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> Result<()> {
        self.write_raw(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_raw(&v.to_le_bytes())
    }

    /// Length-prefixed byte string.
    pub fn write_slice(&mut self, bytes: &[u8]) -> Result<()> {
        let saved = self.offset;
        self.write_u32(bytes.len() as u32)?;
        if let Err(e) = self.write_raw(bytes) {
            self.offset = saved;
            return Err(e);
        }
        Ok(())
    }
}
