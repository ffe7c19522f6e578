//! Messages and per-child message buffers.
//!
//! A message is a delayed write: a Put or Del that has reached some inner
//! node but not yet its leaf. Each inner node keeps one `MsgBuf` per child,
//! sorted by key and deduplicated; writing a key that is already buffered
//! replaces the older message, so a buffer never holds two operations for
//! the same key.
//!
//! The container is a chain of small sorted vectors. Insertion binary
//! searches the chain by each chunk's last key, then the chunk itself; a
//! chunk that reaches the cap splits in half. This keeps insertion
//! logarithmic while bounding memmove cost to one chunk.

use std::cmp::Ordering;

use eyre::{bail, ensure, Result};

use crate::bloom::bloom_create;
use crate::comparator::Comparator;

/// Chunk capacity of the chain.
const CHUNK_CAP: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Put = 1,
    Del = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub kind: MsgKind,
    pub key: Vec<u8>,
    /// Empty for Del.
    pub value: Vec<u8>,
}

impl Msg {
    pub fn put(key: Vec<u8>, value: Vec<u8>) -> Msg {
        Msg {
            kind: MsgKind::Put,
            key,
            value,
        }
    }

    pub fn del(key: Vec<u8>) -> Msg {
        Msg {
            kind: MsgKind::Del,
            key,
            value: Vec::new(),
        }
    }

    /// On-wire size: kind, length-prefixed key, and for Put the
    /// length-prefixed value.
    pub fn size(&self) -> usize {
        let mut sz = 1 + 4 + self.key.len();
        if self.kind == MsgKind::Put {
            sz += 4 + self.value.len();
        }
        sz
    }
}

/// All messages buffered for one child subtree.
///
/// A buffer deserialized from a skeleton read starts as an empty shell
/// with `loaded == false`; its contents are read on first use. The shell
/// carries its own latch (its `parking_lot::RwLock` wrapper), so loading
/// and draining race safely past unrelated siblings.
#[derive(Debug)]
pub struct MsgBuf {
    chunks: Vec<Vec<Msg>>,
    count: usize,
    /// Sum of message sizes, excluding the count prefix.
    bytes: usize,
    loaded: bool,
}

impl MsgBuf {
    /// An empty, usable buffer.
    pub fn new() -> MsgBuf {
        MsgBuf {
            chunks: Vec::new(),
            count: 0,
            bytes: 0,
            loaded: true,
        }
    }

    /// An on-disk shell; contents arrive via `decode`.
    pub fn unloaded() -> MsgBuf {
        MsgBuf {
            chunks: Vec::new(),
            count: 0,
            bytes: 0,
            loaded: false,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// On-wire size: the count prefix plus all messages.
    pub fn size(&self) -> usize {
        4 + self.bytes
    }

    pub fn iter(&self) -> impl Iterator<Item = &Msg> + Clone {
        self.chunks.iter().flatten()
    }

    pub fn first_key(&self) -> Option<&[u8]> {
        self.chunks.first().and_then(|c| c.first()).map(|m| m.key.as_slice())
    }

    /// Position of the first message with key >= `key`.
    fn lower_bound(&self, key: &[u8], comp: &dyn Comparator) -> (usize, usize) {
        let chunk = self
            .chunks
            .partition_point(|c| match c.last() {
                Some(last) => comp.compare(&last.key, key) == Ordering::Less,
                None => true,
            });
        if chunk == self.chunks.len() {
            return (chunk, 0);
        }
        let idx = self.chunks[chunk].partition_point(|m| comp.compare(&m.key, key) == Ordering::Less);
        (chunk, idx)
    }

    /// The buffered message for exactly `key`, if any.
    pub fn get(&self, key: &[u8], comp: &dyn Comparator) -> Option<&Msg> {
        let (chunk, idx) = self.lower_bound(key, comp);
        let msg = self.chunks.get(chunk)?.get(idx)?;
        (comp.compare(&msg.key, key) == Ordering::Equal).then_some(msg)
    }

    /// Inserts `msg`, replacing any buffered message with the same key.
    pub fn write(&mut self, msg: Msg, comp: &dyn Comparator) {
        debug_assert!(self.loaded);
        if self.chunks.is_empty() {
            self.count = 1;
            self.bytes = msg.size();
            self.chunks.push(vec![msg]);
            return;
        }

        let (mut chunk, mut idx) = self.lower_bound(&msg.key, comp);
        if chunk == self.chunks.len() {
            chunk -= 1;
            idx = self.chunks[chunk].len();
        }

        let target = &mut self.chunks[chunk];
        if idx < target.len() && comp.compare(&target[idx].key, &msg.key) == Ordering::Equal {
            self.bytes -= target[idx].size();
            self.bytes += msg.size();
            target[idx] = msg;
            return;
        }

        self.bytes += msg.size();
        self.count += 1;
        target.insert(idx, msg);
        if target.len() > CHUNK_CAP {
            let upper = target.split_off(target.len() / 2);
            self.chunks.insert(chunk + 1, upper);
        }
    }

    /// Merges a sorted run of messages, with the same replace-on-equal
    /// semantics as `write`.
    pub fn append(&mut self, msgs: impl IntoIterator<Item = Msg>, comp: &dyn Comparator) {
        for msg in msgs {
            self.write(msg, comp);
        }
    }

    /// Removes and returns every message in key order. The buffer stays
    /// loaded and usable.
    pub fn drain(&mut self) -> Vec<Msg> {
        let mut out = Vec::with_capacity(self.count);
        for chunk in self.chunks.drain(..) {
            out.extend(chunk);
        }
        self.count = 0;
        self.bytes = 0;
        out
    }

    /// Forgets contents whose ownership has already moved downstream.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.count = 0;
        self.bytes = 0;
    }

    /// Rebuilds the bloom filter over the current key set.
    pub fn get_filter(&self) -> Vec<u8> {
        bloom_create(self.iter().map(|m| m.key.as_slice()))
    }

    /// Serializes to the on-wire form: count, then each message.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&(self.count as u32).to_le_bytes());
        for msg in self.iter() {
            out.push(msg.kind as u8);
            out.extend_from_slice(&(msg.key.len() as u32).to_le_bytes());
            out.extend_from_slice(&msg.key);
            if msg.kind == MsgKind::Put {
                out.extend_from_slice(&(msg.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&msg.value);
            }
        }
        debug_assert_eq!(out.len(), self.size());
        out
    }

    /// Replaces this buffer's contents with the decoded messages and marks
    /// it loaded. Input messages are already in key order.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<()> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let count = cursor.read_u32()? as usize;

        let mut chunks = Vec::with_capacity(count / CHUNK_CAP + 1);
        let mut chunk: Vec<Msg> = Vec::with_capacity(CHUNK_CAP.min(count));
        let mut total = 0usize;
        for _ in 0..count {
            let kind = match cursor.read_u8()? {
                1 => MsgKind::Put,
                2 => MsgKind::Del,
                k => bail!("unknown message kind {}", k),
            };
            let key = cursor.read_slice()?.to_vec();
            let value = if kind == MsgKind::Put {
                cursor.read_slice()?.to_vec()
            } else {
                Vec::new()
            };
            let msg = Msg { kind, key, value };
            total += msg.size();
            if chunk.len() == CHUNK_CAP {
                chunks.push(std::mem::replace(&mut chunk, Vec::with_capacity(CHUNK_CAP)));
            }
            chunk.push(msg);
        }
        if !chunk.is_empty() {
            chunks.push(chunk);
        }

        self.chunks = chunks;
        self.count = count;
        self.bytes = total;
        self.loaded = true;
        Ok(())
    }
}

impl Default for MsgBuf {
    fn default() -> Self {
        MsgBuf::new()
    }
}

/// Plain slice cursor for the compact payload encodings.
pub(crate) struct Cursor<'a> {
    pub bytes: &'a [u8],
    pub pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn read_u8(&mut self) -> Result<u8> {
        ensure!(self.pos + 1 <= self.bytes.len(), "payload is truncated");
        let v = self.bytes[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        ensure!(self.pos + 4 <= self.bytes.len(), "payload is truncated");
        let v = u32::from_le_bytes(self.bytes[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn read_slice(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        ensure!(self.pos + len <= self.bytes.len(), "payload is truncated");
        let s = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(s)
    }
}
