//! # Storage Module
//!
//! The storage layer maps logical node ids onto one data file and moves
//! page-aligned blocks of bytes in and out of it.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ Layout                                   │
//! │   block index: node id → (offset, sizes) │
//! │   hole list + fly-hole list              │
//! │   double-written superblock              │
//! ├──────────────────────────────────────────┤
//! │ AsyncFile (positional, page-aligned I/O) │
//! ├──────────────────────────────────────────┤
//! │ Directory (file namespace)               │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Nodes serialize into `Block`s: page-aligned owned buffers with a typed
//! cursor reader/writer. The `Layout` places each block at a file offset,
//! reusing holes left behind by superseded blocks. Freed extents ride a
//! "fly" list until the next metadata flush so that a crash between a
//! payload write and the metadata update can never hand out bytes that are
//! still reachable from the last durable index.
//!
//! ## File Format
//!
//! ```text
//! [0,    4096)   superblock copy 0
//! [4096, 8192)   superblock copy 1
//! [8192, EOF)    node payloads and one index block, any order,
//!                each page-aligned in length
//! ```
//!
//! Integers are little-endian; byte strings are a u32 length followed by
//! the bytes. Checksums are CRC-16 over the stored bytes.
//!
//! ## Module Organization
//!
//! - `block`: aligned buffers and cursor serialization
//! - `file`: the `Directory` / `AsyncFile` collaborator boundary
//! - `fs`: filesystem-backed directory with a per-file I/O thread
//! - `ram`: in-memory directory for tests
//! - `superblock`: double-written superblock and block descriptors
//! - `layout`: block index, hole reuse, async write submission

mod block;
mod file;
mod fs;
mod layout;
mod ram;
mod superblock;

pub use block::{AlignedBuf, Block, BlockReader, BlockWriter};
pub use file::{AsyncFile, Directory, IoCompletion};
pub use fs::FsDirectory;
pub use layout::Layout;
pub use ram::RamDirectory;
pub use superblock::{BlockMeta, SuperBlock, BLOCK_META_SIZE};

use crc::{Crc, CRC_16_IBM_SDLC};

/// Unit of alignment for every file offset, block length, and buffer.
pub const PAGE_SIZE: usize = 4096;

/// Size reserved for each superblock copy.
pub const SUPER_BLOCK_SIZE: usize = 4096;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// CRC-16 over a byte range.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// Rounds `n` up to the next page boundary.
pub fn page_round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Rounds `n` down to the previous page boundary.
pub fn page_round_down(n: usize) -> usize {
    n & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_rounding_is_exact_on_boundaries() {
        assert_eq!(page_round_up(0), 0);
        assert_eq!(page_round_up(4096), 4096);
        assert_eq!(page_round_down(4096), 4096);
    }

    #[test]
    fn page_rounding_off_boundary() {
        assert_eq!(page_round_up(1), 4096);
        assert_eq!(page_round_up(4097), 8192);
        assert_eq!(page_round_down(4095), 0);
        assert_eq!(page_round_down(8191), 4096);
    }

    #[test]
    fn crc16_is_stable_and_discriminating() {
        let a = crc16(b"hello");
        let b = crc16(b"hello");
        let c = crc16(b"hellp");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
