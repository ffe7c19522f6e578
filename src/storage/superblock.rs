//! The double-written superblock and block descriptors.
//!
//! Two identical superblock copies occupy the first two pages of the data
//! file. Metadata flushes rewrite both; open tries copy 0, then copy 1, so
//! a crash mid-rewrite always leaves one parseable copy pointing at a
//! consistent index block.

use eyre::{ensure, Result};

use super::block::{Block, BlockReader, BlockWriter};
use super::crc16;

pub const SUPER_BLOCK_MAGIC: u64 = u64::from_le_bytes(*b"sluicedb");
pub const MAJOR_VERSION: u8 = 0;
pub const MINOR_VERSION: u8 = 1;

/// Serialized size of a `BlockMeta`: offset + skeleton + total + crc.
pub const BLOCK_META_SIZE: usize = 8 + 4 + 4 + 2;

/// Where a block lives in the file. `crc` covers the skeleton prefix of
/// the stored bytes, so both full and skeleton-only reads can verify it;
/// payload sections carry their own descriptor checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMeta {
    pub offset: u64,
    pub skeleton_size: u32,
    pub total_size: u32,
    pub crc: u16,
}

impl BlockMeta {
    pub fn read_from(reader: &mut BlockReader<'_>) -> Result<BlockMeta> {
        Ok(BlockMeta {
            offset: reader.read_u64()?,
            skeleton_size: reader.read_u32()?,
            total_size: reader.read_u32()?,
            crc: reader.read_u16()?,
        })
    }

    pub fn write_to(&self, writer: &mut BlockWriter<'_>) -> Result<()> {
        writer.write_u64(self.offset)?;
        writer.write_u32(self.skeleton_size)?;
        writer.write_u32(self.total_size)?;
        writer.write_u16(self.crc)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct SuperBlock {
    pub index_meta: Option<BlockMeta>,
}

impl SuperBlock {
    /// Parses one superblock copy, verifying magic, version, and checksum.
    pub fn read_from(block: &Block) -> Result<SuperBlock> {
        let mut reader = BlockReader::new(block);

        let magic = reader.read_u64()?;
        ensure!(magic == SUPER_BLOCK_MAGIC, "bad superblock magic {:#x}", magic);

        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        ensure!(
            major == MAJOR_VERSION,
            "unsupported superblock version {}.{}",
            major,
            minor
        );

        let index_meta = if reader.read_bool()? {
            Some(BlockMeta::read_from(&mut reader)?)
        } else {
            None
        };

        let payload_len = reader.pos();
        let crc = reader.read_u16()?;
        let computed = crc16(block.window(0, payload_len));
        ensure!(
            crc == computed,
            "superblock crc mismatch: stored {:#06x}, computed {:#06x}",
            crc,
            computed
        );

        Ok(SuperBlock { index_meta })
    }

    /// Serializes into `block`, appending a checksum over the payload.
    pub fn write_to(&self, block: &mut Block) -> Result<()> {
        block.clear();
        let payload_len;
        {
            let mut writer = BlockWriter::new(block);
            writer.write_u64(SUPER_BLOCK_MAGIC)?;
            writer.write_u8(MAJOR_VERSION)?;
            writer.write_u8(MINOR_VERSION)?;

            match &self.index_meta {
                Some(meta) => {
                    writer.write_bool(true)?;
                    meta.write_to(&mut writer)?;
                }
                None => writer.write_bool(false)?,
            }
            payload_len = writer.pos();
        }

        let crc = crc16(block.window(0, payload_len));
        let mut writer = BlockWriter::new(block);
        writer.seek(payload_len);
        writer.write_u16(crc)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(sb: &SuperBlock) -> Block {
        let mut block = Block::with_capacity(4096).unwrap();
        sb.write_to(&mut block).unwrap();
        block
    }

    #[test]
    fn superblock_round_trips_without_index() {
        let block = encode(&SuperBlock { index_meta: None });

        let sb = SuperBlock::read_from(&block).unwrap();
        assert!(sb.index_meta.is_none());
    }

    #[test]
    fn superblock_round_trips_with_index() {
        let meta = BlockMeta {
            offset: 8192,
            skeleton_size: 100,
            total_size: 100,
            crc: 0xbeef,
        };
        let block = encode(&SuperBlock {
            index_meta: Some(meta),
        });

        let sb = SuperBlock::read_from(&block).unwrap();
        assert_eq!(sb.index_meta, Some(meta));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut block = encode(&SuperBlock { index_meta: None });
        {
            let mut writer = BlockWriter::new(&mut block);
            writer.seek(3);
            writer.write_u8(0xff).unwrap();
        }

        assert!(SuperBlock::read_from(&block).is_err());
    }

    #[test]
    fn crc_mismatch_is_rejected() {
        let meta = BlockMeta {
            offset: 8192,
            skeleton_size: 1,
            total_size: 2,
            crc: 3,
        };
        let mut block = encode(&SuperBlock {
            index_meta: Some(meta),
        });
        {
            // Corrupt a payload byte after the crc was computed.
            let mut writer = BlockWriter::new(&mut block);
            writer.seek(12);
            writer.write_u8(0xaa).unwrap();
        }

        assert!(SuperBlock::read_from(&block).is_err());
    }
}
