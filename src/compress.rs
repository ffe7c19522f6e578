//! Optional block compression.
//!
//! Message buffers and leaf buckets are compressed individually so each can
//! still be read from disk on its own. The codec is treated as pure and is
//! called concurrently.

use eyre::{ensure, Result, WrapErr};

use crate::config::Compress;

#[derive(Debug, Clone, Copy)]
pub enum Compressor {
    Snappy,
}

impl Compressor {
    /// Builds the compressor configured in `compress`, if any.
    pub fn from_options(compress: Compress) -> Option<Compressor> {
        match compress {
            Compress::None => None,
            Compress::Snappy => Some(Compressor::Snappy),
        }
    }

    /// Upper bound on the compressed length of `n` input bytes.
    pub fn max_compressed_len(&self, n: usize) -> usize {
        match self {
            Compressor::Snappy => snap::raw::max_compress_len(n),
        }
    }

    /// Compresses `input` into `output`, returning the number of bytes
    /// written. `output` must be at least `max_compressed_len(input.len())`
    /// bytes.
    pub fn compress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        match self {
            Compressor::Snappy => snap::raw::Encoder::new()
                .compress(input, output)
                .wrap_err("snappy compression failed"),
        }
    }

    /// Decompresses `input` into `output`, which must be pre-sized to the
    /// recorded uncompressed length.
    pub fn uncompress(&self, input: &[u8], output: &mut [u8]) -> Result<()> {
        match self {
            Compressor::Snappy => {
                let len = snap::raw::decompress_len(input)
                    .wrap_err("snappy header is corrupt")?;
                ensure!(
                    len == output.len(),
                    "uncompressed length mismatch: {} != {}",
                    len,
                    output.len()
                );
                snap::raw::Decoder::new()
                    .decompress(input, output)
                    .wrap_err("snappy decompression failed")?;
                Ok(())
            }
        }
    }
}
