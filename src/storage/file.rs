//! The filesystem collaborator boundary.
//!
//! The engine owns exactly one data file per table, reached through a
//! `Directory`. Files speak positional, page-aligned I/O: blocking reads
//! and writes on the caller's thread, and asynchronous writes whose
//! completions arrive on a thread owned by the file implementation.
//! Completion callbacks receive the buffer back so the submitter keeps
//! ownership across the operation.

use std::sync::Arc;

use eyre::Result;

use super::block::AlignedBuf;

/// Called on the file's I/O thread when an asynchronous operation
/// completes. `ok` reports success; the buffer is returned to the caller.
pub type IoCompletion = Box<dyn FnOnce(bool, AlignedBuf) + Send + 'static>;

pub trait AsyncFile: Send + Sync {
    /// Blocking positional read filling all of `buf`. `offset` and
    /// `buf.len()` must be page-aligned.
    fn read(&self, offset: u64, buf: &mut AlignedBuf) -> Result<()>;

    /// Blocking positional write of all of `buf`.
    fn write(&self, offset: u64, buf: &AlignedBuf) -> Result<()>;

    /// Asynchronous positional read into `buf`; completion runs on the
    /// file's I/O thread.
    fn async_read(&self, offset: u64, buf: AlignedBuf, completion: IoCompletion);

    /// Asynchronous positional write of `buf`; completion runs on the
    /// file's I/O thread.
    fn async_write(&self, offset: u64, buf: AlignedBuf, completion: IoCompletion);

    /// Shrinks or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current file length.
    fn len(&self) -> Result<u64>;
}

pub trait Directory: Send + Sync {
    fn open_aio_file(&self, name: &str) -> Result<Arc<dyn AsyncFile>>;

    fn file_exists(&self, name: &str) -> bool;

    fn file_length(&self, name: &str) -> Result<u64>;

    fn delete_file(&self, name: &str) -> Result<()>;

    fn rename_file(&self, from: &str, to: &str) -> Result<()>;
}
