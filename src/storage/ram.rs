//! In-memory directory for tests.
//!
//! File images live in the directory's map, so a table can be "reopened"
//! within a process and observe what an earlier instance flushed.
//! Asynchronous operations complete inline on the submitting thread.

use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;

use super::block::AlignedBuf;
use super::file::{AsyncFile, Directory, IoCompletion};

#[derive(Default)]
pub struct RamDirectory {
    files: RwLock<HashMap<String, Arc<RamFile>>>,
}

impl RamDirectory {
    pub fn new() -> RamDirectory {
        RamDirectory::default()
    }
}

impl Directory for RamDirectory {
    fn open_aio_file(&self, name: &str) -> Result<Arc<dyn AsyncFile>> {
        let mut files = self.files.write();
        let file = files
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RamFile::default()));
        Ok(Arc::clone(file) as Arc<dyn AsyncFile>)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        match self.files.read().get(name) {
            Some(file) => Ok(file.data.read().len() as u64),
            None => Ok(0),
        }
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        if self.files.write().remove(name).is_none() {
            bail!("no such file {:?}", name);
        }
        Ok(())
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write();
        let Some(file) = files.remove(from) else {
            bail!("no such file {:?}", from);
        };
        files.insert(to.to_string(), file);
        Ok(())
    }
}

#[derive(Default)]
pub struct RamFile {
    data: RwLock<Vec<u8>>,
}

impl RamFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.read();
        let start = offset as usize;
        if start + buf.len() > data.len() {
            bail!(
                "read of {} bytes at {} beyond file end {}",
                buf.len(),
                offset,
                data.len()
            );
        }
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, offset: u64, buf: &[u8]) {
        let mut data = self.data.write();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
    }
}

impl AsyncFile for RamFile {
    fn read(&self, offset: u64, buf: &mut AlignedBuf) -> Result<()> {
        self.read_at(offset, buf)
    }

    fn write(&self, offset: u64, buf: &AlignedBuf) -> Result<()> {
        self.write_at(offset, buf);
        Ok(())
    }

    fn async_read(&self, offset: u64, mut buf: AlignedBuf, completion: IoCompletion) {
        let ok = self.read_at(offset, &mut buf).is_ok();
        completion(ok, buf);
    }

    fn async_write(&self, offset: u64, buf: AlignedBuf, completion: IoCompletion) {
        self.write_at(offset, &buf);
        completion(true, buf);
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}
