//! The engine facade.
//!
//! `Database` wires the tree, cache, and layout to a directory and a data
//! file: one file per database, named `<name>.slu` inside the configured
//! directory. `flush` writes back every dirty node and persists the
//! layout metadata, after which a reopen sees exactly the flushed state.

use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tracing::{error, info};

use crate::btree::Tree;
use crate::cache::Cache;
use crate::config::Options;
use crate::storage::{AsyncFile, Directory, Layout};

const DATA_FILE_SUFFIX: &str = "slu";

pub struct Database {
    name: String,
    tree: Arc<Tree>,
    cache: Arc<Cache>,
    #[allow(dead_code)]
    layout: Arc<Layout>,
    #[allow(dead_code)]
    file: Arc<dyn AsyncFile>,
}

impl Database {
    /// Opens or creates the database `name` inside `opts.dir`.
    pub fn open(name: &str, opts: Options) -> Result<Database> {
        let dir: Arc<dyn Directory> = opts
            .dir
            .clone()
            .ok_or_else(|| eyre!("options carry no directory"))?;

        let filename = format!("{}.{}", name, DATA_FILE_SUFFIX);
        let length = if dir.file_exists(&filename) {
            dir.file_length(&filename)?
        } else {
            0
        };
        let create = length == 0;
        info!(name, length, create, "opening database");

        let file = dir
            .open_aio_file(&filename)
            .wrap_err_with(|| format!("cannot open data file {:?}", filename))?;
        let layout = Arc::new(Layout::new(Arc::clone(&file), length, opts.check_crc));
        layout.init(create).wrap_err("layout initialization failed")?;

        let cache = Cache::new(&opts);
        let tree = Tree::open(name, opts, Arc::clone(&cache), Arc::clone(&layout))
            .wrap_err("tree initialization failed")?;

        Ok(Database {
            name: name.to_string(),
            tree,
            cache,
            layout,
            file,
        })
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.tree.put(key, value)
    }

    pub fn del(&self, key: &[u8]) -> Result<()> {
        self.tree.del(key)
    }

    /// Returns an owned copy of the value, or `None` for a missing key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree.get(key)
    }

    /// Writes back all dirty nodes and persists the layout metadata.
    /// Blocks until in-flight writes drain.
    pub fn flush(&self) -> Result<()> {
        self.cache.flush_table(self.tree.table())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            error!(name = %self.name, "flush on close failed: {e:#}");
        }
        self.cache.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RamDirectory;

    fn ram_options() -> Options {
        Options {
            dir: Some(Arc::new(RamDirectory::new())),
            cache_writeback_interval_ms: 60_000,
            ..Options::default()
        }
    }

    #[test]
    fn open_requires_a_directory() {
        let opts = Options::default();
        assert!(Database::open("nodir", opts).is_err());
    }

    #[test]
    fn put_get_del_round_trip() {
        let db = Database::open("t", ram_options()).unwrap();

        db.put(b"alpha", b"1").unwrap();
        db.put(b"bravo", b"2").unwrap();
        assert_eq!(db.get(b"alpha").unwrap().unwrap(), b"1");

        db.del(b"alpha").unwrap();
        assert!(db.get(b"alpha").unwrap().is_none());
        assert_eq!(db.get(b"bravo").unwrap().unwrap(), b"2");
    }

    #[test]
    fn empty_keys_and_values_are_legal() {
        let db = Database::open("t", ram_options()).unwrap();

        db.put(b"", b"empty-key").unwrap();
        db.put(b"empty-value", b"").unwrap();

        assert_eq!(db.get(b"").unwrap().unwrap(), b"empty-key");
        assert_eq!(db.get(b"empty-value").unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn flush_then_reopen_preserves_data() {
        let opts = ram_options();

        {
            let db = Database::open("t", opts.clone()).unwrap();
            db.put(b"durable", b"yes").unwrap();
            db.flush().unwrap();
        }

        let db = Database::open("t", opts).unwrap();
        assert_eq!(db.get(b"durable").unwrap().unwrap(), b"yes");
    }

    #[test]
    fn overwrites_take_the_newest_value() {
        let db = Database::open("t", ram_options()).unwrap();

        db.put(b"k", b"old").unwrap();
        db.put(b"k", b"new").unwrap();
        assert_eq!(db.get(b"k").unwrap().unwrap(), b"new");

        // Idempotent delete.
        db.del(b"k").unwrap();
        db.del(b"k").unwrap();
        assert!(db.get(b"k").unwrap().is_none());
    }
}
