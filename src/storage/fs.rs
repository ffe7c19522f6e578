//! Filesystem-backed directory.
//!
//! Blocking reads and writes run on the calling thread through positional
//! I/O. Asynchronous operations are submitted over a channel to one
//! dedicated I/O thread per file, which performs the transfer and runs the
//! completion; the thread doubles as the completion thread the engine's
//! write-back path expects.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;
use tracing::error;

use super::block::AlignedBuf;
use super::file::{AsyncFile, Directory, IoCompletion};

pub struct FsDirectory {
    root: PathBuf,
}

impl FsDirectory {
    pub fn new(root: impl AsRef<Path>) -> Result<FsDirectory> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)
            .wrap_err_with(|| format!("cannot create directory {:?}", root))?;
        Ok(FsDirectory { root })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl Directory for FsDirectory {
    fn open_aio_file(&self, name: &str) -> Result<Arc<dyn AsyncFile>> {
        let path = self.path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .wrap_err_with(|| format!("cannot open {:?}", path))?;
        Ok(Arc::new(FsAsyncFile::start(file)))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let path = self.path(name);
        let meta = std::fs::metadata(&path)
            .wrap_err_with(|| format!("cannot stat {:?}", path))?;
        Ok(meta.len())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        std::fs::remove_file(&path).wrap_err_with(|| format!("cannot delete {:?}", path))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let from = self.path(from);
        let to = self.path(to);
        std::fs::rename(&from, &to)
            .wrap_err_with(|| format!("cannot rename {:?} to {:?}", from, to))
    }
}

enum IoRequest {
    Read {
        offset: u64,
        buf: AlignedBuf,
        completion: IoCompletion,
    },
    Write {
        offset: u64,
        buf: AlignedBuf,
        completion: IoCompletion,
    },
}

pub struct FsAsyncFile {
    file: Arc<File>,
    submit: Mutex<Option<Sender<IoRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FsAsyncFile {
    fn start(file: File) -> FsAsyncFile {
        let file = Arc::new(file);
        let (tx, rx) = channel::<IoRequest>();

        let io_file = Arc::clone(&file);
        let worker = std::thread::Builder::new()
            .name("sluicedb-io".into())
            .spawn(move || {
                while let Ok(req) = rx.recv() {
                    match req {
                        IoRequest::Read {
                            offset,
                            mut buf,
                            completion,
                        } => {
                            let ok = io_file.read_exact_at(&mut buf, offset).is_ok();
                            if !ok {
                                error!(offset, len = buf.len(), "async read failed");
                            }
                            completion(ok, buf);
                        }
                        IoRequest::Write {
                            offset,
                            buf,
                            completion,
                        } => {
                            let ok = io_file.write_all_at(&buf, offset).is_ok();
                            if !ok {
                                error!(offset, len = buf.len(), "async write failed");
                            }
                            completion(ok, buf);
                        }
                    }
                }
            })
            .expect("cannot spawn I/O thread");

        FsAsyncFile {
            file,
            submit: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn submit(&self, req: IoRequest) {
        let sender = self.submit.lock();
        match sender.as_ref() {
            Some(tx) => {
                // The worker only exits after the sender is dropped.
                tx.send(req).expect("I/O thread is gone");
            }
            None => {
                let (buf, completion) = match req {
                    IoRequest::Read {
                        buf, completion, ..
                    }
                    | IoRequest::Write {
                        buf, completion, ..
                    } => (buf, completion),
                };
                completion(false, buf);
            }
        }
    }
}

impl AsyncFile for FsAsyncFile {
    fn read(&self, offset: u64, buf: &mut AlignedBuf) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .wrap_err_with(|| format!("read of {} bytes at {} failed", buf.len(), offset))
    }

    fn write(&self, offset: u64, buf: &AlignedBuf) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .wrap_err_with(|| format!("write of {} bytes at {} failed", buf.len(), offset))
    }

    fn async_read(&self, offset: u64, buf: AlignedBuf, completion: IoCompletion) {
        self.submit(IoRequest::Read {
            offset,
            buf,
            completion,
        });
    }

    fn async_write(&self, offset: u64, buf: AlignedBuf, completion: IoCompletion) {
        self.submit(IoRequest::Write {
            offset,
            buf,
            completion,
        });
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .wrap_err_with(|| format!("truncate to {} failed", len))
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata().wrap_err("cannot stat file")?.len())
    }
}

impl Drop for FsAsyncFile {
    fn drop(&mut self) {
        // Closing the channel drains outstanding requests, then the worker
        // exits.
        self.submit.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
