use std::io::{self, ErrorKind, IoSlice};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::FileIo;
use crate::types::{CacheError, Result};

/// Volatile in-memory file with switchable failure injection.
#[derive(Default)]
pub struct MemFileIo {
    bytes: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl MemFileIo {
    /// Creates an empty in-memory file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent read fail (or succeed again).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent write and sync fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful write calls so far; a vectored write counts once.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Number of successful sync calls so far.
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Copies the whole file content.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn injected(op: &'static str) -> CacheError {
        CacheError::Io(io::Error::new(ErrorKind::Other, op))
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Self::injected("injected read failure"));
        }
        let bytes = self.bytes.lock();
        let start = off as usize;
        let end = start + dst.len();
        if end > bytes.len() {
            return Err(CacheError::Io(io::Error::new(
                ErrorKind::UnexpectedEof,
                "read past end of memory file",
            )));
        }
        dst.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("injected write failure"));
        }
        let mut bytes = self.bytes.lock();
        let start = off as usize;
        let end = start + src.len();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(src);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn writev_at(&self, off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("injected write failure"));
        }
        let mut bytes = self.bytes.lock();
        let mut start = off as usize;
        for slice in bufs {
            let end = start + slice.len();
            if end > bytes.len() {
                bytes.resize(end, 0);
            }
            bytes[start..end].copy_from_slice(slice);
            start = end;
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Self::injected("injected sync failure"));
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.bytes.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.bytes.lock().resize(len as usize, 0);
        Ok(())
    }
}

/// Path-keyed collection of [`MemFileIo`] files.
///
/// Files outlive the mappings that use them, so a cache can be closed and
/// re-opened against the same content.
#[derive(Default, Clone)]
pub struct MemFileSystem {
    files: Arc<Mutex<FxHashMap<PathBuf, Arc<MemFileIo>>>>,
}

impl MemFileSystem {
    /// Creates an empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path`, creating an empty file when `create` is set.
    pub fn open(&self, path: &Path, create: bool) -> Result<Arc<MemFileIo>> {
        let mut files = self.files.lock();
        if let Some(file) = files.get(path) {
            return Ok(Arc::clone(file));
        }
        if !create {
            return Err(CacheError::Io(io::Error::new(
                ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }
        let file = Arc::new(MemFileIo::new());
        files.insert(path.to_path_buf(), Arc::clone(&file));
        Ok(file)
    }

    /// Returns the file at `path` if it exists.
    pub fn file(&self, path: &Path) -> Option<Arc<MemFileIo>> {
        self.files.lock().get(path).cloned()
    }
}
