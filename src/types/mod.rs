//! Identifiers and the error type shared by every page cache component.

#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Identity of a mapped file inside one cache instance.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileId(pub u32);

/// Zero-based page number within a mapped file.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PageId(pub u64);

/// Index of a frame in the frame arena.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FrameId(pub u32);

impl PageId {
    /// Returns the page that follows this one, or `None` at `u64::MAX`.
    pub fn next(self) -> Option<PageId> {
        self.0.checked_add(1).map(PageId)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "file:{}", self.0)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame:{}", self.0)
    }
}

impl From<u64> for PageId {
    fn from(value: u64) -> Self {
        PageId(value)
    }
}

/// Errors surfaced by the page cache.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    /// Plain IO failure from a storage collaborator.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Swapping a page in failed; the cursor that faulted must be abandoned.
    #[error("page fault failed for page {page} of {path:?}: {source}")]
    PageFault {
        /// File being read.
        path: PathBuf,
        /// Page being faulted in.
        page: PageId,
        /// Underlying IO failure.
        #[source]
        source: io::Error,
    },
    /// Writing a dirty page back failed; the cache is degraded afterwards.
    #[error("flush failed for page {page} of {path:?}: {source}")]
    FlushFailed {
        /// File being written.
        path: PathBuf,
        /// First page of the failed write.
        page: PageId,
        /// Underlying IO failure.
        #[source]
        source: io::Error,
    },
    /// Every frame is pinned; callers must reduce concurrency.
    #[error("page cache exhausted: all {capacity} frames are pinned")]
    CacheExhausted {
        /// Configured number of frames.
        capacity: usize,
    },
    /// The file is already mapped with a different page size.
    #[error("{path:?} is already mapped with page size {existing}, requested {requested}")]
    MappingConflict {
        /// Mapped file.
        path: PathBuf,
        /// Page size of the live mapping.
        existing: usize,
        /// Page size asked for.
        requested: usize,
    },
    /// The page is not resident and the cursor was opened with no-fault.
    #[error("page {0} is not resident and faulting is disabled")]
    NoFault(PageId),
    /// The cache or file still has pinned pages.
    #[error("{0} page pins are still outstanding")]
    PinsOutstanding(usize),
    /// A flush reached a page the calling thread is still writing through a cursor.
    #[error("page {0} is write-locked by a cursor on the flushing thread")]
    WriteLockedByCaller(PageId),
    /// The cache has been closed.
    #[error("page cache is closed")]
    Closed,
    /// A previous flush failure left the cache unusable until re-opened.
    #[error("page cache is degraded after a flush failure; close and re-open it")]
    Degraded,
    /// A cursor access fell outside the page.
    #[error("cursor access out of bounds at page {page} offset {offset}")]
    OutOfBounds {
        /// Page the cursor was bound to.
        page: PageId,
        /// Offset of the offending access.
        offset: usize,
    },
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Options could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CacheError {
    /// Returns true when the error leaves the cache unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CacheError::FlushFailed { .. } | CacheError::Degraded)
    }

    /// Unwraps a plain IO error, or wraps any other variant into one.
    ///
    /// Used where a collaborator failure is re-reported with page context.
    pub fn into_io_error(self) -> io::Error {
        match self {
            CacheError::Io(err) => err,
            CacheError::PageFault { source, .. } | CacheError::FlushFailed { source, .. } => source,
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CacheError>;
