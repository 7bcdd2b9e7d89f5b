//! Low-level primitives the page cache is built from.
//!
//! Includes positioned file I/O, background job scheduling and the paging
//! subsystem itself.

/// Background job scheduling and spin backoff.
pub mod concurrency;

/// Positioned file I/O over real files and in-memory files.
pub mod io;

/// Frames, mapped files, cursors, eviction and flushing.
pub mod pager;
