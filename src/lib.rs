//! Page cache: a fixed-size buffer pool between record access and file storage.
//!
//! Files are mapped into a [`PageCache`] and accessed through [`PageCursor`]s.
//! Readers are optimistic and validate with a per-frame seqlock; writers take
//! an exclusive per-page lock. A clock sweep reclaims frames, writing dirty
//! pages back first, and [`PageCache::flush_and_force`] makes everything durable.

#![warn(missing_docs)]

pub mod logging;
pub mod primitives;
pub mod trace;
pub mod types;
pub mod version;

pub use primitives::pager::{
    CacheStats, IoLimiter, MapOptions, PageCache, PageCacheBuilder, PageCacheOptions, PageCursor,
    PagedFile, PfFlags, RateLimiter, Unlimited,
};
pub use types::{CacheError, FileId, PageId, Result};
