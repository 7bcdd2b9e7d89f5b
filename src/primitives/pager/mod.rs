//! Page cache: a fixed pool of frames over mapped files.

#![forbid(unsafe_code)]

mod cache;
mod cursor;
mod eviction;
mod frame;
mod limiter;
mod options;
mod paged_file;
mod swapper;
mod table;

pub use cache::{CacheStats, PageCache, PageCacheBuilder};
pub use cursor::{PageCursor, PfFlags};
pub use limiter::{IoLimiter, IoStamp, RateLimiter, Unlimited};
pub use options::PageCacheOptions;
pub use paged_file::{MapOptions, PagedFile};
pub use swapper::{
    MemSwapperFactory, PageSwapper, PageSwapperFactory, SingleFileSwapper, StdSwapperFactory,
};
