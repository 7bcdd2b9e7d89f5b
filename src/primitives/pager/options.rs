use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::types::{CacheError, Result};

/// Sizing and tuning knobs for a [`PageCache`](super::PageCache).
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PageCacheOptions {
    /// Number of frames in the arena.
    pub max_pages: usize,
    /// Size of each frame in bytes; mapped files may use this size or smaller.
    pub page_size: usize,
    /// Free frames the background evictor tries to keep available.
    pub keep_free: usize,
    /// Period of the background eviction sweep in milliseconds.
    pub eviction_period_ms: u64,
    /// Whether to run the background evictor at all.
    pub background_eviction: bool,
    /// Maximum number of consecutive pages written by one flush IO.
    pub flush_batch_pages: usize,
}

impl Default for PageCacheOptions {
    fn default() -> Self {
        Self {
            max_pages: 1024,
            page_size: 8192,
            keep_free: 16,
            eviction_period_ms: 50,
            background_eviction: true,
            flush_batch_pages: 32,
        }
    }
}

impl PageCacheOptions {
    /// Sets the number of frames.
    pub fn max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Sets the frame size.
    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the free-frame target of the background evictor.
    pub fn keep_free(mut self, keep_free: usize) -> Self {
        self.keep_free = keep_free;
        self
    }

    /// Sets the sweep period.
    pub fn eviction_period(mut self, period: Duration) -> Self {
        self.eviction_period_ms = period.as_millis() as u64;
        self
    }

    /// Enables or disables the background evictor.
    pub fn background_eviction(mut self, enabled: bool) -> Self {
        self.background_eviction = enabled;
        self
    }

    /// Sets the flush run length.
    pub fn flush_batch_pages(mut self, pages: usize) -> Self {
        self.flush_batch_pages = pages;
        self
    }

    /// Parses options from TOML text; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: Self = toml::from_str(text).map_err(|err| CacheError::Config(err.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| CacheError::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Checks that the options describe a usable cache.
    pub fn validate(&self) -> Result<()> {
        if self.max_pages < 2 {
            return Err(CacheError::Invalid("max_pages must be at least 2"));
        }
        if self.max_pages >= (u32::MAX - 1) as usize {
            return Err(CacheError::Invalid("max_pages exceeds the frame id space"));
        }
        if self.page_size == 0 {
            return Err(CacheError::Invalid("page_size must be positive"));
        }
        if self.keep_free >= self.max_pages {
            return Err(CacheError::Invalid("keep_free must be below max_pages"));
        }
        if self.flush_batch_pages == 0 {
            return Err(CacheError::Invalid("flush_batch_pages must be positive"));
        }
        Ok(())
    }

    pub(crate) fn eviction_period_duration(&self) -> Duration {
        Duration::from_millis(self.eviction_period_ms.max(1))
    }
}
