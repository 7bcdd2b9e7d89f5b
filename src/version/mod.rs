//! Version contexts carry a reader's snapshot bound into the page cache.
//!
//! The cache itself keeps only a single last-modifier marker per page. A write
//! cursor stamps the committing transaction id of its context onto the page; a
//! read cursor compares the stamp with its context's last closed transaction and
//! marks the context dirty when it sees a page from the future. What to do with
//! a dirty context is up to the layer above.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Transaction id used when no transaction is involved.
pub const BASE_TX_ID: u64 = 0;

/// Per-consumer snapshot bound consulted by cursors.
pub trait VersionContext: Send + Sync {
    /// Captures the current last closed transaction before a read.
    fn init_read(&self);
    /// Prepares a write performed on behalf of `committing_tx_id`.
    fn init_write(&self, committing_tx_id: u64);
    /// Transaction currently writing through this context.
    fn committing_tx_id(&self) -> u64;
    /// Highest transaction visible to the reader.
    fn last_closed_tx_id(&self) -> u64;
    /// Records that a page newer than the snapshot was observed.
    fn mark_as_dirty(&self);
    /// True once a newer page was observed since the last `init_read`.
    fn is_dirty(&self) -> bool;
}

/// Hands the cache the version context for the current caller.
pub trait VersionContextSupplier: Send + Sync {
    /// Returns the context to bind to a new cursor.
    fn version_context(&self) -> Arc<dyn VersionContext>;
}

/// Context that never tracks anything.
#[derive(Default, Debug, Clone, Copy)]
pub struct EmptyVersionContext;

impl VersionContext for EmptyVersionContext {
    fn init_read(&self) {}

    fn init_write(&self, _committing_tx_id: u64) {}

    fn committing_tx_id(&self) -> u64 {
        BASE_TX_ID
    }

    fn last_closed_tx_id(&self) -> u64 {
        u64::MAX
    }

    fn mark_as_dirty(&self) {}

    fn is_dirty(&self) -> bool {
        false
    }
}

/// Supplier returning a shared [`EmptyVersionContext`].
#[derive(Clone)]
pub struct EmptyVersionContextSupplier {
    ctx: Arc<dyn VersionContext>,
}

impl Default for EmptyVersionContextSupplier {
    fn default() -> Self {
        Self {
            ctx: Arc::new(EmptyVersionContext),
        }
    }
}

impl VersionContextSupplier for EmptyVersionContextSupplier {
    fn version_context(&self) -> Arc<dyn VersionContext> {
        Arc::clone(&self.ctx)
    }
}

/// Source of the highest closed transaction id, typically the transaction log.
pub type LastClosedTxSource = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Context bound to one transaction, fed by an external last-closed source.
pub struct TransactionVersionContext {
    source: LastClosedTxSource,
    committing: AtomicU64,
    last_closed: AtomicU64,
    dirty: AtomicBool,
}

impl TransactionVersionContext {
    /// Creates a context reading its snapshot bound from `source`.
    pub fn new(source: LastClosedTxSource) -> Self {
        Self {
            source,
            committing: AtomicU64::new(BASE_TX_ID),
            last_closed: AtomicU64::new(BASE_TX_ID),
            dirty: AtomicBool::new(false),
        }
    }
}

impl fmt::Debug for TransactionVersionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionVersionContext")
            .field("committing", &self.committing.load(Ordering::Relaxed))
            .field("last_closed", &self.last_closed.load(Ordering::Relaxed))
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

impl VersionContext for TransactionVersionContext {
    fn init_read(&self) {
        self.last_closed.store((self.source)(), Ordering::Release);
        self.dirty.store(false, Ordering::Release);
    }

    fn init_write(&self, committing_tx_id: u64) {
        debug_assert!(committing_tx_id > BASE_TX_ID, "write needs a real transaction id");
        self.committing.store(committing_tx_id, Ordering::Release);
    }

    fn committing_tx_id(&self) -> u64 {
        self.committing.load(Ordering::Acquire)
    }

    fn last_closed_tx_id(&self) -> u64 {
        self.last_closed.load(Ordering::Acquire)
    }

    fn mark_as_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }
}

/// Supplier that always returns the same context.
///
/// Useful when one thread owns the cache or in tests.
#[derive(Clone)]
pub struct FixedVersionContextSupplier {
    ctx: Arc<dyn VersionContext>,
}

impl FixedVersionContextSupplier {
    /// Wraps `ctx`.
    pub fn new(ctx: Arc<dyn VersionContext>) -> Self {
        Self { ctx }
    }
}

impl VersionContextSupplier for FixedVersionContextSupplier {
    fn version_context(&self) -> Arc<dyn VersionContext> {
        Arc::clone(&self.ctx)
    }
}
