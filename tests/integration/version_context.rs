#![allow(missing_docs)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pagecache::primitives::io::MemFileSystem;
use pagecache::primitives::pager::MemSwapperFactory;
use pagecache::version::{
    FixedVersionContextSupplier, TransactionVersionContext, VersionContext,
};
use pagecache::{MapOptions, PageCache, PageCacheOptions, PageId, PagedFile, PfFlags, Result};

const PAGE_SIZE: usize = 512;

fn cache() -> Result<PageCache> {
    PageCache::builder(
        PageCacheOptions::default()
            .max_pages(8)
            .page_size(PAGE_SIZE)
            .keep_free(0)
            .background_eviction(false),
    )
    .swapper_factory(Arc::new(MemSwapperFactory::new(MemFileSystem::new())))
    .build()
}

fn context(last_closed: u64) -> Arc<TransactionVersionContext> {
    Arc::new(TransactionVersionContext::new(Arc::new(move || last_closed)))
}

fn write_as(file: &PagedFile, page: u64, tx: u64) -> Result<()> {
    let ctx = context(0);
    ctx.init_write(tx);
    let mut cursor = file.io_with_context(PageId(page), PfFlags::EXCLUSIVE_WRITE, ctx)?;
    assert!(cursor.next()?);
    cursor.put_u64(tx);
    Ok(())
}

#[test]
fn readers_behind_the_writer_see_a_dirty_context() -> Result<()> {
    let cache = cache()?;
    let file = cache.map("/versioned", PAGE_SIZE, MapOptions::create())?;
    write_as(&file, 0, 10)?;

    let behind = context(5);
    let mut cursor = file.io_with_context(PageId(0), PfFlags::SHARED_READ, behind.clone())?;
    assert!(cursor.next()?);
    assert_eq!(cursor.last_modifier(), 10);
    assert!(behind.is_dirty());
    drop(cursor);

    let current = context(10);
    let mut cursor = file.io_with_context(PageId(0), PfFlags::SHARED_READ, current.clone())?;
    assert!(cursor.next()?);
    assert!(!current.is_dirty());
    Ok(())
}

#[test]
fn opening_a_reader_resets_the_dirty_mark() -> Result<()> {
    let cache = cache()?;
    let file = cache.map("/reset", PAGE_SIZE, MapOptions::create())?;
    write_as(&file, 0, 7)?;

    let closed = Arc::new(AtomicU64::new(3));
    let source = Arc::clone(&closed);
    let ctx = Arc::new(TransactionVersionContext::new(Arc::new(move || {
        source.load(Ordering::SeqCst)
    })));
    let mut cursor = file.io_with_context(PageId(0), PfFlags::SHARED_READ, ctx.clone())?;
    assert!(cursor.next()?);
    assert!(ctx.is_dirty());
    drop(cursor);

    closed.store(7, Ordering::SeqCst);
    let mut cursor = file.io_with_context(PageId(0), PfFlags::SHARED_READ, ctx.clone())?;
    assert!(!ctx.is_dirty(), "init_read clears the mark");
    assert!(cursor.next()?);
    assert!(!ctx.is_dirty());
    assert_eq!(ctx.last_closed_tx_id(), 7);
    Ok(())
}

#[test]
fn marker_only_moves_forward() -> Result<()> {
    let cache = cache()?;
    let file = cache.map("/forward", PAGE_SIZE, MapOptions::create())?;
    write_as(&file, 0, 12)?;
    write_as(&file, 0, 4)?;
    let mut cursor = file.io(PageId(0), PfFlags::SHARED_READ)?;
    assert!(cursor.next()?);
    assert_eq!(cursor.last_modifier(), 12);
    assert_eq!(cursor.get_u64_at(0), 4);
    Ok(())
}

#[test]
fn builder_supplier_feeds_plain_cursors() -> Result<()> {
    let ctx = context(1);
    let cache = PageCache::builder(
        PageCacheOptions::default()
            .max_pages(8)
            .page_size(PAGE_SIZE)
            .background_eviction(false)
            .keep_free(0),
    )
    .swapper_factory(Arc::new(MemSwapperFactory::new(MemFileSystem::new())))
    .version_contexts(Arc::new(FixedVersionContextSupplier::new(ctx.clone())))
    .build()?;
    let file = cache.map("/supplied", PAGE_SIZE, MapOptions::create())?;

    ctx.init_write(3);
    {
        let mut writer = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        assert!(writer.next()?);
        writer.put_u32(99);
    }
    let mut reader = file.io(PageId(0), PfFlags::SHARED_READ)?;
    assert!(reader.next()?);
    assert_eq!(reader.last_modifier(), 3);
    assert!(ctx.is_dirty(), "last closed is 1, page was written by 3");
    Ok(())
}

#[test]
fn marker_is_not_persisted_across_eviction() -> Result<()> {
    let cache = cache()?;
    let file = cache.map("/evicted", PAGE_SIZE, MapOptions::create())?;
    write_as(&file, 0, 10)?;
    assert_eq!(cache.evict(8)?, 1);

    let ctx = context(5);
    let mut cursor = file.io_with_context(PageId(0), PfFlags::SHARED_READ, ctx.clone())?;
    assert!(cursor.next()?);
    assert_eq!(cursor.last_modifier(), 0);
    assert!(!ctx.is_dirty());
    assert_eq!(cursor.get_u64_at(0), 10);
    Ok(())
}
