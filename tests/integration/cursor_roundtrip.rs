#![allow(missing_docs)]

use std::io::ErrorKind;
use std::path::Path;
use std::sync::{Arc, Once};

use pagecache::logging::init_logging;
use pagecache::primitives::io::MemFileSystem;
use pagecache::primitives::pager::MemSwapperFactory;
use pagecache::{
    CacheError, MapOptions, PageCache, PageCacheOptions, PageCursor, PageId, PfFlags, Result,
    Unlimited,
};
use proptest::prelude::*;
use tempfile::tempdir;

const RECORD_SIZE: usize = 9;
const MAX_PAGES: usize = 20;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        init_logging("pagecache=warn");
    });
}

/// Four big-endian bytes of `id + 1`, then a byte counter continuing from there.
fn record_for_id(id: u64) -> [u8; RECORD_SIZE] {
    let mut record = [0u8; RECORD_SIZE];
    let mut x = (id + 1) as u32;
    record[..4].copy_from_slice(&x.to_be_bytes());
    for byte in &mut record[4..] {
        x = x.wrapping_add(1);
        *byte = (x & 0xFF) as u8;
    }
    record
}

fn options(page_size: usize) -> PageCacheOptions {
    PageCacheOptions::default()
        .max_pages(MAX_PAGES)
        .page_size(page_size)
        .keep_free(2)
}

fn read_page_records(cursor: &mut PageCursor, records: usize) -> Result<Vec<[u8; RECORD_SIZE]>> {
    let mut out = vec![[0u8; RECORD_SIZE]; records];
    loop {
        cursor.set_offset(0);
        for record in out.iter_mut() {
            cursor.get_bytes(record);
        }
        if !cursor.should_retry()? {
            break;
        }
    }
    cursor.check_and_clear_bounds_flag()?;
    Ok(out)
}

fn roundtrip_at(page_size: usize) -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join(format!("records-{page_size}.bin"));
    let records_per_page = page_size / RECORD_SIZE;
    let record_count = 5 * MAX_PAGES * records_per_page;
    let pages = (record_count / records_per_page) as u64;

    {
        let cache = PageCache::open(options(page_size))?;
        let file = cache.map(&path, page_size, MapOptions::create())?;
        let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        let mut id = 0u64;
        while (id as usize) < record_count {
            assert!(cursor.next()?);
            for _ in 0..records_per_page {
                cursor.put_bytes(&record_for_id(id));
                id += 1;
            }
            cursor.check_and_clear_bounds_flag()?;
        }
        drop(cursor);
        assert_eq!(file.page_count(), pages);
        file.close()?;
        cache.close()?;
    }

    let cache = PageCache::open(options(page_size))?;
    let file = cache.map(&path, page_size, MapOptions::default())?;
    assert_eq!(file.page_count(), pages);
    let mut cursor = file.io(PageId(0), PfFlags::SHARED_READ)?;
    let mut id = 0u64;
    while cursor.next()? {
        for record in read_page_records(&mut cursor, records_per_page)? {
            assert_eq!(record, record_for_id(id), "record {id}");
            id += 1;
        }
    }
    assert_eq!(id as usize, record_count);
    Ok(())
}

#[test]
fn records_roundtrip_through_4k_pages() -> Result<()> {
    roundtrip_at(4096)
}

#[test]
fn records_roundtrip_through_8k_pages() -> Result<()> {
    roundtrip_at(8192)
}

#[test]
fn pages_never_written_read_as_zero() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("sparse.bin");
    let cache = PageCache::open(options(4096))?;
    let file = cache.map(&path, 4096, MapOptions::create())?;
    {
        let mut cursor = file.io(PageId(3), PfFlags::EXCLUSIVE_WRITE)?;
        assert!(cursor.next()?);
        cursor.put_u64(0xDEAD_BEEF);
    }
    file.flush_and_force(&Unlimited)?;
    assert_eq!(std::fs::metadata(&path)?.len(), 4 * 4096);
    assert_eq!(cache.evict(MAX_PAGES)?, 1);

    let mut cursor = file.io(PageId(0), PfFlags::SHARED_READ)?;
    for page in 0..3u64 {
        assert!(cursor.next()?);
        assert_eq!(cursor.current_page_id(), Some(PageId(page)));
        let mut bytes = vec![0xAAu8; 4096];
        loop {
            cursor.set_offset(0);
            cursor.get_bytes(&mut bytes);
            if !cursor.should_retry()? {
                break;
            }
        }
        assert!(bytes.iter().all(|b| *b == 0), "page {page} is not zero-filled");
    }
    assert!(cursor.next()?);
    assert_eq!(cursor.get_u64_at(0), 0xDEAD_BEEF);
    assert!(!cursor.next()?, "readers stop at the last page");
    Ok(())
}

#[test]
fn faulting_beyond_physical_end_zero_fills() -> Result<()> {
    let fs = MemFileSystem::new();
    let cache = PageCache::builder(options(512).background_eviction(false))
        .swapper_factory(Arc::new(MemSwapperFactory::new(fs.clone())))
        .build()?;
    let file = cache.map("/grow", 512, MapOptions::create())?;
    let mut cursor = file.io(PageId(7), PfFlags::EXCLUSIVE_WRITE)?;
    assert!(cursor.next()?);
    assert_eq!(cursor.get_u64_at(504), 0);
    assert_eq!(file.last_page_id(), Some(PageId(7)));
    // Growth is logical until the page is flushed.
    assert_eq!(fs.file(Path::new("/grow")).unwrap().snapshot().len(), 0);
    drop(cursor);
    cache.flush_and_force(&Unlimited)?;
    assert_eq!(fs.file(Path::new("/grow")).unwrap().snapshot().len(), 8 * 512);
    Ok(())
}

#[test]
fn no_fault_cursor_only_sees_resident_pages() -> Result<()> {
    let fs = MemFileSystem::new();
    let cache = PageCache::builder(options(256).background_eviction(false))
        .swapper_factory(Arc::new(MemSwapperFactory::new(fs)))
        .build()?;
    let file = cache.map("/nofault", 256, MapOptions::create())?;
    {
        let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        assert!(cursor.next()?);
        assert!(cursor.next()?);
        cursor.put_u32(11);
    }
    assert_eq!(cache.evict(MAX_PAGES)?, 2);

    let mut cursor = file.io(PageId(1), PfFlags::SHARED_READ | PfFlags::NO_FAULT)?;
    assert!(matches!(cursor.next(), Err(CacheError::NoFault(PageId(1)))));

    let mut loader = file.io(PageId(1), PfFlags::SHARED_READ)?;
    assert!(loader.next()?);
    drop(loader);

    assert!(cursor.next_to(PageId(1))?);
    assert_eq!(cursor.get_u32_at(0), 11);
    assert!(!cursor.should_retry()?);
    Ok(())
}

#[test]
fn mapping_rules() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("mapped.bin");
    let cache = PageCache::open(options(8192))?;

    let missing = cache.map(&path, 8192, MapOptions::default());
    assert!(matches!(missing, Err(CacheError::Io(err)) if err.kind() == ErrorKind::NotFound));

    let first = cache.map(&path, 8192, MapOptions::create())?;
    let second = cache.map(&path, 8192, MapOptions::default())?;
    assert_eq!(cache.stats().mapped_files, 1);
    assert!(matches!(
        cache.map(&path, 4096, MapOptions::default()),
        Err(CacheError::MappingConflict { existing: 8192, requested: 4096, .. })
    ));

    {
        let mut cursor = first.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        assert!(cursor.next()?);
        cursor.put_i64(-42);
    }
    // Both handles share one mapping, so the write is visible through either.
    let mut cursor = second.io(PageId(0), PfFlags::SHARED_READ)?;
    assert!(cursor.next()?);
    assert_eq!(cursor.get_i64(), -42);
    drop(cursor);

    first.close()?;
    assert_eq!(cache.stats().mapped_files, 1);
    second.close()?;
    assert_eq!(cache.stats().mapped_files, 0);
    assert_eq!(cache.stats().resident, 0);

    let truncated = cache.map(&path, 4096, MapOptions::create().truncate_existing())?;
    assert_eq!(truncated.page_count(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn random_writes_read_back(
        writes in prop::collection::vec((0u64..40, 0usize..31, any::<u32>()), 1..64)
    ) {
        let cache = PageCache::builder(
            PageCacheOptions::default()
                .max_pages(8)
                .page_size(128)
                .keep_free(0)
                .background_eviction(false),
        )
        .swapper_factory(Arc::new(MemSwapperFactory::new(MemFileSystem::new())))
        .build()
        .unwrap();
        let file = cache.map("/prop", 128, MapOptions::create()).unwrap();
        let mut expected = std::collections::BTreeMap::new();
        for (page, slot, value) in &writes {
            let mut cursor = file.io(PageId(*page), PfFlags::EXCLUSIVE_WRITE).unwrap();
            prop_assert!(cursor.next().unwrap());
            cursor.put_u32_at(slot * 4, *value);
            expected.insert((*page, *slot), *value);
        }
        for ((page, slot), value) in expected {
            let mut cursor = file.io(PageId(page), PfFlags::SHARED_READ).unwrap();
            prop_assert!(cursor.next().unwrap());
            let read = loop {
                let read = cursor.get_u32_at(slot * 4);
                if !cursor.should_retry().unwrap() {
                    break read;
                }
            };
            prop_assert_eq!(read, value);
        }
    }
}
