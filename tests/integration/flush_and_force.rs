#![allow(missing_docs)]

use std::io::IoSlice;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use pagecache::primitives::io::MemFileSystem;
use pagecache::primitives::pager::{
    IoStamp, MemSwapperFactory, PageSwapper, PageSwapperFactory,
};
use pagecache::trace::CountingTracer;
use pagecache::{
    CacheError, IoLimiter, MapOptions, PageCache, PageCacheOptions, PageId, PagedFile, PfFlags,
    RateLimiter, Result, Unlimited,
};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const PAGE_SIZE: usize = 256;

type WriteLog = Arc<Mutex<Vec<(PathBuf, u64, usize)>>>;

/// Records every write as (file, first page, page count).
struct RecordingSwapper {
    inner: Arc<dyn PageSwapper>,
    log: WriteLog,
}

impl PageSwapper for RecordingSwapper {
    fn path(&self) -> &Path {
        self.inner.path()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn read(&self, page: PageId, dst: &mut [u8]) -> Result<usize> {
        self.inner.read(page, dst)
    }

    fn write(&self, page: PageId, src: &[u8]) -> Result<()> {
        self.log.lock().push((self.path().to_path_buf(), page.0, 1));
        self.inner.write(page, src)
    }

    fn write_run(&self, first: PageId, pages: &[IoSlice<'_>]) -> Result<()> {
        self.log
            .lock()
            .push((self.path().to_path_buf(), first.0, pages.len()));
        self.inner.write_run(first, pages)
    }

    fn force(&self) -> Result<()> {
        self.inner.force()
    }

    fn last_page_id(&self) -> Result<Option<PageId>> {
        self.inner.last_page_id()
    }

    fn truncate(&self) -> Result<()> {
        self.inner.truncate()
    }
}

struct RecordingFactory {
    inner: MemSwapperFactory,
    log: WriteLog,
}

impl PageSwapperFactory for RecordingFactory {
    fn open(&self, path: &Path, page_size: usize, create: bool) -> Result<Arc<dyn PageSwapper>> {
        Ok(Arc::new(RecordingSwapper {
            inner: self.inner.open(path, page_size, create)?,
            log: Arc::clone(&self.log),
        }))
    }
}

#[derive(Default)]
struct CountingLimiter {
    calls: AtomicUsize,
}

impl IoLimiter for CountingLimiter {
    fn maybe_limit_io(&self, previous: IoStamp, recently_completed: usize) -> IoStamp {
        self.calls.fetch_add(1, Ordering::SeqCst);
        IoStamp(previous.0 + recently_completed as u64)
    }
}

struct Setup {
    cache: PageCache,
    fs: MemFileSystem,
    log: WriteLog,
    tracer: Arc<CountingTracer>,
}

fn setup(batch: usize) -> Result<Setup> {
    let fs = MemFileSystem::new();
    let log: WriteLog = Arc::default();
    let tracer = Arc::new(CountingTracer::new());
    let cache = PageCache::builder(
        PageCacheOptions::default()
            .max_pages(64)
            .page_size(PAGE_SIZE)
            .keep_free(0)
            .background_eviction(false)
            .flush_batch_pages(batch),
    )
    .swapper_factory(Arc::new(RecordingFactory {
        inner: MemSwapperFactory::new(fs.clone()),
        log: Arc::clone(&log),
    }))
    .tracer(tracer.clone())
    .build()?;
    Ok(Setup {
        cache,
        fs,
        log,
        tracer,
    })
}

fn touch(file: &PagedFile, page: u64) -> Result<()> {
    let mut cursor = file.io(PageId(page), PfFlags::EXCLUSIVE_WRITE)?;
    assert!(cursor.next()?);
    cursor.put_u64(page * 3 + 1);
    Ok(())
}

#[test]
fn flush_leaves_every_page_clean() -> Result<()> {
    let s = setup(4)?;
    let file = s.cache.map("/clean", PAGE_SIZE, MapOptions::create())?;
    for page in 0..10 {
        touch(&file, page)?;
    }
    assert_eq!(s.cache.stats().dirty, 10);
    s.cache.flush_and_force(&Unlimited)?;
    assert_eq!(s.cache.stats().dirty, 0);
    let snap = s.tracer.snapshot();
    assert_eq!(snap.pages_flushed, 10);
    assert_eq!(snap.flushes, 3, "runs of 4, 4 and 2 pages");
    assert_eq!(snap.bytes_written, 10 * PAGE_SIZE as u64);
    let sizes: Vec<usize> = s.log.lock().iter().map(|(_, _, n)| *n).collect();
    assert_eq!(sizes, vec![4, 4, 2]);
    assert_eq!(s.fs.file(Path::new("/clean")).unwrap().sync_count(), 1);

    // Nothing left to write on a second flush.
    s.cache.flush_and_force(&Unlimited)?;
    assert_eq!(s.tracer.snapshot().flushes, 3);
    Ok(())
}

#[test]
fn flush_waits_for_a_writer_on_another_thread() -> Result<()> {
    let s = setup(4)?;
    let file = Arc::new(s.cache.map("/busy", PAGE_SIZE, MapOptions::create())?);
    {
        let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        assert!(cursor.next()?);
        cursor.put_u64(0xABCD);
    }
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder = {
        let file = Arc::clone(&file);
        thread::spawn(move || -> Result<()> {
            let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
            assert!(cursor.next()?);
            locked_tx.send(()).expect("flushing thread is gone");
            thread::sleep(Duration::from_millis(50));
            cursor.put_u64_at(8, 0xEF);
            Ok(())
        })
    };
    locked_rx.recv().expect("holder never locked page 0");
    s.cache.flush_and_force(&Unlimited)?;
    holder.join().expect("holder panicked")?;

    let content = s.fs.file(Path::new("/busy")).unwrap().snapshot();
    assert_eq!(content.len(), PAGE_SIZE);
    assert_eq!(content[..8], 0xABCDu64.to_be_bytes());
    assert_eq!(content[8..16], 0xEFu64.to_be_bytes());
    assert_eq!(s.cache.stats().dirty, 0);
    Ok(())
}

#[test]
fn flush_from_the_writing_thread_is_refused() -> Result<()> {
    let s = setup(4)?;
    let file = s.cache.map("/own", PAGE_SIZE, MapOptions::create())?;
    touch(&file, 0)?;
    let mut cursor = file.io(PageId(1), PfFlags::EXCLUSIVE_WRITE)?;
    assert!(cursor.next()?);
    cursor.put_u64(5);
    let err = s.cache.flush_and_force(&Unlimited).unwrap_err();
    assert!(matches!(err, CacheError::WriteLockedByCaller(PageId(1))), "{err}");
    assert!(!s.cache.is_degraded());
    assert_eq!(s.cache.stats().dirty, 2, "page 0 is re-dirtied with its run");

    drop(cursor);
    s.cache.flush_and_force(&Unlimited)?;
    assert_eq!(s.cache.stats().dirty, 0);
    let content = s.fs.file(Path::new("/own")).unwrap().snapshot();
    assert_eq!(content[PAGE_SIZE..PAGE_SIZE + 8], 5u64.to_be_bytes());
    Ok(())
}

#[test]
fn flush_order_is_ascending_by_file_then_page() -> Result<()> {
    let s = setup(1)?;
    let a = s.cache.map("/a", PAGE_SIZE, MapOptions::create())?;
    let b = s.cache.map("/b", PAGE_SIZE, MapOptions::create())?;
    let mut work: Vec<(bool, u64)> = (0..12).flat_map(|p| [(true, p), (false, p)]).collect();
    work.shuffle(&mut ChaCha8Rng::seed_from_u64(7));
    for (first_file, page) in work {
        touch(if first_file { &a } else { &b }, page)?;
    }
    s.cache.flush_and_force(&Unlimited)?;
    let log = s.log.lock().clone();
    assert_eq!(log.len(), 24);
    let mut sorted = log.clone();
    sorted.sort();
    assert_eq!(log, sorted);
    assert_eq!(log[0].0, PathBuf::from("/a"));
    assert_eq!(log[23].0, PathBuf::from("/b"));
    Ok(())
}

#[test]
fn limiter_sees_one_call_per_run() -> Result<()> {
    let s = setup(2)?;
    let file = s.cache.map("/limited", PAGE_SIZE, MapOptions::create())?;
    for page in 0..6 {
        touch(&file, page)?;
    }
    let limiter = CountingLimiter::default();
    file.flush_and_force(&limiter)?;
    assert_eq!(limiter.calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn rate_limiter_spreads_runs_over_time() -> Result<()> {
    let s = setup(8)?;
    let file = s.cache.map("/slow", PAGE_SIZE, MapOptions::create())?;
    for page in [0u64, 2, 4, 6, 8] {
        touch(&file, page)?;
    }
    // 100 IO/s is one IO per 10ms quantum; five runs span at least four quanta.
    let start = Instant::now();
    s.cache.flush_and_force(&RateLimiter::new(100))?;
    assert!(start.elapsed() >= Duration::from_millis(40));
    assert_eq!(s.log.lock().len(), 5);
    Ok(())
}

#[test]
fn flush_failure_degrades_and_is_not_retried() -> Result<()> {
    let s = setup(4)?;
    let file = s.cache.map("/broken", PAGE_SIZE, MapOptions::create())?;
    touch(&file, 0)?;
    let mem = s.fs.file(Path::new("/broken")).unwrap();
    mem.set_fail_writes(true);
    let err = s.cache.flush_and_force(&Unlimited).unwrap_err();
    assert!(matches!(err, CacheError::FlushFailed { page: PageId(0), .. }), "{err}");
    assert!(err.is_fatal());
    assert!(s.cache.is_degraded());
    assert_eq!(s.tracer.snapshot().flush_failures, 1);
    assert_eq!(s.cache.stats().dirty, 1, "failed page stays dirty");

    mem.set_fail_writes(false);
    assert!(matches!(s.cache.flush_and_force(&Unlimited), Err(CacheError::Degraded)));
    assert!(matches!(file.flush_and_force(&Unlimited), Err(CacheError::Degraded)));
    assert_eq!(mem.write_count(), 0);
    drop(file);
    s.cache.close()?;
    Ok(())
}

#[test]
fn per_file_flush_leaves_other_files_dirty() -> Result<()> {
    let s = setup(4)?;
    let a = s.cache.map("/pa", PAGE_SIZE, MapOptions::create())?;
    let b = s.cache.map("/pb", PAGE_SIZE, MapOptions::create())?;
    touch(&a, 0)?;
    touch(&b, 0)?;
    touch(&b, 1)?;
    a.flush_and_force(&Unlimited)?;
    assert_eq!(s.cache.stats().dirty, 2);
    assert_eq!(s.fs.file(Path::new("/pb")).unwrap().write_count(), 0);
    Ok(())
}

#[test]
fn close_refuses_while_cursors_pin_pages() -> Result<()> {
    let s = setup(4)?;
    let file = s.cache.map("/pinned", PAGE_SIZE, MapOptions::create())?;
    touch(&file, 0)?;
    let mut reader = file.io(PageId(0), PfFlags::SHARED_READ)?;
    assert!(reader.next()?);
    assert!(matches!(s.cache.close(), Err(CacheError::PinsOutstanding(1))));
    // The refused close left the cache open.
    assert_eq!(reader.get_u64_at(0), 1);
    let mut second = file.io(PageId(0), PfFlags::SHARED_READ)?;
    assert!(second.next()?);
    drop(second);
    drop(reader);
    s.cache.close()?;
    let content = s.fs.file(Path::new("/pinned")).unwrap().snapshot();
    assert_eq!(content[..8], 1u64.to_be_bytes());
    assert!(matches!(file.io(PageId(0), PfFlags::SHARED_READ), Err(CacheError::Closed)));
    Ok(())
}

#[test]
fn close_returns_every_frame_to_the_free_list() -> Result<()> {
    let s = setup(4)?;
    let a = s.cache.map("/fa", PAGE_SIZE, MapOptions::create())?;
    let b = s.cache.map("/fb", PAGE_SIZE, MapOptions::create())?;
    for page in 0..5 {
        touch(&a, page)?;
        touch(&b, page)?;
    }
    let before = s.cache.stats();
    assert_eq!(before.resident, 10);
    assert_eq!(before.free, 54);

    s.cache.close()?;
    let after = s.cache.stats();
    assert_eq!(after.resident, 0, "{after}");
    assert_eq!(after.dirty, 0, "{after}");
    assert_eq!(after.free, after.capacity, "{after}");
    assert_eq!(after.mapped_files, 0, "{after}");
    assert_eq!(s.fs.file(Path::new("/fa")).unwrap().snapshot().len(), 5 * PAGE_SIZE);
    assert_eq!(s.tracer.snapshot().evictions, 0, "closing is not eviction");
    Ok(())
}

#[test]
fn closing_last_handle_with_open_cursor_keeps_mapping() -> Result<()> {
    let s = setup(4)?;
    let file = s.cache.map("/zombie", PAGE_SIZE, MapOptions::create())?;
    touch(&file, 0)?;
    touch(&file, 1)?;
    let mut reader = file.io(PageId(1), PfFlags::SHARED_READ)?;
    assert!(reader.next()?);
    assert!(matches!(file.close(), Err(CacheError::PinsOutstanding(1))));
    assert_eq!(s.cache.stats().mapped_files, 1);
    assert_eq!(reader.get_u64_at(0), 4);
    drop(reader);

    // Mapping again revives the same mapping; closing it now succeeds.
    let again = s.cache.map("/zombie", PAGE_SIZE, MapOptions::default())?;
    again.close()?;
    assert_eq!(s.cache.stats().mapped_files, 0);
    let content = s.fs.file(Path::new("/zombie")).unwrap().snapshot();
    assert_eq!(content.len(), 2 * PAGE_SIZE);
    Ok(())
}
