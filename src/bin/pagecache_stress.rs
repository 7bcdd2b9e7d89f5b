//! Torn-read stress run against a real file.
//!
//! One writer rewrites a checksummed record every `--interval-ms`; reader
//! threads read it through the optimistic path and verify the checksum.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use pagecache::logging::init_logging;
use pagecache::trace::CountingTracer;
use pagecache::{
    CacheError, MapOptions, PageCache, PageCacheOptions, PageCursor, PageId, PfFlags, Result,
    Unlimited,
};
use tracing::{error, info};

const PAYLOAD: usize = 48;
const RECORD: usize = 8 + PAYLOAD + 4;

#[derive(Parser, Debug)]
#[command(name = "pagecache-stress", about = "Checksum stress for the page cache read path")]
struct Args {
    /// Scratch file to map (created, truncated).
    #[arg(long, env = "PAGECACHE_STRESS_FILE", default_value = "pagecache-stress.bin")]
    file: PathBuf,
    /// Cache options TOML file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of reader threads.
    #[arg(long, default_value_t = 10)]
    readers: usize,
    /// Run time in seconds.
    #[arg(long, default_value_t = 1)]
    seconds: u64,
    /// Pause between writes in milliseconds.
    #[arg(long, default_value_t = 1)]
    interval_ms: u64,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "pagecache=info")]
    log: String,
}

fn encode(counter: u64, out: &mut [u8; RECORD]) {
    out[..8].copy_from_slice(&counter.to_be_bytes());
    for (i, byte) in out[8..8 + PAYLOAD].iter_mut().enumerate() {
        *byte = (counter as u8).wrapping_add(i as u8);
    }
    let crc = crc32fast::hash(&out[..8 + PAYLOAD]);
    out[8 + PAYLOAD..].copy_from_slice(&crc.to_be_bytes());
}

fn verify(record: &[u8; RECORD]) -> bool {
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&record[8 + PAYLOAD..]);
    crc32fast::hash(&record[..8 + PAYLOAD]) == u32::from_be_bytes(stored)
}

/// Binds the record page; it always exists once the writer created it.
fn bind_record(cursor: &mut PageCursor) -> Result<()> {
    if cursor.next()? {
        Ok(())
    } else {
        Err(CacheError::Invalid("record page is missing from the stress file"))
    }
}

fn run(args: &Args) -> Result<u64> {
    let options = match &args.config {
        Some(path) => PageCacheOptions::load(path)?,
        None => PageCacheOptions::default().max_pages(64).page_size(4096),
    };
    let page_size = options.page_size;
    let tracer = Arc::new(CountingTracer::new());
    let cache = PageCache::builder(options).tracer(tracer.clone()).build()?;
    let file = Arc::new(cache.map(&args.file, page_size, MapOptions::create().truncate_existing())?);

    {
        let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        bind_record(&mut cursor)?;
        let mut record = [0u8; RECORD];
        encode(0, &mut record);
        cursor.put_bytes(&record);
    }

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicU64::new(0));
    let mismatches = Arc::new(AtomicU64::new(0));
    let mut readers = Vec::with_capacity(args.readers);
    for _ in 0..args.readers {
        let (file, stop, reads, mismatches) = (file.clone(), stop.clone(), reads.clone(), mismatches.clone());
        readers.push(thread::spawn(move || -> Result<()> {
            let mut record = [0u8; RECORD];
            while !stop.load(Ordering::Relaxed) {
                let mut cursor = file.io(PageId(0), PfFlags::SHARED_READ)?;
                bind_record(&mut cursor)?;
                loop {
                    cursor.set_offset(0);
                    cursor.get_bytes(&mut record);
                    if !cursor.should_retry()? {
                        break;
                    }
                }
                cursor.check_and_clear_bounds_flag()?;
                if !verify(&record) {
                    mismatches.fetch_add(1, Ordering::Relaxed);
                }
                reads.fetch_add(1, Ordering::Relaxed);
            }
            Ok(())
        }));
    }

    let deadline = Instant::now() + Duration::from_secs(args.seconds);
    let mut counter = 0u64;
    let mut record = [0u8; RECORD];
    while Instant::now() < deadline {
        counter += 1;
        encode(counter, &mut record);
        let mut cursor = file.io(PageId(0), PfFlags::EXCLUSIVE_WRITE)?;
        bind_record(&mut cursor)?;
        cursor.put_bytes(&record);
        drop(cursor);
        thread::sleep(Duration::from_millis(args.interval_ms));
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        match reader.join() {
            Ok(result) => result?,
            Err(_) => error!("stress.reader.panicked"),
        }
    }

    cache.flush_and_force(&Unlimited)?;
    println!("writes:     {counter}");
    println!("reads:      {}", reads.load(Ordering::Relaxed));
    println!("cache:      {}", cache.stats());
    println!("tracer:     {}", tracer.snapshot());
    drop(file);
    cache.close()?;
    Ok(mismatches.load(Ordering::Relaxed))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log);
    info!(?args, "stress.start");
    match run(&args) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(mismatches) => {
            error!(mismatches, "stress.checksum_mismatch");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!(error = %err, "stress.failed");
            ExitCode::FAILURE
        }
    }
}
