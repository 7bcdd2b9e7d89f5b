use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::types::{FrameId, PageId};

/// Entry value for a page with no frame.
pub const UNMAPPED: u32 = u32::MAX;
/// Entry value while one thread is faulting the page in.
pub const FAULTING: u32 = u32::MAX - 1;

const CHUNK_SHIFT: u32 = 10;
const CHUNK_LEN: usize = 1 << CHUNK_SHIFT;

/// Per-file page id → frame id table.
///
/// Entries move through `UNMAPPED → FAULTING → frame → UNMAPPED` by CAS only.
/// Chunks are allocated only for ranges a page was ever installed in, so a
/// far-away page costs one chunk. The directory lock is taken for writing only
/// to add a chunk.
#[derive(Default)]
pub struct TranslationTable {
    chunks: RwLock<BTreeMap<u64, Box<[AtomicU32]>>>,
}

fn split(page: PageId) -> (u64, usize) {
    (page.0 >> CHUNK_SHIFT, (page.0 as usize) & (CHUNK_LEN - 1))
}

fn new_chunk() -> Box<[AtomicU32]> {
    (0..CHUNK_LEN).map(|_| AtomicU32::new(UNMAPPED)).collect()
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, page: PageId) -> u32 {
        let (chunk, slot) = split(page);
        self.chunks
            .read()
            .get(&chunk)
            .map_or(UNMAPPED, |entries| entries[slot].load(Ordering::Acquire))
    }

    /// CAS on the entry for `page`, allocating its chunk on demand.
    pub fn compare_exchange(&self, page: PageId, current: u32, new: u32) -> Result<u32, u32> {
        let (chunk, slot) = split(page);
        {
            let chunks = self.chunks.read();
            if let Some(entries) = chunks.get(&chunk) {
                return entries[slot].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire);
            }
        }
        let mut chunks = self.chunks.write();
        let entries = chunks.entry(chunk).or_insert_with(new_chunk);
        entries[slot].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Resident pages in ascending page order.
    pub fn resident(&self) -> Vec<(PageId, FrameId)> {
        let chunks = self.chunks.read();
        let mut out = Vec::new();
        for (chunk_idx, entries) in chunks.iter() {
            for (slot, entry) in entries.iter().enumerate() {
                let value = entry.load(Ordering::Acquire);
                if value != UNMAPPED && value != FAULTING {
                    let page = (*chunk_idx << CHUNK_SHIFT) | slot as u64;
                    out.push((PageId(page), FrameId(value)));
                }
            }
        }
        out
    }

    /// Pages currently being faulted in.
    pub fn faulting(&self) -> usize {
        let chunks = self.chunks.read();
        chunks
            .values()
            .flat_map(|entries| entries.iter())
            .filter(|entry| entry.load(Ordering::Acquire) == FAULTING)
            .count()
    }
}
