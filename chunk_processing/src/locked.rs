//! The global table of chunks pinned in memory.

use fnv::FnvHashMap;
use parking_lot::Mutex;

use super::error::{ChunkError, Result};
use super::ChunkId;

/// Reference counts of chunks that must not be unloaded.
///
/// Shared between the main thread and workers as an `Arc<LockedChunks>`;
/// a chunk with a non-zero count is safe to read from a worker thread.
#[derive(Default, Debug)]
pub struct LockedChunks {
    counts: Mutex<FnvHashMap<ChunkId, u32>>,
}

impl LockedChunks {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the new count.
    pub fn lock(&self, chunk: ChunkId) -> u32 {
        let mut counts = self.counts.lock();
        let count = counts.entry(chunk).or_insert(0);
        *count += 1;
        *count
    }

    /// Returns the remaining count; the entry is dropped when it reaches zero.
    pub fn unlock(&self, chunk: ChunkId) -> Result<u32> {
        Self::unlock_locked(&mut self.counts.lock(), chunk)
    }

    /// Unlock every chunk once. All chunks are attempted; the first failure
    /// is returned.
    pub fn unlock_all<I: IntoIterator<Item = ChunkId>>(&self, chunks: I) -> Result<()> {
        let mut counts = self.counts.lock();
        let mut result = Ok(());
        for chunk in chunks {
            if let Err(e) = Self::unlock_locked(&mut counts, chunk) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn unlock_locked(counts: &mut FnvHashMap<ChunkId, u32>, chunk: ChunkId) -> Result<u32> {
        let remaining = match counts.get_mut(&chunk) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                error!("unlocking chunk {} which is not locked", chunk);
                return Err(ChunkError::NotLocked(chunk));
            }
        };
        if remaining == 0 {
            counts.remove(&chunk);
        }
        Ok(remaining)
    }

    pub fn count(&self, chunk: ChunkId) -> u32 {
        self.counts.lock().get(&chunk).cloned().unwrap_or(0)
    }

    pub fn is_locked(&self, chunk: ChunkId) -> bool {
        self.counts.lock().contains_key(&chunk)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// Number of distinct chunks locked.
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    /// Currently locked chunks, in id order.
    pub fn snapshot(&self) -> Vec<ChunkId> {
        let mut chunks: Vec<_> = self.counts.lock().keys().cloned().collect();
        chunks.sort();
        chunks
    }
}
