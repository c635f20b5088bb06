//! Dirty tracking for chunks, terrain blocks and cdata awaiting a save.
//!
//! Each set keeps the items still pending plus the items written since the
//! last `clear()`. The saved set is what `filter` consults, so two passes
//! over overlapping chunks in one batch don't write the same file twice.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::world::{Chunk, ChunkWorld};
use super::ChunkId;

/// Extension given to the file a terrain block saves into.
pub const TERRAIN_BLOCK_EXTENSION: &str = "cdata";

/// Receives progress of a long batch operation.
pub trait Progress {
    /// Announce how many steps follow.
    fn length(&mut self, steps: usize);
    fn step(&mut self);
    /// Jump to an absolute position.
    fn set(&mut self, _position: usize) {}
    fn name(&mut self, _name: &str) {}
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Progress sink that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgress;

impl Progress for NullProgress {
    fn length(&mut self, _steps: usize) {}
    fn step(&mut self) {}
}

/// Writes a chunk (or its cdata, or its thumbnail) to disk.
pub trait ChunkSaver {
    fn save(&mut self, chunk: &Chunk) -> bool;

    /// Deleted chunks are dropped from the pending set without a write.
    fn is_deleted(&self, _chunk: &Chunk) -> bool {
        false
    }
}

/// Resolves and loads chunks for a save pass.
pub trait ChunkLoader {
    fn find(&self, identifier: &str) -> Option<ChunkId>;
    fn chunk(&self, id: ChunkId) -> &Chunk;
    fn load(&mut self, id: ChunkId);
}

impl ChunkLoader for ChunkWorld {
    fn find(&self, identifier: &str) -> Option<ChunkId> {
        ChunkWorld::find(self, identifier)
    }

    fn chunk(&self, id: ChunkId) -> &Chunk {
        ChunkWorld::chunk(self, id)
    }

    fn load(&mut self, id: ChunkId) {
        self.load_now(id);
    }
}

#[derive(Clone, Debug, Default)]
pub struct UnsavedChunks {
    pending: BTreeSet<ChunkId>,
    saved: BTreeSet<ChunkId>,
}

impl UnsavedChunks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, chunk: ChunkId) {
        self.pending.insert(chunk);
    }

    pub fn contains(&self, chunk: ChunkId) -> bool {
        self.pending.contains(&chunk)
    }

    pub fn was_saved(&self, chunk: ChunkId) -> bool {
        self.saved.contains(&chunk)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.pending.iter().cloned()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.saved.clear();
    }

    /// Save every pending chunk plus the chunks named in `extra`.
    ///
    /// Chunks that aren't resident are loaded through `loader` first. Items
    /// that fail stay pending and make the result false; the rest of the
    /// batch is still attempted.
    pub fn save(
        &mut self,
        loader: &mut dyn ChunkLoader,
        saver: &mut dyn ChunkSaver,
        progress: &mut dyn Progress,
        extra: &[String],
    ) -> bool {
        let mut ok = true;
        let mut work = self.pending.clone();
        for identifier in extra {
            match loader.find(identifier) {
                Some(id) => {
                    work.insert(id);
                }
                None => {
                    warn!("cannot save unknown chunk '{}'", identifier);
                    ok = false;
                }
            }
        }

        progress.length(work.len());
        for id in work {
            progress.step();

            if saver.is_deleted(loader.chunk(id)) {
                self.pending.remove(&id);
                continue;
            }
            if !loader.chunk(id).is_ready() {
                loader.load(id);
            }
            let chunk = loader.chunk(id);
            if !chunk.is_ready() {
                warn!("cannot save chunk {}: it could not be loaded", chunk.identifier());
                ok = false;
                continue;
            }
            if saver.save(chunk) {
                self.pending.remove(&id);
                self.saved.insert(id);
            } else {
                warn!("failed to save chunk {}", chunk.identifier());
                ok = false;
            }
        }
        ok
    }

    /// Drop pending chunks that `other` has already written.
    pub fn filter(&mut self, other: &UnsavedChunks) {
        let saved = &other.saved;
        self.pending.retain(|id| !saved.contains(id));
    }

    /// Drop the given chunks without writing them.
    pub fn filter_without_saving<I: IntoIterator<Item = ChunkId>>(&mut self, chunks: I) {
        for id in chunks {
            self.pending.remove(&id);
        }
    }
}

/// A block of terrain that knows how to write itself.
pub trait TerrainBlock: Send + Sync {
    fn resource_name(&self) -> &str;
    fn save(&self, filename: &str) -> bool;
}

/// The file a terrain block resource is written into: the extension of the
/// last path component is replaced by [`TERRAIN_BLOCK_EXTENSION`], or added
/// if there is none.
pub fn terrain_block_filename(resource: &str) -> String {
    let base_start = resource.rfind('/').map(|i| i + 1).unwrap_or(0);
    let stem = match resource[base_start..].rfind('.') {
        Some(dot) => &resource[..base_start + dot],
        None => resource,
    };
    format!("{}.{}", stem, TERRAIN_BLOCK_EXTENSION)
}

#[derive(Clone, Default)]
pub struct UnsavedTerrainBlocks {
    pending: BTreeMap<String, Arc<dyn TerrainBlock>>,
    saved: BTreeSet<String>,
}

impl UnsavedTerrainBlocks {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn add(&mut self, block: Arc<dyn TerrainBlock>) {
        self.pending.insert(block.resource_name().to_string(), block);
    }

    pub fn contains(&self, resource: &str) -> bool {
        self.pending.contains_key(resource)
    }

    pub fn was_saved(&self, resource: &str) -> bool {
        self.saved.contains(resource)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.saved.clear();
    }

    pub fn save(&mut self, progress: &mut dyn Progress) -> bool {
        let mut ok = true;
        progress.length(self.pending.len());
        let pending = ::std::mem::replace(&mut self.pending, BTreeMap::new());
        for (resource, block) in pending {
            progress.step();
            let filename = terrain_block_filename(&resource);
            if block.save(&filename) {
                self.saved.insert(resource);
            } else {
                warn!("failed to save terrain block {} to {}", resource, filename);
                ok = false;
                self.pending.insert(resource, block);
            }
        }
        ok
    }

    pub fn filter(&mut self, other: &UnsavedTerrainBlocks) {
        let saved = &other.saved;
        self.pending.retain(|resource, _| !saved.contains(resource));
    }

    pub fn filter_without_saving<'a, I: IntoIterator<Item = &'a str>>(&mut self, resources: I) {
        for resource in resources {
            self.pending.remove(resource);
        }
    }
}

impl fmt::Debug for UnsavedTerrainBlocks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UnsavedTerrainBlocks")
            .field("pending", &self.pending.keys().collect::<Vec<_>>())
            .field("saved", &self.saved)
            .finish()
    }
}

/// Everything one processing pass left unsaved.
#[derive(Clone, Debug, Default)]
pub struct UnsavedList {
    pub terrain_blocks: UnsavedTerrainBlocks,
    pub chunks: UnsavedChunks,
    /// Chunks whose cdata (shadows, navmeshes, thumbnails) needs writing.
    pub cdatas: UnsavedChunks,
}

impl UnsavedList {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn clear(&mut self) {
        self.terrain_blocks.clear();
        self.chunks.clear();
        self.cdatas.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.terrain_blocks.is_empty() && self.chunks.is_empty() && self.cdatas.is_empty()
    }

    /// Drop whatever `other` has already written.
    pub fn filter(&mut self, other: &UnsavedList) {
        self.terrain_blocks.filter(&other.terrain_blocks);
        self.chunks.filter(&other.chunks);
        self.cdatas.filter(&other.cdatas);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{loaded_grid, RecordingSaver, TestTerrainBlock};
    use crate::LockedChunks;

    #[test]
    fn filter_drops_what_other_saved() {
        let (mut world, ids) = loaded_grid(1, 0);
        let mut a = UnsavedChunks::new();
        a.add(ids[0]);
        a.add(ids[1]);

        let mut b = UnsavedChunks::new();
        b.add(ids[0]);
        assert!(b.save(&mut world, &mut RecordingSaver::default(), &mut NullProgress, &[]));
        assert!(b.was_saved(ids[0]));

        a.filter(&b);
        assert!(!a.contains(ids[0]));
        assert!(a.contains(ids[1]));
        assert_eq!(a.len(), 1);

        assert!(a.save(&mut world, &mut RecordingSaver::default(), &mut NullProgress, &[]));
        assert!(a.is_empty());
        a.filter(&UnsavedChunks::new());
        assert!(a.is_empty());
        assert!(a.was_saved(ids[1]));
    }

    #[test]
    fn second_save_is_a_no_op() {
        let (mut world, ids) = loaded_grid(1, 0);
        let mut unsaved = UnsavedChunks::new();
        unsaved.add(ids[0]);
        unsaved.add(ids[0]);
        unsaved.add(ids[1]);

        let mut saver = RecordingSaver::default();
        assert!(unsaved.save(&mut world, &mut saver, &mut NullProgress, &[]));
        assert_eq!(saver.saved.len(), 2);

        let mut saver = RecordingSaver::default();
        assert!(unsaved.save(&mut world, &mut saver, &mut NullProgress, &[]));
        assert!(saver.saved.is_empty());
    }

    #[test]
    fn failures_stay_pending() {
        let (mut world, ids) = loaded_grid(2, 0);
        let mut unsaved = UnsavedChunks::new();
        for &id in &ids {
            unsaved.add(id);
        }
        let mut saver = RecordingSaver::default();
        saver.fail.insert(world.chunk(ids[1]).identifier().to_string());

        assert!(!unsaved.save(&mut world, &mut saver, &mut NullProgress, &[]));
        assert_eq!(saver.saved.len(), 2);
        assert!(unsaved.contains(ids[1]));
        assert_eq!(unsaved.len(), 1);
    }

    #[test]
    fn unloaded_chunks_are_loaded_then_saved() {
        let (mut world, ids) = loaded_grid(1, 0);
        world.set_removable(ids[1], true);
        world.unload_removable(&LockedChunks::new());
        assert!(!world.chunk(ids[1]).is_resident());

        let mut unsaved = UnsavedChunks::new();
        let mut saver = RecordingSaver::default();
        let extra = vec![world.chunk(ids[1]).identifier().to_string()];
        assert!(unsaved.save(&mut world, &mut saver, &mut NullProgress, &extra));
        assert!(world.chunk(ids[1]).is_bound());
        assert!(unsaved.was_saved(ids[1]));

        let unknown = vec!["nowhere".to_string()];
        assert!(!unsaved.save(&mut world, &mut saver, &mut NullProgress, &unknown));
    }

    #[test]
    fn deleted_chunks_are_dropped() {
        let (mut world, ids) = loaded_grid(0, 0);
        let mut unsaved = UnsavedChunks::new();
        unsaved.add(ids[0]);
        let mut saver = RecordingSaver::default();
        saver.deleted.insert(world.chunk(ids[0]).identifier().to_string());

        assert!(unsaved.save(&mut world, &mut saver, &mut NullProgress, &[]));
        assert!(unsaved.is_empty());
        assert!(!unsaved.was_saved(ids[0]));
        assert!(saver.saved.is_empty());
    }

    #[test]
    fn filter_without_saving() {
        let mut unsaved = UnsavedChunks::new();
        unsaved.add(ChunkId(1));
        unsaved.add(ChunkId(2));
        unsaved.filter_without_saving(vec![ChunkId(2), ChunkId(5)]);
        assert_eq!(unsaved.iter().collect::<Vec<_>>(), vec![ChunkId(1)]);
    }

    #[test]
    fn terrain_filenames() {
        assert_eq!(
            terrain_block_filename("spaces/hills/0000fffeo.terrain2"),
            "spaces/hills/0000fffeo.cdata"
        );
        assert_eq!(terrain_block_filename("spaces/v1.2/block"), "spaces/v1.2/block.cdata");
        assert_eq!(terrain_block_filename("block"), "block.cdata");
    }

    #[test]
    fn terrain_blocks_save_themselves() {
        let good = Arc::new(TestTerrainBlock::new("spaces/a/00000000o.terrain2", true));
        let bad = Arc::new(TestTerrainBlock::new("spaces/a/00010000o.terrain2", false));
        let mut blocks = UnsavedTerrainBlocks::new();
        blocks.add(good.clone());
        blocks.add(bad.clone());
        blocks.add(good.clone());
        assert_eq!(blocks.len(), 2);

        assert!(!blocks.save(&mut NullProgress));
        assert_eq!(good.saved_to(), vec!["spaces/a/00000000o.cdata".to_string()]);
        assert!(blocks.was_saved("spaces/a/00000000o.terrain2"));
        assert!(blocks.contains("spaces/a/00010000o.terrain2"));

        let mut other = UnsavedTerrainBlocks::new();
        other.add(good.clone());
        other.filter(&blocks);
        assert!(other.is_empty());

        blocks.filter_without_saving(vec!["spaces/a/00010000o.terrain2"]);
        assert!(blocks.is_empty());
    }

    #[test]
    fn unsaved_list_filters_all_sets() {
        let (mut world, ids) = loaded_grid(1, 0);
        let mut done = UnsavedList::new();
        done.chunks.add(ids[0]);
        done.cdatas.add(ids[1]);
        done.chunks.save(&mut world, &mut RecordingSaver::default(), &mut NullProgress, &[]);
        done.cdatas.save(&mut world, &mut RecordingSaver::default(), &mut NullProgress, &[]);

        let mut list = UnsavedList::new();
        list.chunks.add(ids[0]);
        list.cdatas.add(ids[1]);
        list.cdatas.add(ids[0]);
        list.filter(&done);
        assert!(list.chunks.is_empty());
        assert_eq!(list.cdatas.iter().collect::<Vec<_>>(), vec![ids[0]]);

        list.clear();
        assert!(list.is_empty());
    }
}
