//! Background processing of streamed world chunks.
//!
//! Derived per-chunk data (shadows, navmeshes, terrain LODs) is recomputed by
//! [`ChunkProcessor`]s: a background phase runs on a worker thread and a
//! finalize phase runs on the main thread, during `ChunkProcessorManager::tick`.
//! While a processor reads chunk data from a worker thread, the chunks it
//! touches are pinned with a [`ScopedLockedChunkHolder`], which the streaming
//! side of the [`ChunkWorld`] honours by never unloading a locked chunk.
//!
//! Threading notes:
//! Only the main thread (the thread that created the manager) walks the chunk
//! graph. Workers see chunks through ids and locks, never through the world.
//! With zero worker threads everything runs inline, and processors observe the
//! same completion contract either way.

#[macro_use]
extern crate log;
extern crate cgmath;
extern crate crossbeam_channel;
extern crate fnv;
extern crate parking_lot;

use std::fmt;

pub mod budget;
pub mod cache;
pub mod error;
pub mod holder;
pub mod locked;
pub mod manager;
pub mod processor;
pub mod tasks;
pub mod unsaved;
pub mod world;

#[cfg(test)]
mod testing;

pub use cache::{CacheIndex, ChunkCache, CleanChunkList, DirtyChunkList, DirtyChunkLists};
pub use error::{ChunkError, Result};
pub use holder::ScopedLockedChunkHolder;
pub use locked::LockedChunks;
pub use manager::{ChunkProcessorManager, EditorHooks, ManagerConfig, ProcessorHooks};
pub use processor::{
    BackgroundContext, ChunkProcessor, ChunkProcessorListener, ChunkProcessors, Dispatch,
    ListenerAction, ListenerId, ProcessorHandle, ProcessorState, ProcessorTask,
};
pub use tasks::TaskManager;
pub use unsaved::{
    ChunkLoader, ChunkSaver, NullProgress, Progress, TerrainBlock, UnsavedChunks, UnsavedList,
    UnsavedTerrainBlocks,
};
pub use world::{Chunk, ChunkKind, ChunkWorld, GridBox, LoadState};

/// A position in world space, in metres.
pub type Coord = cgmath::Vector3<f32>;

/// The grid cell of an outdoor chunk.
pub type GridCoord = cgmath::Vector2<i16>;

/// Outdoor chunks are GRID_RESOLUTION by GRID_RESOLUTION metres.
pub const GRID_RESOLUTION: f32 = 100.0;

/// Outdoor chunk identifiers end in this, e.g. `0001fffeo` for grid (1, -2).
pub const OUTSIDE_CHUNK_SUFFIX: char = 'o';
/// Indoor (shell) chunk identifiers end in this.
pub const INSIDE_CHUNK_SUFFIX: char = 'i';

/// Handle to a chunk in a [`ChunkWorld`].
///
/// Chunk slots are never reused, so an id stays valid while its chunk is
/// unloaded and reloaded.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChunkId(pub(crate) u32);

impl ChunkId {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Grid cell containing a world position.
#[inline(always)]
pub fn grid_of(coord: Coord) -> GridCoord {
    GridCoord::new(
        (coord.x / GRID_RESOLUTION).floor() as i16,
        (coord.z / GRID_RESOLUTION).floor() as i16,
    )
}

/// Centre of an outdoor chunk's grid cell, at height 0.
#[inline(always)]
pub fn grid_centre(grid: GridCoord) -> Coord {
    Coord::new(
        (f32::from(grid.x) + 0.5) * GRID_RESOLUTION,
        0.0,
        (f32::from(grid.y) + 0.5) * GRID_RESOLUTION,
    )
}
