//! The chunk graph of one space, stored as an arena.
//!
//! Outdoor chunks tile a regular grid and are looked up by grid cell; indoor
//! (shell) chunks hang off the outdoor chunks they overlap and connect to each
//! other through portals. All relationships are stored as `ChunkId`s, and
//! slots are never freed, so traversal can't observe a dangling chunk.
//!
//! Streaming here is a state machine only: `request_load` queues a chunk,
//! `process_pending_loads` completes every queued load, and
//! `unload_removable` drops chunks that were marked removable and are not
//! locked. The geometry itself belongs to the caller.

use std::collections::BTreeSet;
use std::convert::TryFrom;
use std::fmt;

use fnv::{FnvHashMap, FnvHashSet};

use super::cache::{CacheIndex, ChunkCache};
use super::locked::LockedChunks;
use super::{grid_centre, ChunkId, Coord, GridCoord, INSIDE_CHUNK_SUFFIX, OUTSIDE_CHUNK_SUFFIX};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    /// Loaded and stitched to its neighbours.
    Bound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkKind {
    Outdoor(GridCoord),
    Indoor,
}

/// An inclusive rectangle of grid cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridBox {
    pub min_x: i32,
    pub max_x: i32,
    pub min_z: i32,
    pub max_z: i32,
}

impl GridBox {
    pub fn new(min_x: i32, max_x: i32, min_z: i32, max_z: i32) -> Self {
        GridBox { min_x, max_x, min_z, max_z }
    }

    #[inline(always)]
    pub fn contains(&self, x: i32, z: i32) -> bool {
        x >= self.min_x && x <= self.max_x && z >= self.min_z && z <= self.max_z
    }

    pub fn width(&self) -> i32 {
        self.max_x - self.min_x + 1
    }
}

pub struct Chunk {
    id: ChunkId,
    identifier: String,
    kind: ChunkKind,
    centre: Coord,
    state: LoadState,
    removable: bool,
    file_exists: bool,
    corrupt: bool,
    portals: Vec<ChunkId>,
    overlappers: Vec<ChunkId>,
    overlapped: Vec<ChunkId>,
    caches: Vec<Option<Box<dyn ChunkCache>>>,
}

impl Chunk {
    fn new(id: ChunkId, identifier: String, kind: ChunkKind, centre: Coord) -> Self {
        Chunk {
            id,
            identifier,
            kind,
            centre,
            state: LoadState::Unloaded,
            removable: false,
            file_exists: true,
            corrupt: false,
            portals: Vec::new(),
            overlappers: Vec::new(),
            overlapped: Vec::new(),
            caches: Vec::new(),
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }
    pub fn identifier(&self) -> &str {
        &self.identifier
    }
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }
    pub fn is_outside_chunk(&self) -> bool {
        self.grid().is_some()
    }
    pub fn grid(&self) -> Option<GridCoord> {
        match self.kind {
            ChunkKind::Outdoor(grid) => Some(grid),
            ChunkKind::Indoor => None,
        }
    }
    pub fn centre(&self) -> Coord {
        self.centre
    }
    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Loaded or loading; the streaming system is committed to keeping it.
    pub fn is_resident(&self) -> bool {
        self.state != LoadState::Unloaded
    }

    /// Fully loaded, not merely loading.
    pub fn is_ready(&self) -> bool {
        match self.state {
            LoadState::Loaded | LoadState::Bound => true,
            _ => false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.state == LoadState::Bound
    }

    pub fn is_removable(&self) -> bool {
        self.removable
    }

    pub fn file_exists(&self) -> bool {
        self.file_exists
    }

    pub fn portals(&self) -> &[ChunkId] {
        &self.portals
    }

    /// Indoor chunks overlapping this outdoor chunk.
    pub fn overlappers(&self) -> &[ChunkId] {
        &self.overlappers
    }

    /// Outdoor chunks this indoor chunk overlaps.
    pub fn overlapped(&self) -> &[ChunkId] {
        &self.overlapped
    }

    pub fn num_cache_slots(&self) -> usize {
        self.caches.len()
    }

    pub fn cache(&self, index: CacheIndex) -> Option<&dyn ChunkCache> {
        match self.caches.get(index.0) {
            Some(Some(cache)) => Some(cache.as_ref()),
            _ => None,
        }
    }

    pub fn set_cache(&mut self, index: CacheIndex, cache: Box<dyn ChunkCache>) {
        if self.caches.len() <= index.0 {
            self.caches.resize_with(index.0 + 1, || None);
        }
        self.caches[index.0] = Some(cache);
    }

    pub(crate) fn take_cache(&mut self, index: CacheIndex) -> Option<Box<dyn ChunkCache>> {
        self.caches.get_mut(index.0).and_then(Option::take)
    }

    pub(crate) fn restore_cache(&mut self, index: CacheIndex, cache: Box<dyn ChunkCache>) {
        debug_assert!(self.caches[index.0].is_none());
        self.caches[index.0] = Some(cache);
    }

    /// Whether any cache of this chunk needs recalculating.
    pub fn dirty(&self) -> bool {
        self.caches.iter().flatten().any(|cache| cache.dirty())
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("id", &self.id)
            .field("identifier", &self.identifier)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("caches", &self.caches.iter().filter(|c| c.is_some()).count())
            .finish()
    }
}

/// Identifier of the outdoor chunk at a grid cell, e.g. `0001fffeo` for (1, -2).
pub fn outside_chunk_identifier(grid: GridCoord) -> String {
    format!("{:04x}{:04x}{}", grid.x as u16, grid.y as u16, OUTSIDE_CHUNK_SUFFIX)
}

/// Inverse of [`outside_chunk_identifier`].
pub fn grid_from_chunk_name(name: &str) -> Option<GridCoord> {
    if name.len() != 9 || !name.is_ascii() || !name.ends_with(OUTSIDE_CHUNK_SUFFIX) {
        return None;
    }
    let x = u16::from_str_radix(&name[0..4], 16).ok()?;
    let z = u16::from_str_radix(&name[4..8], 16).ok()?;
    Some(GridCoord::new(x as i16, z as i16))
}

/// The grid cell (x, z), if both fit a grid coordinate.
pub fn grid_cell(x: i32, z: i32) -> Option<GridCoord> {
    Some(GridCoord::new(i16::try_from(x).ok()?, i16::try_from(z).ok()?))
}

#[derive(Debug)]
pub struct ChunkWorld {
    chunks: Vec<Chunk>,
    by_name: FnvHashMap<String, ChunkId>,
    by_grid: FnvHashMap<GridCoord, ChunkId>,
    bounds: GridBox,
    loading: Vec<ChunkId>,
}

impl ChunkWorld {
    /// An empty space whose outdoor grid spans `bounds`.
    pub fn new(bounds: GridBox) -> Self {
        ChunkWorld {
            chunks: Vec::new(),
            by_name: FnvHashMap::default(),
            by_grid: FnvHashMap::default(),
            bounds,
            loading: Vec::new(),
        }
    }

    /// A space with an (unloaded) outdoor chunk in every cell of `bounds`.
    /// Cells outside the grid coordinate range are left empty.
    pub fn with_outdoor_grid(bounds: GridBox) -> Self {
        let mut world = ChunkWorld::new(bounds);
        let mut skipped = 0u64;
        for z in bounds.min_z..=bounds.max_z {
            for x in bounds.min_x..=bounds.max_x {
                match grid_cell(x, z) {
                    Some(grid) => {
                        world.add_outdoor_chunk(grid);
                    }
                    None => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            warn!("{} cells of {:?} are outside the grid and have no chunk", skipped, bounds);
        }
        world
    }

    /// Add a chunk listed by its identifier: outdoor names place a chunk in
    /// their grid cell, indoor names an indoor chunk with no overlaps yet.
    /// Returns None for names that are neither, or outdoor cells outside the
    /// space.
    pub fn add_chunk_by_name(&mut self, identifier: &str) -> Option<ChunkId> {
        if let Some(grid) = grid_from_chunk_name(identifier) {
            if self.bounds.contains(i32::from(grid.x), i32::from(grid.y)) {
                return Some(self.add_outdoor_chunk(grid));
            }
            warn!("chunk {} lies outside {:?}", identifier, self.bounds);
            return None;
        }
        if identifier.ends_with(INSIDE_CHUNK_SUFFIX) {
            return Some(self.add_indoor_chunk(identifier, &[]));
        }
        debug!("'{}' is not a chunk name", identifier);
        None
    }

    pub fn bounds(&self) -> GridBox {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Add the outdoor chunk for `grid`, or return the existing one.
    pub fn add_outdoor_chunk(&mut self, grid: GridCoord) -> ChunkId {
        if let Some(&id) = self.by_grid.get(&grid) {
            return id;
        }
        debug_assert!(self.bounds.contains(i32::from(grid.x), i32::from(grid.y)));
        let id = self.next_id();
        let identifier = outside_chunk_identifier(grid);
        self.by_name.insert(identifier.clone(), id);
        self.by_grid.insert(grid, id);
        self.chunks.push(Chunk::new(id, identifier, ChunkKind::Outdoor(grid), grid_centre(grid)));
        id
    }

    /// Add an indoor chunk overlapping the given outdoor chunks.
    pub fn add_indoor_chunk(&mut self, identifier: &str, overlapped: &[ChunkId]) -> ChunkId {
        if let Some(&id) = self.by_name.get(identifier) {
            return id;
        }
        let id = self.next_id();
        let centre = if overlapped.is_empty() {
            Coord::new(0.0, 0.0, 0.0)
        } else {
            let sum = overlapped
                .iter()
                .fold(Coord::new(0.0, 0.0, 0.0), |acc, o| acc + self.chunk(*o).centre);
            sum / overlapped.len() as f32
        };
        let mut chunk = Chunk::new(id, identifier.to_string(), ChunkKind::Indoor, centre);
        for &outdoor in overlapped {
            debug_assert!(self.chunk(outdoor).is_outside_chunk());
            if !chunk.overlapped.contains(&outdoor) {
                chunk.overlapped.push(outdoor);
                self.chunks[outdoor.index()].overlappers.push(id);
            }
        }
        self.by_name.insert(identifier.to_string(), id);
        self.chunks.push(chunk);
        id
    }

    /// Join two chunks with a portal, in both directions.
    pub fn connect_portal(&mut self, a: ChunkId, b: ChunkId) {
        if a == b || self.chunks[a.index()].portals.contains(&b) {
            return;
        }
        self.chunks[a.index()].portals.push(b);
        self.chunks[b.index()].portals.push(a);
    }

    fn next_id(&self) -> ChunkId {
        ChunkId(self.chunks.len() as u32)
    }

    /// Panics if `id` came from a different world.
    #[inline(always)]
    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id.index()]
    }

    #[inline(always)]
    pub fn chunk_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.chunks[id.index()]
    }

    pub fn find(&self, identifier: &str) -> Option<ChunkId> {
        self.by_name.get(identifier).cloned()
    }

    pub fn chunk_at(&self, grid: GridCoord) -> Option<ChunkId> {
        self.by_grid.get(&grid).cloned()
    }

    /// Identifier of the outdoor chunk at (x, z), or None outside the space.
    pub fn outside_chunk_identifier(&self, x: i32, z: i32) -> Option<String> {
        if !self.bounds.contains(x, z) {
            return None;
        }
        grid_cell(x, z).map(outside_chunk_identifier)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = ChunkId> + '_ {
        self.chunks.iter().map(|c| c.id)
    }

    /// Every chunk identifier in the space.
    pub fn gather_chunks(&self) -> BTreeSet<String> {
        self.chunks.iter().map(|c| c.identifier.clone()).collect()
    }

    /// Existing outdoor chunks within `expand_x`/`expand_z` cells of `grid`,
    /// row by row.
    pub fn grid_neighbourhood(&self, grid: GridCoord, expand_x: i32, expand_z: i32) -> Vec<ChunkId> {
        let (expand_x, expand_z) = (expand_x.max(0), expand_z.max(0));
        let (gx, gz) = (i32::from(grid.x), i32::from(grid.y));
        let mut found = Vec::new();
        let (min_z, max_z) = (
            gz.saturating_sub(expand_z).max(self.bounds.min_z),
            gz.saturating_add(expand_z).min(self.bounds.max_z),
        );
        let (min_x, max_x) = (
            gx.saturating_sub(expand_x).max(self.bounds.min_x),
            gx.saturating_add(expand_x).min(self.bounds.max_x),
        );
        for z in min_z..=max_z {
            for x in min_x..=max_x {
                if let Some(id) = grid_cell(x, z).and_then(|grid| self.chunk_at(grid)) {
                    found.push(id);
                }
            }
        }
        found
    }

    /// Sort key that orders outdoor chunks row by row, for scanline processing.
    pub fn scanline_key(&self, id: ChunkId) -> i64 {
        match self.chunk(id).kind {
            ChunkKind::Outdoor(grid) => {
                i64::from(grid.x) + i64::from(grid.y) * i64::from(self.bounds.width())
            }
            ChunkKind::Indoor => i64::max_value(),
        }
    }

    /// `ids` ordered row by row, indoor chunks last.
    pub fn sorted_by_scanline<I: IntoIterator<Item = ChunkId>>(&self, ids: I) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> = ids.into_iter().collect();
        ids.sort_by_key(|&id| self.scanline_key(id));
        ids
    }

    pub fn set_file_exists(&mut self, id: ChunkId, exists: bool) {
        self.chunks[id.index()].file_exists = exists;
    }

    /// A corrupt chunk keeps its file but never loads.
    pub fn set_corrupt(&mut self, id: ChunkId, corrupt: bool) {
        self.chunks[id.index()].corrupt = corrupt;
    }

    pub fn count_in_state(&self, state: LoadState) -> usize {
        self.chunks.iter().filter(|c| c.state == state).count()
    }

    pub fn is_loading(&self) -> bool {
        !self.loading.is_empty()
    }

    /// Start loading a chunk. Returns true if the chunk is now loading or
    /// already resident.
    pub fn request_load(&mut self, id: ChunkId) -> bool {
        let chunk = &mut self.chunks[id.index()];
        if chunk.is_resident() {
            return true;
        }
        if !chunk.file_exists {
            debug!("not loading {}: no chunk file", chunk.identifier);
            return false;
        }
        if chunk.corrupt {
            warn!("cannot read chunk file of {}", chunk.identifier);
            return false;
        }
        trace!("loading {}", chunk.identifier);
        chunk.state = LoadState::Loading;
        self.loading.push(id);
        true
    }

    /// Load a chunk synchronously. Returns whether it is now bound.
    pub fn load_now(&mut self, id: ChunkId) -> bool {
        let chunk = &mut self.chunks[id.index()];
        if !chunk.file_exists || chunk.corrupt {
            return chunk.is_bound();
        }
        chunk.state = LoadState::Bound;
        self.loading.retain(|&l| l != id);
        true
    }

    /// Finish every pending load. Returns how many chunks became bound.
    pub fn process_pending_loads(&mut self) -> usize {
        let loading = ::std::mem::replace(&mut self.loading, Vec::new());
        let mut bound = 0;
        for id in loading {
            let chunk = &mut self.chunks[id.index()];
            if chunk.state == LoadState::Loading {
                chunk.state = LoadState::Bound;
                bound += 1;
            }
        }
        bound
    }

    pub fn set_removable(&mut self, id: ChunkId, removable: bool) {
        self.chunks[id.index()].removable = removable;
    }

    /// Mark bound chunks outside `grid_box` as removable, except those in
    /// `keep`. Indoor chunks count as outside only when every outdoor chunk
    /// they overlap is outside. Returns how many were marked.
    pub fn mark_removable_outside(&mut self, grid_box: GridBox, keep: &FnvHashSet<ChunkId>) -> usize {
        let outside = |chunk: &Chunk| match chunk.kind {
            ChunkKind::Outdoor(grid) => !grid_box.contains(i32::from(grid.x), i32::from(grid.y)),
            ChunkKind::Indoor => false,
        };

        let mut marked = Vec::new();
        for chunk in &self.chunks {
            if keep.contains(&chunk.id) || !chunk.is_bound() {
                continue;
            }
            let remove = match chunk.kind {
                ChunkKind::Outdoor(_) => outside(chunk),
                ChunkKind::Indoor => chunk
                    .overlapped
                    .iter()
                    .all(|&o| outside(&self.chunks[o.index()])),
            };
            if remove {
                marked.push(chunk.id);
            }
        }
        for &id in &marked {
            self.chunks[id.index()].removable = true;
        }
        marked.len()
    }

    /// Unload every removable chunk that isn't locked, then reset all
    /// removable marks. Loading chunks are never unloaded.
    pub fn unload_removable(&mut self, locked: &LockedChunks) -> usize {
        let mut unloaded = 0;
        for chunk in &mut self.chunks {
            if chunk.removable && chunk.is_ready() && !locked.is_locked(chunk.id) {
                trace!("unloading {}", chunk.identifier);
                chunk.state = LoadState::Unloaded;
                unloaded += 1;
            }
            chunk.removable = false;
        }
        if unloaded > 0 {
            debug!("unloaded {} chunks", unloaded);
        }
        unloaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        let grid = GridCoord::new(1, -2);
        assert_eq!(outside_chunk_identifier(grid), "0001fffeo");
        assert_eq!(grid_from_chunk_name("0001fffeo"), Some(grid));
        assert_eq!(grid_from_chunk_name("0001fffei"), None);
        assert_eq!(grid_from_chunk_name("shell"), None);
        // nine bytes, but not nine characters
        assert_eq!(grid_from_chunk_name("00é0000o"), None);
        assert_eq!(grid_from_chunk_name("000é000o"), None);
        assert_eq!(grid_cell(1, -2), Some(grid));
        assert_eq!(grid_cell(40_000, 0), None);
        assert_eq!(grid_cell(0, -40_000), None);
    }

    #[test]
    fn chunks_added_by_name() {
        let mut world = ChunkWorld::new(GridBox::new(-1, 1, -1, 1));
        let outdoor = world.add_chunk_by_name("0001ffffo").unwrap();
        assert_eq!(world.chunk(outdoor).grid(), Some(GridCoord::new(1, -1)));
        assert_eq!(world.add_chunk_by_name("0001ffffo"), Some(outdoor));
        let shell = world.add_chunk_by_name("house01i").unwrap();
        assert!(!world.chunk(shell).is_outside_chunk());
        assert_eq!(world.add_chunk_by_name("00050000o"), None);
        assert_eq!(world.add_chunk_by_name("readme.txt"), None);
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn grid_beyond_coordinate_range() {
        let world = ChunkWorld::with_outdoor_grid(GridBox::new(32_766, 32_768, 0, 0));
        assert_eq!(world.len(), 2);
        assert_eq!(world.outside_chunk_identifier(32_768, 0), None);
        assert_eq!(world.outside_chunk_identifier(32_767, 0), Some("7fff0000o".to_string()));
        let edge = GridCoord::new(32_767, 0);
        assert_eq!(world.grid_neighbourhood(edge, 1, 1).len(), 2);
        assert_eq!(world.grid_neighbourhood(edge, i32::max_value(), i32::max_value()).len(), 2);
    }

    #[test]
    fn grid_lookup() {
        let world = ChunkWorld::with_outdoor_grid(GridBox::new(-1, 1, -1, 1));
        assert_eq!(world.len(), 9);
        let centre = world.chunk_at(GridCoord::new(0, 0)).unwrap();
        assert_eq!(world.find("00000000o"), Some(centre));
        assert_eq!(world.grid_neighbourhood(GridCoord::new(0, 0), 1, 1).len(), 9);
        // clipped at the edge of the space
        assert_eq!(world.grid_neighbourhood(GridCoord::new(1, 1), 1, 1).len(), 4);
        assert_eq!(world.outside_chunk_identifier(2, 0), None);
    }

    #[test]
    fn scanline_order() {
        let mut world = ChunkWorld::with_outdoor_grid(GridBox::new(-1, 1, -1, 1));
        let a = world.chunk_at(GridCoord::new(1, -1)).unwrap();
        let b = world.chunk_at(GridCoord::new(-1, 0)).unwrap();
        let c = world.chunk_at(GridCoord::new(0, 0)).unwrap();
        let shell = world.add_indoor_chunk("house01i", &[c]);
        assert_eq!(world.sorted_by_scanline(vec![shell, c, b, a]), vec![a, b, c, shell]);
    }

    #[test]
    fn indoor_overlaps() {
        let mut world = ChunkWorld::with_outdoor_grid(GridBox::new(0, 1, 0, 0));
        let a = world.chunk_at(GridCoord::new(0, 0)).unwrap();
        let b = world.chunk_at(GridCoord::new(1, 0)).unwrap();
        let shell = world.add_indoor_chunk("house01i", &[a, b]);
        assert_eq!(world.chunk(shell).overlapped(), &[a, b]);
        assert_eq!(world.chunk(a).overlappers(), &[shell]);
        assert_eq!(world.chunk(shell).centre().x, 100.0);
    }

    #[test]
    fn streaming_states() {
        let mut world = ChunkWorld::with_outdoor_grid(GridBox::new(0, 2, 0, 0));
        let ids: Vec<_> = world.ids().collect();
        assert!(world.request_load(ids[0]));
        assert_eq!(world.chunk(ids[0]).state(), LoadState::Loading);
        assert!(world.chunk(ids[0]).is_resident());
        assert!(!world.chunk(ids[0]).is_ready());
        assert_eq!(world.process_pending_loads(), 1);
        assert!(world.chunk(ids[0]).is_bound());

        world.set_file_exists(ids[1], false);
        assert!(!world.request_load(ids[1]));
        assert!(!world.load_now(ids[1]));

        world.set_file_exists(ids[1], true);
        world.set_corrupt(ids[1], true);
        assert!(!world.request_load(ids[1]));
        assert!(!world.load_now(ids[1]));
        assert!(!world.chunk(ids[1]).is_resident());
        assert!(world.chunk(ids[1]).file_exists());
    }

    #[test]
    fn unload_skips_locked() {
        let mut world = ChunkWorld::with_outdoor_grid(GridBox::new(0, 2, 0, 0));
        let ids: Vec<_> = world.ids().collect();
        for &id in &ids {
            world.load_now(id);
        }
        let locked = LockedChunks::new();
        locked.lock(ids[2]);

        let marked = world.mark_removable_outside(GridBox::new(0, 0, 0, 0), &FnvHashSet::default());
        assert_eq!(marked, 2);
        assert_eq!(world.unload_removable(&locked), 1);
        assert!(world.chunk(ids[0]).is_bound());
        assert_eq!(world.chunk(ids[1]).state(), LoadState::Unloaded);
        assert!(world.chunk(ids[2]).is_bound());
        assert!(!world.chunk(ids[2]).is_removable());
    }
}
