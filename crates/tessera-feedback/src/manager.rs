//! Feedback Manager
//!
//! Per-frame driver of tile streaming. A frame looks like:
//!
//! 1. `begin_frame`: consume the feedback resolved N frames ago, update
//!    residency, size the heap pool, admit tiles, and report the tiles to
//!    unmap and map plus any defragmentation moves
//! 2. The host unmaps, maps and uploads, then calls `update_tile_mappings`
//! 3. The host resolves feedback for `textures_to_resolve` through `resolve_feedback`
//! 4. `end_frame` rotates the round-robin ring and publishes statistics

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tessera_core::{
    DefragMove, FrameClock, HeapId, MinMipSummary, Stopwatch, TextureId, TileInfo, TileState,
    TiledTextureDesc, TiledTextureManager, TiledTextureManagerConfig, TiledTextureManagerDesc,
};

use crate::heap_allocator::{HeapAllocator, HeapBackend};
use crate::ring::{FeedbackData, FeedbackRing};
use crate::stats::{FeedbackManagerStats, SharedStats};
use crate::texture_sets::{TextureSetId, TextureSetRegistry};
use crate::{FeedbackManagerDesc, FeedbackResult, FeedbackUpdateConfig};

/// Tile indices of one texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureTiles {
    pub texture: TextureId,
    pub tiles: Vec<u32>,
}

/// Work for the host produced by [`FeedbackManager::begin_frame`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameUpdate {
    pub frame_index: u64,
    /// Tiles to unmap before any new mapping, slots already returned to the pool
    pub tiles_to_unmap: Vec<TextureTiles>,
    /// Tiles holding a reserved slot, to map and upload
    pub tiles_to_map: Vec<TextureTiles>,
    /// Relocations to apply, then report through `complete_defrag_moves`
    pub defrag_moves: Vec<DefragMove>,
    /// Textures whose feedback the host resolves this frame
    pub textures_to_resolve: Vec<TextureId>,
    pub heaps_added: Vec<HeapId>,
    /// Heaps released to deferred destruction
    pub heaps_released: Vec<HeapId>,
}

/// Committed tiles of one texture living in one heap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileMappingBatch {
    pub texture: TextureId,
    pub heap: HeapId,
    pub tiles: Vec<u32>,
    /// Byte offset of each tile's slot inside the heap
    pub byte_offsets: Vec<u64>,
}

/// Frame-pipelined owner of the residency engine and its heaps
pub struct FeedbackManager<B: HeapBackend> {
    desc: FeedbackManagerDesc,
    residency: TiledTextureManager,
    heaps: HeapAllocator<B>,
    ring: FeedbackRing,
    sets: TextureSetRegistry,
    textures: IndexSet<TextureId>,
    /// Round-robin order for feedback readback
    feedback_order: VecDeque<TextureId>,
    dirty_min_mip: IndexSet<TextureId>,
    clock: FrameClock,
    frame_index: u64,
    begin_frame_watch: Stopwatch,
    update_watch: Stopwatch,
    resolve_watch: Stopwatch,
    resolve_seconds: f64,
    textures_serviced: u32,
    heap_allocation_failures: u64,
    stats: SharedStats,
}

impl<B: HeapBackend> FeedbackManager<B> {
    /// Create a manager timing standby tiles with the wall clock
    pub fn new(desc: FeedbackManagerDesc, backend: B) -> FeedbackResult<Self> {
        Self::with_clock(desc, backend, FrameClock::wall())
    }

    /// Create a manager with an explicit clock
    pub fn with_clock(desc: FeedbackManagerDesc, backend: B, clock: FrameClock) -> FeedbackResult<Self> {
        desc.validate()?;
        let residency = TiledTextureManager::new(TiledTextureManagerDesc {
            heap_tiles_capacity: desc.heap_size_in_tiles,
            always_map_packed_tiles: desc.always_map_packed_tiles,
        })?;
        let frames = desc.num_frames_in_flight as usize;

        log::info!(
            "Feedback manager: {} frames in flight, {} tiles per heap ({} bytes)",
            frames,
            desc.heap_size_in_tiles,
            desc.heap_size_in_bytes()
        );

        Ok(Self {
            heaps: HeapAllocator::new(backend, desc.heap_size_in_bytes(), frames),
            ring: FeedbackRing::new(frames),
            desc,
            residency,
            sets: TextureSetRegistry::new(),
            textures: IndexSet::new(),
            feedback_order: VecDeque::new(),
            dirty_min_mip: IndexSet::new(),
            clock,
            frame_index: 0,
            begin_frame_watch: Stopwatch::new(),
            update_watch: Stopwatch::new(),
            resolve_watch: Stopwatch::new(),
            resolve_seconds: 0.0,
            textures_serviced: 0,
            heap_allocation_failures: 0,
            stats: Arc::new(Mutex::new(FeedbackManagerStats::default())),
        })
    }

    pub fn desc(&self) -> &FeedbackManagerDesc {
        &self.desc
    }

    /// Residency table, for queries
    pub fn residency(&self) -> &TiledTextureManager {
        &self.residency
    }

    pub fn heap_allocator(&self) -> &HeapAllocator<B> {
        &self.heaps
    }

    /// Host handle of a live heap
    pub fn heap(&self, id: HeapId) -> Option<&B::Heap> {
        self.heaps.heap(id)
    }

    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }

    pub fn texture_sets(&self) -> &TextureSetRegistry {
        &self.sets
    }

    /// Registered textures in creation order
    pub fn textures(&self) -> impl Iterator<Item = TextureId> + '_ {
        self.textures.iter().copied()
    }

    /// Register a tiled texture
    pub fn create_texture(&mut self, desc: TiledTextureDesc) -> FeedbackResult<TextureId> {
        let id = self.residency.add_tiled_texture(desc)?;
        self.textures.insert(id);
        self.feedback_order.push_back(id);
        self.dirty_min_mip.insert(id);
        log::info!("Created tiled texture {}", id);
        Ok(id)
    }

    /// Unregister a texture and drop it from every set and pending readback
    pub fn remove_texture(&mut self, id: TextureId) -> FeedbackResult<()> {
        self.residency.remove_tiled_texture(id)?;
        self.textures.shift_remove(&id);
        self.feedback_order.retain(|&t| t != id);
        self.dirty_min_mip.shift_remove(&id);
        self.ring.forget(id);
        self.sets.remove_texture_everywhere(id);
        log::info!("Removed tiled texture {}", id);
        Ok(())
    }

    /// Group textures sharing coordinates; the first one is the primary
    pub fn create_texture_set(&mut self, textures: &[TextureId]) -> FeedbackResult<TextureSetId> {
        self.sets.create(&self.residency, textures)
    }

    pub fn remove_texture_set(&mut self, id: TextureSetId) -> FeedbackResult<()> {
        self.sets.remove_set(id).map(|_| ())
    }

    pub fn add_texture_to_set(&mut self, set: TextureSetId, texture: TextureId) -> FeedbackResult<()> {
        self.sets.add_texture(&self.residency, set, texture)
    }

    /// Remove a texture from a set; returns `true` if the set was dissolved
    pub fn remove_texture_from_set(&mut self, set: TextureSetId, texture: TextureId) -> FeedbackResult<bool> {
        self.sets.remove_texture(set, texture)
    }

    pub fn set_texture_set_primary(&mut self, set: TextureSetId, index: usize) -> FeedbackResult<()> {
        self.sets.set_primary_index(&self.residency, set, index)
    }

    /// Start a frame
    pub fn begin_frame(&mut self, config: &FeedbackUpdateConfig) -> FeedbackResult<FrameUpdate> {
        let _span = tracing::debug_span!("begin_frame", frame_index = config.frame_index).entered();
        self.begin_frame_watch.start();
        let update = self.run_begin_frame(config);
        self.begin_frame_watch.stop();
        update
    }

    fn run_begin_frame(&mut self, config: &FeedbackUpdateConfig) -> FeedbackResult<FrameUpdate> {
        let frame_index = config.frame_index;
        let bucket = (frame_index % self.ring.len() as u64) as usize;
        self.frame_index = frame_index;
        self.resolve_seconds = 0.0;
        self.heaps.begin_frame(bucket);
        self.residency.set_config(TiledTextureManagerConfig {
            num_extra_standby_tiles: config.num_extra_standby_tiles,
            max_tiles_to_map_per_frame: config.max_tiles_to_map_per_frame,
        });

        self.textures_serviced = self.consume_feedback(config);

        let textures_to_resolve = self.textures_for_feedback(config.max_textures_to_update);
        self.ring.schedule(frame_index, textures_to_resolve.clone());

        if config.trim_standby_tiles {
            self.residency.trim_standby_tiles();
        }

        let mut update = FrameUpdate {
            frame_index,
            textures_to_resolve,
            ..Default::default()
        };

        let desired = self.residency.num_desired_heaps();
        if desired > self.residency.num_heaps() {
            self.grow_heaps(desired, &mut update.heaps_added)?;
        } else if config.release_empty_heaps {
            for id in self.residency.release_empty_heaps() {
                self.heaps.release_heap(id, bucket)?;
                update.heaps_released.push(id);
            }
        }

        self.residency.allocate_requested_tiles();

        for &texture in &self.textures {
            let unmap = self.residency.take_tiles_to_unmap(texture)?;
            if !unmap.is_empty() {
                self.dirty_min_mip.insert(texture);
                update.tiles_to_unmap.push(TextureTiles { texture, tiles: unmap });
            }
            let map = self.residency.tiles_to_map(texture)?;
            if !map.is_empty() {
                update.tiles_to_map.push(TextureTiles { texture, tiles: map });
            }
        }

        if config.defragment_heaps {
            update.defrag_moves = self.residency.defragment_tiles(config.max_defrag_moves)?;
        }

        Ok(update)
    }

    /// Feed the readbacks that completed for this frame into the residency table
    fn consume_feedback(&mut self, config: &FeedbackUpdateConfig) -> u32 {
        let (produced, completed) = self.ring.begin_frame(config.frame_index);
        if config.events.suppresses_feedback() {
            if !completed.is_empty() {
                log::info!(
                    "Discarding {} feedback readbacks from frame {:?} ({:?})",
                    completed.len(),
                    produced,
                    config.events
                );
            }
            return 0;
        }

        let now = self.clock.now_seconds();
        let timeout = config.tile_timeout_seconds;
        let mut serviced = 0;

        for (texture, data) in completed {
            if !self.residency.contains(texture) {
                continue;
            }
            let request = match self.residency.layout(texture).and_then(|layout| data.decode(layout)) {
                Ok(request) => request,
                Err(e) => {
                    log::warn!("Dropping feedback for {}: {}", texture, e);
                    continue;
                }
            };
            if let Err(e) = self.residency.update_with_feedback(texture, &request, now, timeout) {
                log::warn!("Dropping feedback for {}: {}", texture, e);
                continue;
            }
            serviced += 1;

            if !self.sets.is_primary(texture) {
                continue;
            }
            for follower in self.sets.followers_of(texture) {
                if let Err(e) = self.residency.match_primary_texture(texture, follower, now, timeout) {
                    log::warn!("Cannot match {} to primary {}: {}", follower, texture, e);
                }
            }
        }
        serviced
    }

    /// Next textures in round-robin order that take their own feedback
    fn textures_for_feedback(&self, max_textures: u32) -> Vec<TextureId> {
        let eligible = self
            .feedback_order
            .iter()
            .copied()
            .filter(|&texture| self.sets.needs_feedback(texture));
        match max_textures {
            0 => eligible.collect(),
            max => eligible.take(max as usize).collect(),
        }
    }

    fn grow_heaps(&mut self, desired: u32, added: &mut Vec<HeapId>) -> FeedbackResult<()> {
        while self.residency.num_heaps() < desired {
            match self.heaps.allocate_heap() {
                Ok(id) => {
                    self.residency.add_heap(id)?;
                    added.push(id);
                }
                Err(e) => {
                    self.heap_allocation_failures += 1;
                    log::warn!("Heap allocation failed, continuing with {} heaps: {}", self.residency.num_heaps(), e);
                    break;
                }
            }
        }
        if !added.is_empty() {
            log::info!("Grew heap pool to {} heaps", self.residency.num_heaps());
        }
        Ok(())
    }

    /// Commit tiles the host has mapped and uploaded
    ///
    /// Returns the committed tiles grouped per texture and heap, with the byte
    /// offset of each slot. Tiles without a reservation and removed textures
    /// are skipped. Every tile is checked before anything is committed, so an
    /// out-of-range tile leaves the residency table untouched.
    pub fn update_tile_mappings(&mut self, tiles: &[TextureTiles]) -> FeedbackResult<Vec<TileMappingBatch>> {
        let _span = tracing::debug_span!("update_tile_mappings", textures = tiles.len()).entered();
        self.update_watch.start();
        let batches = self.commit_tile_mappings(tiles);
        self.update_watch.stop();
        batches
    }

    fn commit_tile_mappings(&mut self, tiles: &[TextureTiles]) -> FeedbackResult<Vec<TileMappingBatch>> {
        let tile_size = self.desc.tile_size_in_bytes;
        let mut pending = Vec::with_capacity(tiles.len());
        for entry in tiles {
            if !self.residency.contains(entry.texture) {
                log::debug!("Skipping mapping update for removed {}", entry.texture);
                continue;
            }

            let mut per_heap: IndexMap<HeapId, TileMappingBatch> = IndexMap::new();
            let mut committed = Vec::with_capacity(entry.tiles.len());
            for &tile in &entry.tiles {
                let TileState::Requested { reservation: Some(slot) } = self.residency.tile_state(entry.texture, tile)? else {
                    continue;
                };
                committed.push(tile);
                let batch = per_heap.entry(slot.heap).or_insert_with(|| TileMappingBatch {
                    texture: entry.texture,
                    heap: slot.heap,
                    tiles: Vec::new(),
                    byte_offsets: Vec::new(),
                });
                batch.tiles.push(tile);
                batch.byte_offsets.push(slot.byte_offset(tile_size));
            }
            if !committed.is_empty() {
                pending.push((entry.texture, committed, per_heap));
            }
        }

        let mut batches = Vec::new();
        for (texture, committed, per_heap) in pending {
            self.residency.update_tiles_mapping(texture, &committed)?;
            self.dirty_min_mip.insert(texture);
            batches.extend(per_heap.into_values());
        }
        Ok(batches)
    }

    /// Report applied defragmentation moves, freeing their source slots
    pub fn complete_defrag_moves(&mut self, moves: &[DefragMove]) -> FeedbackResult<usize> {
        Ok(self.residency.complete_moves(moves)?)
    }

    /// Record this frame's resolved feedback for a scheduled texture
    pub fn resolve_feedback(&mut self, texture: TextureId, data: FeedbackData) -> FeedbackResult<()> {
        let _span = tracing::debug_span!("resolve_feedback", texture = texture.0).entered();
        self.resolve_watch.start();
        let result = self.ring.resolve(self.frame_index, texture, data);
        self.resolve_seconds += self.resolve_watch.stop().as_secs_f64();
        result
    }

    /// Finish the frame: rotate the feedback ring and publish statistics
    pub fn end_frame(&mut self) {
        let serviced = self.ring.scheduled(self.frame_index).to_vec();
        if !serviced.is_empty() && serviced.len() < self.feedback_order.len() {
            self.feedback_order.retain(|t| !serviced.contains(t));
            self.feedback_order.extend(serviced);
        }

        let residency = self.residency.statistics();
        let mut stats = self.stats.lock();
        stats.frame_index = self.frame_index;
        stats.apply_residency(&residency);
        stats.heap_allocation_in_bytes = self.heaps.total_allocation_in_bytes();
        stats.heap_free_in_bytes = residency.heap_free_tiles as u64 * self.desc.tile_size_in_bytes;
        stats.textures_serviced = self.textures_serviced;
        stats.heap_allocation_failures = self.heap_allocation_failures;
        stats.cputime_begin_frame = self.begin_frame_watch.elapsed_secs();
        stats.cputime_update_tile_mappings = self.update_watch.elapsed_secs();
        stats.cputime_resolve = self.resolve_seconds;
    }

    /// MinMip summaries of textures whose residency changed since the last call
    pub fn take_min_mip_updates(&mut self) -> FeedbackResult<Vec<(TextureId, MinMipSummary)>> {
        let dirty = std::mem::take(&mut self.dirty_min_mip);
        let mut updates = Vec::with_capacity(dirty.len());
        for texture in dirty {
            if self.residency.contains(texture) {
                updates.push((texture, self.residency.min_mip_summary(texture)?));
            }
        }
        Ok(updates)
    }

    /// Statistics published by the last `end_frame`
    pub fn stats(&self) -> FeedbackManagerStats {
        self.stats.lock().clone()
    }

    /// Shared statistics handle for other threads
    pub fn stats_handle(&self) -> SharedStats {
        Arc::clone(&self.stats)
    }

    /// Heaps the current demand calls for
    pub fn num_desired_heaps(&self) -> u32 {
        self.residency.num_desired_heaps()
    }

    /// Texel regions to upload for a tile
    pub fn tile_info(&self, texture: TextureId, tile: u32) -> FeedbackResult<SmallVec<[TileInfo; 4]>> {
        Ok(self.residency.tile_info(texture, tile)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FeedbackError;
    use tessera_core::TileStateKind;

    #[derive(Default)]
    struct TestBackend {
        next: u32,
    }

    impl HeapBackend for TestBackend {
        type Heap = u32;
        type Error = String;

        fn create_heap(&mut self, _size_in_bytes: u64) -> Result<u32, String> {
            self.next += 1;
            Ok(self.next)
        }

        fn destroy_heap(&mut self, _heap: u32) {}
    }

    fn manager() -> FeedbackManager<TestBackend> {
        let desc = FeedbackManagerDesc { num_frames_in_flight: 1, ..Default::default() };
        FeedbackManager::with_clock(desc, TestBackend::default(), FrameClock::manual()).unwrap()
    }

    fn config(frame_index: u64) -> FeedbackUpdateConfig {
        FeedbackUpdateConfig {
            num_extra_standby_tiles: 0,
            max_tiles_to_map_per_frame: 0,
            ..FeedbackUpdateConfig::default()
        }
        .with_frame_index(frame_index)
    }

    #[test]
    fn test_invalid_desc_rejected() {
        let desc = FeedbackManagerDesc { heap_size_in_tiles: 0, ..Default::default() };
        let result = FeedbackManager::new(desc, TestBackend::default());
        assert!(matches!(result, Err(FeedbackError::InvalidConfig(_))));
    }

    #[test]
    fn test_packed_tiles_mapped_first_frame() {
        let mut manager = manager();
        let texture = manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();

        let update = manager.begin_frame(&config(0)).unwrap();
        assert_eq!(update.heaps_added, vec![HeapId(0)]);
        assert_eq!(update.tiles_to_map, vec![TextureTiles { texture, tiles: vec![10] }]);
        assert_eq!(update.textures_to_resolve, vec![texture]);

        let batches = manager.update_tile_mappings(&update.tiles_to_map).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].heap, HeapId(0));
        assert_eq!(batches[0].byte_offsets, vec![0]);
        assert_eq!(
            manager.residency().tile_state(texture, 10).unwrap().kind(),
            TileStateKind::Mapped
        );
    }

    #[test]
    fn test_min_mip_updates_follow_mapping_changes() {
        let mut manager = manager();
        let texture = manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();
        let initial = manager.take_min_mip_updates().unwrap();
        assert_eq!(initial.len(), 1);
        assert!(initial[0].1.data.iter().all(|&m| m == 10));
        assert!(manager.take_min_mip_updates().unwrap().is_empty());

        let update = manager.begin_frame(&config(0)).unwrap();
        manager.update_tile_mappings(&update.tiles_to_map).unwrap();
        let updates = manager.take_min_mip_updates().unwrap();
        assert_eq!(updates[0].0, texture);
        assert!(updates[0].1.data.iter().all(|&m| m == 2));
    }

    #[test]
    fn test_stale_mapping_update_skipped() {
        let mut manager = manager();
        let texture = manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();
        let update = manager.begin_frame(&config(0)).unwrap();
        manager.remove_texture(texture).unwrap();

        assert!(manager.update_tile_mappings(&update.tiles_to_map).unwrap().is_empty());
        assert!(manager.remove_texture(texture).is_err());
    }

    #[test]
    fn test_mapping_update_validated_before_commit() {
        let mut manager = manager();
        let first = manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();
        let second = manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(256, 256, 128, 128))
            .unwrap();
        let update = manager.begin_frame(&config(0)).unwrap();
        assert!(!manager.begin_frame_watch.is_running());

        let bad = [
            TextureTiles { texture: first, tiles: vec![10] },
            TextureTiles { texture: second, tiles: vec![999] },
        ];
        assert!(manager.update_tile_mappings(&bad).is_err());
        assert!(!manager.update_watch.is_running());
        assert_eq!(
            manager.residency().tile_state(first, 10).unwrap().kind(),
            TileStateKind::Requested
        );

        let batches = manager.update_tile_mappings(&update.tiles_to_map).unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            manager.residency().tile_state(first, 10).unwrap().kind(),
            TileStateKind::Mapped
        );
    }

    #[test]
    fn test_stats_published_at_end_frame() {
        let mut manager = manager();
        manager
            .create_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();
        let handle = manager.stats_handle();

        let update = manager.begin_frame(&config(0)).unwrap();
        manager.update_tile_mappings(&update.tiles_to_map).unwrap();
        assert_eq!(handle.lock().tiles_total, 0);

        manager.end_frame();
        let stats = handle.lock().clone();
        assert_eq!(stats.tiles_total, 11);
        assert_eq!(stats.tiles_mapped, 1);
        assert_eq!(stats.heap_count, 1);
        assert_eq!(stats.heap_allocation_in_bytes, 256 * 64 * 1024);
        assert_eq!(stats.heap_tiles_free, 255);
        assert_eq!(stats.heap_free_in_bytes, 255 * 64 * 1024);
        assert!(stats.cputime_begin_frame >= 0.0);
        assert_eq!(manager.stats(), stats);
    }
}
