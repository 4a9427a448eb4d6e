//! Tile Residency Table
//!
//! [`TiledTextureManager`] is the authoritative record of every tile of every
//! registered texture. It owns the heap pool and the admission queues; the
//! admission, compaction, MinMip and texture-set logic extend it from their
//! own modules.

use std::collections::VecDeque;

use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::feedback::FeedbackRequest;
use crate::heap::HeapPool;
use crate::texture::{TileCoord, TileInfo, TileLayout, TiledTextureDesc};
use crate::tile::{Tile, TileEvent, TileState, TileStateKind};
use crate::{SlotRef, TextureId, TileError, TileRef, TileResult};

/// Construction parameters of a [`TiledTextureManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledTextureManagerDesc {
    /// Tile slots per heap
    pub heap_tiles_capacity: u32,
    /// Keep the packed mip tiles of every texture mapped for its whole lifetime
    pub always_map_packed_tiles: bool,
}

impl Default for TiledTextureManagerDesc {
    fn default() -> Self {
        Self {
            heap_tiles_capacity: 256,
            always_map_packed_tiles: true,
        }
    }
}

/// Per-frame tunables of a [`TiledTextureManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledTextureManagerConfig {
    /// Standby margin added to demand when sizing heaps, also the standby trim limit
    pub num_extra_standby_tiles: u32,
    /// Regular tiles admitted per frame, 0 = unlimited
    pub max_tiles_to_map_per_frame: u32,
}

impl Default for TiledTextureManagerConfig {
    fn default() -> Self {
        Self {
            num_extra_standby_tiles: 2000,
            max_tiles_to_map_per_frame: 256,
        }
    }
}

/// Aggregate residency counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Tiles of all registered textures
    pub total_tiles: u32,
    /// Tiles waiting for a slot or for the caller to commit the mapping
    pub requested_tiles: u32,
    /// Requested tiles holding a reserved slot
    pub reserved_tiles: u32,
    /// Occupied heap slots
    pub allocated_tiles: u32,
    pub mapped_tiles: u32,
    pub standby_tiles: u32,
    pub pending_unmap_tiles: u32,
    pub heap_count: u32,
    pub heap_free_tiles: u32,
    /// Slots vacated by defragmentation moves not yet completed
    pub retiring_slots: u32,
}

/// Per-state tile counters
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct StateCounts {
    by_kind: [u32; 5],
    reserved: u32,
    reserved_regular: u32,
}

impl StateCounts {
    pub(crate) fn get(&self, kind: TileStateKind) -> u32 {
        self.by_kind[kind as usize]
    }

    pub(crate) fn reserved(&self) -> u32 {
        self.reserved
    }

    /// Reservations held by regular tiles
    pub(crate) fn reserved_regular(&self) -> u32 {
        self.reserved_regular
    }

    fn add(&mut self, tile: &Tile) {
        self.by_kind[tile.state.kind() as usize] += 1;
        if matches!(tile.state, TileState::Requested { reservation: Some(_) }) {
            self.reserved += 1;
            if !tile.packed {
                self.reserved_regular += 1;
            }
        }
    }

    fn remove(&mut self, tile: &Tile) {
        self.by_kind[tile.state.kind() as usize] -= 1;
        if matches!(tile.state, TileState::Requested { reservation: Some(_) }) {
            self.reserved -= 1;
            if !tile.packed {
                self.reserved_regular -= 1;
            }
        }
    }
}

/// Apply `event` to `tile`, keeping the counters in sync
///
/// Returns `false` and leaves the tile untouched if the transition is not allowed.
pub(crate) fn transition(counts: &mut StateCounts, tile: &mut Tile, event: TileEvent) -> bool {
    match tile.state.on(event) {
        Some(next) => {
            counts.remove(tile);
            tile.state = next;
            counts.add(tile);
            true
        }
        None => false,
    }
}

/// Residency bookkeeping of one texture
#[derive(Debug)]
pub(crate) struct TextureEntry {
    pub(crate) layout: TileLayout,
    pub(crate) tiles: Vec<Tile>,
    /// Tiles reported by the most recent feedback
    pub(crate) active: Vec<bool>,
    /// Tiles that entered `PendingUnmap` and were not handed to the caller yet
    pub(crate) pending_unmap: Vec<u32>,
}

impl TextureEntry {
    fn check_tile(&self, id: TextureId, tile: u32) -> TileResult<()> {
        if (tile as usize) < self.tiles.len() {
            Ok(())
        } else {
            Err(TileError::TileOutOfRange { texture: id, tile })
        }
    }
}

/// Residency table for all tiled textures sharing one heap pool
#[derive(Debug)]
pub struct TiledTextureManager {
    pub(crate) desc: TiledTextureManagerDesc,
    pub(crate) config: TiledTextureManagerConfig,
    pub(crate) textures: AHashMap<TextureId, TextureEntry>,
    next_texture_id: u32,
    pub(crate) pool: HeapPool,
    /// Regular tiles waiting for a slot, oldest first
    pub(crate) request_queue: VecDeque<TileRef>,
    /// Packed tiles waiting for a slot, admitted outside the frame budget
    pub(crate) packed_queue: VecDeque<TileRef>,
    pub(crate) counts: StateCounts,
    /// Largest heap count reported since the last heap removal
    pub(crate) high_water: std::cell::Cell<u32>,
    pub(crate) pending_moves: Vec<crate::compaction::DefragMove>,
}

impl TiledTextureManager {
    /// Create an empty residency table
    pub fn new(desc: TiledTextureManagerDesc) -> TileResult<Self> {
        let pool = HeapPool::new(desc.heap_tiles_capacity)?;
        Ok(Self {
            desc,
            config: TiledTextureManagerConfig::default(),
            textures: AHashMap::new(),
            next_texture_id: 0,
            pool,
            request_queue: VecDeque::new(),
            packed_queue: VecDeque::new(),
            counts: StateCounts::default(),
            high_water: std::cell::Cell::new(0),
            pending_moves: Vec::new(),
        })
    }

    pub fn desc(&self) -> &TiledTextureManagerDesc {
        &self.desc
    }

    pub fn config(&self) -> &TiledTextureManagerConfig {
        &self.config
    }

    /// Replace the per-frame tunables
    pub fn set_config(&mut self, config: TiledTextureManagerConfig) {
        self.config = config;
    }

    /// The heap pool backing all textures
    pub fn heap_pool(&self) -> &HeapPool {
        &self.pool
    }

    /// Register a texture, returning its identifier
    ///
    /// With `always_map_packed_tiles`, the packed tiles are requested immediately
    /// and stay resident until the texture is removed.
    pub fn add_tiled_texture(&mut self, desc: TiledTextureDesc) -> TileResult<TextureId> {
        let layout = TileLayout::new(desc)?;
        let id = TextureId(self.next_texture_id);
        self.next_texture_id += 1;

        let total = layout.total_tiles() as usize;
        let tiles = (0..layout.total_tiles())
            .map(|index| Tile { packed: layout.is_packed(index), ..Tile::default() })
            .collect();
        let mut entry = TextureEntry {
            tiles,
            active: vec![false; total],
            pending_unmap: Vec::new(),
            layout,
        };
        for tile in &entry.tiles {
            self.counts.add(tile);
        }

        if self.desc.always_map_packed_tiles {
            for index in entry.layout.packed_tiles() {
                if transition(&mut self.counts, &mut entry.tiles[index as usize], TileEvent::Request) {
                    self.packed_queue.push_back(TileRef::new(id, index));
                }
            }
        }

        log::debug!(
            "Registered tiled texture {} ({}x{}, {} regular + {} packed tiles)",
            id,
            entry.layout.desc().width,
            entry.layout.desc().height,
            entry.layout.regular_tile_count(),
            entry.layout.desc().packed_tiles
        );

        self.textures.insert(id, entry);
        Ok(id)
    }

    /// Unregister a texture, freeing every slot its tiles held
    pub fn remove_tiled_texture(&mut self, id: TextureId) -> TileResult<()> {
        let entry = self.textures.remove(&id).ok_or(TileError::UnknownTexture(id))?;
        for tile in &entry.tiles {
            if let Some(slot) = tile.state.slot() {
                self.pool.release(slot)?;
            }
            self.counts.remove(tile);
        }
        log::debug!("Removed tiled texture {}", id);
        Ok(())
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.textures.contains_key(&id)
    }

    /// Registered textures in identifier order
    pub fn texture_ids(&self) -> Vec<TextureId> {
        let mut ids: Vec<_> = self.textures.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn layout(&self, id: TextureId) -> TileResult<&TileLayout> {
        Ok(&self.entry(id)?.layout)
    }

    pub fn texture_desc(&self, id: TextureId) -> TileResult<&TiledTextureDesc> {
        Ok(self.entry(id)?.layout.desc())
    }

    /// Ingest the tiles sampled for a texture this frame
    ///
    /// Newly reported tiles are requested, standby tiles come back to `Mapped`,
    /// mapped tiles no longer reported go to `Standby` stamped with `timestamp`,
    /// and standby tiles absent for longer than `timeout` seconds are scheduled
    /// for unmapping.
    pub fn update_with_feedback(
        &mut self,
        id: TextureId,
        request: &FeedbackRequest,
        timestamp: f64,
        timeout: f64,
    ) -> TileResult<()> {
        let (regular, packed) = request.split_packed(self.layout(id)?);
        log::trace!("Feedback for {}: {} regular, {} packed tiles", id, regular.len(), packed.len());
        self.apply_active_tiles(id, request.tiles(), timestamp, timeout)
    }

    /// Run the residency transitions for a sorted, deduplicated active tile list
    pub(crate) fn apply_active_tiles(
        &mut self,
        id: TextureId,
        active_tiles: &[u32],
        timestamp: f64,
        timeout: f64,
    ) -> TileResult<()> {
        let Self { textures, counts, request_queue, packed_queue, desc, .. } = self;
        let entry = textures.get_mut(&id).ok_or(TileError::UnknownTexture(id))?;
        for &tile in active_tiles {
            entry.check_tile(id, tile)?;
        }

        let timeout = timeout.max(0.0);
        entry.active.fill(false);
        for &tile in active_tiles {
            entry.active[tile as usize] = true;
        }

        for index in 0..entry.tiles.len() {
            let tile = &mut entry.tiles[index];
            let packed = tile.packed;

            if entry.active[index] {
                tile.last_requested = timestamp;
                match tile.state {
                    TileState::Unmapped => {
                        transition(counts, tile, TileEvent::Request);
                        let queue = if packed { &mut *packed_queue } else { &mut *request_queue };
                        queue.push_back(TileRef::new(id, index as u32));
                    }
                    TileState::Standby { .. } => {
                        transition(counts, tile, TileEvent::Rerequest);
                    }
                    _ => {}
                }
                continue;
            }

            if packed && desc.always_map_packed_tiles {
                continue;
            }

            match tile.state {
                TileState::Requested { reservation: None } => {
                    transition(counts, tile, TileEvent::Cancel);
                }
                TileState::Mapped { .. } => {
                    transition(counts, tile, TileEvent::Release { now: timestamp });
                }
                TileState::Standby { since, .. } if timestamp - since > timeout => {
                    transition(counts, tile, TileEvent::Expire);
                    entry.pending_unmap.push(index as u32);
                }
                _ => {}
            }
        }

        self.compact_request_queue();
        Ok(())
    }

    /// Drop cancelled and duplicate entries once they dominate the queue
    fn compact_request_queue(&mut self) {
        let live = self.counts.get(TileStateKind::Requested) as usize;
        if self.request_queue.len() <= 2 * live + 64 {
            return;
        }

        let textures = &self.textures;
        let mut seen = AHashSet::with_capacity(live);
        self.request_queue.retain(|tile| {
            let waiting = textures
                .get(&tile.texture)
                .and_then(|entry| entry.tiles.get(tile.tile as usize))
                .is_some_and(|t| matches!(t.state, TileState::Requested { reservation: None }));
            waiting && seen.insert(*tile)
        });
    }

    /// Tiles holding a reserved slot that the caller must map and upload
    pub fn tiles_to_map(&self, id: TextureId) -> TileResult<Vec<u32>> {
        let entry = self.entry(id)?;
        Ok(entry
            .tiles
            .iter()
            .enumerate()
            .filter(|(_, t)| matches!(t.state, TileState::Requested { reservation: Some(_) }))
            .map(|(index, _)| index as u32)
            .collect())
    }

    /// Commit tiles the caller has mapped and uploaded
    ///
    /// Only tiles holding a reservation move to `Mapped`; others are left as is.
    /// Returns the number of committed tiles.
    pub fn update_tiles_mapping(&mut self, id: TextureId, tiles: &[u32]) -> TileResult<usize> {
        let Self { textures, counts, .. } = self;
        let entry = textures.get_mut(&id).ok_or(TileError::UnknownTexture(id))?;
        for &tile in tiles {
            entry.check_tile(id, tile)?;
        }

        let mut committed = 0;
        for &tile in tiles {
            if transition(counts, &mut entry.tiles[tile as usize], TileEvent::Commit) {
                committed += 1;
            }
        }
        Ok(committed)
    }

    /// Hand over the tiles scheduled for unmapping and free their slots
    ///
    /// Taking the list is the caller's acknowledgement: the tiles become
    /// `Unmapped` and their slots return to the pool. Allocation for the
    /// current frame has already run, so those slots are reused no earlier
    /// than the next frame.
    pub fn take_tiles_to_unmap(&mut self, id: TextureId) -> TileResult<Vec<u32>> {
        let Self { textures, counts, pool, .. } = self;
        let entry = textures.get_mut(&id).ok_or(TileError::UnknownTexture(id))?;

        let mut unmapped = Vec::with_capacity(entry.pending_unmap.len());
        for index in std::mem::take(&mut entry.pending_unmap) {
            let tile = &mut entry.tiles[index as usize];
            if let TileState::PendingUnmap { slot } = tile.state {
                pool.release(slot)?;
                transition(counts, tile, TileEvent::Acknowledge);
                unmapped.push(index);
            }
        }
        unmapped.sort_unstable();
        Ok(unmapped)
    }

    /// Tiles reported by the most recent feedback for a texture
    pub fn active_tiles(&self, id: TextureId) -> TileResult<Vec<u32>> {
        let entry = self.entry(id)?;
        Ok(entry
            .active
            .iter()
            .enumerate()
            .filter(|(_, active)| **active)
            .map(|(index, _)| index as u32)
            .collect())
    }

    pub fn tile_state(&self, id: TextureId, tile: u32) -> TileResult<TileState> {
        let entry = self.entry(id)?;
        entry.check_tile(id, tile)?;
        Ok(entry.tiles[tile as usize].state)
    }

    /// Slot backing a tile, reservations included
    pub fn tile_allocation(&self, id: TextureId, tile: u32) -> TileResult<Option<SlotRef>> {
        Ok(self.tile_state(id, tile)?.slot())
    }

    /// Mip and grid position of every regular tile
    pub fn tile_coordinates(&self, id: TextureId) -> TileResult<&[TileCoord]> {
        Ok(self.entry(id)?.layout.coords())
    }

    /// Texel regions to upload for a tile
    pub fn tile_info(&self, id: TextureId, tile: u32) -> TileResult<SmallVec<[TileInfo; 4]>> {
        let entry = self.entry(id)?;
        entry.check_tile(id, tile)?;
        Ok(entry.layout.tile_info(tile))
    }

    pub fn is_tile_packed(&self, id: TextureId, tile: u32) -> TileResult<bool> {
        let entry = self.entry(id)?;
        entry.check_tile(id, tile)?;
        Ok(entry.layout.is_packed(tile))
    }

    /// Snapshot of the aggregate counters
    pub fn statistics(&self) -> Statistics {
        Statistics {
            total_tiles: self.textures.values().map(|e| e.tiles.len() as u32).sum(),
            requested_tiles: self.counts.get(TileStateKind::Requested),
            reserved_tiles: self.counts.reserved(),
            allocated_tiles: self.pool.occupied_slots_count(),
            mapped_tiles: self.counts.get(TileStateKind::Mapped),
            standby_tiles: self.counts.get(TileStateKind::Standby),
            pending_unmap_tiles: self.counts.get(TileStateKind::PendingUnmap),
            heap_count: self.pool.num_heaps() as u32,
            heap_free_tiles: self.pool.free_slots(),
            retiring_slots: self.pool.retiring_slots(),
        }
    }

    pub(crate) fn entry(&self, id: TextureId) -> TileResult<&TextureEntry> {
        self.textures.get(&id).ok_or(TileError::UnknownTexture(id))
    }
}
