//! Heap Sizing and Compaction
//!
//! - Heap demand covers every tile holding or waiting for a slot plus the standby margin
//! - The desired heap count only grows until a heap is removed (high-water mark)
//! - Defragmentation drains the sparsest heaps into the densest ones
//! - Standby trimming evicts the oldest standby tiles beyond the standby margin
//!
//! Nothing here shrinks the pool on its own: heaps go away only through
//! [`TiledTextureManager::release_empty_heaps`] or an explicit
//! [`TiledTextureManager::remove_heap`].

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::heap::HeapOccupancy;
use crate::residency::{transition, TiledTextureManager};
use crate::tile::{TileEvent, TileState, TileStateKind};
use crate::{HeapId, SlotRef, TileRef, TileResult};

/// Relocation of a resident tile to another slot
///
/// The caller copies the tile contents and remaps the tile, then reports the
/// move through [`TiledTextureManager::complete_moves`]. The source slot stays
/// unavailable until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefragMove {
    pub tile: TileRef,
    pub from: SlotRef,
    pub to: SlotRef,
}

impl TiledTextureManager {
    /// Tiles that hold or wait for a slot, plus the standby margin
    pub fn demanded_tiles(&self) -> u32 {
        [
            self.counts.get(TileStateKind::Requested),
            self.counts.get(TileStateKind::Mapped),
            self.counts.get(TileStateKind::Standby),
            self.counts.get(TileStateKind::PendingUnmap),
            self.pool.retiring_slots(),
            self.config.num_extra_standby_tiles,
        ]
        .into_iter()
        .fold(0u32, u32::saturating_add)
    }

    /// Heaps needed to hold the current demand, never below a previously reported value
    ///
    /// The high-water mark resets when a heap is removed.
    pub fn num_desired_heaps(&self) -> u32 {
        let desired = self.demanded_heaps().max(self.high_water.get());
        self.high_water.set(desired);
        desired
    }

    fn demanded_heaps(&self) -> u32 {
        self.demanded_tiles().div_ceil(self.pool.capacity())
    }

    pub fn num_heaps(&self) -> u32 {
        self.pool.num_heaps() as u32
    }

    /// Register a heap created by the caller
    pub fn add_heap(&mut self, id: HeapId) -> TileResult<()> {
        self.pool.add_heap(id)?;
        log::debug!("Added {} ({} tiles)", id, self.pool.capacity());
        Ok(())
    }

    /// Unregister an empty heap
    pub fn remove_heap(&mut self, id: HeapId) -> TileResult<()> {
        self.pool.remove_heap(id)?;
        self.high_water.set(0);
        log::debug!("Removed {}", id);
        Ok(())
    }

    /// Heaps with no occupied or retiring slot
    pub fn empty_heaps(&self) -> Vec<HeapId> {
        self.pool.empty_heaps()
    }

    /// Unregister empty heaps not needed for the current demand
    ///
    /// The most recently added heaps go first. Returns the removed heaps; the
    /// caller destroys them once the GPU no longer references them.
    pub fn release_empty_heaps(&mut self) -> Vec<HeapId> {
        let surplus = self.num_heaps().saturating_sub(self.demanded_heaps()) as usize;
        let mut released: Vec<HeapId> = self.pool.empty_heaps().into_iter().rev().take(surplus).collect();
        released.retain(|&id| self.pool.remove_heap(id).is_ok());
        if !released.is_empty() {
            self.high_water.set(0);
            log::debug!("Released {} empty heaps", released.len());
        }
        released
    }

    /// Evict the oldest standby tiles beyond `num_extra_standby_tiles`
    ///
    /// Evicted tiles go through `PendingUnmap` like timed-out tiles. Returns the
    /// number of evicted tiles.
    pub fn trim_standby_tiles(&mut self) -> u32 {
        let standby = self.counts.get(TileStateKind::Standby);
        let excess = standby.saturating_sub(self.config.num_extra_standby_tiles);
        if excess == 0 {
            return 0;
        }

        let mut candidates = Vec::with_capacity(standby as usize);
        for (&id, entry) in &self.textures {
            for (index, tile) in entry.tiles.iter().enumerate() {
                if let TileState::Standby { since, .. } = tile.state {
                    candidates.push((since, TileRef::new(id, index as u32)));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut evicted = 0;
        for (_, tile) in candidates.into_iter().take(excess as usize) {
            let Some(entry) = self.textures.get_mut(&tile.texture) else {
                continue;
            };
            if transition(&mut self.counts, &mut entry.tiles[tile.tile as usize], TileEvent::Evict) {
                entry.pending_unmap.push(tile.tile);
                evicted += 1;
            }
        }
        log::debug!("Trimmed {} standby tiles", evicted);
        evicted
    }

    /// Plan up to `max_moves` relocations from sparse heaps into dense ones
    ///
    /// Only mapped and standby tiles move. Tiles with a move still in flight
    /// are left alone.
    pub fn defragment_tiles(&mut self, max_moves: u32) -> TileResult<Vec<DefragMove>> {
        let mut moves = Vec::new();
        let mut in_flight: AHashSet<TileRef> = self.pending_moves.iter().map(|m| m.tile).collect();

        while (moves.len() as u32) < max_moves {
            let Some((tile, from, destination)) = self.plan_move(&in_flight)? else {
                break;
            };

            let Some(to) = self.pool.allocate_in(destination, tile)? else {
                break;
            };
            self.pool.retire(from)?;
            if let Some(entry) = self.textures.get_mut(&tile.texture) {
                transition(&mut self.counts, &mut entry.tiles[tile.tile as usize], TileEvent::Relocate(to));
            }

            let mv = DefragMove { tile, from, to };
            in_flight.insert(mv.tile);
            self.pending_moves.push(mv);
            moves.push(mv);
        }

        if !moves.is_empty() {
            log::debug!("Planned {} defragmentation moves", moves.len());
        }
        Ok(moves)
    }

    /// Pick the next tile to move with its current slot and destination heap
    fn plan_move(&self, in_flight: &AHashSet<TileRef>) -> TileResult<Option<(TileRef, SlotRef, HeapId)>> {
        let heaps: Vec<HeapOccupancy> = self.pool.occupancy().collect();

        // Sparsest first, later heaps first among equals
        let mut sources: Vec<(usize, &HeapOccupancy)> =
            heaps.iter().enumerate().filter(|(_, h)| h.occupied > 0).collect();
        sources.sort_by(|a, b| a.1.occupied.cmp(&b.1.occupied).then(b.0.cmp(&a.0)));

        for (source_index, source) in sources {
            let destination = heaps
                .iter()
                .enumerate()
                .filter(|(i, h)| *i != source_index && h.free > 0 && h.occupied >= source.occupied)
                .rev()
                .max_by_key(|(_, h)| h.occupied);
            let Some((_, destination)) = destination else {
                continue;
            };

            for (from, tile) in self.pool.occupied_slots(source.id)? {
                if in_flight.contains(&tile) {
                    continue;
                }
                let movable = self
                    .textures
                    .get(&tile.texture)
                    .and_then(|entry| entry.tiles.get(tile.tile as usize))
                    .is_some_and(|t| t.state.is_resident());
                if movable {
                    return Ok(Some((tile, from, destination.id)));
                }
            }
        }
        Ok(None)
    }

    /// Free the source slots of moves the caller has applied
    ///
    /// Unknown or already completed moves are ignored. Returns the number of
    /// completed moves.
    pub fn complete_moves(&mut self, moves: &[DefragMove]) -> TileResult<usize> {
        let mut completed = 0;
        for mv in moves {
            let Some(position) = self.pending_moves.iter().position(|p| p == mv) else {
                continue;
            };
            self.pending_moves.swap_remove(position);
            self.pool.release_retiring(mv.from)?;
            completed += 1;
        }
        Ok(completed)
    }

    /// Moves handed out and not completed yet
    pub fn pending_moves(&self) -> &[DefragMove] {
        &self.pending_moves
    }
}

#[cfg(test)]
mod tests {
    use crate::feedback::FeedbackRequest;
    use crate::{
        HeapId, TextureId, TiledTextureDesc, TiledTextureManager, TiledTextureManagerConfig,
        TiledTextureManagerDesc, TileStateKind,
    };

    fn manager(capacity: u32, extra: u32) -> (TiledTextureManager, TextureId) {
        let desc = TiledTextureManagerDesc { heap_tiles_capacity: capacity, always_map_packed_tiles: false };
        let mut manager = TiledTextureManager::new(desc).unwrap();
        manager.set_config(TiledTextureManagerConfig {
            num_extra_standby_tiles: extra,
            max_tiles_to_map_per_frame: 0,
        });
        let id = manager
            .add_tiled_texture(TiledTextureDesc::with_full_mip_chain(1024, 1024, 128, 128))
            .unwrap();
        (manager, id)
    }

    fn request_and_map(manager: &mut TiledTextureManager, id: TextureId, tiles: &[u32], now: f64) {
        manager
            .update_with_feedback(id, &FeedbackRequest::from_tiles(tiles.iter().copied()), now, 1.0)
            .unwrap();
        manager.allocate_requested_tiles();
        let to_map = manager.tiles_to_map(id).unwrap();
        manager.update_tiles_mapping(id, &to_map).unwrap();
    }

    #[test]
    fn test_demand_saturates_with_huge_standby_margin() {
        let (mut manager, id) = manager(4, u32::MAX);
        manager.update_with_feedback(id, &FeedbackRequest::from_tiles([0]), 0.0, 1.0).unwrap();
        assert_eq!(manager.demanded_tiles(), u32::MAX);
        assert_eq!(manager.num_desired_heaps(), u32::MAX.div_ceil(4));
    }

    #[test]
    fn test_desired_heaps_from_demand() {
        let (mut manager, id) = manager(4, 0);
        assert_eq!(manager.num_desired_heaps(), 0);

        manager.update_with_feedback(id, &FeedbackRequest::from_tiles(0..5), 0.0, 1.0).unwrap();
        assert_eq!(manager.num_desired_heaps(), 2);

        manager.set_config(TiledTextureManagerConfig { num_extra_standby_tiles: 4, max_tiles_to_map_per_frame: 0 });
        assert_eq!(manager.num_desired_heaps(), 3);
    }

    #[test]
    fn test_high_water_mark() {
        let (mut manager, id) = manager(4, 0);
        manager.update_with_feedback(id, &FeedbackRequest::from_tiles(0..8), 0.0, 1.0).unwrap();
        assert_eq!(manager.num_desired_heaps(), 2);

        // Requests withdrawn before allocation: demand drops, the mark holds
        manager.update_with_feedback(id, &FeedbackRequest::default(), 0.1, 1.0).unwrap();
        assert_eq!(manager.demanded_tiles(), 0);
        assert_eq!(manager.num_desired_heaps(), 2);

        manager.add_heap(HeapId(0)).unwrap();
        manager.add_heap(HeapId(1)).unwrap();
        assert_eq!(manager.release_empty_heaps().len(), 2);
        assert_eq!(manager.num_desired_heaps(), 0);
    }

    #[test]
    fn test_release_keeps_needed_heaps() {
        let (mut manager, id) = manager(4, 0);
        for heap in 0..3 {
            manager.add_heap(HeapId(heap)).unwrap();
        }
        request_and_map(&mut manager, id, &[0, 1], 0.0);

        // Demand is one heap: the two empty ones go, trailing first
        let released = manager.release_empty_heaps();
        assert_eq!(released, vec![HeapId(2), HeapId(1)]);
        assert_eq!(manager.num_heaps(), 1);
    }

    #[test]
    fn test_trim_standby_oldest_first() {
        let (mut manager, id) = manager(64, 1);
        manager.add_heap(HeapId(0)).unwrap();
        request_and_map(&mut manager, id, &[0, 1, 2], 0.0);

        request_and_map(&mut manager, id, &[1, 2], 1.0);
        request_and_map(&mut manager, id, &[], 1.5);
        assert_eq!(manager.statistics().standby_tiles, 3);

        assert_eq!(manager.trim_standby_tiles(), 2);
        assert_eq!(manager.tile_state(id, 0).unwrap().kind(), TileStateKind::PendingUnmap);
        assert_eq!(manager.tile_state(id, 1).unwrap().kind(), TileStateKind::PendingUnmap);
        assert_eq!(manager.tile_state(id, 2).unwrap().kind(), TileStateKind::Standby);
        assert_eq!(manager.take_tiles_to_unmap(id).unwrap(), vec![0, 1]);
        assert_eq!(manager.trim_standby_tiles(), 0);
    }

    #[test]
    fn test_defragment_drains_sparse_heap() {
        let (mut manager, id) = manager(4, 0);
        manager.add_heap(HeapId(0)).unwrap();
        request_and_map(&mut manager, id, &[0, 1, 2], 0.0);
        manager.add_heap(HeapId(1)).unwrap();
        request_and_map(&mut manager, id, &[0, 1, 2, 3, 4], 0.1);

        // Free a slot in the first heap so the second can drain into it
        request_and_map(&mut manager, id, &[1, 2, 3, 4], 0.2);
        request_and_map(&mut manager, id, &[1, 2, 3, 4], 2.0);
        manager.take_tiles_to_unmap(id).unwrap();

        let moves = manager.defragment_tiles(16).unwrap();
        assert_eq!(moves.len(), 1);
        let mv = moves[0];
        assert_eq!(mv.from.heap, HeapId(1));
        assert_eq!(mv.to.heap, HeapId(0));
        assert_eq!(manager.tile_allocation(mv.tile.texture, mv.tile.tile).unwrap(), Some(mv.to));

        // Source slot is retiring: the heap is not empty until the move completes
        assert!(manager.empty_heaps().is_empty());
        assert_eq!(manager.complete_moves(&moves).unwrap(), 1);
        assert_eq!(manager.empty_heaps(), vec![HeapId(1)]);
        assert_eq!(manager.complete_moves(&moves).unwrap(), 0);
    }

    #[test]
    fn test_defragment_respects_budget() {
        let (mut manager, id) = manager(4, 0);
        manager.add_heap(HeapId(0)).unwrap();
        manager.add_heap(HeapId(1)).unwrap();
        manager.add_heap(HeapId(2)).unwrap();
        request_and_map(&mut manager, id, &[0, 1, 2, 3, 4, 5], 0.0);
        assert!(manager.defragment_tiles(0).unwrap().is_empty());
        assert!(manager.defragment_tiles(1).unwrap().len() <= 1);
    }
}
