//! Admission Control
//!
//! Grants heap slots to requested tiles within the per-frame budget:
//! - Packed tiles are admitted first and never count against the budget
//! - Regular tiles are admitted in request order, capped by `max_tiles_to_map_per_frame`
//! - Regular reservations the caller has not committed yet count against the budget
//!
//! Running out of slots is not an error. The tile stays queued and is retried
//! on the next frame.

use serde::{Deserialize, Serialize};

use crate::residency::{transition, TiledTextureManager};
use crate::tile::{TileEvent, TileState, TileStateKind};
use crate::TileRef;

/// Result of one admission pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationOutcome {
    /// Packed tiles granted a slot
    pub packed: u32,
    /// Regular tiles granted a slot
    pub regular: u32,
    /// Requested tiles still waiting after this pass
    pub deferred: u32,
    /// Whether the pass stopped because the heaps were full
    pub out_of_slots: bool,
}

impl AllocationOutcome {
    pub fn total(&self) -> u32 {
        self.packed + self.regular
    }
}

impl TiledTextureManager {
    /// Reserve heap slots for queued tile requests
    pub fn allocate_requested_tiles(&mut self) -> AllocationOutcome {
        let mut outcome = AllocationOutcome::default();

        while let Some(&tile) = self.packed_queue.front() {
            if !self.is_waiting(tile) {
                self.packed_queue.pop_front();
                continue;
            }
            if !self.reserve(tile) {
                outcome.out_of_slots = true;
                break;
            }
            self.packed_queue.pop_front();
            outcome.packed += 1;
        }

        let budget = match self.config.max_tiles_to_map_per_frame {
            0 => u32::MAX,
            max => max.saturating_sub(self.counts.reserved_regular()),
        };

        while outcome.regular < budget && !outcome.out_of_slots {
            let Some(&tile) = self.request_queue.front() else {
                break;
            };
            if !self.is_waiting(tile) {
                self.request_queue.pop_front();
                continue;
            }
            if !self.reserve(tile) {
                outcome.out_of_slots = true;
                break;
            }
            self.request_queue.pop_front();
            outcome.regular += 1;
        }

        outcome.deferred = self.counts.get(TileStateKind::Requested) - self.counts.reserved();
        if outcome.out_of_slots {
            log::debug!(
                "Heap pool exhausted, {} tile requests deferred to a later frame",
                outcome.deferred
            );
        }
        outcome
    }

    /// Whether a queued tile still waits for a slot
    fn is_waiting(&self, tile: TileRef) -> bool {
        self.textures
            .get(&tile.texture)
            .and_then(|entry| entry.tiles.get(tile.tile as usize))
            .is_some_and(|t| matches!(t.state, TileState::Requested { reservation: None }))
    }

    /// Reserve a slot for a waiting tile; `false` when no slot is free
    fn reserve(&mut self, tile: TileRef) -> bool {
        let Some(slot) = self.pool.allocate(tile) else {
            return false;
        };
        if let Some(entry) = self.textures.get_mut(&tile.texture) {
            transition(&mut self.counts, &mut entry.tiles[tile.tile as usize], TileEvent::Reserve(slot));
        }
        true
    }
}
