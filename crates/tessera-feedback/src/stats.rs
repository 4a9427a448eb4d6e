//! Feedback Manager Statistics
//!
//! Snapshot published at the end of every frame. The snapshot sits behind a
//! shared mutex so auxiliary threads (UI, telemetry) can read it while the
//! frame loop runs.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tessera_core::Statistics;

/// Statistics handle shared with other threads
pub type SharedStats = Arc<Mutex<FeedbackManagerStats>>;

/// Aggregate state of the feedback manager after a frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackManagerStats {
    /// Frame the snapshot was taken for
    pub frame_index: u64,
    /// Bytes held by live and not yet destroyed heaps
    pub heap_allocation_in_bytes: u64,
    /// Bytes of free tile slots in live heaps
    pub heap_free_in_bytes: u64,
    pub heap_count: u32,
    pub heap_tiles_free: u32,
    pub tiles_total: u32,
    pub tiles_requested: u32,
    /// Occupied heap slots
    pub tiles_allocated: u32,
    pub tiles_mapped: u32,
    pub tiles_standby: u32,
    pub tiles_pending_unmap: u32,
    /// Textures whose feedback was consumed this frame
    pub textures_serviced: u32,
    /// Heap creations refused by the backend so far
    pub heap_allocation_failures: u64,
    /// Seconds spent in `begin_frame`
    pub cputime_begin_frame: f64,
    /// Seconds spent in `update_tile_mappings`
    pub cputime_update_tile_mappings: f64,
    /// Seconds spent in `resolve_feedback` this frame
    pub cputime_resolve: f64,
}

impl FeedbackManagerStats {
    /// Copy the residency counters from a core snapshot
    pub fn apply_residency(&mut self, residency: &Statistics) {
        self.heap_count = residency.heap_count;
        self.heap_tiles_free = residency.heap_free_tiles;
        self.tiles_total = residency.total_tiles;
        self.tiles_requested = residency.requested_tiles;
        self.tiles_allocated = residency.allocated_tiles;
        self.tiles_mapped = residency.mapped_tiles;
        self.tiles_standby = residency.standby_tiles;
        self.tiles_pending_unmap = residency.pending_unmap_tiles;
    }

    /// Fraction of heap slots in use
    pub fn heap_occupancy(&self) -> f32 {
        let capacity = self.tiles_allocated + self.heap_tiles_free;
        if capacity == 0 {
            0.0
        } else {
            self.tiles_allocated as f32 / capacity as f32
        }
    }
}
