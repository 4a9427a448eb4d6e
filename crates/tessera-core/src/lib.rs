//! # Tessera Core
//!
//! Tile residency engine for feedback-driven texture streaming.
//!
//! Only the tiles that sampling actually touched are kept resident in physical
//! memory. Every frame the engine ingests usage feedback, moves tiles through
//! their residency states, and hands the caller a bounded list of tiles to map.
//!
//! ## Modules
//! - **Texture**: texture descriptors and tile geometry (regular and packed mips)
//! - **Tile**: the per-tile residency state machine
//! - **Heap**: heap pool of fixed-size tile slots
//! - **Residency**: the tile residency table ([`TiledTextureManager`])
//! - **Admission**: per-frame allocation budget and request queue
//! - **Compaction**: heap sizing, defragmentation and standby trimming
//! - **Feedback**: decoding of resolved feedback into tile requests
//! - **MinMip**: per-region finest resident mip summaries
//! - **Texture Set**: primary/follower residency inference
//! - **Timing**: phase stopwatches and frame clocks

pub mod admission;
pub mod compaction;
pub mod feedback;
pub mod heap;
pub mod min_mip;
pub mod residency;
pub mod texture;
pub mod texture_set;
pub mod tile;
pub mod timing;

pub use admission::AllocationOutcome;
pub use compaction::DefragMove;
pub use feedback::{FeedbackRequest, FEEDBACK_NOT_SAMPLED};
pub use heap::{HeapOccupancy, HeapPool};
pub use min_mip::MinMipSummary;
pub use residency::{
    Statistics, TiledTextureManager, TiledTextureManagerConfig, TiledTextureManagerDesc,
};
pub use texture::{TexelRect, TileCoord, TileInfo, TileLayout, TiledTextureDesc};
pub use texture_set::TextureSet;
pub use tile::{TileEvent, TileState, TileStateKind};
pub use timing::{FrameClock, Stopwatch};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of a registered tiled texture
///
/// Identifiers are never reused, so a stale id is always detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextureId(pub u32);

impl std::fmt::Display for TextureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "texture#{}", self.0)
    }
}

/// Identifier of a physical heap, chosen by the heap owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeapId(pub u32);

impl std::fmt::Display for HeapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// A tile-sized slot inside a heap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    /// Heap holding the slot
    pub heap: HeapId,
    /// Slot index inside the heap
    pub slot: u32,
}

impl SlotRef {
    pub fn new(heap: HeapId, slot: u32) -> Self {
        Self { heap, slot }
    }

    /// Byte offset of this slot inside its heap
    pub fn byte_offset(&self, tile_size_in_bytes: u64) -> u64 {
        self.slot as u64 * tile_size_in_bytes
    }
}

/// A tile of a specific texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileRef {
    pub texture: TextureId,
    pub tile: u32,
}

impl TileRef {
    pub fn new(texture: TextureId, tile: u32) -> Self {
        Self { texture, tile }
    }
}

/// Residency engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TileError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown texture: {0}")]
    UnknownTexture(TextureId),

    #[error("Tile {tile} out of range for {texture}")]
    TileOutOfRange { texture: TextureId, tile: u32 },

    #[error("Unknown heap: {0}")]
    UnknownHeap(HeapId),

    #[error("Heap already registered: {0}")]
    DuplicateHeap(HeapId),

    #[error("Heap still holds tiles: {0}")]
    HeapNotEmpty(HeapId),

    #[error("Slot {slot} of {heap} is not in the expected state")]
    SlotMismatch { heap: HeapId, slot: u32 },

    #[error("Invalid texture set: {0}")]
    InvalidTextureSet(String),

    #[error("Feedback size mismatch: expected {expected} bytes, got {actual}")]
    FeedbackSizeMismatch { expected: usize, actual: usize },
}

/// Result type for residency operations
pub type TileResult<T> = Result<T, TileError>;
