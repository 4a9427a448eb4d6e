//! # Tessera Feedback
//!
//! Frame-pipelined orchestration of the tile residency engine.
//!
//! The [`FeedbackManager`] runs the per-frame cycle around a
//! [`tessera_core::TiledTextureManager`]:
//! - `begin_frame` consumes the feedback resolved N frames ago, grows or shrinks
//!   heaps, admits tiles and returns the tiles to unmap and map
//! - `update_tile_mappings` commits the tiles the caller mapped
//! - `resolve_feedback` records this frame's resolved feedback
//! - `end_frame` rotates the round-robin texture ring and publishes statistics
//!
//! Physical heaps are created and destroyed through a caller-supplied
//! [`HeapBackend`].

pub mod heap_allocator;
pub mod manager;
pub mod ring;
pub mod stats;
pub mod texture_sets;

pub use heap_allocator::{HeapAllocator, HeapBackend};
pub use manager::{FeedbackManager, FrameUpdate, TextureTiles, TileMappingBatch};
pub use ring::{FeedbackData, FeedbackRing};
pub use stats::{FeedbackManagerStats, SharedStats};
pub use texture_sets::{TextureSetId, TextureSetRegistry};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tessera_core::{TextureId, TileError};
use thiserror::Error;

/// Feedback manager errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedbackError {
    #[error(transparent)]
    Tile(#[from] TileError),

    #[error("Heap backend failure: {0}")]
    Backend(String),

    #[error("Unknown texture set: {0}")]
    UnknownTextureSet(TextureSetId),

    #[error("Feedback for {0} was not scheduled this frame")]
    NotScheduled(TextureId),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for feedback manager operations
pub type FeedbackResult<T> = Result<T, FeedbackError>;

/// Construction parameters of a [`FeedbackManager`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackManagerDesc {
    /// Frames between resolving feedback and consuming it
    pub num_frames_in_flight: u32,
    /// Tile slots per heap
    pub heap_size_in_tiles: u32,
    /// Bytes per tile, used for heap sizes and slot offsets
    pub tile_size_in_bytes: u64,
    /// Keep packed mip tiles mapped for the lifetime of each texture
    pub always_map_packed_tiles: bool,
}

impl Default for FeedbackManagerDesc {
    fn default() -> Self {
        Self {
            num_frames_in_flight: 2,
            heap_size_in_tiles: 256,
            tile_size_in_bytes: 64 * 1024,
            always_map_packed_tiles: true,
        }
    }
}

impl FeedbackManagerDesc {
    pub fn validate(&self) -> FeedbackResult<()> {
        if self.num_frames_in_flight == 0 {
            return Err(FeedbackError::InvalidConfig("num_frames_in_flight must be at least 1".into()));
        }
        if self.heap_size_in_tiles == 0 {
            return Err(FeedbackError::InvalidConfig("heap_size_in_tiles must be at least 1".into()));
        }
        if self.tile_size_in_bytes == 0 {
            return Err(FeedbackError::InvalidConfig("tile_size_in_bytes must be non-zero".into()));
        }
        Ok(())
    }

    /// Bytes per heap
    pub fn heap_size_in_bytes(&self) -> u64 {
        self.heap_size_in_tiles as u64 * self.tile_size_in_bytes
    }
}

bitflags! {
    /// Host events affecting feedback consumption
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct FrameEvents: u8 {
        /// The view changed discontinuously; in-flight feedback describes a stale view
        const CAMERA_CUT = 0b0001;
        /// Scene topology was rebuilt
        const TOPOLOGY_RESET = 0b0010;
    }
}

impl FrameEvents {
    /// Whether feedback consumption is suppressed this frame
    pub fn suppresses_feedback(&self) -> bool {
        self.intersects(FrameEvents::CAMERA_CUT | FrameEvents::TOPOLOGY_RESET)
    }
}

/// Per-frame configuration of [`FeedbackManager::begin_frame`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedbackUpdateConfig {
    /// Host frame counter, selects the feedback ring slot
    pub frame_index: u64,
    /// Textures scheduled for feedback readback per frame, 0 = all
    pub max_textures_to_update: u32,
    /// Seconds a standby tile stays mapped without being requested
    pub tile_timeout_seconds: f64,
    /// Regular tiles admitted per frame, 0 = unlimited
    pub max_tiles_to_map_per_frame: u32,
    /// Standby margin used for heap sizing and trimming
    pub num_extra_standby_tiles: u32,
    /// Plan defragmentation moves this frame
    pub defragment_heaps: bool,
    /// Evict standby tiles beyond the standby margin this frame
    pub trim_standby_tiles: bool,
    /// Release empty heaps not needed for the current demand
    pub release_empty_heaps: bool,
    /// Upper bound on defragmentation moves per frame
    pub max_defrag_moves: u32,
    /// Host events for this frame
    pub events: FrameEvents,
}

impl Default for FeedbackUpdateConfig {
    fn default() -> Self {
        Self {
            frame_index: 0,
            max_textures_to_update: 0,
            tile_timeout_seconds: 1.0,
            max_tiles_to_map_per_frame: 256,
            num_extra_standby_tiles: 2000,
            defragment_heaps: false,
            trim_standby_tiles: false,
            release_empty_heaps: false,
            max_defrag_moves: 16,
            events: FrameEvents::empty(),
        }
    }
}

impl FeedbackUpdateConfig {
    /// Earlier tuning: longer timeout, smaller standby margin
    pub fn legacy() -> Self {
        Self {
            tile_timeout_seconds: 2.0,
            num_extra_standby_tiles: 1000,
            ..Self::default()
        }
    }

    /// Same configuration for another frame
    pub fn with_frame_index(mut self, frame_index: u64) -> Self {
        self.frame_index = frame_index;
        self
    }

    /// Compaction settings for load screens and pauses
    pub fn with_compaction(mut self) -> Self {
        self.defragment_heaps = true;
        self.trim_standby_tiles = true;
        self.release_empty_heaps = true;
        self
    }
}
