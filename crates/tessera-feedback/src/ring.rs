//! Feedback Readback Ring
//!
//! N slots addressed by `frame_index % N`. Frame `f` schedules textures for
//! readback and records their resolved feedback in slot `f % N`; frame `f + N`
//! takes it back out. Consumption order matches scheduling order.

use ahash::AHashMap;
use tessera_core::{FeedbackRequest, TextureId, TileLayout, TileResult};

use crate::{FeedbackError, FeedbackResult};

/// Resolved feedback of one texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackData {
    /// One byte per mip 0 tile-sized region, finest sampled mip or `0xFF`
    MinMip(Vec<u8>),
    /// Tile indices already decoded by the host
    Tiles(Vec<u32>),
}

impl FeedbackData {
    /// Decode into the tiles the texture needs
    pub fn decode(&self, layout: &TileLayout) -> TileResult<FeedbackRequest> {
        match self {
            FeedbackData::MinMip(data) => FeedbackRequest::decode_min_mip(layout, data),
            FeedbackData::Tiles(tiles) => Ok(FeedbackRequest::from_tiles(tiles.iter().copied())),
        }
    }
}

#[derive(Debug, Default)]
struct RingSlot {
    frame_index: Option<u64>,
    scheduled: Vec<TextureId>,
    resolved: AHashMap<TextureId, FeedbackData>,
}

/// Fixed ring of per-frame readback slots
#[derive(Debug)]
pub struct FeedbackRing {
    slots: Vec<RingSlot>,
}

impl FeedbackRing {
    pub fn new(num_frames_in_flight: usize) -> Self {
        Self {
            slots: (0..num_frames_in_flight.max(1)).map(|_| RingSlot::default()).collect(),
        }
    }

    /// Frames between resolving and consuming feedback
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot_index(&self, frame_index: u64) -> usize {
        (frame_index % self.slots.len() as u64) as usize
    }

    /// Take the readbacks recorded N frames ago and free the slot for this frame
    ///
    /// Returns the resolved textures in scheduling order with the frame that
    /// produced them. Scheduled textures that were never resolved are skipped.
    pub fn begin_frame(&mut self, frame_index: u64) -> (Option<u64>, Vec<(TextureId, FeedbackData)>) {
        let index = self.slot_index(frame_index);
        let slot = &mut self.slots[index];
        let produced = slot.frame_index.replace(frame_index);
        let scheduled = std::mem::take(&mut slot.scheduled);
        let mut resolved = std::mem::take(&mut slot.resolved);

        let completed = scheduled
            .into_iter()
            .filter_map(|id| resolved.remove(&id).map(|data| (id, data)))
            .collect();
        (produced, completed)
    }

    /// Set the textures whose feedback this frame will resolve
    pub fn schedule(&mut self, frame_index: u64, textures: Vec<TextureId>) {
        let index = self.slot_index(frame_index);
        self.slots[index].scheduled = textures;
    }

    /// Textures scheduled for the given frame
    pub fn scheduled(&self, frame_index: u64) -> &[TextureId] {
        &self.slots[self.slot_index(frame_index)].scheduled
    }

    /// Record the resolved feedback of a scheduled texture
    pub fn resolve(&mut self, frame_index: u64, texture: TextureId, data: FeedbackData) -> FeedbackResult<()> {
        let index = self.slot_index(frame_index);
        let slot = &mut self.slots[index];
        if !slot.scheduled.contains(&texture) {
            return Err(FeedbackError::NotScheduled(texture));
        }
        slot.resolved.insert(texture, data);
        Ok(())
    }

    /// Drop every trace of a texture
    pub fn forget(&mut self, texture: TextureId) {
        for slot in &mut self.slots {
            slot.scheduled.retain(|&id| id != texture);
            slot.resolved.remove(&texture);
        }
    }
}
