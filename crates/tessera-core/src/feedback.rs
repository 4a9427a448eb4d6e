//! Feedback Decoding
//!
//! Turns resolved sampler feedback into the set of tiles a texture needs.
//!
//! The resolved form holds one byte per mip 0 tile-sized region: the finest
//! mip level sampled in that region, or [`FEEDBACK_NOT_SAMPLED`]. A sampled
//! region requests the tile covering it at the sampled mip and at every
//! coarser regular mip, so a coarser fallback is always on its way. Any
//! sampled region also requests the packed tiles.

use serde::{Deserialize, Serialize};

use crate::texture::TileLayout;
use crate::{TileError, TileResult};

/// Resolved feedback value for a region that was not sampled
pub const FEEDBACK_NOT_SAMPLED: u8 = 0xFF;

/// Tiles of one texture reported as needed during a frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRequest {
    tiles: Vec<u32>,
}

impl FeedbackRequest {
    /// Build a request from tile indices in any order, duplicates allowed
    pub fn from_tiles(tiles: impl IntoIterator<Item = u32>) -> Self {
        let mut tiles: Vec<u32> = tiles.into_iter().collect();
        tiles.sort_unstable();
        tiles.dedup();
        Self { tiles }
    }

    /// Sorted, deduplicated tile indices
    pub fn tiles(&self) -> &[u32] {
        &self.tiles
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Split into regular and packed tile indices
    pub fn split_packed(&self, layout: &TileLayout) -> (&[u32], &[u32]) {
        let first_packed = layout.first_packed_tile();
        let split = self.tiles.partition_point(|&t| t < first_packed);
        self.tiles.split_at(split)
    }

    /// Decode a resolved MinMip feedback buffer
    pub fn decode_min_mip(layout: &TileLayout, data: &[u8]) -> TileResult<Self> {
        let (grid_width, grid_height) = layout.feedback_grid();
        let expected = (grid_width * grid_height) as usize;
        if data.len() != expected {
            return Err(TileError::FeedbackSizeMismatch { expected, actual: data.len() });
        }

        let regular_mips = layout.desc().regular_mip_levels;
        let mut requested = vec![false; layout.total_tiles() as usize];
        let mut any_sampled = false;

        for y in 0..grid_height {
            for x in 0..grid_width {
                let value = data[(y * grid_width + x) as usize];
                if value == FEEDBACK_NOT_SAMPLED {
                    continue;
                }
                any_sampled = true;
                for mip in (value as u32)..regular_mips {
                    if let Some(tile) = layout.tile_covering(mip, x, y) {
                        requested[tile as usize] = true;
                    }
                }
            }
        }

        if any_sampled {
            for tile in layout.packed_tiles() {
                requested[tile as usize] = true;
            }
        }

        Ok(Self {
            tiles: requested
                .iter()
                .enumerate()
                .filter(|(_, r)| **r)
                .map(|(i, _)| i as u32)
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::TiledTextureDesc;

    fn layout() -> TileLayout {
        TileLayout::new(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128)).unwrap()
    }

    #[test]
    fn test_from_tiles_sorts_and_dedups() {
        let request = FeedbackRequest::from_tiles([5, 1, 5, 3]);
        assert_eq!(request.tiles(), &[1, 3, 5]);
        assert_eq!(request.len(), 3);
    }

    #[test]
    fn test_split_packed() {
        let layout = layout();
        let request = FeedbackRequest::from_tiles([0, 9, 10]);
        let (regular, packed) = request.split_packed(&layout);
        assert_eq!(regular, &[0, 9]);
        assert_eq!(packed, &[10]);
    }

    #[test]
    fn test_decode_requests_coarser_mips() {
        let layout = layout();
        let mut data = vec![FEEDBACK_NOT_SAMPLED; 8];
        // Region (3, 1) sampled at mip 0
        data[7] = 0;
        let request = FeedbackRequest::decode_min_mip(&layout, &data).unwrap();
        let mip1 = layout.tile_index(1, 1, 0).unwrap();
        assert_eq!(request.tiles(), &[7, mip1, 10]);
    }

    #[test]
    fn test_decode_packed_only() {
        let layout = layout();
        let mut data = vec![FEEDBACK_NOT_SAMPLED; 8];
        data[0] = 5;
        let request = FeedbackRequest::decode_min_mip(&layout, &data).unwrap();
        assert_eq!(request.tiles(), &[10]);
    }

    #[test]
    fn test_decode_nothing_sampled() {
        let layout = layout();
        let data = vec![FEEDBACK_NOT_SAMPLED; 8];
        assert!(FeedbackRequest::decode_min_mip(&layout, &data).unwrap().is_empty());
    }

    #[test]
    fn test_decode_size_mismatch() {
        let layout = layout();
        let err = FeedbackRequest::decode_min_mip(&layout, &[0; 3]).unwrap_err();
        assert_eq!(err, TileError::FeedbackSizeMismatch { expected: 8, actual: 3 });
    }
}
