//! MinMip Summaries
//!
//! For every mip 0 tile-sized region, the finest mip level whose data is
//! resident there. Samplers clamp to this level so they never read a tile that
//! is not mapped.
//!
//! A region whose packed tiles are not resident reports the texture's mip count,
//! meaning nothing can be sampled yet.

use serde::{Deserialize, Serialize};

use crate::residency::TiledTextureManager;
use crate::{TextureId, TileError, TileResult};

/// Per-region finest resident mip of a texture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinMipSummary {
    /// Regions across
    pub width: u32,
    /// Regions down
    pub height: u32,
    /// Row-major finest resident mip per region
    pub data: Vec<u8>,
}

impl MinMipSummary {
    /// Finest resident mip of a region
    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data.get((y * self.width + x) as usize).copied()
    }
}

impl TiledTextureManager {
    /// Compute the MinMip summary of a texture
    pub fn min_mip_summary(&self, id: TextureId) -> TileResult<MinMipSummary> {
        let (width, height) = self.entry(id)?.layout.feedback_grid();
        let mut data = vec![0; (width * height) as usize];
        self.write_min_mip_data(id, &mut data)?;
        Ok(MinMipSummary { width, height, data })
    }

    /// Write the MinMip summary of a texture into a caller-owned buffer
    ///
    /// `data` must hold exactly one byte per feedback region.
    pub fn write_min_mip_data(&self, id: TextureId, data: &mut [u8]) -> TileResult<()> {
        let entry = self.entry(id)?;
        let layout = &entry.layout;
        let (width, height) = layout.feedback_grid();
        let expected = (width * height) as usize;
        if data.len() != expected {
            return Err(TileError::FeedbackSizeMismatch { expected, actual: data.len() });
        }

        let desc = layout.desc();
        let packed_resident = layout
            .packed_tiles()
            .all(|tile| entry.tiles[tile as usize].state.is_resident());
        let base = if packed_resident { desc.regular_mip_levels } else { desc.mip_levels };

        for y in 0..height {
            for x in 0..width {
                let mut min_mip = base;
                if packed_resident {
                    for mip in (0..desc.regular_mip_levels).rev() {
                        let resident = layout
                            .tile_covering(mip, x, y)
                            .is_some_and(|tile| entry.tiles[tile as usize].state.is_resident());
                        if !resident {
                            break;
                        }
                        min_mip = mip;
                    }
                }
                data[(y * width + x) as usize] = min_mip as u8;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::feedback::FeedbackRequest;
    use crate::{
        HeapId, TextureId, TiledTextureDesc, TiledTextureManager, TiledTextureManagerConfig,
        TiledTextureManagerDesc,
    };

    fn setup() -> (TiledTextureManager, TextureId) {
        let mut manager = TiledTextureManager::new(TiledTextureManagerDesc::default()).unwrap();
        manager.set_config(TiledTextureManagerConfig {
            num_extra_standby_tiles: 0,
            max_tiles_to_map_per_frame: 0,
        });
        manager.add_heap(HeapId(0)).unwrap();
        let id = manager
            .add_tiled_texture(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128))
            .unwrap();
        (manager, id)
    }

    fn map(manager: &mut TiledTextureManager, id: TextureId, tiles: &[u32]) {
        manager
            .update_with_feedback(id, &FeedbackRequest::from_tiles(tiles.iter().copied()), 0.0, 1.0)
            .unwrap();
        manager.allocate_requested_tiles();
        let to_map = manager.tiles_to_map(id).unwrap();
        manager.update_tiles_mapping(id, &to_map).unwrap();
    }

    #[test]
    fn test_nothing_resident() {
        let (manager, id) = setup();
        let summary = manager.min_mip_summary(id).unwrap();
        assert_eq!((summary.width, summary.height), (4, 2));
        assert!(summary.data.iter().all(|&m| m == 10));
    }

    #[test]
    fn test_packed_only() {
        let (mut manager, id) = setup();
        map(&mut manager, id, &[]);
        let summary = manager.min_mip_summary(id).unwrap();
        assert!(summary.data.iter().all(|&m| m == 2));
    }

    #[test]
    fn test_fine_tile_needs_coarser_chain() {
        let (mut manager, id) = setup();
        // Mip 0 tile 7 alone does not help without the mip 1 tile above it
        map(&mut manager, id, &[7]);
        assert_eq!(manager.min_mip_summary(id).unwrap().get(3, 1), Some(2));

        map(&mut manager, id, &[7, 9]);
        let summary = manager.min_mip_summary(id).unwrap();
        assert_eq!(summary.get(3, 1), Some(0));
        assert_eq!(summary.get(2, 0), Some(1));
        assert_eq!(summary.get(0, 0), Some(2));
        assert_eq!(summary.get(4, 0), None);
    }

    #[test]
    fn test_write_size_checked() {
        let (manager, id) = setup();
        let mut buffer = [0u8; 3];
        assert!(manager.write_min_mip_data(id, &mut buffer).is_err());
    }
}
