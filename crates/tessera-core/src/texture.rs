//! Tiled Texture Geometry
//!
//! Describes how a virtual texture is cut into tiles:
//! - Regular mip levels are tile-granular, one tile per `tile_width x tile_height` texels
//! - Packed mip levels (the coarsest, smaller than a tile) share a few trailing tiles
//!
//! Tile indices run mip 0 row-major first, then each coarser regular mip, then
//! the packed tiles.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{TileError, TileResult};

/// Maximum number of mip levels a texture may have
pub const MAX_MIP_LEVELS: u32 = 16;

/// Texture registration descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TiledTextureDesc {
    /// Width of mip 0 in texels
    pub width: u32,
    /// Height of mip 0 in texels
    pub height: u32,
    /// Total mip levels
    pub mip_levels: u32,
    /// Tile width in texels
    pub tile_width: u32,
    /// Tile height in texels
    pub tile_height: u32,
    /// Number of leading tile-granular mip levels
    pub regular_mip_levels: u32,
    /// Number of tiles holding the packed mip levels
    pub packed_tiles: u32,
}

impl TiledTextureDesc {
    /// Create a descriptor, deriving the regular/packed split from the tile shape
    ///
    /// A mip level is regular while both of its dimensions are at least one tile.
    /// All remaining levels are packed into a single tile.
    pub fn new(width: u32, height: u32, mip_levels: u32, tile_width: u32, tile_height: u32) -> Self {
        let mut regular_mip_levels = 0;
        while regular_mip_levels < mip_levels
            && tile_width > 0
            && tile_height > 0
            && (width >> regular_mip_levels).max(1) >= tile_width
            && (height >> regular_mip_levels).max(1) >= tile_height
        {
            regular_mip_levels += 1;
        }

        let packed_tiles = if regular_mip_levels < mip_levels { 1 } else { 0 };

        Self {
            width,
            height,
            mip_levels,
            tile_width,
            tile_height,
            regular_mip_levels,
            packed_tiles,
        }
    }

    /// Create a descriptor with a full mip chain down to 1x1
    pub fn with_full_mip_chain(width: u32, height: u32, tile_width: u32, tile_height: u32) -> Self {
        Self::new(width, height, full_mip_chain(width, height), tile_width, tile_height)
    }

    /// Override the number of tiles used by the packed mip levels
    pub fn with_packed_tiles(mut self, packed_tiles: u32) -> Self {
        self.packed_tiles = packed_tiles;
        self
    }

    /// Number of packed mip levels
    pub fn packed_mip_levels(&self) -> u32 {
        self.mip_levels.saturating_sub(self.regular_mip_levels)
    }

    /// Width of a mip level in texels
    pub fn mip_width(&self, mip: u32) -> u32 {
        (self.width >> mip.min(31)).max(1)
    }

    /// Height of a mip level in texels
    pub fn mip_height(&self, mip: u32) -> u32 {
        (self.height >> mip.min(31)).max(1)
    }

    /// Check the descriptor for consistency
    pub fn validate(&self) -> TileResult<()> {
        if self.width == 0 || self.height == 0 {
            return Err(TileError::InvalidConfig("texture dimensions must be non-zero".into()));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(TileError::InvalidConfig("tile dimensions must be non-zero".into()));
        }
        if self.mip_levels == 0 || self.mip_levels > MAX_MIP_LEVELS {
            return Err(TileError::InvalidConfig(format!(
                "mip level count {} outside 1..={}",
                self.mip_levels, MAX_MIP_LEVELS
            )));
        }
        if self.mip_levels > full_mip_chain(self.width, self.height) {
            return Err(TileError::InvalidConfig(format!(
                "{} mip levels exceed the full chain of a {}x{} texture",
                self.mip_levels, self.width, self.height
            )));
        }
        if self.regular_mip_levels > self.mip_levels {
            return Err(TileError::InvalidConfig("more regular mips than mips".into()));
        }
        if (self.packed_mip_levels() > 0) != (self.packed_tiles > 0) {
            return Err(TileError::InvalidConfig(
                "packed tiles must be present exactly when packed mips are".into(),
            ));
        }
        Ok(())
    }
}

/// Number of mip levels in a full chain for the given size
pub fn full_mip_chain(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Position of a regular tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub mip: u32,
    pub x: u32,
    pub y: u32,
}

/// Texel-space region covered by a tile at one mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileInfo {
    pub mip: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub packed: bool,
}

/// Texel rectangle of one mip level, `[x0, x1) x [y0, y1)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TexelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl TexelRect {
    /// The whole `width` x `height` level
    pub fn full(width: u32, height: u32) -> Self {
        Self { x0: 0, y0: 0, x1: width, y1: height }
    }

    pub fn is_empty(&self) -> bool {
        self.x0 >= self.x1 || self.y0 >= self.y1
    }

    /// Map the rectangle from a `from` sized level onto a `to` sized level
    ///
    /// The start rounds down and the end rounds up, so every texel touched by
    /// the source region is covered and nothing beyond it.
    pub fn scale(&self, from: (u32, u32), to: (u32, u32)) -> Self {
        let floor = |v: u32, src: u32, dst: u32| (v as u64 * dst as u64 / src.max(1) as u64) as u32;
        let ceil = |v: u32, src: u32, dst: u32| (v as u64 * dst as u64).div_ceil(src.max(1) as u64) as u32;
        Self {
            x0: floor(self.x0, from.0, to.0),
            y0: floor(self.y0, from.1, to.1),
            x1: ceil(self.x1, from.0, to.0),
            y1: ceil(self.y1, from.1, to.1),
        }
    }
}

/// Tile grid of one regular mip level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelLayout {
    pub width_in_tiles: u32,
    pub height_in_tiles: u32,
    /// Index of the level's first tile
    pub first_tile: u32,
}

impl LevelLayout {
    /// Number of tiles in the level
    pub fn tile_count(&self) -> u32 {
        self.width_in_tiles * self.height_in_tiles
    }
}

/// Tile geometry derived from a [`TiledTextureDesc`]
#[derive(Debug, Clone)]
pub struct TileLayout {
    desc: TiledTextureDesc,
    levels: SmallVec<[LevelLayout; 16]>,
    coords: Vec<TileCoord>,
}

impl TileLayout {
    /// Build the tile layout of a texture
    pub fn new(desc: TiledTextureDesc) -> TileResult<Self> {
        desc.validate()?;

        let mut levels = SmallVec::new();
        let mut coords = Vec::new();
        let mut first_tile = 0;
        for mip in 0..desc.regular_mip_levels {
            let level = LevelLayout {
                width_in_tiles: desc.mip_width(mip).div_ceil(desc.tile_width),
                height_in_tiles: desc.mip_height(mip).div_ceil(desc.tile_height),
                first_tile,
            };
            for y in 0..level.height_in_tiles {
                for x in 0..level.width_in_tiles {
                    coords.push(TileCoord { mip, x, y });
                }
            }
            first_tile += level.tile_count();
            levels.push(level);
        }

        Ok(Self { desc, levels, coords })
    }

    /// The descriptor this layout was built from
    pub fn desc(&self) -> &TiledTextureDesc {
        &self.desc
    }

    /// Grid of a regular mip level
    pub fn level(&self, mip: u32) -> Option<&LevelLayout> {
        self.levels.get(mip as usize)
    }

    /// Number of regular (tile-granular) tiles
    pub fn regular_tile_count(&self) -> u32 {
        self.coords.len() as u32
    }

    /// Total tile count, packed tiles included
    pub fn total_tiles(&self) -> u32 {
        self.regular_tile_count() + self.desc.packed_tiles
    }

    /// Index of the first packed tile
    pub fn first_packed_tile(&self) -> u32 {
        self.regular_tile_count()
    }

    /// Indices of the packed tiles
    pub fn packed_tiles(&self) -> std::ops::Range<u32> {
        self.first_packed_tile()..self.total_tiles()
    }

    pub fn is_packed(&self, tile: u32) -> bool {
        tile >= self.first_packed_tile() && tile < self.total_tiles()
    }

    /// Coordinates of all regular tiles, indexed by tile index
    pub fn coords(&self) -> &[TileCoord] {
        &self.coords
    }

    /// Coordinate of a regular tile, `None` for packed or out of range tiles
    pub fn coord(&self, tile: u32) -> Option<TileCoord> {
        self.coords.get(tile as usize).copied()
    }

    /// Index of the regular tile at a position
    pub fn tile_index(&self, mip: u32, x: u32, y: u32) -> Option<u32> {
        let level = self.level(mip)?;
        if x >= level.width_in_tiles || y >= level.height_in_tiles {
            return None;
        }
        Some(level.first_tile + y * level.width_in_tiles + x)
    }

    /// Index of the regular tile at `mip` covering the mip 0 tile-sized region `(x, y)`
    pub fn tile_covering(&self, mip: u32, x: u32, y: u32) -> Option<u32> {
        let level = self.level(mip)?;
        let tx = (x >> mip).min(level.width_in_tiles - 1);
        let ty = (y >> mip).min(level.height_in_tiles - 1);
        self.tile_index(mip, tx, ty)
    }

    /// Size of the feedback and MinMip grids: one cell per mip 0 tile-sized region
    pub fn feedback_grid(&self) -> (u32, u32) {
        (
            self.desc.width.div_ceil(self.desc.tile_width),
            self.desc.height.div_ceil(self.desc.tile_height),
        )
    }

    /// Texel regions to fill when the tile is uploaded
    ///
    /// Regular tiles are clipped to their mip level. Packed tiles report every
    /// packed mip level in full.
    pub fn tile_info(&self, tile: u32) -> SmallVec<[TileInfo; 4]> {
        let mut infos = SmallVec::new();
        if self.is_packed(tile) {
            for mip in self.desc.regular_mip_levels..self.desc.mip_levels {
                infos.push(TileInfo {
                    mip,
                    x: 0,
                    y: 0,
                    width: self.desc.mip_width(mip),
                    height: self.desc.mip_height(mip),
                    packed: true,
                });
            }
        } else if let Some(coord) = self.coord(tile) {
            let x = coord.x * self.desc.tile_width;
            let y = coord.y * self.desc.tile_height;
            let width = self.desc.tile_width.min(self.desc.mip_width(coord.mip) - x);
            let height = self.desc.tile_height.min(self.desc.mip_height(coord.mip) - y);
            infos.push(TileInfo { mip: coord.mip, x, y, width, height, packed: false });
        }
        infos
    }

    /// Mip level and texel region of a regular tile, clipped to the level
    pub fn tile_texel_rect(&self, tile: u32) -> Option<(u32, TexelRect)> {
        if self.is_packed(tile) {
            return None;
        }
        let info = self.tile_info(tile).into_iter().next()?;
        let rect = TexelRect {
            x0: info.x,
            y0: info.y,
            x1: info.x + info.width,
            y1: info.y + info.height,
        };
        Some((info.mip, rect))
    }

    /// Regular tiles of `mip` sharing at least one texel with `rect`
    pub fn tiles_in_rect(&self, mip: u32, rect: &TexelRect) -> Vec<u32> {
        let Some(level) = self.level(mip) else {
            return Vec::new();
        };
        if rect.is_empty() {
            return Vec::new();
        }

        let x0 = rect.x0 / self.desc.tile_width;
        let y0 = rect.y0 / self.desc.tile_height;
        let x1 = rect.x1.div_ceil(self.desc.tile_width).min(level.width_in_tiles);
        let y1 = rect.y1.div_ceil(self.desc.tile_height).min(level.height_in_tiles);

        let mut tiles = Vec::new();
        for y in y0..y1 {
            for x in x0..x1 {
                if let Some(tile) = self.tile_index(mip, x, y) {
                    tiles.push(tile);
                }
            }
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regular_packed_split() {
        // 512x256 with 128x128 tiles: mips 0 and 1 are regular
        let desc = TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128);
        assert_eq!(desc.mip_levels, 10);
        assert_eq!(desc.regular_mip_levels, 2);
        assert_eq!(desc.packed_mip_levels(), 8);
        assert_eq!(desc.packed_tiles, 1);
    }

    #[test]
    fn test_layout_tile_counts() {
        let layout = TileLayout::new(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128)).unwrap();
        assert_eq!(layout.regular_tile_count(), 10);
        assert_eq!(layout.total_tiles(), 11);
        assert_eq!(layout.first_packed_tile(), 10);
        assert!(layout.is_packed(10));
        assert!(!layout.is_packed(9));
        assert!(!layout.is_packed(11));

        assert_eq!(layout.tile_index(0, 3, 1), Some(7));
        assert_eq!(layout.tile_index(1, 1, 0), Some(9));
        assert_eq!(layout.tile_index(1, 2, 0), None);
        assert_eq!(layout.coord(9), Some(TileCoord { mip: 1, x: 1, y: 0 }));
        assert_eq!(layout.coord(10), None);
    }

    #[test]
    fn test_no_packed_mips() {
        let desc = TiledTextureDesc::new(256, 256, 1, 128, 128);
        assert_eq!(desc.packed_tiles, 0);
        let layout = TileLayout::new(desc).unwrap();
        assert_eq!(layout.total_tiles(), 4);
        assert!(layout.packed_tiles().is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_desc() {
        assert!(TiledTextureDesc::new(0, 256, 1, 128, 128).validate().is_err());
        assert!(TiledTextureDesc::new(256, 256, 1, 0, 128).validate().is_err());
        assert!(TiledTextureDesc::new(256, 256, 12, 128, 128).validate().is_err());
        let desc = TiledTextureDesc::with_full_mip_chain(256, 256, 128, 128).with_packed_tiles(0);
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_tile_info_clipped() {
        // 300 wide: the last mip 0 column is only 44 texels
        let layout = TileLayout::new(TiledTextureDesc::new(300, 128, 1, 128, 128)).unwrap();
        let info = layout.tile_info(2);
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].x, 256);
        assert_eq!(info[0].width, 44);
        assert_eq!(info[0].height, 128);
    }

    #[test]
    fn test_packed_tile_info() {
        let layout = TileLayout::new(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128)).unwrap();
        let info = layout.tile_info(10);
        assert_eq!(info.len(), 8);
        assert!(info.iter().all(|i| i.packed));
        assert_eq!(info[0].mip, 2);
        assert_eq!((info[0].width, info[0].height), (128, 64));
    }

    #[test]
    fn test_tile_covering() {
        let layout = TileLayout::new(TiledTextureDesc::with_full_mip_chain(1024, 1024, 128, 128)).unwrap();
        let tile = layout.tile_covering(2, 7, 5).unwrap();
        assert_eq!(layout.coord(tile), Some(TileCoord { mip: 2, x: 1, y: 1 }));
    }

    #[test]
    fn test_tiles_in_rect() {
        let layout = TileLayout::new(TiledTextureDesc::with_full_mip_chain(512, 512, 128, 128)).unwrap();
        let rect = TexelRect { x0: 128, y0: 192, x1: 192, y1: 256 };
        assert_eq!(layout.tiles_in_rect(0, &rect), vec![layout.tile_index(0, 1, 1).unwrap()]);

        let straddling = TexelRect { x0: 127, y0: 0, x1: 129, y1: 1 };
        assert_eq!(layout.tiles_in_rect(0, &straddling), vec![0, 1]);
        assert!(layout.tiles_in_rect(0, &TexelRect { x0: 5, y0: 5, x1: 5, y1: 9 }).is_empty());
    }

    #[test]
    fn test_texel_rect_scale_npot() {
        // 256..384 of a 788 level is exactly 128..192 of a 394 level
        let rect = TexelRect { x0: 256, y0: 256, x1: 384, y1: 384 };
        assert_eq!(rect.scale((788, 788), (394, 394)), TexelRect { x0: 128, y0: 128, x1: 192, y1: 192 });

        // Partial texels round outwards
        let rect = TexelRect { x0: 1, y0: 0, x1: 3, y1: 600 };
        assert_eq!(rect.scale((788, 600), (394, 300)), TexelRect { x0: 0, y0: 0, x1: 2, y1: 300 });
    }

    #[test]
    fn test_tile_texel_rect_clipped() {
        let layout = TileLayout::new(TiledTextureDesc::new(300, 128, 1, 128, 128)).unwrap();
        assert_eq!(layout.tile_texel_rect(2), Some((0, TexelRect { x0: 256, y0: 0, x1: 300, y1: 128 })));
        let layout = TileLayout::new(TiledTextureDesc::with_full_mip_chain(512, 256, 128, 128)).unwrap();
        assert_eq!(layout.tile_texel_rect(10), None);
    }
}
