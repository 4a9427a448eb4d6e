//! Texture Sets
//!
//! Textures sampled with the same coordinates (all textures of a material)
//! share one feedback signal. The texel region of each active primary tile is
//! rescaled onto the follower, which requests its own tiles overlapping that
//! region at the same or coarser detail.

use smallvec::SmallVec;

use crate::residency::TiledTextureManager;
use crate::texture::{TexelRect, TileLayout};
use crate::{TextureId, TileError, TileResult};

/// A primary texture and the followers inferring residency from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSet {
    pub primary: TextureId,
    pub followers: SmallVec<[TextureId; 4]>,
}

impl TextureSet {
    /// Every member, primary first
    pub fn members(&self) -> impl Iterator<Item = TextureId> + '_ {
        std::iter::once(self.primary).chain(self.followers.iter().copied())
    }

    pub fn contains(&self, id: TextureId) -> bool {
        self.primary == id || self.followers.contains(&id)
    }
}

/// Follower tiles covering the same region as the primary's active tiles
///
/// For a primary tile at mip `p`, the follower uses the finest level that is no
/// more detailed than the primary's mip `p`. Returns a sorted, deduplicated list.
pub fn resolve_follower_tiles(primary: &TileLayout, follower: &TileLayout, active: &[u32]) -> Vec<u32> {
    let p_desc = primary.desc();
    let f_desc = follower.desc();
    let mut requested = vec![false; follower.total_tiles() as usize];

    for &tile in active {
        let (mip, rect) = if primary.is_packed(tile) {
            let mip = p_desc.regular_mip_levels;
            (mip, TexelRect::full(p_desc.mip_width(mip), p_desc.mip_height(mip)))
        } else {
            match primary.tile_texel_rect(tile) {
                Some(found) => found,
                None => continue,
            }
        };

        let primary_size = (p_desc.mip_width(mip), p_desc.mip_height(mip));
        let Some(level) = (0..f_desc.mip_levels)
            .find(|&f| f_desc.mip_width(f) <= primary_size.0 && f_desc.mip_height(f) <= primary_size.1)
        else {
            continue;
        };

        if level >= f_desc.regular_mip_levels {
            for packed in follower.packed_tiles() {
                requested[packed as usize] = true;
            }
        } else {
            let follower_size = (f_desc.mip_width(level), f_desc.mip_height(level));
            let scaled = rect.scale(primary_size, follower_size);
            for t in follower.tiles_in_rect(level, &scaled) {
                requested[t as usize] = true;
            }
        }
    }

    requested
        .iter()
        .enumerate()
        .filter(|(_, r)| **r)
        .map(|(i, _)| i as u32)
        .collect()
}

/// Check that a set can be formed from the given textures
pub fn validate_texture_set(
    primary: (TextureId, &TileLayout),
    followers: &[(TextureId, &TileLayout)],
) -> TileResult<()> {
    let (primary_id, primary_layout) = primary;
    let p = primary_layout.desc();

    for (index, &(id, layout)) in followers.iter().enumerate() {
        if id == primary_id {
            return Err(TileError::InvalidTextureSet(format!("{} is both primary and follower", id)));
        }
        if followers[..index].iter().any(|(other, _)| *other == id) {
            return Err(TileError::InvalidTextureSet(format!("{} listed twice", id)));
        }
        let f = layout.desc();
        if f.width > p.width || f.height > p.height || f.mip_levels > p.mip_levels {
            return Err(TileError::InvalidTextureSet(format!(
                "follower {} ({}x{}, {} mips) exceeds primary {} ({}x{}, {} mips)",
                id, f.width, f.height, f.mip_levels, primary_id, p.width, p.height, p.mip_levels
            )));
        }
    }
    Ok(())
}

impl TiledTextureManager {
    /// Build a texture set from registered textures, the first being the primary
    pub fn create_texture_set(&self, textures: &[TextureId]) -> TileResult<TextureSet> {
        let Some((&primary, followers)) = textures.split_first() else {
            return Err(TileError::InvalidTextureSet("empty texture set".into()));
        };

        let primary_layout = self.layout(primary)?;
        let mut follower_layouts = Vec::with_capacity(followers.len());
        for &id in followers {
            follower_layouts.push((id, self.layout(id)?));
        }
        validate_texture_set((primary, primary_layout), &follower_layouts)?;

        Ok(TextureSet {
            primary,
            followers: followers.iter().copied().collect(),
        })
    }

    /// Follower tiles implied by the primary's most recent feedback
    pub fn resolve_follower_requests(&self, set: &TextureSet) -> TileResult<Vec<(TextureId, Vec<u32>)>> {
        let primary = self.layout(set.primary)?;
        let active = self.active_tiles(set.primary)?;
        set.followers
            .iter()
            .map(|&follower| -> TileResult<(TextureId, Vec<u32>)> {
                let tiles = resolve_follower_tiles(primary, self.layout(follower)?, &active);
                Ok((follower, tiles))
            })
            .collect()
    }

    /// Drive a follower's residency from the primary's most recent feedback
    ///
    /// Behaves like [`TiledTextureManager::update_with_feedback`] for the follower,
    /// with the active tiles inferred from the primary.
    pub fn match_primary_texture(
        &mut self,
        primary: TextureId,
        follower: TextureId,
        timestamp: f64,
        timeout: f64,
    ) -> TileResult<()> {
        let active = self.active_tiles(primary)?;
        let tiles = resolve_follower_tiles(self.layout(primary)?, self.layout(follower)?, &active);
        self.apply_active_tiles(follower, &tiles, timestamp, timeout)
    }
}
