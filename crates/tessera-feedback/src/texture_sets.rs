//! Texture Set Registry
//!
//! Tracks the texture sets known to the feedback manager. A texture takes part
//! in the feedback ring when it belongs to no set or is the primary of at least
//! one set; pure followers get their residency from their primaries.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tessera_core::{TextureId, TextureSet, TiledTextureManager};

use crate::{FeedbackError, FeedbackResult};

/// Identifier of a registered texture set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TextureSetId(pub u32);

impl std::fmt::Display for TextureSetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "set#{}", self.0)
    }
}

/// Registered texture sets in creation order
#[derive(Debug, Default)]
pub struct TextureSetRegistry {
    sets: IndexMap<TextureSetId, TextureSet>,
    next_id: u32,
}

impl TextureSetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a set, the first texture being the primary
    pub fn create(&mut self, manager: &TiledTextureManager, textures: &[TextureId]) -> FeedbackResult<TextureSetId> {
        let set = manager.create_texture_set(textures).inspect_err(|e| {
            log::warn!("Rejected texture set: {}", e);
        })?;
        let id = TextureSetId(self.next_id);
        self.next_id += 1;
        log::debug!("Created {} with primary {} and {} followers", id, set.primary, set.followers.len());
        self.sets.insert(id, set);
        Ok(id)
    }

    pub fn get(&self, id: TextureSetId) -> Option<&TextureSet> {
        self.sets.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TextureSetId, &TextureSet)> {
        self.sets.iter().map(|(id, set)| (*id, set))
    }

    /// Unregister a set; its members revert to independent feedback
    pub fn remove_set(&mut self, id: TextureSetId) -> FeedbackResult<TextureSet> {
        self.sets.shift_remove(&id).ok_or(FeedbackError::UnknownTextureSet(id))
    }

    /// Add a follower to a set
    pub fn add_texture(
        &mut self,
        manager: &TiledTextureManager,
        id: TextureSetId,
        texture: TextureId,
    ) -> FeedbackResult<()> {
        let set = self.sets.get(&id).ok_or(FeedbackError::UnknownTextureSet(id))?;
        let mut members: Vec<TextureId> = set.members().collect();
        members.push(texture);
        let updated = manager.create_texture_set(&members)?;
        self.sets.insert(id, updated);
        Ok(())
    }

    /// Remove a texture from a set; removing the primary dissolves the set
    ///
    /// Returns `true` when the set was dissolved.
    pub fn remove_texture(&mut self, id: TextureSetId, texture: TextureId) -> FeedbackResult<bool> {
        let set = self.sets.get_mut(&id).ok_or(FeedbackError::UnknownTextureSet(id))?;
        if set.primary == texture {
            self.sets.shift_remove(&id);
            log::debug!("Dissolved {}: primary {} removed", id, texture);
            return Ok(true);
        }
        set.followers.retain(|f| *f != texture);
        Ok(false)
    }

    /// Make the member at `index` (0 = current primary) the primary
    pub fn set_primary_index(
        &mut self,
        manager: &TiledTextureManager,
        id: TextureSetId,
        index: usize,
    ) -> FeedbackResult<()> {
        let set = self.sets.get(&id).ok_or(FeedbackError::UnknownTextureSet(id))?;
        let mut members: Vec<TextureId> = set.members().collect();
        if index >= members.len() {
            return Err(FeedbackError::InvalidConfig(format!(
                "primary index {} out of range for {} with {} members",
                index,
                id,
                members.len()
            )));
        }
        members.swap(0, index);
        let updated = manager.create_texture_set(&members)?;
        self.sets.insert(id, updated);
        Ok(())
    }

    /// Remove a texture from every set; sets it was primary of are dissolved
    pub fn remove_texture_everywhere(&mut self, texture: TextureId) {
        self.sets.retain(|_, set| set.primary != texture);
        for set in self.sets.values_mut() {
            set.followers.retain(|f| *f != texture);
        }
    }

    /// Whether the texture needs its own feedback readback
    pub fn needs_feedback(&self, texture: TextureId) -> bool {
        self.is_primary(texture) || !self.sets.values().any(|set| set.followers.contains(&texture))
    }

    /// Whether the texture is primary of any set
    pub fn is_primary(&self, texture: TextureId) -> bool {
        self.sets.values().any(|set| set.primary == texture)
    }

    /// Followers of every set the texture is primary of, without duplicates
    pub fn followers_of(&self, primary: TextureId) -> Vec<TextureId> {
        let mut followers = Vec::new();
        for set in self.sets.values().filter(|set| set.primary == primary) {
            for &follower in &set.followers {
                if !followers.contains(&follower) {
                    followers.push(follower);
                }
            }
        }
        followers
    }
}
