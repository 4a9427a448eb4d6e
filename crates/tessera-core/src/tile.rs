//! Tile Residency State Machine
//!
//! Every tile moves through:
//! - `Unmapped` -> `Requested` when feedback first reports it
//! - `Requested` -> `Mapped` once a slot was reserved and the caller committed the mapping
//! - `Mapped` -> `Standby` when feedback stops reporting it
//! - `Standby` -> `Mapped` when feedback reports it again
//! - `Standby` -> `PendingUnmap` after the timeout, or when trimmed
//! - `PendingUnmap` -> `Unmapped` when the caller acknowledges the unmap

use serde::{Deserialize, Serialize};

use crate::SlotRef;

/// Residency state of a single tile
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub enum TileState {
    /// No physical backing
    #[default]
    Unmapped,
    /// Wanted; `reservation` is set once the admission controller found a slot
    Requested { reservation: Option<SlotRef> },
    /// Resident and in use
    Mapped { slot: SlotRef },
    /// Resident but unused since `since` (seconds)
    Standby { slot: SlotRef, since: f64 },
    /// Scheduled for unmapping, slot still held until acknowledged
    PendingUnmap { slot: SlotRef },
}

/// Discriminant of [`TileState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileStateKind {
    Unmapped,
    Requested,
    Mapped,
    Standby,
    PendingUnmap,
}

/// Input to the tile state machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TileEvent {
    /// Feedback reported the tile
    Request,
    /// A slot was reserved for the request
    Reserve(SlotRef),
    /// Request withdrawn before a slot was reserved
    Cancel,
    /// Caller committed the mapping
    Commit,
    /// Feedback stopped reporting a mapped tile
    Release { now: f64 },
    /// Feedback reported a standby tile again
    Rerequest,
    /// Standby timeout elapsed
    Expire,
    /// Forced out of residency (trim)
    Evict,
    /// Caller acknowledged the unmap
    Acknowledge,
    /// Tile contents moved to another slot
    Relocate(SlotRef),
}

impl TileState {
    pub fn kind(&self) -> TileStateKind {
        match self {
            TileState::Unmapped => TileStateKind::Unmapped,
            TileState::Requested { .. } => TileStateKind::Requested,
            TileState::Mapped { .. } => TileStateKind::Mapped,
            TileState::Standby { .. } => TileStateKind::Standby,
            TileState::PendingUnmap { .. } => TileStateKind::PendingUnmap,
        }
    }

    /// Slot held by the tile, reservations included
    pub fn slot(&self) -> Option<SlotRef> {
        match *self {
            TileState::Unmapped => None,
            TileState::Requested { reservation } => reservation,
            TileState::Mapped { slot }
            | TileState::Standby { slot, .. }
            | TileState::PendingUnmap { slot } => Some(slot),
        }
    }

    /// Whether the tile's contents are usable by sampling
    pub fn is_resident(&self) -> bool {
        matches!(self, TileState::Mapped { .. } | TileState::Standby { .. })
    }

    /// Apply an event, returning the next state or `None` if the transition is not allowed
    pub fn on(&self, event: TileEvent) -> Option<TileState> {
        use TileEvent as E;
        use TileState as S;

        match (*self, event) {
            (S::Unmapped, E::Request) => Some(S::Requested { reservation: None }),
            (S::Requested { reservation: None }, E::Reserve(slot)) => {
                Some(S::Requested { reservation: Some(slot) })
            }
            (S::Requested { reservation: None }, E::Cancel) => Some(S::Unmapped),
            (S::Requested { reservation: Some(slot) }, E::Commit) => Some(S::Mapped { slot }),
            (S::Mapped { slot }, E::Release { now }) => Some(S::Standby { slot, since: now }),
            (S::Standby { slot, .. }, E::Rerequest) => Some(S::Mapped { slot }),
            (S::Standby { slot, .. }, E::Expire) => Some(S::PendingUnmap { slot }),
            (S::Mapped { slot } | S::Standby { slot, .. }, E::Evict) => {
                Some(S::PendingUnmap { slot })
            }
            (S::PendingUnmap { .. }, E::Acknowledge) => Some(S::Unmapped),
            (S::Mapped { .. }, E::Relocate(slot)) => Some(S::Mapped { slot }),
            (S::Standby { since, .. }, E::Relocate(slot)) => Some(S::Standby { slot, since }),
            _ => None,
        }
    }
}

/// Per-tile bookkeeping inside the residency table
#[derive(Debug, Clone, Copy, Default)]
pub struct Tile {
    pub state: TileState,
    /// Timestamp of the last feedback report, seconds
    pub last_requested: f64,
    /// Part of the packed mip tail
    pub packed: bool,
}
