//! Heap Pool
//!
//! Physical heaps are divided into fixed-size tile slots. The pool only tracks
//! slot ownership; creating and destroying the backing memory is the owner's job.
//!
//! A slot is in one of three states:
//! - `Free`, available for allocation
//! - `Occupied`, owned by a tile (reserved, mapped, standby or pending unmap)
//! - `Retiring`, vacated by a defragmentation move the caller has not completed yet

use std::collections::BTreeSet;

use crate::{HeapId, SlotRef, TileError, TileRef, TileResult};

/// Ownership state of a heap slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEntry {
    Free,
    Occupied(TileRef),
    Retiring,
}

/// Slot usage of one heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOccupancy {
    pub id: HeapId,
    pub occupied: u32,
    pub retiring: u32,
    pub free: u32,
}

impl HeapOccupancy {
    /// Slots that are not free
    pub fn used(&self) -> u32 {
        self.occupied + self.retiring
    }
}

#[derive(Debug)]
struct Heap {
    id: HeapId,
    slots: Vec<SlotEntry>,
    free: BTreeSet<u32>,
    occupied: u32,
    retiring: u32,
}

impl Heap {
    fn new(id: HeapId, capacity: u32) -> Self {
        Self {
            id,
            slots: vec![SlotEntry::Free; capacity as usize],
            free: (0..capacity).collect(),
            occupied: 0,
            retiring: 0,
        }
    }

    fn occupancy(&self) -> HeapOccupancy {
        HeapOccupancy {
            id: self.id,
            occupied: self.occupied,
            retiring: self.retiring,
            free: self.free.len() as u32,
        }
    }

    fn is_empty(&self) -> bool {
        self.occupied == 0 && self.retiring == 0
    }

    fn take_free(&mut self, tile: TileRef) -> Option<SlotRef> {
        let slot = self.free.pop_first()?;
        self.slots[slot as usize] = SlotEntry::Occupied(tile);
        self.occupied += 1;
        Some(SlotRef::new(self.id, slot))
    }
}

/// Pool of equally sized heaps
#[derive(Debug)]
pub struct HeapPool {
    capacity: u32,
    heaps: Vec<Heap>,
}

impl HeapPool {
    /// Create an empty pool of heaps holding `capacity` tiles each
    pub fn new(capacity: u32) -> TileResult<Self> {
        if capacity == 0 {
            return Err(TileError::InvalidConfig("heap capacity must be at least one tile".into()));
        }
        Ok(Self { capacity, heaps: Vec::new() })
    }

    /// Tiles per heap
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn num_heaps(&self) -> usize {
        self.heaps.len()
    }

    pub fn contains_heap(&self, id: HeapId) -> bool {
        self.heaps.iter().any(|h| h.id == id)
    }

    /// Heap identifiers in registration order
    pub fn heap_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.heaps.iter().map(|h| h.id)
    }

    /// Register a new heap with all slots free
    pub fn add_heap(&mut self, id: HeapId) -> TileResult<()> {
        if self.contains_heap(id) {
            return Err(TileError::DuplicateHeap(id));
        }
        self.heaps.push(Heap::new(id, self.capacity));
        Ok(())
    }

    /// Unregister a heap; it must not hold any tiles
    pub fn remove_heap(&mut self, id: HeapId) -> TileResult<()> {
        let index = self.index_of(id)?;
        if !self.heaps[index].is_empty() {
            return Err(TileError::HeapNotEmpty(id));
        }
        self.heaps.remove(index);
        Ok(())
    }

    /// Allocate a slot for `tile`, preferring the most occupied heap with room
    ///
    /// Filling dense heaps first keeps sparse heaps draining towards empty.
    pub fn allocate(&mut self, tile: TileRef) -> Option<SlotRef> {
        let heap = self
            .heaps
            .iter_mut()
            .filter(|h| !h.free.is_empty())
            .rev()
            .max_by_key(|h| h.occupied + h.retiring)?;
        heap.take_free(tile)
    }

    /// Allocate a slot for `tile` in a specific heap
    pub fn allocate_in(&mut self, id: HeapId, tile: TileRef) -> TileResult<Option<SlotRef>> {
        let index = self.index_of(id)?;
        Ok(self.heaps[index].take_free(tile))
    }

    /// Free an occupied slot, returning the tile that owned it
    pub fn release(&mut self, slot: SlotRef) -> TileResult<TileRef> {
        let heap = self.heap_mut(slot.heap)?;
        match heap.slots.get(slot.slot as usize).copied() {
            Some(SlotEntry::Occupied(tile)) => {
                heap.slots[slot.slot as usize] = SlotEntry::Free;
                heap.occupied -= 1;
                heap.free.insert(slot.slot);
                Ok(tile)
            }
            _ => Err(TileError::SlotMismatch { heap: slot.heap, slot: slot.slot }),
        }
    }

    /// Mark an occupied slot as vacated by a move that is still in flight
    pub fn retire(&mut self, slot: SlotRef) -> TileResult<TileRef> {
        let heap = self.heap_mut(slot.heap)?;
        match heap.slots.get(slot.slot as usize).copied() {
            Some(SlotEntry::Occupied(tile)) => {
                heap.slots[slot.slot as usize] = SlotEntry::Retiring;
                heap.occupied -= 1;
                heap.retiring += 1;
                Ok(tile)
            }
            _ => Err(TileError::SlotMismatch { heap: slot.heap, slot: slot.slot }),
        }
    }

    /// Free a retiring slot once its move completed
    pub fn release_retiring(&mut self, slot: SlotRef) -> TileResult<()> {
        let heap = self.heap_mut(slot.heap)?;
        match heap.slots.get(slot.slot as usize) {
            Some(SlotEntry::Retiring) => {
                heap.slots[slot.slot as usize] = SlotEntry::Free;
                heap.retiring -= 1;
                heap.free.insert(slot.slot);
                Ok(())
            }
            _ => Err(TileError::SlotMismatch { heap: slot.heap, slot: slot.slot }),
        }
    }

    /// Tile owning a slot, if any
    pub fn owner(&self, slot: SlotRef) -> Option<TileRef> {
        let heap = self.heaps.iter().find(|h| h.id == slot.heap)?;
        match heap.slots.get(slot.slot as usize)? {
            SlotEntry::Occupied(tile) => Some(*tile),
            _ => None,
        }
    }

    /// Occupied slots of a heap with their owners, in slot order
    pub fn occupied_slots(&self, id: HeapId) -> TileResult<Vec<(SlotRef, TileRef)>> {
        let index = self.index_of(id)?;
        let heap = &self.heaps[index];
        Ok(heap
            .slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| match entry {
                SlotEntry::Occupied(tile) => Some((SlotRef::new(id, slot as u32), *tile)),
                _ => None,
            })
            .collect())
    }

    /// Usage of every heap in registration order
    pub fn occupancy(&self) -> impl Iterator<Item = HeapOccupancy> + '_ {
        self.heaps.iter().map(Heap::occupancy)
    }

    /// Heaps with no occupied or retiring slots
    pub fn empty_heaps(&self) -> Vec<HeapId> {
        self.heaps.iter().filter(|h| h.is_empty()).map(|h| h.id).collect()
    }

    pub fn total_slots(&self) -> u32 {
        self.capacity.saturating_mul(self.heaps.len() as u32)
    }

    pub fn free_slots(&self) -> u32 {
        self.heaps.iter().map(|h| h.free.len() as u32).sum()
    }

    pub fn occupied_slots_count(&self) -> u32 {
        self.heaps.iter().map(|h| h.occupied).sum()
    }

    pub fn retiring_slots(&self) -> u32 {
        self.heaps.iter().map(|h| h.retiring).sum()
    }

    fn index_of(&self, id: HeapId) -> TileResult<usize> {
        self.heaps
            .iter()
            .position(|h| h.id == id)
            .ok_or(TileError::UnknownHeap(id))
    }

    fn heap_mut(&mut self, id: HeapId) -> TileResult<&mut Heap> {
        let index = self.index_of(id)?;
        Ok(&mut self.heaps[index])
    }
}
