//! Heap Allocator
//!
//! Owns the physical heaps created through a [`HeapBackend`]:
//! - Heap identifiers are dense and recycled, lowest first
//! - Released heaps are destroyed only when their frame bucket comes around
//!   again, once the GPU can no longer reference them
//! - All remaining heaps are destroyed on drop

use std::collections::BTreeSet;

use tessera_core::{HeapId, TileError};

use crate::{FeedbackError, FeedbackResult};

/// Host hook creating and destroying physical heaps
pub trait HeapBackend {
    /// Host heap handle
    type Heap;
    /// Host error type
    type Error: std::fmt::Display;

    /// Create a heap of `size_in_bytes`
    fn create_heap(&mut self, size_in_bytes: u64) -> Result<Self::Heap, Self::Error>;

    /// Destroy a heap no longer referenced by the GPU
    fn destroy_heap(&mut self, heap: Self::Heap);
}

/// Physical heap owner with deferred destruction
pub struct HeapAllocator<B: HeapBackend> {
    backend: B,
    heap_size_in_bytes: u64,
    heaps: Vec<Option<B::Heap>>,
    free_ids: BTreeSet<u32>,
    /// Released heaps per frame bucket
    pending_release: Vec<Vec<B::Heap>>,
}

impl<B: HeapBackend> HeapAllocator<B> {
    /// Create an allocator with `num_buckets` frame buckets for deferred release
    pub fn new(backend: B, heap_size_in_bytes: u64, num_buckets: usize) -> Self {
        Self {
            backend,
            heap_size_in_bytes,
            heaps: Vec::new(),
            free_ids: BTreeSet::new(),
            pending_release: (0..num_buckets.max(1)).map(|_| Vec::new()).collect(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn heap_size_in_bytes(&self) -> u64 {
        self.heap_size_in_bytes
    }

    /// Destroy the heaps released the last time `bucket` was current
    pub fn begin_frame(&mut self, bucket: usize) {
        let index = bucket % self.pending_release.len();
        let released = std::mem::take(&mut self.pending_release[index]);
        if !released.is_empty() {
            log::debug!("Destroying {} released heaps", released.len());
        }
        for heap in released {
            self.backend.destroy_heap(heap);
        }
    }

    /// Create a heap and return its identifier
    pub fn allocate_heap(&mut self) -> FeedbackResult<HeapId> {
        let heap = self
            .backend
            .create_heap(self.heap_size_in_bytes)
            .map_err(|e| FeedbackError::Backend(e.to_string()))?;

        let id = match self.free_ids.pop_first() {
            Some(id) => {
                self.heaps[id as usize] = Some(heap);
                id
            }
            None => {
                self.heaps.push(Some(heap));
                self.heaps.len() as u32 - 1
            }
        };
        Ok(HeapId(id))
    }

    /// Release a heap; it is destroyed when `bucket` comes around again
    pub fn release_heap(&mut self, id: HeapId, bucket: usize) -> FeedbackResult<()> {
        let heap = self
            .heaps
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or(TileError::UnknownHeap(id))?;
        let index = bucket % self.pending_release.len();
        self.pending_release[index].push(heap);
        self.free_ids.insert(id.0);
        Ok(())
    }

    /// Host handle of a live heap
    pub fn heap(&self, id: HeapId) -> Option<&B::Heap> {
        self.heaps.get(id.0 as usize)?.as_ref()
    }

    /// Live heaps
    pub fn num_heaps(&self) -> usize {
        self.heaps.iter().filter(|h| h.is_some()).count()
    }

    /// Heaps released but not destroyed yet
    pub fn num_pending_release(&self) -> usize {
        self.pending_release.iter().map(Vec::len).sum()
    }

    /// Bytes held by live and not yet destroyed heaps
    pub fn total_allocation_in_bytes(&self) -> u64 {
        (self.num_heaps() + self.num_pending_release()) as u64 * self.heap_size_in_bytes
    }
}

impl<B: HeapBackend> Drop for HeapAllocator<B> {
    fn drop(&mut self) {
        for heap in self.pending_release.iter_mut().flat_map(std::mem::take) {
            self.backend.destroy_heap(heap);
        }
        for heap in self.heaps.iter_mut().filter_map(Option::take) {
            self.backend.destroy_heap(heap);
        }
    }
}
