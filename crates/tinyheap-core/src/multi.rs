//! Multi-heap allocator.
//!
//! An ordered group of heaps with a deterministic fallback policy: "any"
//! requests try heaps in ascending index order and the first success wins;
//! "at" requests target one heap with no fallback. At most one heap lock is
//! held at any time.

use std::sync::Arc;

use crate::error::{ContractViolation, MmError, MmResult};
use crate::heap::{Heap, HeapInfo};
use crate::region::RegionSpace;
use crate::tracker::CallSite;

#[derive(Debug)]
pub struct HeapGroup {
    space: RegionSpace,
    heaps: Vec<Arc<Heap>>,
}

impl HeapGroup {
    #[must_use]
    pub fn new(space: RegionSpace, heaps: Vec<Arc<Heap>>) -> Self {
        Self { space, heaps }
    }

    #[must_use]
    pub fn space(&self) -> RegionSpace {
        self.space
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heaps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heaps.is_empty()
    }

    #[must_use]
    pub fn heap(&self, index: usize) -> Option<&Arc<Heap>> {
        self.heaps.get(index)
    }

    pub fn heaps(&self) -> impl Iterator<Item = &Arc<Heap>> + '_ {
        self.heaps.iter()
    }

    /// Heap whose regions contain `ptr`.
    #[must_use]
    pub fn owner_of(&self, ptr: usize) -> Option<&Arc<Heap>> {
        self.heaps.iter().find(|h| h.owns(ptr))
    }

    fn target(&self, index: usize) -> MmResult<&Arc<Heap>> {
        self.heaps.get(index).ok_or(MmError::InvalidHeapIndex {
            index,
            count: self.heaps.len(),
        })
    }

    /// First heap, in index order, that can serve `size` bytes.
    pub fn allocate_any(&self, size: usize, site: Option<CallSite>) -> MmResult<usize> {
        self.first_success(size, |heap| heap.allocate_from(size, site))
    }

    /// [`HeapGroup::allocate_any`] for an aligned request.
    pub fn memalign_any(
        &self,
        alignment: usize,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        self.first_success(size, |heap| heap.memalign_from(alignment, size, site))
    }

    fn first_success(
        &self,
        size: usize,
        mut attempt: impl FnMut(&Heap) -> MmResult<usize>,
    ) -> MmResult<usize> {
        for heap in self.heaps.iter().map(Arc::as_ref) {
            if let Ok(ptr) = attempt(heap) {
                return Ok(ptr);
            }
        }
        Err(MmError::exhausted(size))
    }

    /// Allocates from heap `index` only.
    pub fn allocate_at(&self, index: usize, size: usize, site: Option<CallSite>) -> MmResult<usize> {
        self.target(index)?.allocate_from(size, site)
    }

    /// Aligned allocation from heap `index` only.
    pub fn memalign_at(
        &self,
        index: usize,
        alignment: usize,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        self.target(index)?.memalign_from(alignment, size, site)
    }

    /// Routes `ptr` to its owning heap by address. Null is a no-op.
    pub fn try_free(&self, ptr: usize) -> Result<(), ContractViolation> {
        if ptr == 0 {
            return Ok(());
        }
        match self.owner_of(ptr) {
            Some(heap) => heap.try_free(ptr),
            None => Err(ContractViolation::ForeignPointer {
                ptr,
                heap: self.space_name(),
            }),
        }
    }

    /// Frees `ptr` in its owning heap, asserting on contract breaches the way
    /// that heap is configured to.
    pub fn free(&self, ptr: usize) -> Result<(), ContractViolation> {
        if ptr == 0 {
            return Ok(());
        }
        match self.owner_of(ptr) {
            Some(heap) => {
                heap.free(ptr);
                Ok(())
            }
            None => Err(ContractViolation::ForeignPointer {
                ptr,
                heap: self.space_name(),
            }),
        }
    }

    const fn space_name(&self) -> &'static str {
        match self.space {
            RegionSpace::User => "user heap group",
            RegionSpace::Kernel => "kernel heap group",
        }
    }

    #[must_use]
    pub fn info(&self) -> Vec<HeapInfo> {
        self.heaps.iter().map(|h| h.info()).collect()
    }
}
