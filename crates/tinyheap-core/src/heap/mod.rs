//! Heap instance.
//!
//! One lock-protected allocator over one or more regions. Every public call
//! takes the heap's own lock for its whole body and never calls into another
//! heap while holding it. Addresses are handed out but the managed memory is
//! never read or written here; callers that back regions with real memory
//! (the ABI layer) do any zeroing or copying themselves.

mod block;
mod state;

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

pub use block::{
    BLOCK_OVERHEAD, BlockView, MIN_ALIGN, MIN_BLOCK_SIZE, MIN_PAYLOAD, align_down, align_up,
    block_size_for, payload_size_for, trim_to_granule,
};

use crate::config::MmConfig;
use crate::error::{ContractViolation, MmError, MmResult};
use crate::log::{Event, LifecycleLog, LifecycleRecord, LogLevel};
use crate::memalign;
use crate::region::MemoryRegion;
use crate::tracker::{CallSite, SiteReport, SiteTracker};
use state::HeapState;

/// Which population a heap serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HeapKind {
    User,
    Kernel,
    /// Private heap of one task group (isolation-capable builds).
    Task,
}

impl HeapKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "user heap",
            Self::Kernel => "kernel heap",
            Self::Task => "task heap",
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            Self::User => "heap",
            Self::Kernel => "kheap",
            Self::Task => "task",
        }
    }
}

impl fmt::Display for HeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accounting snapshot of one heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapInfo {
    pub label: String,
    pub kind: HeapKind,
    pub index: usize,
    /// Sum of the region sizes as supplied by the platform.
    pub region_bytes: usize,
    /// Sum of the (granule-trimmed) region sizes.
    pub total_bytes: usize,
    /// Payload bytes of in-use blocks, alignment slack included.
    pub live_bytes: usize,
    /// Payload bytes of free blocks.
    pub free_bytes: usize,
    /// Header bytes of every block.
    pub overhead_bytes: usize,
    /// Payload bytes of the largest free block.
    pub largest_free_block: usize,
    pub blocks: usize,
    pub free_blocks: usize,
    pub live_allocations: usize,
    pub peak_live_bytes: usize,
    /// Region bytes lost to granule trimming at init.
    pub trimmed_bytes: usize,
    pub failed_allocations: u64,
}

impl HeapInfo {
    /// `live + free + overhead + trimmed` equals the raw region sum, and
    /// trimming accounts for the whole gap between raw and usable bytes.
    #[must_use]
    pub fn is_conserved(&self) -> bool {
        self.live_bytes + self.free_bytes + self.overhead_bytes + self.trimmed_bytes
            == self.region_bytes
            && self.total_bytes + self.trimmed_bytes == self.region_bytes
    }
}

/// What `realloc` decided while holding the lock.
enum ReallocPlan {
    InPlace,
    Move {
        old_payload: usize,
        old_site: Option<CallSite>,
    },
    Unknown(ContractViolation),
}

/// Lock-protected allocator over a fixed set of regions.
#[derive(Debug)]
pub struct Heap {
    kind: HeapKind,
    index: usize,
    label: String,
    /// Trimmed `(start, size)` spans, in region order.
    regions: Vec<(usize, usize)>,
    region_bytes: usize,
    total_bytes: usize,
    trimmed_bytes: usize,
    assert_contract: bool,
    state: Mutex<HeapState>,
}

impl Heap {
    /// Builds a heap over `regions`.
    ///
    /// Regions are trimmed inward to the `MIN_ALIGN` granule; a region left
    /// with less than one minimum block is dropped and its bytes counted as
    /// trimmed (the registry rejects such regions before they get here).
    pub fn new<'a>(
        kind: HeapKind,
        index: usize,
        regions: impl IntoIterator<Item = &'a MemoryRegion>,
        config: &MmConfig,
    ) -> Self {
        let mut spans = Vec::new();
        let mut region_bytes = 0;
        let mut trimmed_bytes = 0;
        for region in regions {
            region_bytes += region.size;
            match trim_to_granule(region.start, region.size) {
                Some((start, size)) if size >= MIN_BLOCK_SIZE => {
                    trimmed_bytes += region.size - size;
                    spans.push((start, size));
                }
                _ => trimmed_bytes += region.size,
            }
        }
        let total_bytes = spans.iter().map(|&(_, size)| size).sum();
        let label = format!("{}{}", kind.prefix(), index);

        let sites = config
            .track_sites
            .then(|| SiteTracker::new(config.site_table_capacity));
        let log = LifecycleLog::new(label.clone(), config.lifecycle_log_capacity);
        let mut state = HeapState::new(&spans, sites, log);
        state.log(
            Event::new(LogLevel::Info, "init", "heap_ready", "success")
                .size(total_bytes)
                .details(format!(
                    "regions={} trimmed_bytes={}",
                    spans.len(),
                    trimmed_bytes
                )),
        );

        Self {
            kind,
            index,
            label,
            regions: spans,
            region_bytes,
            total_bytes,
            trimmed_bytes,
            assert_contract: config.assert_contract,
            state: Mutex::new(state),
        }
    }

    #[must_use]
    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Short name used in logs and reports (`heap0`, `kheap1`, `task7`).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Whether `ptr` lies inside one of this heap's regions. Lock-free.
    #[must_use]
    pub fn owns(&self, ptr: usize) -> bool {
        self.regions
            .iter()
            .any(|&(start, size)| ptr >= start && ptr - start < size)
    }

    /// Allocates at least `size` bytes aligned to `MIN_ALIGN`.
    pub fn allocate(&self, size: usize) -> MmResult<usize> {
        self.allocate_from(size, None)
    }

    /// [`Heap::allocate`] attributing the block to `site` when tracking is on.
    pub fn allocate_from(&self, size: usize, site: Option<CallSite>) -> MmResult<usize> {
        self.allocate_inner(size, site, "malloc")
    }

    pub(crate) fn allocate_inner(
        &self,
        size: usize,
        site: Option<CallSite>,
        symbol: &'static str,
    ) -> MmResult<usize> {
        let mut state = self.state.lock();
        let Some(total) = block_size_for(size) else {
            state.note_failure();
            state.log(
                Event::new(LogLevel::Warn, symbol, "size_overflow", "denied").size(size),
            );
            return Err(MmError::exhausted(size));
        };

        let Some(block) = state.take(total, size) else {
            state.note_failure();
            let largest = state.largest_free();
            state.log(
                Event::new(LogLevel::Info, symbol, "no_fit", "oom")
                    .size(size)
                    .details(format!("block_size={total} largest_free={largest}")),
            );
            return Err(MmError::exhausted(size));
        };

        let ptr = block.payload();
        if let (Some(sites), Some(site)) = (state.sites.as_mut(), site) {
            sites.record(ptr, size, site);
        }
        state.log(
            Event::new(LogLevel::Trace, symbol, "alloc", "success")
                .ptr(ptr)
                .size(size)
                .details(format!("block_size={}", block.size)),
        );
        Ok(ptr)
    }

    /// Frees a pointer previously returned by this heap. Null is a no-op.
    ///
    /// Contract breaches panic when `assert_contract` is set and are logged
    /// and ignored otherwise.
    pub fn free(&self, ptr: usize) {
        if let Err(violation) = self.try_free(ptr)
            && self.assert_contract
        {
            panic!("free: {violation}");
        }
    }

    /// [`Heap::free`] reporting contract breaches instead of asserting.
    pub fn try_free(&self, ptr: usize) -> Result<(), ContractViolation> {
        if ptr == 0 {
            return Ok(());
        }
        let mut state = self.state.lock();
        match state.release(ptr) {
            Some(block) => {
                state.log(
                    Event::new(LogLevel::Trace, "free", "free", "success")
                        .ptr(ptr)
                        .size(block.requested)
                        .details(format!("block_size={}", block.size)),
                );
                Ok(())
            }
            None => {
                let violation = self.violation(ptr);
                state.log(
                    Event::new(LogLevel::Warn, "free", violation.event(), "ignored").ptr(ptr),
                );
                Err(violation)
            }
        }
    }

    fn violation(&self, ptr: usize) -> ContractViolation {
        if self.owns(ptr) {
            ContractViolation::NotLive {
                ptr,
                heap: self.kind.name(),
            }
        } else {
            ContractViolation::ForeignPointer {
                ptr,
                heap: self.kind.name(),
            }
        }
    }

    /// Allocates `size` bytes at an `alignment`-aligned address.
    ///
    /// `alignment` must be a power of two.
    pub fn memalign(&self, alignment: usize, size: usize) -> MmResult<usize> {
        memalign::memalign(self, alignment, size, None)
    }

    pub fn memalign_from(
        &self,
        alignment: usize,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        memalign::memalign(self, alignment, size, site)
    }

    /// Returns the leading `aligned - base` bytes of a freshly allocated
    /// oversized block to the free pool.
    pub(crate) fn release_leading(&self, base: usize, aligned: usize) -> bool {
        let mut state = self.state.lock();
        let done = state.split_front(base, aligned);
        let event = if done {
            Event::new(LogLevel::Trace, "memalign", "release_leading", "success")
        } else {
            Event::new(LogLevel::Error, "memalign", "release_leading", "refused")
        };
        state.log(event.ptr(base).size(aligned - base));
        done
    }

    /// Cuts a freshly aligned block down to `payload` bytes when the tail can
    /// stand alone; otherwise the tail stays as slack. Records `size` as the
    /// block's requested size.
    pub(crate) fn release_trailing(
        &self,
        aligned: usize,
        size: usize,
        payload: usize,
        alignment: usize,
    ) {
        let mut state = self.state.lock();
        let released = state.split_tail(aligned, payload + BLOCK_OVERHEAD);
        state.set_requested(aligned, size);
        if let Some(sites) = state.sites.as_mut() {
            sites.resize(aligned, size);
        }
        let outcome = if released > 0 { "trimmed" } else { "slack_kept" };
        state.log(
            Event::new(LogLevel::Trace, "memalign", "aligned", outcome)
                .ptr(aligned)
                .size(size)
                .details(format!("alignment={alignment} tail_released={released}")),
        );
    }

    /// Resizes the block at `ptr` to at least `size` bytes.
    ///
    /// Shrinks in place, grows in place into a free successor, or moves:
    /// allocates a new block in this heap, calls `copy(src, dst, len)` and
    /// frees the old block. On failure the old block is left untouched. A
    /// null `ptr` behaves like `allocate`.
    pub fn realloc<F>(&self, ptr: usize, size: usize, copy: F) -> MmResult<usize>
    where
        F: FnMut(usize, usize, usize),
    {
        self.realloc_from(ptr, size, None, copy)
    }

    pub fn realloc_from<F>(
        &self,
        ptr: usize,
        size: usize,
        site: Option<CallSite>,
        mut copy: F,
    ) -> MmResult<usize>
    where
        F: FnMut(usize, usize, usize),
    {
        if ptr == 0 {
            return self.allocate_inner(size, site, "realloc");
        }

        let plan = {
            let mut state = self.state.lock();
            match (block_size_for(size), state.live_block(ptr)) {
                (_, None) => {
                    let violation = self.violation(ptr);
                    state.log(
                        Event::new(LogLevel::Warn, "realloc", "realloc_unknown_pointer", "fallback_alloc")
                            .ptr(ptr)
                            .size(size),
                    );
                    ReallocPlan::Unknown(violation)
                }
                (None, Some(_)) => {
                    state.note_failure();
                    state.log(
                        Event::new(LogLevel::Warn, "realloc", "size_overflow", "denied")
                            .ptr(ptr)
                            .size(size),
                    );
                    return Err(MmError::exhausted(size));
                }
                (Some(total), Some(block)) if total <= block.size => {
                    let released = state.split_tail(ptr, total);
                    state.set_requested(ptr, size);
                    if let Some(sites) = state.sites.as_mut() {
                        sites.resize(ptr, size);
                    }
                    state.log(
                        Event::new(LogLevel::Trace, "realloc", "realloc_shrink", "success")
                            .ptr(ptr)
                            .size(size)
                            .details(format!("old_size={} released={released}", block.requested)),
                    );
                    ReallocPlan::InPlace
                }
                (Some(total), Some(block)) => {
                    if state.grow(ptr, total, size) {
                        if let Some(sites) = state.sites.as_mut() {
                            sites.resize(ptr, size);
                        }
                        state.log(
                            Event::new(LogLevel::Trace, "realloc", "realloc_grow", "success")
                                .ptr(ptr)
                                .size(size)
                                .details(format!("old_size={}", block.requested)),
                        );
                        ReallocPlan::InPlace
                    } else {
                        ReallocPlan::Move {
                            old_payload: block.payload_size(),
                            old_site: state.sites.as_ref().and_then(|s| s.site_of(ptr)),
                        }
                    }
                }
            }
        };

        match plan {
            ReallocPlan::InPlace => Ok(ptr),
            ReallocPlan::Unknown(violation) => {
                if self.assert_contract {
                    panic!("realloc: {violation}");
                }
                self.allocate_inner(size, site, "realloc")
            }
            ReallocPlan::Move {
                old_payload,
                old_site,
            } => {
                let new_ptr = self.allocate_inner(size, site.or(old_site), "realloc")?;
                copy(ptr, new_ptr, old_payload.min(size));
                let mut state = self.state.lock();
                state.release(ptr);
                state.log(
                    Event::new(LogLevel::Trace, "realloc", "realloc_move", "success")
                        .ptr(new_ptr)
                        .size(size)
                        .details(format!("old_ptr={ptr:#x} old_payload={old_payload}")),
                );
                Ok(new_ptr)
            }
        }
    }

    /// Usable payload bytes of a live allocation.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        self.state.lock().live_block(ptr).map(|b| b.payload_size())
    }

    #[must_use]
    pub fn info(&self) -> HeapInfo {
        let state = self.state.lock();
        HeapInfo {
            label: self.label.clone(),
            kind: self.kind,
            index: self.index,
            region_bytes: self.region_bytes,
            total_bytes: self.total_bytes,
            live_bytes: state.live_bytes(),
            free_bytes: state.free_bytes(),
            overhead_bytes: state.block_count() * BLOCK_OVERHEAD,
            largest_free_block: state.largest_free(),
            blocks: state.block_count(),
            free_blocks: state.free_block_count(),
            live_allocations: state.live_allocations(),
            peak_live_bytes: state.peak_live_bytes(),
            trimmed_bytes: self.trimmed_bytes,
            failed_allocations: state.failed_allocations(),
        }
    }

    /// Address-ordered block layout.
    #[must_use]
    pub fn layout(&self) -> Vec<BlockView> {
        self.state.lock().layout()
    }

    /// Site table snapshot; `None` when tracking is disabled.
    #[must_use]
    pub fn site_report(&self) -> Option<SiteReport> {
        let state = self.state.lock();
        state.sites.as_ref().map(|s| s.report(self.label.clone()))
    }

    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.state.lock().log.records()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.state.lock().log.drain()
    }
}
