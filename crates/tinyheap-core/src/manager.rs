//! Memory manager: the single initialization handle.
//!
//! Built once from the configuration, the platform region tables and the
//! scheduler's [`ExecutionContext`]. Owns every heap for the life of the
//! system and exposes the malloc family on top of them.
//!
//! Pointers are plain addresses. The core never touches managed memory, so
//! `calloc`/`zalloc` leave zeroing to the caller and `realloc` copies through
//! a caller-supplied callback; the ABI crate does both on real memory.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::MmConfig;
use crate::error::{ConfigError, ContractViolation, MmError, MmResult};
use crate::heap::{Heap, HeapInfo, HeapKind};
use crate::log::{Event, LifecycleLog, LifecycleRecord, LogLevel};
use crate::multi::HeapGroup;
use crate::region::{RegionDescriptor, RegionRegistry, RegionSpace, validate_region};
use crate::selector::{ExecutionContext, HeapSelector, Selection, SelectionRule};
use crate::tracker::{CallSite, SiteReport};

/// A private heap created for one task group.
#[derive(Debug)]
struct TaskHeap {
    start: usize,
    end: usize,
    heap: Arc<Heap>,
}

pub struct MemoryManager {
    config: MmConfig,
    registry: RegionRegistry,
    selector: HeapSelector,
    context: Arc<dyn ExecutionContext>,
    task_heaps: Mutex<Vec<TaskHeap>>,
    log: Mutex<LifecycleLog>,
}

impl std::fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryManager")
            .field("config", &self.config)
            .field("selector", &self.selector)
            .field("task_heaps", &self.task_heaps.lock().len())
            .finish_non_exhaustive()
    }
}

impl MemoryManager {
    /// Validates the region tables and builds every heap.
    pub fn new(
        config: MmConfig,
        user: &[RegionDescriptor],
        kernel: &[RegionDescriptor],
        context: Arc<dyn ExecutionContext>,
    ) -> Result<Self, ConfigError> {
        let registry = RegionRegistry::new(&config, user, kernel)?;

        let build = |space: RegionSpace, kind: HeapKind| {
            let heaps = (0..registry.heap_count(space))
                .map(|index| {
                    Arc::new(Heap::new(
                        kind,
                        index,
                        registry.regions_for(space, index),
                        &config,
                    ))
                })
                .collect();
            HeapGroup::new(space, heaps)
        };
        let user_group = build(RegionSpace::User, HeapKind::User);
        let kernel_group = (registry.heap_count(RegionSpace::Kernel) > 0)
            .then(|| build(RegionSpace::Kernel, HeapKind::Kernel));

        let selector = HeapSelector::new(
            config.topology,
            user_group,
            kernel_group,
            config.app_fallback_heap,
        )?;

        let mut log = LifecycleLog::new("manager", config.lifecycle_log_capacity);
        log.push(
            Event::new(LogLevel::Info, "init", "manager_ready", "success").details(format!(
                "topology={} user_heaps={} kernel_heaps={} regions={}",
                config.topology,
                registry.heap_count(RegionSpace::User),
                registry.heap_count(RegionSpace::Kernel),
                registry.iter().count()
            )),
            0,
            0,
        );

        Ok(Self {
            config,
            registry,
            selector,
            context,
            task_heaps: Mutex::new(Vec::new()),
            log: Mutex::new(log),
        })
    }

    #[must_use]
    pub fn config(&self) -> &MmConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    #[must_use]
    pub fn selector(&self) -> &HeapSelector {
        &self.selector
    }

    /// Rule the selector applies to the current caller right now.
    #[must_use]
    pub fn current_rule(&self) -> Option<SelectionRule> {
        self.selector.resolve(self.context.as_ref()).map(|s| s.rule())
    }

    fn record(&self, event: Event) {
        self.log.lock().push(event, 0, 0);
    }

    #[track_caller]
    fn site(&self) -> Option<CallSite> {
        if self.config.track_sites {
            Some(CallSite::caller())
        } else {
            None
        }
    }

    fn site_if_tracking(&self, site: CallSite) -> Option<CallSite> {
        self.config.track_sites.then_some(site)
    }

    fn note_failure(
        &self,
        symbol: &'static str,
        err: MmError,
        rule: Option<SelectionRule>,
    ) -> MmError {
        let level = match err {
            MmError::ResourceExhausted { .. } => LogLevel::Info,
            MmError::InvalidHeapIndex { .. } => LogLevel::Warn,
        };
        let details = match rule {
            Some(rule) => format!("{err} rule={rule}"),
            None => err.to_string(),
        };
        let mut event = Event::new(level, symbol, "request_failed", err.outcome()).details(details);
        if let MmError::ResourceExhausted { requested } = err {
            event = event.size(requested);
        }
        self.record(event);
        err
    }

    // --- implicit (context-selected) requests -------------------------------

    /// Allocates `size` bytes from the heap selected for the current caller.
    #[track_caller]
    pub fn malloc(&self, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.malloc_inner("malloc", size, site)
    }

    /// [`MemoryManager::malloc`] attributed to a foreign return address.
    pub fn malloc_traced(&self, size: usize, return_address: usize) -> MmResult<usize> {
        let site = self.site_if_tracking(CallSite::address(return_address));
        self.malloc_inner("malloc", size, site)
    }

    fn malloc_inner(
        &self,
        symbol: &'static str,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        let Some(selection) = self.selector.resolve(self.context.as_ref()) else {
            return Err(self.unresolved(symbol, size));
        };
        let rule = selection.rule();
        let result = match selection {
            Selection::Task(heap) => heap.allocate_inner(size, site, symbol),
            Selection::Fallback(heap) => heap.allocate_inner(size, site, symbol),
            Selection::Group(_, group) => group.allocate_any(size, site),
        };
        result.map_err(|err| self.note_failure(symbol, err, Some(rule)))
    }

    fn unresolved(&self, symbol: &'static str, size: usize) -> MmError {
        self.record(
            Event::new(LogLevel::Error, symbol, "unresolved_context", "oom").size(size),
        );
        MmError::exhausted(size)
    }

    /// Allocates `n * size` bytes; fails without touching any heap when the
    /// product overflows. The caller zeroes the block.
    #[track_caller]
    pub fn calloc(&self, n: usize, size: usize) -> MmResult<usize> {
        let site = self.site();
        let Some(total) = n.checked_mul(size) else {
            self.record(
                Event::new(LogLevel::Warn, "calloc", "size_overflow", "denied")
                    .details(format!("n={n} size={size}")),
            );
            return Err(MmError::exhausted(usize::MAX));
        };
        self.malloc_inner("calloc", total, site)
    }

    /// Allocation the caller zeroes.
    #[track_caller]
    pub fn zalloc(&self, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.malloc_inner("zalloc", size, site)
    }

    /// Aligned allocation from the heap selected for the current caller.
    #[track_caller]
    pub fn memalign(&self, alignment: usize, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.memalign_inner(alignment, size, site)
    }

    pub fn memalign_traced(
        &self,
        alignment: usize,
        size: usize,
        return_address: usize,
    ) -> MmResult<usize> {
        let site = self.site_if_tracking(CallSite::address(return_address));
        self.memalign_inner(alignment, size, site)
    }

    fn memalign_inner(
        &self,
        alignment: usize,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        let Some(selection) = self.selector.resolve(self.context.as_ref()) else {
            return Err(self.unresolved("memalign", size));
        };
        let rule = selection.rule();
        let result = match selection {
            Selection::Task(heap) => heap.memalign_from(alignment, size, site),
            Selection::Fallback(heap) => heap.memalign_from(alignment, size, site),
            Selection::Group(_, group) => group.memalign_any(alignment, size, site),
        };
        result.map_err(|err| self.note_failure("memalign", err, Some(rule)))
    }

    /// Frees a pointer from any heap this manager owns. Null is a no-op.
    ///
    /// The pointer is routed by address, so memory may be freed from a
    /// different context than the one that allocated it.
    pub fn free(&self, ptr: usize) {
        if ptr == 0 {
            return;
        }
        match self.locate(ptr) {
            Some((heap, _)) => heap.free(ptr),
            None => self.foreign("free", ptr),
        }
    }

    /// [`MemoryManager::free`] reporting contract breaches instead of
    /// asserting.
    pub fn try_free(&self, ptr: usize) -> Result<(), ContractViolation> {
        if ptr == 0 {
            return Ok(());
        }
        match self.locate(ptr) {
            Some((heap, _)) => heap.try_free(ptr),
            None => Err(ContractViolation::ForeignPointer {
                ptr,
                heap: "memory manager",
            }),
        }
    }

    fn foreign(&self, symbol: &'static str, ptr: usize) {
        let violation = ContractViolation::ForeignPointer {
            ptr,
            heap: "memory manager",
        };
        self.record(Event::new(LogLevel::Warn, symbol, violation.event(), "ignored").ptr(ptr));
        if self.config.assert_contract {
            panic!("{symbol}: {violation}");
        }
    }

    /// Owning heap of `ptr` and, for user and kernel heaps, the group it
    /// belongs to.
    fn locate(&self, ptr: usize) -> Option<(Arc<Heap>, Option<&HeapGroup>)> {
        let user = self.selector.user_group();
        if let Some(heap) = user.owner_of(ptr) {
            return Some((Arc::clone(heap), Some(user)));
        }
        if let Some(kernel) = self.selector.kernel_group()
            && let Some(heap) = kernel.owner_of(ptr)
        {
            return Some((Arc::clone(heap), Some(kernel)));
        }
        self.task_heaps
            .lock()
            .iter()
            .find(|t| ptr >= t.start && ptr < t.end)
            .map(|t| (Arc::clone(&t.heap), None))
    }

    /// Resizes an allocation.
    ///
    /// A null `ptr` allocates; a zero `size` frees and returns `Ok(None)`.
    /// When the owning heap cannot serve the new size, the other heaps of its
    /// group are tried. `copy(src, dst, len)` moves the payload whenever the
    /// block changes address. On failure the old block is left untouched.
    #[track_caller]
    pub fn realloc<F>(&self, ptr: usize, size: usize, copy: F) -> MmResult<Option<usize>>
    where
        F: FnMut(usize, usize, usize),
    {
        let site = self.site();
        self.realloc_inner(ptr, size, site, copy)
    }

    pub fn realloc_traced<F>(
        &self,
        ptr: usize,
        size: usize,
        return_address: usize,
        copy: F,
    ) -> MmResult<Option<usize>>
    where
        F: FnMut(usize, usize, usize),
    {
        let site = self.site_if_tracking(CallSite::address(return_address));
        self.realloc_inner(ptr, size, site, copy)
    }

    fn realloc_inner<F>(
        &self,
        ptr: usize,
        size: usize,
        site: Option<CallSite>,
        mut copy: F,
    ) -> MmResult<Option<usize>>
    where
        F: FnMut(usize, usize, usize),
    {
        if ptr == 0 {
            return self.malloc_inner("realloc", size, site).map(Some);
        }
        if size == 0 {
            self.free(ptr);
            return Ok(None);
        }

        let Some((heap, group)) = self.locate(ptr) else {
            self.foreign("realloc", ptr);
            return self.malloc_inner("realloc", size, site).map(Some);
        };

        let err = match heap.realloc_from(ptr, size, site, &mut copy) {
            Ok(new_ptr) => return Ok(Some(new_ptr)),
            Err(err) => err,
        };
        let (Some(group), Some(old_payload)) = (group, heap.usable_size(ptr)) else {
            return Err(self.note_failure("realloc", err, None));
        };

        let new_ptr = group
            .heaps()
            .filter(|other| !Arc::ptr_eq(other, &heap))
            .find_map(|other| other.allocate_inner(size, site, "realloc").ok());
        let Some(new_ptr) = new_ptr else {
            return Err(self.note_failure("realloc", err, None));
        };
        copy(ptr, new_ptr, old_payload.min(size));
        heap.free(ptr);
        self.record(
            Event::new(LogLevel::Debug, "realloc", "moved_across_heaps", "success")
                .ptr(new_ptr)
                .size(size)
                .details(format!("old_ptr={ptr:#x} from={}", heap.label())),
        );
        Ok(Some(new_ptr))
    }

    // --- targeted requests (user group) -------------------------------------

    /// Allocates from user heap `index` only.
    #[track_caller]
    pub fn malloc_at(&self, index: usize, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.selector
            .user_group()
            .allocate_at(index, size, site)
            .map_err(|err| self.note_failure("malloc_at", err, None))
    }

    /// Aligned allocation from user heap `index` only. An out-of-range index
    /// fails before any heap is touched.
    #[track_caller]
    pub fn memalign_at(&self, index: usize, alignment: usize, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.memalign_at_inner(index, alignment, size, site)
    }

    pub fn memalign_at_traced(
        &self,
        index: usize,
        alignment: usize,
        size: usize,
        return_address: usize,
    ) -> MmResult<usize> {
        let site = self.site_if_tracking(CallSite::address(return_address));
        self.memalign_at_inner(index, alignment, size, site)
    }

    fn memalign_at_inner(
        &self,
        index: usize,
        alignment: usize,
        size: usize,
        site: Option<CallSite>,
    ) -> MmResult<usize> {
        self.selector
            .user_group()
            .memalign_at(index, alignment, size, site)
            .map_err(|err| self.note_failure("memalign_at", err, None))
    }

    // --- kernel-side requests -----------------------------------------------

    /// Kernel heap group, or the shared group in a flat build.
    fn kernel_group(&self) -> &HeapGroup {
        self.selector
            .kernel_group()
            .unwrap_or_else(|| self.selector.user_group())
    }

    /// Allocates from the kernel heap group regardless of the caller.
    #[track_caller]
    pub fn kmm_malloc(&self, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.kernel_group()
            .allocate_any(size, site)
            .map_err(|err| self.note_failure("kmm_malloc", err, None))
    }

    #[track_caller]
    pub fn kmm_memalign(&self, alignment: usize, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.kernel_group()
            .memalign_any(alignment, size, site)
            .map_err(|err| self.note_failure("kmm_memalign", err, None))
    }

    pub fn kmm_free(&self, ptr: usize) {
        if let Err(violation) = self.kernel_group().free(ptr) {
            self.foreign("kmm_free", violation.ptr());
        }
    }

    /// Kernel code allocating memory that user code will own: always the
    /// shared user group, whatever the caller's privilege.
    #[track_caller]
    pub fn kumm_malloc(&self, size: usize) -> MmResult<usize> {
        let site = self.site();
        self.selector
            .user_group()
            .allocate_any(size, site)
            .map_err(|err| self.note_failure("kumm_malloc", err, None))
    }

    pub fn kumm_free(&self, ptr: usize) {
        if let Err(violation) = self.selector.user_group().free(ptr) {
            self.foreign("kumm_free", violation.ptr());
        }
    }

    // --- task heaps ---------------------------------------------------------

    /// Builds the private heap of task group `group_id` over a region the
    /// scheduler reserved for it. The scheduler hands the returned heap back
    /// through [`ExecutionContext::task_heap`].
    pub fn create_task_heap(
        &self,
        group_id: usize,
        region: RegionDescriptor,
    ) -> Result<Arc<Heap>, ConfigError> {
        if !self.config.topology.has_task_heaps() {
            return Err(ConfigError::TaskHeapsUnsupported {
                topology: self.config.topology,
            });
        }
        let desc = RegionDescriptor::new(region.start, region.size, 0);
        let region = validate_region(RegionSpace::User, group_id, &desc, 1)?;
        self.registry.check_disjoint(&region)?;

        let mut task_heaps = self.task_heaps.lock();
        if let Some(existing) = task_heaps
            .iter()
            .find(|t| region.start < t.end && t.start < region.end())
        {
            return Err(ConfigError::OverlappingRegions {
                first: existing.start,
                second: region.start,
            });
        }
        let heap = Arc::new(Heap::new(HeapKind::Task, group_id, [&region], &self.config));
        task_heaps.push(TaskHeap {
            start: region.start,
            end: region.end(),
            heap: Arc::clone(&heap),
        });
        drop(task_heaps);

        self.record(
            Event::new(LogLevel::Info, "create_task_heap", "task_heap_created", "success")
                .ptr(region.start)
                .size(region.size)
                .details(format!("group={group_id}")),
        );
        Ok(heap)
    }

    // --- introspection ------------------------------------------------------

    /// Usable payload bytes of a live allocation from any heap.
    #[must_use]
    pub fn usable_size(&self, ptr: usize) -> Option<usize> {
        self.locate(ptr)?.0.usable_size(ptr)
    }

    /// Every heap: user heaps, kernel heaps, then task heaps in creation order.
    #[must_use]
    pub fn heaps(&self) -> Vec<Arc<Heap>> {
        let mut heaps: Vec<Arc<Heap>> = self.selector.user_group().heaps().cloned().collect();
        if let Some(kernel) = self.selector.kernel_group() {
            heaps.extend(kernel.heaps().cloned());
        }
        heaps.extend(self.task_heaps.lock().iter().map(|t| Arc::clone(&t.heap)));
        heaps
    }

    #[must_use]
    pub fn heap_info(&self) -> Vec<HeapInfo> {
        self.heaps().iter().map(|h| h.info()).collect()
    }

    /// Site tables of every heap; empty when tracking is disabled.
    #[must_use]
    pub fn site_reports(&self) -> Vec<SiteReport> {
        self.heaps().iter().filter_map(|h| h.site_report()).collect()
    }

    /// Dispatch-level records (heap records live in each heap's own ring).
    #[must_use]
    pub fn lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.log.lock().records()
    }

    pub fn drain_lifecycle_logs(&self) -> Vec<LifecycleRecord> {
        self.log.lock().drain()
    }
}
