//! Error taxonomy.
//!
//! Allocation calls fail with [`MmError`] and never panic. Configuration
//! problems surface as [`ConfigError`] while the manager is being built, so a
//! bad platform table halts boot before any task runs. Caller contract
//! breaches are described by [`ContractViolation`].

use thiserror::Error;

use crate::config::Topology;
use crate::region::RegionSpace;

/// Failure of a single allocation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MmError {
    /// No eligible heap had a free block large enough.
    #[error("no eligible heap can satisfy a request of {requested} bytes")]
    ResourceExhausted { requested: usize },
    /// An explicit target heap index was outside the configured range.
    #[error("heap index {index} is out of range (heap count {count})")]
    InvalidHeapIndex { index: usize, count: usize },
}

impl MmError {
    pub(crate) const fn exhausted(requested: usize) -> Self {
        Self::ResourceExhausted { requested }
    }

    /// Machine-readable outcome label used in lifecycle records.
    #[must_use]
    pub const fn outcome(&self) -> &'static str {
        match self {
            Self::ResourceExhausted { .. } => "oom",
            Self::InvalidHeapIndex { .. } => "invalid_heap_index",
        }
    }
}

pub type MmResult<T> = Result<T, MmError>;

/// Inconsistent platform or build configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{space} heap count must be at least one")]
    NoHeaps { space: RegionSpace },
    #[error("{count} {space} regions exceed the configured maximum of {max}")]
    TooManyRegions {
        space: RegionSpace,
        count: usize,
        max: usize,
    },
    #[error("{space} region {position} has zero size")]
    EmptyRegion { space: RegionSpace, position: usize },
    #[error("{space} region {position} at {start:#x} wraps the address space")]
    RegionOverflow {
        space: RegionSpace,
        position: usize,
        start: usize,
    },
    #[error("{space} region {position} leaves {usable} usable bytes, less than one block")]
    RegionTooSmall {
        space: RegionSpace,
        position: usize,
        usable: usize,
    },
    #[error(
        "{space} region {position} names heap {heap_index}, but only {heap_count} heaps are configured"
    )]
    HeapIndexOutOfRange {
        space: RegionSpace,
        position: usize,
        heap_index: usize,
        heap_count: usize,
    },
    #[error("{space} heap {heap_index} owns no region")]
    HeapWithoutRegion {
        space: RegionSpace,
        heap_index: usize,
    },
    #[error("regions at {first:#x} and {second:#x} overlap")]
    OverlappingRegions { first: usize, second: usize },
    #[error("topology {topology} does not use kernel regions, {count} supplied")]
    UnexpectedKernelRegions { topology: Topology, count: usize },
    #[error("app fallback heap {index} is out of range (user heap count {count})")]
    FallbackOutOfRange { index: usize, count: usize },
    #[error("topology {topology} cannot resolve a heap for {context}")]
    UnresolvedContext {
        topology: Topology,
        context: &'static str,
    },
    #[error("topology {topology} has no per-task heaps")]
    TaskHeapsUnsupported { topology: Topology },
}

/// Breach of the free/realloc caller contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContractViolation {
    /// Pointer inside the heap that is not a live allocation (double free or
    /// interior pointer).
    #[error("{ptr:#x} is not a live allocation of {heap}")]
    NotLive { ptr: usize, heap: &'static str },
    /// Pointer outside every region the heap (or manager) knows about.
    #[error("{ptr:#x} does not belong to {heap}")]
    ForeignPointer { ptr: usize, heap: &'static str },
}

impl ContractViolation {
    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::NotLive { .. } => "double_free_detected",
            Self::ForeignPointer { .. } => "foreign_free_pointer",
        }
    }

    #[must_use]
    pub const fn ptr(&self) -> usize {
        match self {
            Self::NotLive { ptr, .. } | Self::ForeignPointer { ptr, .. } => *ptr,
        }
    }
}
