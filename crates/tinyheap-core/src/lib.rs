//! # tinyheap-core
//!
//! Dynamic-memory manager of an embedded RTOS, in safe Rust.
//!
//! A statically described set of memory regions becomes one or more
//! independently locked heaps. Requests are routed by deployment topology
//! (flat, privilege-separated, isolated) and execution context, with a
//! deterministic lowest-index-first fallback across heap groups and aligned
//! allocation layered on the plain allocator.
//!
//! ```text
//! caller -> MemoryManager -> HeapSelector | HeapGroup -> Heap (memalign) -> HeapState
//! ```
//!
//! Heaps hand out addresses and keep their bookkeeping out of band; the
//! managed memory itself is never read or written. No `unsafe` code is
//! permitted at the crate level.

#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod heap;
pub mod log;
pub mod manager;
mod memalign;
pub mod multi;
pub mod region;
pub mod selector;
pub mod tracker;

pub use config::{MmConfig, Topology};
pub use error::{ConfigError, ContractViolation, MmError, MmResult};
pub use heap::{Heap, HeapInfo, HeapKind};
pub use log::{LifecycleRecord, LogLevel};
pub use manager::MemoryManager;
pub use multi::HeapGroup;
pub use region::{MemoryRegion, RegionDescriptor, RegionRegistry, RegionSpace};
pub use selector::{ExecutionContext, HeapSelector, HostContext, Selection, SelectionRule};
pub use tracker::{CallSite, SiteReport};
