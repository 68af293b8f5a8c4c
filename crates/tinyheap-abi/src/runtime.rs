//! Process-wide manager handle.
//!
//! Exactly one [`MemoryManager`] serves every `tinyheap_*` export. It is
//! installed once, either from Rust with [`install`] or from C with
//! `tinyheap_init`, and never replaced. Exports called before installation
//! fail the way an exhausted allocator does.

use std::ffi::c_int;
use std::sync::OnceLock;

use tinyheap_core::{MemoryManager, RegionDescriptor};

static MANAGER: OnceLock<MemoryManager> = OnceLock::new();

/// C layout of a platform region descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TinyheapRegion {
    pub start: usize,
    pub size: usize,
    pub heap_index: usize,
}

impl From<TinyheapRegion> for RegionDescriptor {
    fn from(region: TinyheapRegion) -> Self {
        RegionDescriptor::new(region.start, region.size, region.heap_index)
    }
}

/// Result codes of `tinyheap_init`.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    Ok = 0,
    AlreadyInitialized = 1,
    InvalidConfig = 2,
    NullRegions = 3,
}

impl From<InitStatus> for c_int {
    fn from(status: InitStatus) -> Self {
        status as c_int
    }
}

/// Installs the process-wide manager. Hands the manager back if one is
/// already installed.
pub fn install(manager: MemoryManager) -> Result<(), MemoryManager> {
    MANAGER.set(manager)
}

/// The installed manager, if any.
#[must_use]
pub fn manager() -> Option<&'static MemoryManager> {
    MANAGER.get()
}
