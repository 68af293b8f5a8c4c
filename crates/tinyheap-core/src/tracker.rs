//! Allocation-site tracking.
//!
//! A bounded table attributing each live allocation to the code that asked
//! for it. The site is captured where the request is made (`#[track_caller]`
//! in Rust, an explicit return address across the C ABI), never inside the
//! allocator. The table is purely additive: allocation decisions never
//! consult it.

use std::collections::HashMap;
use std::fmt;
use std::panic::Location;

use serde::Serialize;

/// Where an allocation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSite {
    /// Raw return address supplied by a foreign caller.
    Address(usize),
    /// Rust source location captured with `#[track_caller]`.
    Source(&'static Location<'static>),
}

impl CallSite {
    /// Location of the (track_caller-transparent) caller.
    #[track_caller]
    #[must_use]
    pub fn caller() -> Self {
        Self::Source(Location::caller())
    }

    #[must_use]
    pub const fn address(addr: usize) -> Self {
        Self::Address(addr)
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{addr:#x}"),
            Self::Source(loc) => write!(f, "{}:{}:{}", loc.file(), loc.line(), loc.column()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SiteRecord {
    site: CallSite,
    size: usize,
}

/// One live allocation and its site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteEntry {
    pub ptr: usize,
    pub size: usize,
    pub site: String,
}

/// Introspection snapshot of one heap's site table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SiteReport {
    pub heap: String,
    /// Live allocations, ordered by address.
    pub entries: Vec<SiteEntry>,
    /// Allocations that found the table full.
    pub dropped: u64,
}

/// Bounded per-heap site table keyed by payload address.
#[derive(Debug)]
pub struct SiteTracker {
    capacity: usize,
    entries: HashMap<usize, SiteRecord>,
    dropped: u64,
}

impl SiteTracker {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            dropped: 0,
        }
    }

    pub fn record(&mut self, ptr: usize, size: usize, site: CallSite) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&ptr) {
            self.dropped += 1;
            return;
        }
        self.entries.insert(ptr, SiteRecord { site, size });
    }

    pub fn forget(&mut self, ptr: usize) {
        self.entries.remove(&ptr);
    }

    /// Moves the entry for `from` to `to` (aligned allocations shift their
    /// payload after the site was recorded).
    pub fn relocate(&mut self, from: usize, to: usize, size: usize) {
        if let Some(mut record) = self.entries.remove(&from) {
            record.size = size;
            self.entries.insert(to, record);
        }
    }

    pub fn resize(&mut self, ptr: usize, size: usize) {
        if let Some(record) = self.entries.get_mut(&ptr) {
            record.size = size;
        }
    }

    #[must_use]
    pub fn site_of(&self, ptr: usize) -> Option<CallSite> {
        self.entries.get(&ptr).map(|r| r.site)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn report(&self, heap: impl Into<String>) -> SiteReport {
        let mut entries: Vec<SiteEntry> = self
            .entries
            .iter()
            .map(|(&ptr, record)| SiteEntry {
                ptr,
                size: record.size,
                site: record.site.to_string(),
            })
            .collect();
        entries.sort_by_key(|e| e.ptr);
        SiteReport {
            heap: heap.into(),
            entries,
            dropped: self.dropped,
        }
    }
}
