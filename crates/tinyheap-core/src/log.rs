//! Structured lifecycle records.
//!
//! Every heap (and the manager) keeps a bounded ring of machine-readable
//! records describing what it decided and why. Records are diagnostics only;
//! nothing on the allocation path reads them back.

use std::collections::VecDeque;

use serde::Serialize;

/// Record severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// One structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleRecord {
    /// Monotonic decision id within the owning scope.
    pub decision_id: u64,
    /// Correlation id (`tinyheap::<scope>::<symbol>::<id>`).
    pub trace_id: String,
    pub level: LogLevel,
    /// API symbol (`malloc`, `free`, `memalign`, ...).
    pub symbol: &'static str,
    /// Event kind (`alloc`, `free`, `fallback_miss`, ...).
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
    /// Snapshot: live payload bytes of the scope (0 for the manager).
    pub live_bytes: usize,
    /// Snapshot: free payload bytes of the scope (0 for the manager).
    pub free_bytes: usize,
}

/// Event under construction; turned into a record by [`LifecycleLog::push`].
#[derive(Debug, Clone)]
pub(crate) struct Event {
    level: LogLevel,
    symbol: &'static str,
    event: &'static str,
    outcome: &'static str,
    ptr: Option<usize>,
    size: Option<usize>,
    details: String,
}

impl Event {
    pub fn new(
        level: LogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            outcome,
            ptr: None,
            size: None,
            details: String::new(),
        }
    }

    pub fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

/// Bounded ring of lifecycle records.
#[derive(Debug)]
pub struct LifecycleLog {
    scope: String,
    capacity: usize,
    records: VecDeque<LifecycleRecord>,
    next_decision_id: u64,
    evicted: u64,
}

impl LifecycleLog {
    /// Creates a log for `scope` keeping at most `capacity` records.
    #[must_use]
    pub fn new(scope: impl Into<String>, capacity: usize) -> Self {
        Self {
            scope: scope.into(),
            capacity,
            records: VecDeque::with_capacity(capacity.min(64)),
            next_decision_id: 1,
            evicted: 0,
        }
    }

    pub(crate) fn push(&mut self, event: Event, live_bytes: usize, free_bytes: usize) {
        if self.capacity == 0 {
            return;
        }
        let decision_id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        if self.records.len() == self.capacity {
            self.records.pop_front();
            self.evicted += 1;
        }
        self.records.push_back(LifecycleRecord {
            decision_id,
            trace_id: format!(
                "tinyheap::{}::{}::{:016x}",
                self.scope, event.symbol, decision_id
            ),
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            outcome: event.outcome,
            details: event.details,
            live_bytes,
            free_bytes,
        });
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LifecycleRecord> {
        self.records.iter().cloned().collect()
    }

    /// Removes and returns the retained records.
    pub fn drain(&mut self) -> Vec<LifecycleRecord> {
        self.records.drain(..).collect()
    }

    /// Records pushed out of the ring since creation.
    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
