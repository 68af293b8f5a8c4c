//! Heap selection for implicit ("current context") requests.
//!
//! The topology is fixed when the selector is built; the caller's context is
//! asked again on every call because the running task changes between calls.
//! Every topology is probed with a privileged and an unprivileged context at
//! construction, so a table that leaves some caller without a heap fails init
//! instead of a later allocation.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::Topology;
use crate::error::ConfigError;
use crate::heap::Heap;
use crate::multi::HeapGroup;

/// What the scheduler knows about the current caller.
pub trait ExecutionContext: Send + Sync {
    /// Whether the caller runs with kernel privileges.
    fn is_privileged(&self) -> bool;

    /// Private heap of the caller's task group, if it has one.
    fn task_heap(&self) -> Option<Arc<Heap>>;
}

/// Mutable context for host builds and tests: whatever was last set is what
/// every caller appears to be.
#[derive(Debug, Default)]
pub struct HostContext {
    privileged: RwLock<bool>,
    task_heap: RwLock<Option<Arc<Heap>>>,
}

impl HostContext {
    #[must_use]
    pub fn unprivileged() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn privileged() -> Self {
        let ctx = Self::default();
        ctx.set_privileged(true);
        ctx
    }

    pub fn set_privileged(&self, privileged: bool) {
        *self.privileged.write() = privileged;
    }

    pub fn set_task_heap(&self, heap: Option<Arc<Heap>>) {
        *self.task_heap.write() = heap;
    }
}

impl ExecutionContext for HostContext {
    fn is_privileged(&self) -> bool {
        *self.privileged.read()
    }

    fn task_heap(&self) -> Option<Arc<Heap>> {
        self.task_heap.read().clone()
    }
}

/// Context used to probe a configuration at init.
struct Probe {
    privileged: bool,
}

impl ExecutionContext for Probe {
    fn is_privileged(&self) -> bool {
        self.privileged
    }

    fn task_heap(&self) -> Option<Arc<Heap>> {
        None
    }
}

/// Which precedence rule produced a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionRule {
    TaskHeap,
    AppFallback,
    KernelGroup,
    SharedGroup,
}

impl SelectionRule {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TaskHeap => "task_heap",
            Self::AppFallback => "app_fallback",
            Self::KernelGroup => "kernel_group",
            Self::SharedGroup => "shared_group",
        }
    }
}

impl fmt::Display for SelectionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved target of an implicit request.
#[derive(Debug)]
pub enum Selection<'a> {
    /// The caller's private task heap.
    Task(Arc<Heap>),
    /// The configured app-binary fallback heap.
    Fallback(&'a Arc<Heap>),
    /// A heap group served with lowest-index-first fallback.
    Group(SelectionRule, &'a HeapGroup),
}

impl Selection<'_> {
    #[must_use]
    pub fn rule(&self) -> SelectionRule {
        match self {
            Self::Task(_) => SelectionRule::TaskHeap,
            Self::Fallback(_) => SelectionRule::AppFallback,
            Self::Group(rule, _) => *rule,
        }
    }
}

#[derive(Debug)]
pub struct HeapSelector {
    topology: Topology,
    user: HeapGroup,
    kernel: Option<HeapGroup>,
    fallback: Option<Arc<Heap>>,
}

impl HeapSelector {
    /// Builds and validates a selector.
    ///
    /// `fallback` is an index into the user group.
    pub fn new(
        topology: Topology,
        user: HeapGroup,
        kernel: Option<HeapGroup>,
        fallback: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let fallback = match fallback {
            Some(index) => Some(user.heap(index).cloned().ok_or(
                ConfigError::FallbackOutOfRange {
                    index,
                    count: user.len(),
                },
            )?),
            None => None,
        };
        let kernel = kernel.filter(|group| !group.is_empty());
        let selector = Self {
            topology,
            user,
            kernel,
            fallback,
        };

        for (privileged, context) in [(true, "privileged code"), (false, "unprivileged code")] {
            if selector.resolve(&Probe { privileged }).is_none() {
                return Err(ConfigError::UnresolvedContext { topology, context });
            }
        }
        Ok(selector)
    }

    /// Applies the precedence rules to `ctx`.
    ///
    /// Returns `None` only for configurations rejected by [`HeapSelector::new`].
    pub fn resolve(&self, ctx: &dyn ExecutionContext) -> Option<Selection<'_>> {
        let privileged = ctx.is_privileged();
        if self.topology.has_task_heaps()
            && !privileged
            && let Some(heap) = ctx.task_heap()
        {
            return Some(Selection::Task(heap));
        }
        if let Some(heap) = &self.fallback {
            return Some(Selection::Fallback(heap));
        }
        if privileged && self.topology.has_kernel_heap() {
            return self
                .kernel
                .as_ref()
                .map(|group| Selection::Group(SelectionRule::KernelGroup, group));
        }
        (!self.user.is_empty()).then_some(Selection::Group(SelectionRule::SharedGroup, &self.user))
    }

    #[must_use]
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// The shared user heap group.
    #[must_use]
    pub fn user_group(&self) -> &HeapGroup {
        &self.user
    }

    #[must_use]
    pub fn kernel_group(&self) -> Option<&HeapGroup> {
        self.kernel.as_ref()
    }
}
