//! Build-time configuration.
//!
//! On target the values come from the board configuration; on the host they
//! can be deserialized from a platform description or overridden from the
//! environment:
//! - `TINYHEAP_TOPOLOGY`: `flat`, `protected`/`privilege-separated` or
//!   `kernel`/`isolated`.
//! - `TINYHEAP_TRACK_SITES`: `1`/`true`/`on` enables allocation-site tracking.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deployment topology, selected once at init.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topology {
    /// One shared heap group for every caller.
    #[default]
    Flat,
    /// Separate user and kernel heap groups; unprivileged code never reaches
    /// the kernel group.
    PrivilegeSeparated,
    /// Kernel heap group plus one private heap per task group.
    Isolated,
}

impl Topology {
    /// Parse from string (case-insensitive). Unknown values fall back to `Flat`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "protected" | "privilege-separated" | "privilege_separated" | "split" => {
                Self::PrivilegeSeparated
            }
            "kernel" | "isolated" | "addrenv" => Self::Isolated,
            _ => Self::Flat,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Flat => "flat",
            Self::PrivilegeSeparated => "privilege-separated",
            Self::Isolated => "isolated",
        }
    }

    /// Whether privileged code gets its own heap group.
    #[must_use]
    pub const fn has_kernel_heap(self) -> bool {
        !matches!(self, Self::Flat)
    }

    #[must_use]
    pub const fn has_task_heaps(self) -> bool {
        matches!(self, Self::Isolated)
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heap manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmConfig {
    pub topology: Topology,
    /// Number of user heaps (user region heap indices live in `[0, heap_count)`).
    pub heap_count: usize,
    /// Number of kernel heaps; ignored by the flat topology.
    pub kernel_heap_count: usize,
    /// Maximum number of regions per address space.
    pub max_regions: usize,
    /// App-binary separation: user heap used for every implicit request that
    /// is not served by a task heap.
    pub app_fallback_heap: Option<usize>,
    /// Record the call site of every live allocation.
    pub track_sites: bool,
    /// Bound of each heap's call-site table.
    pub site_table_capacity: usize,
    /// Bound of each lifecycle log ring; 0 disables lifecycle logging.
    pub lifecycle_log_capacity: usize,
    /// Panic on double/foreign frees instead of logging and ignoring them.
    pub assert_contract: bool,
}

impl Default for MmConfig {
    fn default() -> Self {
        Self {
            topology: Topology::Flat,
            heap_count: 1,
            kernel_heap_count: 1,
            max_regions: 8,
            app_fallback_heap: None,
            track_sites: false,
            site_table_capacity: 256,
            lifecycle_log_capacity: 512,
            assert_contract: cfg!(debug_assertions),
        }
    }
}

impl MmConfig {
    /// Flat build with `heap_count` user heaps.
    #[must_use]
    pub fn flat(heap_count: usize) -> Self {
        Self {
            heap_count,
            ..Self::default()
        }
    }

    /// Privilege-separated build.
    #[must_use]
    pub fn privilege_separated(heap_count: usize, kernel_heap_count: usize) -> Self {
        Self {
            topology: Topology::PrivilegeSeparated,
            heap_count,
            kernel_heap_count,
            ..Self::default()
        }
    }

    /// Isolation-capable build.
    #[must_use]
    pub fn isolated(heap_count: usize, kernel_heap_count: usize) -> Self {
        Self {
            topology: Topology::Isolated,
            heap_count,
            kernel_heap_count,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_site_tracking(mut self, enabled: bool) -> Self {
        self.track_sites = enabled;
        self
    }

    #[must_use]
    pub fn with_app_fallback(mut self, heap_index: usize) -> Self {
        self.app_fallback_heap = Some(heap_index);
        self
    }

    #[must_use]
    pub fn with_contract_assertions(mut self, enabled: bool) -> Self {
        self.assert_contract = enabled;
        self
    }

    /// Applies `TINYHEAP_TOPOLOGY` / `TINYHEAP_TRACK_SITES` when set.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(
            std::env::var("TINYHEAP_TOPOLOGY").ok().as_deref(),
            std::env::var("TINYHEAP_TRACK_SITES").ok().as_deref(),
        )
    }

    fn with_overrides(mut self, topology: Option<&str>, track_sites: Option<&str>) -> Self {
        if let Some(raw) = topology {
            self.topology = Topology::from_str_loose(raw);
        }
        if let Some(raw) = track_sites {
            self.track_sites = parse_flag(raw);
        }
        self
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "on" | "yes" | "enabled"
    )
}
