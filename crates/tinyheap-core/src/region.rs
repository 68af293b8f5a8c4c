//! Region registry.
//!
//! Immutable table of the memory regions handed over by the platform at
//! init, each tagged with its owning heap index. Validation happens once,
//! here; nothing downstream re-checks overlap or index ranges.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::MmConfig;
use crate::error::ConfigError;
use crate::heap::{MIN_BLOCK_SIZE, trim_to_granule};

/// Address space a region (and its heap) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionSpace {
    User,
    Kernel,
}

impl RegionSpace {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Kernel => "kernel",
        }
    }
}

impl fmt::Display for RegionSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw region description supplied by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionDescriptor {
    pub start: usize,
    pub size: usize,
    #[serde(default)]
    pub heap_index: usize,
}

impl RegionDescriptor {
    #[must_use]
    pub const fn new(start: usize, size: usize, heap_index: usize) -> Self {
        Self {
            start,
            size,
            heap_index,
        }
    }
}

/// A validated region owned by exactly one heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: usize,
    pub size: usize,
    pub heap_index: usize,
    pub space: RegionSpace,
}

impl MemoryRegion {
    #[must_use]
    pub const fn new(start: usize, size: usize, heap_index: usize, space: RegionSpace) -> Self {
        Self {
            start,
            size,
            heap_index,
            space,
        }
    }

    /// User-space region owned by heap `heap_index`.
    #[must_use]
    pub const fn user(start: usize, size: usize, heap_index: usize) -> Self {
        Self::new(start, size, heap_index, RegionSpace::User)
    }

    /// One past the last byte. Validated regions never wrap.
    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.size
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Init-time region table.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    user: Vec<MemoryRegion>,
    kernel: Vec<MemoryRegion>,
    user_heap_count: usize,
    kernel_heap_count: usize,
}

impl RegionRegistry {
    /// Validates the platform descriptors against `config`.
    ///
    /// Kernel descriptors are only accepted by topologies with a kernel heap.
    /// An empty kernel list is accepted here; the selector rejects it when
    /// privileged code would have nowhere to allocate.
    pub fn new(
        config: &MmConfig,
        user: &[RegionDescriptor],
        kernel: &[RegionDescriptor],
    ) -> Result<Self, ConfigError> {
        if !config.topology.has_kernel_heap() && !kernel.is_empty() {
            return Err(ConfigError::UnexpectedKernelRegions {
                topology: config.topology,
                count: kernel.len(),
            });
        }

        let user = validate_space(RegionSpace::User, user, config.heap_count, config.max_regions)?;
        let (kernel, kernel_heap_count) = if kernel.is_empty() {
            (Vec::new(), 0)
        } else {
            (
                validate_space(
                    RegionSpace::Kernel,
                    kernel,
                    config.kernel_heap_count,
                    config.max_regions,
                )?,
                config.kernel_heap_count,
            )
        };

        let registry = Self {
            user,
            kernel,
            user_heap_count: config.heap_count,
            kernel_heap_count,
        };
        registry.check_no_overlap()?;
        Ok(registry)
    }

    fn check_no_overlap(&self) -> Result<(), ConfigError> {
        let mut all: Vec<&MemoryRegion> = self.user.iter().chain(self.kernel.iter()).collect();
        all.sort_by_key(|r| r.start);
        for pair in all.windows(2) {
            if pair[0].overlaps(pair[1]) {
                return Err(ConfigError::OverlappingRegions {
                    first: pair[0].start,
                    second: pair[1].start,
                });
            }
        }
        Ok(())
    }

    /// Rejects `region` if it overlaps any registered region.
    pub fn check_disjoint(&self, region: &MemoryRegion) -> Result<(), ConfigError> {
        match self.iter().find(|r| r.overlaps(region)) {
            Some(existing) => Err(ConfigError::OverlappingRegions {
                first: existing.start,
                second: region.start,
            }),
            None => Ok(()),
        }
    }

    #[must_use]
    pub fn user_regions(&self) -> &[MemoryRegion] {
        &self.user
    }

    #[must_use]
    pub fn kernel_regions(&self) -> &[MemoryRegion] {
        &self.kernel
    }

    /// Number of heaps configured for `space` (0 when the space has no regions).
    #[must_use]
    pub fn heap_count(&self, space: RegionSpace) -> usize {
        match space {
            RegionSpace::User => self.user_heap_count,
            RegionSpace::Kernel => self.kernel_heap_count,
        }
    }

    /// Regions owned by heap `heap_index` of `space`, in platform order.
    pub fn regions_for(
        &self,
        space: RegionSpace,
        heap_index: usize,
    ) -> impl Iterator<Item = &MemoryRegion> + '_ {
        let regions = match space {
            RegionSpace::User => &self.user,
            RegionSpace::Kernel => &self.kernel,
        };
        regions.iter().filter(move |r| r.heap_index == heap_index)
    }

    /// Region containing `addr`, if any.
    #[must_use]
    pub fn owner_of(&self, addr: usize) -> Option<&MemoryRegion> {
        self.iter().find(|r| r.contains(addr))
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> + '_ {
        self.user.iter().chain(self.kernel.iter())
    }
}

fn validate_space(
    space: RegionSpace,
    descriptors: &[RegionDescriptor],
    heap_count: usize,
    max_regions: usize,
) -> Result<Vec<MemoryRegion>, ConfigError> {
    if heap_count == 0 {
        return Err(ConfigError::NoHeaps { space });
    }
    if descriptors.len() > max_regions {
        return Err(ConfigError::TooManyRegions {
            space,
            count: descriptors.len(),
            max: max_regions,
        });
    }

    let mut regions = Vec::with_capacity(descriptors.len());
    for (position, desc) in descriptors.iter().enumerate() {
        regions.push(validate_region(space, position, desc, heap_count)?);
    }

    for heap_index in 0..heap_count {
        if !regions.iter().any(|r| r.heap_index == heap_index) {
            return Err(ConfigError::HeapWithoutRegion { space, heap_index });
        }
    }
    Ok(regions)
}

/// Checks one descriptor in isolation (size, wrap, usable bytes, heap index).
pub(crate) fn validate_region(
    space: RegionSpace,
    position: usize,
    desc: &RegionDescriptor,
    heap_count: usize,
) -> Result<MemoryRegion, ConfigError> {
    if desc.size == 0 {
        return Err(ConfigError::EmptyRegion { space, position });
    }
    if desc.start.checked_add(desc.size).is_none() {
        return Err(ConfigError::RegionOverflow {
            space,
            position,
            start: desc.start,
        });
    }
    let usable = trim_to_granule(desc.start, desc.size).map_or(0, |(_, size)| size);
    if usable < MIN_BLOCK_SIZE {
        return Err(ConfigError::RegionTooSmall {
            space,
            position,
            usable,
        });
    }
    if desc.heap_index >= heap_count {
        return Err(ConfigError::HeapIndexOutOfRange {
            space,
            position,
            heap_index: desc.heap_index,
            heap_count,
        });
    }
    Ok(MemoryRegion::new(desc.start, desc.size, desc.heap_index, space))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Topology;

    fn desc(start: usize, size: usize, heap: usize) -> RegionDescriptor {
        RegionDescriptor::new(start, size, heap)
    }

    #[test]
    fn accepts_disjoint_regions_and_groups_them_by_heap() {
        let config = MmConfig::flat(2);
        let registry = RegionRegistry::new(
            &config,
            &[desc(0x1000, 0x100, 0), desc(0x2000, 0x100, 1), desc(0x3000, 0x80, 0)],
            &[],
        )
        .expect("valid table");

        let heap0: Vec<usize> = registry
            .regions_for(RegionSpace::User, 0)
            .map(|r| r.start)
            .collect();
        assert_eq!(heap0, vec![0x1000, 0x3000]);
        assert_eq!(registry.heap_count(RegionSpace::User), 2);
        assert_eq!(registry.heap_count(RegionSpace::Kernel), 0);
        assert_eq!(registry.owner_of(0x2010).map(|r| r.heap_index), Some(1));
        assert!(registry.owner_of(0x2100).is_none());
    }

    #[test]
    fn rejects_overlap_across_spaces() {
        let config = MmConfig::privilege_separated(1, 1);
        let err = RegionRegistry::new(&config, &[desc(0x1000, 0x100, 0)], &[desc(0x10f0, 0x100, 0)])
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::OverlappingRegions {
                first: 0x1000,
                second: 0x10f0
            }
        );
    }

    #[test]
    fn adjacent_regions_do_not_overlap() {
        let config = MmConfig::flat(1);
        assert!(
            RegionRegistry::new(&config, &[desc(0x1000, 0x100, 0), desc(0x1100, 0x100, 0)], &[])
                .is_ok()
        );
    }

    #[test]
    fn rejects_malformed_descriptors() {
        let config = MmConfig::flat(1);
        assert_eq!(
            RegionRegistry::new(&config, &[desc(0x1000, 0, 0)], &[]).unwrap_err(),
            ConfigError::EmptyRegion {
                space: RegionSpace::User,
                position: 0
            }
        );
        assert!(matches!(
            RegionRegistry::new(&config, &[desc(usize::MAX - 8, 64, 0)], &[]).unwrap_err(),
            ConfigError::RegionOverflow { .. }
        ));
        assert!(matches!(
            RegionRegistry::new(&config, &[desc(0x1001, 32, 0)], &[]).unwrap_err(),
            ConfigError::RegionTooSmall { usable: 24, .. }
        ));
        assert!(matches!(
            RegionRegistry::new(&config, &[desc(0x1000, 64, 3)], &[]).unwrap_err(),
            ConfigError::HeapIndexOutOfRange { heap_index: 3, .. }
        ));
    }

    #[test]
    fn every_heap_needs_a_region() {
        let config = MmConfig::flat(2);
        assert_eq!(
            RegionRegistry::new(&config, &[desc(0x1000, 64, 0)], &[]).unwrap_err(),
            ConfigError::HeapWithoutRegion {
                space: RegionSpace::User,
                heap_index: 1
            }
        );
        assert_eq!(
            RegionRegistry::new(&MmConfig::flat(0), &[], &[]).unwrap_err(),
            ConfigError::NoHeaps {
                space: RegionSpace::User
            }
        );
    }

    #[test]
    fn region_count_is_bounded() {
        let config = MmConfig {
            max_regions: 2,
            ..MmConfig::flat(1)
        };
        let table = [desc(0x1000, 64, 0), desc(0x2000, 64, 0), desc(0x3000, 64, 0)];
        assert_eq!(
            RegionRegistry::new(&config, &table, &[]).unwrap_err(),
            ConfigError::TooManyRegions {
                space: RegionSpace::User,
                count: 3,
                max: 2
            }
        );
    }

    #[test]
    fn flat_topology_refuses_kernel_regions() {
        let config = MmConfig::flat(1);
        assert_eq!(
            RegionRegistry::new(&config, &[desc(0x1000, 64, 0)], &[desc(0x8000, 64, 0)])
                .unwrap_err(),
            ConfigError::UnexpectedKernelRegions {
                topology: Topology::Flat,
                count: 1
            }
        );
    }

    #[test]
    fn check_disjoint_spots_collisions() {
        let config = MmConfig::isolated(1, 1);
        let registry =
            RegionRegistry::new(&config, &[desc(0x1000, 0x100, 0)], &[desc(0x8000, 0x100, 0)])
                .expect("valid table");
        assert!(registry.check_disjoint(&MemoryRegion::user(0x4000, 0x100, 0)).is_ok());
        assert!(registry.check_disjoint(&MemoryRegion::user(0x80f0, 0x100, 0)).is_err());
    }

    #[test]
    fn descriptors_load_from_json() {
        let table: Vec<RegionDescriptor> =
            serde_json::from_str(r#"[{"start":4096,"size":256},{"start":8192,"size":128,"heap_index":1}]"#)
                .expect("valid json");
        assert_eq!(table[0], desc(4096, 256, 0));
        assert_eq!(table[1], desc(8192, 128, 1));
    }
}
