//! Lock-protected heap state.
//!
//! Blocks are kept in an address-ordered map that tiles every region without
//! gaps; free blocks are additionally indexed by `(size, start)` for
//! best-fit lookup. Free blocks are merged eagerly, so two free blocks of the
//! same region are never adjacent.

use std::collections::{BTreeMap, BTreeSet};

use super::block::{BLOCK_OVERHEAD, Block, BlockView, MIN_BLOCK_SIZE};
use crate::log::{Event, LifecycleLog};
use crate::tracker::SiteTracker;

#[derive(Debug)]
pub(crate) struct HeapState {
    blocks: BTreeMap<usize, Block>,
    free_index: BTreeSet<(usize, usize)>,
    live_bytes: usize,
    free_bytes: usize,
    live_allocations: usize,
    peak_live_bytes: usize,
    failed_allocations: u64,
    pub sites: Option<SiteTracker>,
    pub log: LifecycleLog,
}

impl HeapState {
    /// `regions` must already be trimmed to the granule and hold at least one
    /// minimum block each.
    pub fn new(regions: &[(usize, usize)], sites: Option<SiteTracker>, log: LifecycleLog) -> Self {
        let mut state = Self {
            blocks: BTreeMap::new(),
            free_index: BTreeSet::new(),
            live_bytes: 0,
            free_bytes: 0,
            live_allocations: 0,
            peak_live_bytes: 0,
            failed_allocations: 0,
            sites,
            log,
        };
        for (position, &(start, size)) in regions.iter().enumerate() {
            state.add_block(Block::free(start, size, position));
        }
        state
    }

    fn add_block(&mut self, block: Block) {
        let payload = block.payload_size();
        if block.in_use {
            self.live_bytes += payload;
            self.live_allocations += 1;
            self.peak_live_bytes = self.peak_live_bytes.max(self.live_bytes);
        } else {
            self.free_bytes += payload;
            self.free_index.insert((block.size, block.start));
        }
        self.blocks.insert(block.start, block);
    }

    fn remove_block(&mut self, start: usize) -> Option<Block> {
        let block = self.blocks.remove(&start)?;
        let payload = block.payload_size();
        if block.in_use {
            self.live_bytes -= payload;
            self.live_allocations -= 1;
        } else {
            self.free_bytes -= payload;
            self.free_index.remove(&(block.size, block.start));
        }
        Some(block)
    }

    /// Inserts a free span and merges it with free neighbours of the same
    /// region. At most two merges happen per call.
    fn insert_free(&mut self, start: usize, size: usize, region: usize) {
        let mut start = start;
        let mut size = size;

        let prev = self.blocks.range(..start).next_back().map(|(_, b)| *b);
        if let Some(prev) = prev
            && !prev.in_use
            && prev.region == region
            && prev.end() == start
        {
            self.remove_block(prev.start);
            start = prev.start;
            size += prev.size;
        }

        let next = self.blocks.get(&(start + size)).copied();
        if let Some(next) = next
            && !next.in_use
            && next.region == region
        {
            self.remove_block(next.start);
            size += next.size;
        }

        self.add_block(Block::free(start, size, region));
    }

    /// Best fit: smallest free block of at least `total` bytes, lowest
    /// address on ties. Splits off the remainder when it can stand alone.
    pub fn take(&mut self, total: usize, requested: usize) -> Option<Block> {
        let &(size, start) = self.free_index.range((total, 0)..).next()?;
        let block = self.remove_block(start)?;
        let used = if size - total >= MIN_BLOCK_SIZE {
            // The successor of a free block is never free, so the remainder
            // needs no merging.
            self.add_block(Block::free(start + total, size - total, block.region));
            Block::used(start, total, block.region, requested)
        } else {
            Block::used(start, size, block.region, requested)
        };
        self.add_block(used);
        Some(used)
    }

    pub fn live_block(&self, ptr: usize) -> Option<Block> {
        let start = ptr.checked_sub(BLOCK_OVERHEAD)?;
        self.blocks.get(&start).filter(|b| b.in_use).copied()
    }

    /// Frees the live block whose payload starts at `ptr`.
    pub fn release(&mut self, ptr: usize) -> Option<Block> {
        let block = self.live_block(ptr)?;
        self.remove_block(block.start);
        self.insert_free(block.start, block.size, block.region);
        if let Some(sites) = self.sites.as_mut() {
            sites.forget(ptr);
        }
        Some(block)
    }

    /// Cuts the leading `new_ptr - ptr` bytes off a live block and frees them.
    pub fn split_front(&mut self, ptr: usize, new_ptr: usize) -> bool {
        let Some(block) = self.live_block(ptr) else {
            return false;
        };
        let Some(gap) = new_ptr.checked_sub(ptr) else {
            return false;
        };
        if gap < MIN_BLOCK_SIZE || gap + MIN_BLOCK_SIZE > block.size {
            return false;
        }
        self.remove_block(block.start);
        let kept = Block::used(
            block.start + gap,
            block.size - gap,
            block.region,
            block.requested,
        );
        self.add_block(kept);
        self.insert_free(block.start, gap, block.region);
        if let Some(sites) = self.sites.as_mut() {
            sites.relocate(ptr, new_ptr, block.requested);
        }
        true
    }

    /// Shrinks a live block to `keep` total bytes when the tail can stand
    /// alone. Returns the number of bytes given back.
    pub fn split_tail(&mut self, ptr: usize, keep: usize) -> usize {
        let Some(block) = self.live_block(ptr) else {
            return 0;
        };
        if block.size < keep + MIN_BLOCK_SIZE {
            return 0;
        }
        self.remove_block(block.start);
        self.add_block(Block::used(
            block.start,
            keep,
            block.region,
            block.requested,
        ));
        self.insert_free(block.start + keep, block.size - keep, block.region);
        block.size - keep
    }

    /// Extends a live block into a free successor of the same region.
    pub fn grow(&mut self, ptr: usize, total: usize, requested: usize) -> bool {
        let Some(block) = self.live_block(ptr) else {
            return false;
        };
        let Some(next) = self.blocks.get(&block.end()).copied() else {
            return false;
        };
        if next.in_use || next.region != block.region || block.size + next.size < total {
            return false;
        }
        self.remove_block(block.start);
        self.remove_block(next.start);
        let combined = block.size + next.size;
        if combined - total >= MIN_BLOCK_SIZE {
            self.add_block(Block::used(block.start, total, block.region, requested));
            self.add_block(Block::free(
                block.start + total,
                combined - total,
                block.region,
            ));
        } else {
            self.add_block(Block::used(block.start, combined, block.region, requested));
        }
        true
    }

    pub fn set_requested(&mut self, ptr: usize, requested: usize) {
        if let Some(start) = ptr.checked_sub(BLOCK_OVERHEAD)
            && let Some(block) = self.blocks.get_mut(&start)
            && block.in_use
        {
            block.requested = requested;
        }
    }

    pub fn note_failure(&mut self) {
        self.failed_allocations += 1;
    }

    pub fn log(&mut self, event: Event) {
        let (live, free) = (self.live_bytes, self.free_bytes);
        self.log.push(event, live, free);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn free_block_count(&self) -> usize {
        self.free_index.len()
    }

    pub fn live_allocations(&self) -> usize {
        self.live_allocations
    }

    pub fn peak_live_bytes(&self) -> usize {
        self.peak_live_bytes
    }

    pub fn failed_allocations(&self) -> u64 {
        self.failed_allocations
    }

    /// Payload bytes of the largest free block.
    pub fn largest_free(&self) -> usize {
        self.free_index
            .iter()
            .next_back()
            .map_or(0, |&(size, _)| size - BLOCK_OVERHEAD)
    }

    pub fn layout(&self) -> Vec<BlockView> {
        self.blocks.values().map(BlockView::from).collect()
    }
}
