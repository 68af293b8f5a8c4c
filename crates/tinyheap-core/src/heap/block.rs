//! Block layout.
//!
//! Bookkeeping lives outside the managed memory, but addresses are laid out
//! as in a boundary-tag heap: every block reserves a fixed header in front of
//! its payload, and block sizes move in `MIN_ALIGN` granules.

/// Minimum natural alignment of every payload address.
pub const MIN_ALIGN: usize = 8;

/// Fixed per-block overhead (the logical header in front of each payload).
pub const BLOCK_OVERHEAD: usize = 16;

/// Smallest block that can exist on its own, header included.
pub const MIN_BLOCK_SIZE: usize = 32;

/// Smallest payload handed out for any request.
pub const MIN_PAYLOAD: usize = MIN_BLOCK_SIZE - BLOCK_OVERHEAD;

/// One contiguous block inside a heap region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Block {
    /// Address of the logical header.
    pub start: usize,
    /// Total size, header included.
    pub size: usize,
    /// Position of the owning region in the heap's region list.
    pub region: usize,
    pub in_use: bool,
    /// Bytes the caller asked for (0 for free blocks).
    pub requested: usize,
}

impl Block {
    pub fn free(start: usize, size: usize, region: usize) -> Self {
        Self {
            start,
            size,
            region,
            in_use: false,
            requested: 0,
        }
    }

    pub fn used(start: usize, size: usize, region: usize, requested: usize) -> Self {
        Self {
            start,
            size,
            region,
            in_use: true,
            requested,
        }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn payload(&self) -> usize {
        self.start + BLOCK_OVERHEAD
    }

    pub fn payload_size(&self) -> usize {
        self.size - BLOCK_OVERHEAD
    }
}

/// Public, copyable view of a block for introspection and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BlockView {
    pub start: usize,
    pub size: usize,
    pub in_use: bool,
}

impl From<&Block> for BlockView {
    fn from(block: &Block) -> Self {
        Self {
            start: block.start,
            size: block.size,
            in_use: block.in_use,
        }
    }
}

/// Rounds `value` up to a multiple of the power-of-two `align`.
#[must_use]
pub fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Rounds `value` down to a multiple of the power-of-two `align`.
#[must_use]
pub fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Payload bytes reserved for a request of `size` bytes.
#[must_use]
pub fn payload_size_for(size: usize) -> Option<usize> {
    Some(align_up(size, MIN_ALIGN)?.max(MIN_PAYLOAD))
}

/// Total block size (header included) for a request of `size` bytes.
#[must_use]
pub fn block_size_for(size: usize) -> Option<usize> {
    payload_size_for(size)?.checked_add(BLOCK_OVERHEAD)
}

/// Shrinks `[start, start + size)` inward to the `MIN_ALIGN` granule.
///
/// Returns the trimmed `(start, size)`, or `None` if nothing usable is left
/// or the span wraps the address space.
#[must_use]
pub fn trim_to_granule(start: usize, size: usize) -> Option<(usize, usize)> {
    let end = align_down(start.checked_add(size)?, MIN_ALIGN);
    let start = align_up(start, MIN_ALIGN)?;
    if end <= start {
        return None;
    }
    Some((start, end - start))
}
