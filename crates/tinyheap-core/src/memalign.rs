//! Aligned allocation on top of a plain heap.
//!
//! An aligned request over-allocates `payload + alignment + MIN_BLOCK_SIZE`
//! bytes, picks the first aligned payload address inside the block whose
//! leading gap is either empty or a whole block, then hands the leading gap
//! and any tail that can stand alone back to the same heap.
//!
//! Cost: one allocation plus at most two fragment returns. The heap is kept
//! fully coalesced, so each fragment merges with at most its two neighbours
//! and no coalescing chain can form. Fragments are returned only after the
//! oversized allocation has released the heap lock, each under its own lock
//! acquisition. Slack is bounded by `MIN_BLOCK_SIZE` at the tail; the leading
//! gap is never slack.

use crate::error::{MmError, MmResult};
use crate::heap::{Heap, MIN_ALIGN, MIN_BLOCK_SIZE, payload_size_for};
use crate::tracker::CallSite;

/// First payload address at or above `base` aligned to `alignment` whose
/// distance from `base` is zero or at least `MIN_BLOCK_SIZE`.
///
/// `base` must be the payload of a block of at least
/// `alignment + MIN_BLOCK_SIZE` payload bytes, so the result stays inside it.
fn aligned_payload(base: usize, alignment: usize) -> usize {
    let mut aligned = (base + alignment - 1) & !(alignment - 1);
    while aligned > base && aligned - base < MIN_BLOCK_SIZE {
        aligned += alignment;
    }
    aligned
}

pub(crate) fn memalign(
    heap: &Heap,
    alignment: usize,
    size: usize,
    site: Option<CallSite>,
) -> MmResult<usize> {
    debug_assert!(
        alignment.is_power_of_two(),
        "memalign alignment {alignment} is not a power of two"
    );
    let Some(alignment) = alignment.checked_next_power_of_two() else {
        return Err(MmError::exhausted(size));
    };
    if alignment <= MIN_ALIGN {
        return heap.allocate_inner(size, site, "memalign");
    }

    let Some(oversize) = payload_size_for(size).and_then(|payload| {
        payload
            .checked_add(alignment)?
            .checked_add(MIN_BLOCK_SIZE)
            .map(|oversize| (payload, oversize))
    }) else {
        return Err(MmError::exhausted(size));
    };
    let (payload, oversize) = oversize;

    let base = heap
        .allocate_inner(oversize, site, "memalign")
        .map_err(|_| MmError::exhausted(size))?;

    let aligned = aligned_payload(base, alignment);
    if aligned != base && !heap.release_leading(base, aligned) {
        // Unreachable with the oversize above; give the block back rather
        // than return a pointer the heap does not know.
        heap.free(base);
        return Err(MmError::exhausted(size));
    }
    heap.release_trailing(aligned, size, payload, alignment);
    Ok(aligned)
}
