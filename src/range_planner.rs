//! Range planner
//!
//! Splits a resource of a given size into a non-overlapping, gap-free
//! sequence of byte ranges for the configured chunk count.

use crate::error::{Result, XgetError};
use crate::models::{Plan, Range};
use tracing::debug;

/// Resolve how many chunks to actually use, given the configured target and
/// what the probe learned about the resource.
///
/// Rules: if the origin doesn't support ranges, always use one chunk. If the
/// remaining size is smaller than the configured chunk count, fall back to
/// one chunk for tiny resources (< 5 bytes) or five chunks otherwise.
pub fn resolve_chunk_count(configured_chunks: u32, size: u64, chunkable: bool) -> u32 {
    if !chunkable {
        return 1;
    }
    if size < u64::from(configured_chunks) {
        return if size < 5 { 1 } else { 5 };
    }
    configured_chunks.max(1)
}

/// Build the plan covering `[start, start + size - 1]` (or `[start, ∞)` if
/// `size` is `None`) using `chunks` segments.
///
/// `size` is `None` only when the server never reported a length; in that
/// case `chunks` is expected to already have been resolved to 1 by
/// [`resolve_chunk_count`] since `chunkable` is false whenever `size` is
/// unknown.
pub fn plan(start: u64, size: Option<u64>, chunks: u32) -> Result<Plan> {
    let Some(size) = size else {
        return Ok(vec![Range::new(start, None)]);
    };

    if size == 0 {
        return Ok(Vec::new());
    }

    let chunks = u64::from(chunks.max(1));
    let quotient = size / chunks;
    let remainder = size % chunks;

    debug!(
        "planning {} chunks over {} bytes starting at {}: quotient={} remainder={}",
        chunks, size, start, quotient, remainder
    );

    let mut ranges = Vec::with_capacity(chunks as usize);
    let mut cursor = start;
    for i in 0..chunks {
        let this_size = if i + 1 == chunks {
            quotient + remainder
        } else {
            quotient
        };
        // A quotient of 0 with leftover remainder can only happen on the
        // final chunk (size < chunks was already redirected to 1 or 5
        // chunks by resolve_chunk_count), so every non-final chunk has at
        // least one byte.
        if this_size == 0 {
            break;
        }
        let max = cursor + this_size - 1;
        ranges.push(Range::new(cursor, Some(max)));
        cursor = max + 1;
    }

    Ok(ranges)
}

/// Validate the caller-supplied start against the probed total size and
/// return the effective size to plan over (`None` when the resource length
/// is unknown).
///
/// `start == total_size` is defined as the zero-length success case: it
/// returns `Some(0)`, not `RangeExceeded` (see DESIGN.md).
pub fn effective_size(start: u64, total_size: Option<u64>) -> Result<Option<u64>> {
    match total_size {
        None => Ok(None),
        Some(total) if start > total => Err(XgetError::RangeExceeded {
            start,
            total_size: total,
        }),
        Some(total) => Ok(Some(total - start)),
    }
}
