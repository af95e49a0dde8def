//! Core data types shared across the fetch engine: byte ranges, the fetch
//! plan, per-segment bookkeeping, and the metadata snapshot handed to
//! middleware and event listeners.

use http::HeaderMap;
use std::sync::Arc;

/// A byte interval assigned to one segment: `[min, max]`, both inclusive.
///
/// `max` is `None` when the upper bound is unknown — this only happens for
/// the sole segment of a plan built from a server that did not report a
/// length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub min: u64,
    pub max: Option<u64>,
}

impl Range {
    pub fn new(min: u64, max: Option<u64>) -> Self {
        debug_assert!(max.map_or(true, |m| m >= min));
        Range { min, max }
    }

    /// Size in bytes, or `None` if the range is unbounded.
    pub fn size(&self) -> Option<u64> {
        self.max.map(|m| m - self.min + 1)
    }

    /// Render as a `Range: bytes=...` header value. `resume_from` is the
    /// number of bytes already delivered for this range, used when a
    /// resilient source reissues the request after a transport error.
    pub fn to_header(&self, resume_from: u64) -> String {
        let min = self.min + resume_from;
        match self.max {
            Some(max) => format!("bytes={}-{}", min, max),
            None => format!("bytes={}-", min),
        }
    }
}

/// The ordered, gap-free, non-overlapping sequence of [`Range`]s that
/// together cover `[start, total_size - 1]`.
pub type Plan = Vec<Range>;

/// Per-segment retry/progress bookkeeping, surfaced in `retry` events and
/// used internally by the resilient segment source to decide when to stop.
#[derive(Debug, Clone)]
pub struct RetrySlice {
    /// Segment index, or `None` for a meta-retry of the probe.
    pub index: Option<usize>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    pub last_err: String,
    pub meta: bool,
}

/// Snapshot of the probe result handed to a user-supplied head handler,
/// which may override the byte offset fetching begins from.
#[derive(Debug, Clone)]
pub struct HeaderSlice {
    pub chunks: u32,
    pub headers: Arc<HeaderMap>,
    pub total_size: Option<u64>,
    pub accepts_ranges: bool,
}

/// The result of the metadata probe: everything known about the resource
/// before any segment has been dispatched.
#[derive(Debug, Clone)]
pub struct LoadData {
    pub url: String,
    /// `total_size - start`, or `None` if the total size is unknown.
    pub size: Option<u64>,
    pub start: u64,
    pub total_size: Option<u64>,
    pub chunkable: bool,
    pub headers: Arc<HeaderMap>,
    pub plan: Plan,
}

/// Terminal state of one segment fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Pending,
    Running,
    Done,
    Exhausted,
}

/// Per-segment tracking owned by the orchestrator; the resilient source
/// itself only tracks `bytes_delivered`/`retry_count` locally and reports
/// back through [`RetrySlice`] events.
#[derive(Debug, Clone)]
pub struct SegmentHandle {
    pub index: usize,
    pub range: Range,
    pub bytes_delivered: u64,
    pub retry_count: u32,
    pub state: SegmentState,
}

impl SegmentHandle {
    pub fn new(index: usize, range: Range) -> Self {
        SegmentHandle {
            index,
            range,
            bytes_delivered: 0,
            retry_count: 0,
            state: SegmentState::Pending,
        }
    }

    /// `true` once every byte of the range has been delivered.
    pub fn is_complete(&self) -> bool {
        match self.range.size() {
            Some(size) => self.bytes_delivered >= size,
            None => self.state == SegmentState::Done,
        }
    }
}
