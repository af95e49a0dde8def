//! Lifecycle events emitted by an [`crate::Xget`] instance.
//!
//! A `tokio::sync::broadcast` channel lets any number of listeners (a
//! progress bar, a logger, a test harness) subscribe independently of the
//! orchestrator's own internal wiring.

use crate::error::ErrContext;
use crate::models::{LoadData, RetrySlice};
use std::sync::Arc;

/// One lifecycle notification from an in-flight or completed fetch.
#[derive(Debug, Clone)]
pub enum XgetEvent {
    /// Fired once, after a successful probe, before `with` middleware runs.
    Loaded(Arc<LoadData>),
    /// Fired once, after all `with` middleware has populated the store.
    Set,
    /// Fired on every retry, meta (probe) or per-segment.
    Retry(RetrySlice),
    /// Fired once all segments have drained and the hasher (if any) has
    /// finalized.
    End,
    /// Terminal failure. No further events follow.
    Error {
        message: String,
        context: Option<ErrContext>,
    },
}

/// Capacity of the broadcast channel backing an instance's event stream.
/// Generous enough that a slow listener does not cause `Lagged` under normal
/// retry/segment-count volumes.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

pub type EventSender = tokio::sync::broadcast::Sender<XgetEvent>;
pub type EventReceiver = tokio::sync::broadcast::Receiver<XgetEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    tokio::sync::broadcast::channel(EVENT_CHANNEL_CAPACITY)
}
