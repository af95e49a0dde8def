//! Resilient segment source
//!
//! A restartable byte producer for one [`Range`]. On any transport-level
//! error it transparently reissues a new ranged GET offset by the bytes
//! already delivered and continues the sequence — the consumer observes no
//! gap or duplication, only a `retry` event.

use crate::error::{Result, XgetError};
use crate::events::{EventSender, XgetEvent};
use crate::models::{RetrySlice, SegmentState};
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::models::Range;

/// One chunk pulled off a resilient segment source.
pub enum SourceEvent {
    Chunk(Bytes),
    End,
}

/// Wraps a request factory with restart semantics for a single [`Range`].
pub struct ResilientSegmentSource {
    client: Client,
    url: String,
    index: usize,
    range: Range,
    max_retries: u32,
    bytes_delivered: u64,
    retry_count: u32,
    cancel: CancellationToken,
    stream: Option<BoxedByteStream>,
}

type BoxedByteStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = reqwest::Result<Bytes>> + Send>>;

impl ResilientSegmentSource {
    pub fn new(
        client: Client,
        url: String,
        index: usize,
        range: Range,
        max_retries: u32,
        chunkable: bool,
        cancel: CancellationToken,
    ) -> Self {
        // With no usable resumption (origin doesn't support ranges), a
        // restart would just replay the whole body from offset 0, which
        // produces duplicate bytes. Cap retries at 1.
        let max_retries = if chunkable { max_retries } else { max_retries.min(1) };
        ResilientSegmentSource {
            client,
            url,
            index,
            range,
            max_retries,
            bytes_delivered: 0,
            retry_count: 0,
            cancel,
            stream: None,
        }
    }

    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// A clone of this source's cancellation token, so a caller can race a
    /// downstream operation (e.g. admitting into the reassembly buffer)
    /// against the same destroy signal instead of only checking it between
    /// `next()` calls.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Abort the in-flight request (if any) and make the source terminal.
    pub fn destroy(&mut self) {
        self.cancel.cancel();
        self.stream = None;
    }

    async fn open_stream(&self) -> Result<BoxedByteStream> {
        let range_header = self.range.to_header(self.bytes_delivered);
        debug!(
            "segment {} opening request with Range: {range_header}",
            self.index
        );
        let response = self
            .client
            .get(&self.url)
            .header("Range", range_header)
            .send()
            .await
            .map_err(|e| XgetError::HttpError(format!("segment {} request failed: {e}", self.index)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(XgetError::NetException {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
            });
        }

        Ok(Box::pin(response.bytes_stream()))
    }

    /// Pull the next event from this segment, transparently retrying on
    /// transport errors up to `max_retries`.
    ///
    /// Returns `Ok(SourceEvent::End)` once `bytes_delivered` reaches the
    /// range's size (or, for an unbounded range, once the underlying stream
    /// hits EOF).
    pub async fn next(&mut self, events: &EventSender) -> Result<SourceEvent> {
        if self.cancel.is_cancelled() {
            return Err(XgetError::Destroyed);
        }

        if let Some(size) = self.range.size() {
            if self.bytes_delivered >= size {
                return Ok(SourceEvent::End);
            }
        }

        loop {
            if self.stream.is_none() {
                match self.open_stream().await {
                    Ok(s) => self.stream = Some(s),
                    Err(err) => return self.handle_error(err, events).await,
                }
            }

            let stream = self.stream.as_mut().expect("stream set above");
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.stream = None;
                    return Err(XgetError::Destroyed);
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(chunk)) => {
                            self.bytes_delivered += chunk.len() as u64;
                            return Ok(SourceEvent::Chunk(chunk));
                        }
                        Some(Err(e)) => {
                            self.stream = None;
                            let err = XgetError::HttpError(format!(
                                "segment {} stream error: {e}",
                                self.index
                            ));
                            return self.handle_error(err, events).await;
                        }
                        None => {
                            self.stream = None;
                            return Ok(SourceEvent::End);
                        }
                    }
                }
            }
        }
    }

    async fn handle_error(&mut self, err: XgetError, events: &EventSender) -> Result<SourceEvent> {
        if self.retry_count >= self.max_retries {
            warn!(
                "segment {} exhausted {} retries: {err}",
                self.index, self.max_retries
            );
            return Err(XgetError::SegmentExhausted {
                index: self.index,
                last_err: err.to_string(),
            });
        }

        self.retry_count += 1;
        let _ = events.send(XgetEvent::Retry(RetrySlice {
            index: Some(self.index),
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            bytes_read: self.bytes_delivered,
            total_bytes: self.range.size(),
            last_err: err.to_string(),
            meta: false,
        }));
        debug!(
            "segment {} retrying ({}/{}) after {} bytes: {err}",
            self.index, self.retry_count, self.max_retries, self.bytes_delivered
        );
        self.stream = None;
        // Loop back around in `next` by recursing once; the caller's loop
        // in `next` already handles reopening the stream.
        Box::pin(self.next(events)).await
    }

    pub fn state_if_terminal(&self, result: &Result<SourceEvent>) -> Option<SegmentState> {
        match result {
            Ok(SourceEvent::End) => Some(SegmentState::Done),
            Err(XgetError::SegmentExhausted { .. }) => Some(SegmentState::Exhausted),
            _ => None,
        }
    }
}

/// Per-request inactivity timeout applied to every segment's HTTP client.
/// `read_timeout` resets on every byte received, so a large segment that is
/// actively (if slowly) streaming never trips it; only a stalled socket does.
/// A plain `.timeout()` would instead bound the *whole* request, which would
/// abort any segment whose total transfer time exceeds it.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .read_timeout(timeout)
        .build()
        .map_err(|e| XgetError::HttpError(format!("failed to build http client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_chunkable_caps_retries_at_one() {
        let client = Client::new();
        let cancel = CancellationToken::new();
        let source = ResilientSegmentSource::new(
            client,
            "http://example.test".into(),
            0,
            Range::new(0, Some(99)),
            5,
            false,
            cancel,
        );
        assert_eq!(source.max_retries, 1);
    }

    #[test]
    fn chunkable_keeps_configured_retries() {
        let client = Client::new();
        let cancel = CancellationToken::new();
        let source = ResilientSegmentSource::new(
            client,
            "http://example.test".into(),
            0,
            Range::new(0, Some(99)),
            5,
            true,
            cancel,
        );
        assert_eq!(source.max_retries, 5);
    }
}
