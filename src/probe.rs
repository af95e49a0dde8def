//! Metadata probe
//!
//! Issues a single ranged GET for `bytes=0-` and extracts whatever the
//! origin tells us about chunkability and total size. Retried up to the
//! configured cap, except that a 403 is treated as an authoritative refusal
//! and never retried.

use crate::error::{Result, XgetError};
use crate::events::{EventSender, XgetEvent};
use crate::models::RetrySlice;
use http::HeaderMap;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What the probe learned about the resource.
pub struct ProbeOutcome {
    pub total_size: Option<u64>,
    pub chunkable: bool,
    pub headers: Arc<HeaderMap>,
}

pub struct MetadataProbe {
    client: Client,
    retries: u32,
}

impl MetadataProbe {
    pub fn new(timeout: Duration, retries: u32) -> Result<Self> {
        let client = Client::builder()
            .read_timeout(timeout)
            .build()
            .map_err(|e| XgetError::HttpError(format!("failed to build http client: {e}")))?;
        Ok(MetadataProbe { client, retries })
    }

    /// Run the probe, retrying transient failures up to `self.retries` times
    /// and emitting a `retry` (meta) event on every attempt after the first.
    pub async fn probe(&self, url: &str, events: &EventSender) -> Result<ProbeOutcome> {
        let mut attempt = 0u32;

        loop {
            match self.try_probe(url).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let is_403 = matches!(
                        &err,
                        XgetError::NetException { status, .. } if *status == 403
                    );
                    if is_403 {
                        warn!("probe for {url} refused with 403, not retrying");
                        return Err(XgetError::MetaExhausted {
                            last_err: err.to_string(),
                        });
                    }

                    if attempt >= self.retries {
                        return Err(XgetError::MetaExhausted {
                            last_err: err.to_string(),
                        });
                    }

                    attempt += 1;
                    let _ = events.send(XgetEvent::Retry(RetrySlice {
                        index: None,
                        retry_count: attempt,
                        max_retries: self.retries,
                        bytes_read: 0,
                        total_bytes: None,
                        last_err: err.to_string(),
                        meta: true,
                    }));
                    debug!("retrying probe for {url} (attempt {attempt}/{})", self.retries);
                }
            }
        }
    }

    async fn try_probe(&self, url: &str) -> Result<ProbeOutcome> {
        let response = self
            .client
            .get(url)
            .header("Range", "bytes=0-")
            .send()
            .await
            .map_err(|e| XgetError::HttpError(format!("probe request failed: {e}")))?;

        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let headers = Arc::new(response.headers().clone());
            let total_size = content_length(&headers).or_else(|| content_range_total(&headers));
            return Ok(ProbeOutcome {
                total_size,
                chunkable: false,
                headers,
            });
        }

        if status == StatusCode::FORBIDDEN {
            return Err(XgetError::NetException {
                status: 403,
                message: "forbidden".into(),
            });
        }

        if !status.is_success() {
            return Err(XgetError::NetException {
                status: status.as_u16(),
                message: status
                    .canonical_reason()
                    .unwrap_or("unknown status")
                    .to_string(),
            });
        }

        let headers = Arc::new(response.headers().clone());
        let total_size = content_length(&headers).or_else(|| content_range_total(&headers));
        let accepts_ranges = headers
            .get("accept-ranges")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
            || content_range_total(&headers).is_some();

        Ok(ProbeOutcome {
            total_size,
            chunkable: accepts_ranges && total_size.is_some(),
            headers,
        })
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Parse the total length out of a `Content-Range: bytes start-end/total`
/// header, if present and well-formed.
fn content_range_total(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get("content-range")?.to_str().ok()?;
    let (_, total) = value.rsplit_once('/')?;
    if total == "*" {
        return None;
    }
    total.trim().parse().ok()
}
