//! End-to-end tests driving [`Xget`] against a mock origin, covering the
//! chunkable/non-chunkable/unknown-size probe outcomes, retry bookkeeping,
//! and hash correctness.

use sha2::{Digest, Sha256};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::AsyncWrite;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xget::{XgetError, XgetOptions};

fn body_of(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A minimal in-memory sink so tests can assert on the exact bytes `pipe`
/// wrote without standing up a temp file.
#[derive(Default)]
struct VecSink(Vec<u8>);

impl AsyncWrite for VecSink {
    fn poll_write(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        self.0.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// A 1024-byte chunkable resource split into four even quarters. Every quarter is mocked individually since the origin is
/// range-aware and each segment issues its own distinct `Range` header.
#[tokio::test]
async fn chunkable_resource_downloads_in_order() {
    let body = body_of(1024);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/file"))
        .and(header("Range", "bytes=0-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body.clone())
                .insert_header("content-range", "bytes 0-1023/1024")
                .insert_header("accept-ranges", "bytes"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let quarters = [
        (0u64, 255u64),
        (256, 511),
        (512, 767),
        (768, 1023),
    ];
    for (min, max) in quarters {
        let slice = body[min as usize..=max as usize].to_vec();
        Mock::given(method("GET"))
            .and(path("/file"))
            .and(header("Range", format!("bytes={min}-{max}").as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(slice)
                    .insert_header("content-range", format!("bytes {min}-{max}/1024"))
                    .insert_header("accept-ranges", "bytes"),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let url = format!("{}/file", server.uri());
    let mut options = XgetOptions::default();
    options.chunks = 4;
    let xget = xget::Xget::new(url, options).unwrap();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();

    assert_eq!(out.0, body);
    assert_eq!(xget.state(), xget::LifecycleState::Ended);
    let load = xget.load_data().unwrap();
    assert!(load.chunkable);
    assert_eq!(load.plan.len(), 4);
}

/// The origin ignores `Range` entirely and always answers 200 with the
/// full body. The probe must see this as non-chunkable and collapse to a
/// single segment covering the whole resource from offset 0, even though
/// `start` was configured to something else.
#[tokio::test]
async fn non_chunkable_resource_forces_single_segment_from_zero() {
    let body = body_of(2000);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flat"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let url = format!("{}/flat", server.uri());
    let mut options = XgetOptions::default();
    options.chunks = 8;
    options.start = 500;
    let xget = xget::Xget::new(url, options).unwrap();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();

    assert_eq!(out.0, body);
    let load = xget.load_data().unwrap();
    assert!(!load.chunkable);
    assert_eq!(load.start, 0);
    assert_eq!(load.plan.len(), 1);
}

/// The running hasher tap over the reassembled output matches a direct
/// digest of the same bytes, across multiple segments.
#[tokio::test]
async fn hash_over_reassembled_output_matches_direct_digest() {
    let body = body_of(4096);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/hashed"))
        .and(header("Range", "bytes=0-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body.clone())
                .insert_header("content-range", "bytes 0-4095/4096")
                .insert_header("accept-ranges", "bytes"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let quarter = 1024u64;
    for i in 0..4u64 {
        let min = i * quarter;
        let max = min + quarter - 1;
        let slice = body[min as usize..=max as usize].to_vec();
        Mock::given(method("GET"))
            .and(path("/hashed"))
            .and(header("Range", format!("bytes={min}-{max}").as_str()))
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(slice)
                    .insert_header("content-range", format!("bytes {min}-{max}/4096"))
                    .insert_header("accept-ranges", "bytes"),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let url = format!("{}/hashed", server.uri());
    let mut options = XgetOptions::default();
    options.chunks = 4;
    options.hash = Some("sha256".to_string());
    let xget = xget::Xget::new(url, options).unwrap();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();

    let expected = hex::encode(Sha256::digest(&body));
    assert_eq!(xget.get_hash().unwrap(), expected);
}

/// A segment's first attempt fails with a 500, is retried, and the
/// retried request resumes from the same offset (no bytes had been
/// delivered yet) and succeeds. The final output must still be byte-exact.
#[tokio::test]
async fn segment_retries_after_transient_failure_and_resumes_correctly() {
    let body = body_of(1024);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/flaky"))
        .and(header("Range", "bytes=0-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body.clone())
                .insert_header("content-range", "bytes 0-1023/1024")
                .insert_header("accept-ranges", "bytes"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let quarters = [(0u64, 255u64), (256, 511), (512, 767), (768, 1023)];
    for (min, max) in quarters {
        let slice = body[min as usize..=max as usize].to_vec();
        let range_header = format!("bytes={min}-{max}");

        // Segment index 2's range fails once before succeeding; every other
        // segment succeeds on the first attempt.
        if min == 512 {
            Mock::given(method("GET"))
                .and(path("/flaky"))
                .and(header("Range", range_header.as_str()))
                .respond_with(ResponseTemplate::new(500))
                .up_to_n_times(1)
                .with_priority(1)
                .expect(1)
                .mount(&server)
                .await;
        }

        Mock::given(method("GET"))
            .and(path("/flaky"))
            .and(header("Range", range_header.as_str()))
            .with_priority(2)
            .respond_with(
                ResponseTemplate::new(206)
                    .set_body_bytes(slice)
                    .insert_header("content-range", format!("bytes {min}-{max}/1024"))
                    .insert_header("accept-ranges", "bytes"),
            )
            .expect(1)
            .mount(&server)
            .await;
    }

    let url = format!("{}/flaky", server.uri());
    let mut options = XgetOptions::default();
    options.chunks = 4;
    let xget = xget::Xget::new(url, options).unwrap();
    let mut events = xget.subscribe();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();

    assert_eq!(out.0, body);

    let mut saw_segment_retry = false;
    while let Ok(event) = events.try_recv() {
        if let xget::XgetEvent::Retry(slice) = event {
            if slice.index == Some(2) {
                saw_segment_retry = true;
                assert_eq!(slice.retry_count, 1);
                assert_eq!(slice.bytes_read, 0);
            }
        }
    }
    assert!(saw_segment_retry, "expected a retry event for segment 2");
}

/// A segment whose retries are all exhausted surfaces `SegmentExhausted`
/// through `pipe`, not a partial/truncated success.
#[tokio::test]
async fn segment_exhausting_retries_surfaces_segment_exhausted() {
    let server = MockServer::start().await;
    let body = body_of(100);

    Mock::given(method("GET"))
        .and(path("/always-down"))
        .and(header("Range", "bytes=0-"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body.clone())
                .insert_header("content-range", "bytes 0-99/100")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/always-down"))
        .and(header("Range", "bytes=0-99"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let url = format!("{}/always-down", server.uri());
    let mut options = XgetOptions::default();
    options.chunks = 1;
    options.retries = 2;
    let xget = xget::Xget::new(url, options).unwrap();

    let mut out = VecSink::default();
    let err = xget.pipe(&mut out).await.unwrap_err();
    assert!(matches!(err, XgetError::SegmentExhausted { index: 0, .. }));
}

/// A 403 on the probe is an authoritative refusal: it must surface
/// immediately as `MetaExhausted`, never as a retried segment fetch.
#[tokio::test]
async fn probe_forbidden_surfaces_meta_exhausted_without_retrying() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/forbidden"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let url = format!("{}/forbidden", server.uri());
    let xget = xget::Xget::new(url, XgetOptions::default()).unwrap();

    let mut out = VecSink::default();
    let err = xget.pipe(&mut out).await.unwrap_err();
    assert!(matches!(err, XgetError::MetaExhausted { .. }));
}

/// `start == total_size` is the zero-length success case: the plan is
/// empty, the fetch ends immediately, and the output is empty bytes.
#[tokio::test]
async fn start_at_total_size_completes_with_empty_output() {
    let server = MockServer::start().await;

    // The probe always requests `bytes=0-`, i.e. the whole resource; the
    // origin reports its actual total size of 100, which equals the
    // configured `start`, so the plan collapses to zero segments and no
    // segment request is ever issued.
    Mock::given(method("GET"))
        .and(path("/exact"))
        .respond_with(
            ResponseTemplate::new(206)
                .set_body_bytes(body_of(100))
                .insert_header("content-range", "bytes 0-99/100")
                .insert_header("accept-ranges", "bytes"),
        )
        .mount(&server)
        .await;

    let url = format!("{}/exact", server.uri());
    let mut options = XgetOptions::default();
    options.start = 100;
    let xget = xget::Xget::new(url, options).unwrap();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();
    assert!(out.0.is_empty());
    assert_eq!(xget.state(), xget::LifecycleState::Ended);
}

/// `into_async_read` is an alternative to `pipe`: driving it through
/// `tokio::io::copy` must reassemble the same bytes.
#[tokio::test]
async fn into_async_read_drives_the_same_bytes_as_pipe() {
    let body = body_of(300);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/reader"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let url = format!("{}/reader", server.uri());
    let xget = xget::Xget::new(url, XgetOptions::default()).unwrap();

    let mut reader = xget.into_async_read().unwrap();
    let mut out = Vec::new();
    tokio::io::copy(&mut reader, &mut out).await.unwrap();

    assert_eq!(out, body);
}

/// Shrinking the reassembly buffer below the amount of data it already
/// holds must drain silently rather than error, per the buffer's own
/// resize contract (see `reassembly.rs`'s
/// `set_capacity_below_current_load_drains_silently`); this exercises that
/// contract through `Xget::set_cache_size`'s public wiring once a fetch has
/// run to completion and the buffer is still reachable.
#[tokio::test]
async fn set_cache_size_can_shrink_below_transferred_size() {
    let body = body_of(4096);
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resizable"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let url = format!("{}/resizable", server.uri());
    let xget = xget::Xget::new(url, XgetOptions::default()).unwrap();

    let mut out = VecSink::default();
    xget.pipe(&mut out).await.unwrap();
    assert_eq!(out.0, body);

    xget.set_cache_size(1).unwrap();
}
