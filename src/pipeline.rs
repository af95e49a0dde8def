//! Per-segment transformation pipeline and the hasher tap on the merged
//! output.

use crate::error::{Result, XgetError};
use async_trait::async_trait;
use bytes::Bytes;
use digest::Digest;
use md5::Md5;
use sha1::Sha1;
use sha2::Sha256;
use std::sync::Mutex;

/// A duplex byte transformer applied to one segment's raw bytes before they
/// reach its reassembly-buffer slot. Factories build one of these per
/// segment via [`crate::middleware::TransformerFactory`].
#[async_trait]
pub trait Transformer: Send {
    /// Transform one chunk. Errors here destroy every segment and surface
    /// annotated with `{tag, source = "transform"}`.
    async fn transform(&mut self, chunk: Bytes) -> Result<Bytes>;

    /// Called once after the final chunk, giving the transformer a chance
    /// to emit any buffered trailing bytes (e.g. a compressor's footer).
    /// Default: nothing buffered, nothing to flush.
    async fn flush(&mut self) -> Result<Option<Bytes>> {
        Ok(None)
    }
}

/// The ordered chain of transformers for one segment, built once at
/// segment-start from the registered `use` factories.
pub struct Pipeline {
    stages: Vec<Box<dyn Transformer>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Box<dyn Transformer>>) -> Self {
        Pipeline { stages }
    }

    /// Feed `chunk` through every stage in registration order.
    pub async fn process(&mut self, mut chunk: Bytes) -> Result<Bytes> {
        for stage in &mut self.stages {
            chunk = stage.transform(chunk).await?;
        }
        Ok(chunk)
    }

    /// Drain every stage's trailing bytes, in registration order, feeding
    /// each stage's flush output through the remaining stages' `transform`.
    pub async fn finish(&mut self) -> Result<Vec<Bytes>> {
        let mut trailing = Vec::new();
        for i in 0..self.stages.len() {
            if let Some(mut chunk) = self.stages[i].flush().await? {
                for stage in &mut self.stages[i + 1..] {
                    chunk = stage.transform(chunk).await?;
                }
                trailing.push(chunk);
            }
        }
        Ok(trailing)
    }
}

/// A per-segment transformer chain where each stage remembers the `use` tag
/// it was registered under, so a runtime failure can be annotated with
/// `{tag, source = "transform"}` instead of losing provenance once
/// stages are chained.
pub struct TaggedPipeline {
    stages: Vec<(String, Box<dyn Transformer>)>,
}

impl TaggedPipeline {
    pub fn new(stages: Vec<(String, Box<dyn Transformer>)>) -> Self {
        TaggedPipeline { stages }
    }

    pub async fn process(&mut self, mut chunk: Bytes) -> Result<Bytes> {
        for (tag, stage) in &mut self.stages {
            chunk = stage
                .transform(chunk)
                .await
                .map_err(|e| XgetError::TransformError {
                    tag: tag.clone(),
                    cause: e.to_string(),
                })?;
        }
        Ok(chunk)
    }

    /// Drain every stage's trailing bytes in registration order, routing
    /// each stage's flush output through the remaining downstream stages.
    pub async fn finish(&mut self) -> Result<Vec<Bytes>> {
        let mut trailing = Vec::new();
        for i in 0..self.stages.len() {
            let (tag, _) = &self.stages[i];
            let tag = tag.clone();
            let flushed = self.stages[i]
                .1
                .flush()
                .await
                .map_err(|e| XgetError::TransformError { tag: tag.clone(), cause: e.to_string() })?;
            let Some(mut chunk) = flushed else { continue };
            for (tag, stage) in &mut self.stages[i + 1..] {
                chunk = stage
                    .transform(chunk)
                    .await
                    .map_err(|e| XgetError::TransformError {
                        tag: tag.clone(),
                        cause: e.to_string(),
                    })?;
            }
            trailing.push(chunk);
        }
        Ok(trailing)
    }
}

enum HashAlgorithm {
    Sha256(Sha256),
    Sha1(Sha1),
    Md5(Md5),
}

impl HashAlgorithm {
    fn new(name: &str) -> Result<Self> {
        match name {
            "sha256" => Ok(HashAlgorithm::Sha256(Sha256::new())),
            "sha1" => Ok(HashAlgorithm::Sha1(Sha1::new())),
            "md5" => Ok(HashAlgorithm::Md5(Md5::new())),
            other => Err(XgetError::HashUnsupported(other.to_string())),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            HashAlgorithm::Sha256(h) => Digest::update(h, data),
            HashAlgorithm::Sha1(h) => Digest::update(h, data),
            HashAlgorithm::Md5(h) => Digest::update(h, data),
        }
    }

    /// Digest of everything fed so far, without disturbing further updates.
    fn snapshot(&self) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256(h) => h.clone().finalize().to_vec(),
            HashAlgorithm::Sha1(h) => h.clone().finalize().to_vec(),
            HashAlgorithm::Md5(h) => h.clone().finalize().to_vec(),
        }
    }
}

/// A read-only observer of the fully reassembled byte stream, computing a
/// running digest that can be snapshotted mid-stream or after `end`.
pub struct HasherTap {
    algorithm: Mutex<HashAlgorithm>,
}

impl HasherTap {
    pub fn new(algorithm_name: &str) -> Result<Self> {
        Ok(HasherTap {
            algorithm: Mutex::new(HashAlgorithm::new(algorithm_name)?),
        })
    }

    /// Feed the next chunk of the merged output into the running digest.
    pub fn observe(&self, chunk: &[u8]) {
        self.algorithm
            .lock()
            .expect("hasher tap lock poisoned")
            .update(chunk);
    }

    /// Hex-encoded digest of everything observed so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.algorithm.lock().expect("hasher tap lock poisoned").snapshot())
    }

    /// Raw digest bytes of everything observed so far.
    pub fn raw_digest(&self) -> Vec<u8> {
        self.algorithm.lock().expect("hasher tap lock poisoned").snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Uppercase;
    #[async_trait]
    impl Transformer for Uppercase {
        async fn transform(&mut self, chunk: Bytes) -> Result<Bytes> {
            Ok(Bytes::from(chunk.to_ascii_uppercase()))
        }
    }

    struct AppendOnFlush(&'static str);
    #[async_trait]
    impl Transformer for AppendOnFlush {
        async fn transform(&mut self, chunk: Bytes) -> Result<Bytes> {
            Ok(chunk)
        }
        async fn flush(&mut self) -> Result<Option<Bytes>> {
            Ok(Some(Bytes::from_static(self.0.as_bytes())))
        }
    }

    struct Failing;
    #[async_trait]
    impl Transformer for Failing {
        async fn transform(&mut self, _chunk: Bytes) -> Result<Bytes> {
            Err(XgetError::InvalidOption("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn pipeline_applies_stages_in_order() {
        let mut pipeline = Pipeline::new(vec![Box::new(Uppercase)]);
        let out = pipeline.process(Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(&out[..], b"ABC");
    }

    #[tokio::test]
    async fn flush_output_is_routed_through_downstream_stages() {
        let mut pipeline = Pipeline::new(vec![Box::new(AppendOnFlush("tail")), Box::new(Uppercase)]);
        let trailing = pipeline.finish().await.unwrap();
        assert_eq!(trailing.len(), 1);
        assert_eq!(&trailing[0][..], b"TAIL");
    }

    #[tokio::test]
    async fn transformer_error_propagates() {
        let mut pipeline = Pipeline::new(vec![Box::new(Failing)]);
        let err = pipeline.process(Bytes::from_static(b"x")).await.unwrap_err();
        assert!(matches!(err, XgetError::InvalidOption(_)));
    }

    #[tokio::test]
    async fn tagged_pipeline_annotates_failure_with_its_own_tag() {
        let mut pipeline = TaggedPipeline::new(vec![
            ("upper".to_string(), Box::new(Uppercase)),
            ("boom".to_string(), Box::new(Failing)),
        ]);
        let err = pipeline.process(Bytes::from_static(b"x")).await.unwrap_err();
        match err {
            XgetError::TransformError { tag, .. } => assert_eq!(tag, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn hasher_tap_rejects_unknown_algorithm() {
        assert!(HasherTap::new("crc32").is_err());
    }

    #[test]
    fn hasher_tap_snapshot_matches_direct_digest() {
        let tap = HasherTap::new("sha256").unwrap();
        tap.observe(b"abc");
        let expected = hex::encode(Sha256::digest(b"abc"));
        assert_eq!(tap.hex_digest(), expected);
    }

    #[test]
    fn hasher_tap_snapshot_then_more_data_extends_digest() {
        let tap = HasherTap::new("sha256").unwrap();
        tap.observe(b"ab");
        let partial = tap.hex_digest();
        tap.observe(b"c");
        let full = tap.hex_digest();
        assert_ne!(partial, full);
    }
}
