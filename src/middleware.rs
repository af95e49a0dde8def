//! User-extensible middleware registries: `use` (per-segment transformer
//! factories) and `with` (store-populating hooks run once after the probe).
//!
//! The store is built once, after the probe, then shared read-only (via
//! `Arc`) with every concurrently-running segment task for the rest of the
//! fetch.

use crate::error::{Result, XgetError};
use crate::models::{LoadData, SegmentHandle};
use crate::pipeline::Transformer;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

/// Read-only, string-keyed bag of values computed by `with` hooks and handed
/// to every `use` transformer factory.
pub type MiddlewareStore = Arc<HashMap<String, Box<dyn Any + Send + Sync>>>;

/// A `with` hook: given the probe result, computes one value for the store.
pub type WithFn =
    Box<dyn Fn(&LoadData) -> std::result::Result<Box<dyn Any + Send + Sync>, String> + Send + Sync>;

/// A `use` hook: builds one transformer for one segment.
pub type TransformerFactory = Arc<
    dyn Fn(&SegmentHandle, &MiddlewareStore) -> std::result::Result<Box<dyn Transformer>, String>
        + Send
        + Sync,
>;

/// Ordered, tagged registries of `use`/`with` hooks. Registration order is
/// preserved and is the order in which hooks run.
#[derive(Default)]
pub struct MiddlewareRegistry {
    transformers: Vec<(String, TransformerFactory)>,
    withs: Vec<(String, WithFn)>,
}

impl MiddlewareRegistry {
    pub fn new() -> Self {
        MiddlewareRegistry::default()
    }

    pub fn use_transformer(&mut self, tag: impl Into<String>, factory: TransformerFactory) {
        self.transformers.push((tag.into(), factory));
    }

    pub fn with(&mut self, tag: impl Into<String>, hook: WithFn) {
        self.withs.push((tag.into(), hook));
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty() && self.withs.is_empty()
    }

    /// Run every `with` hook in registration order, sealing the results
    /// into a read-only store.
    pub fn build_store(&self, load: &LoadData) -> Result<MiddlewareStore> {
        let mut map: HashMap<String, Box<dyn Any + Send + Sync>> = HashMap::new();
        for (tag, hook) in &self.withs {
            let value = hook(load).map_err(|cause| XgetError::MiddlewareError {
                tag: tag.clone(),
                cause,
            })?;
            map.insert(tag.clone(), value);
        }
        Ok(Arc::new(map))
    }

    /// Invoke every `use` factory for one segment, in registration order,
    /// producing the tagged transformer chain that segment's bytes flow
    /// through before reaching the reassembly buffer. Tags are carried
    /// alongside each stage so a runtime failure later in the chain (see
    /// [`crate::pipeline::TaggedPipeline`]) can still be attributed to the
    /// `use` registration that built it.
    pub fn build_transformers(
        &self,
        segment: &SegmentHandle,
        store: &MiddlewareStore,
    ) -> Result<Vec<(String, Box<dyn Transformer>)>> {
        let mut chain = Vec::with_capacity(self.transformers.len());
        for (tag, factory) in &self.transformers {
            let transformer = factory(segment, store).map_err(|cause| XgetError::TransformError {
                tag: tag.clone(),
                cause,
            })?;
            chain.push((tag.clone(), transformer));
        }
        Ok(chain)
    }
}
