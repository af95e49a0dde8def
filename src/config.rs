//! Runtime configuration for an [`crate::Xget`] instance.

use crate::error::{Result, XgetError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Sentinel for "retry forever" in [`XgetOptions::retries`].
pub const INFINITE_RETRIES: u32 = u32::MAX;

/// Digest algorithms the hasher tap knows how to construct.
pub const SUPPORTED_HASH_ALGORITHMS: &[&str] = &["sha256", "sha1", "md5"];

/// Tunable options for one fetch. Mirrors the option table in the external
/// interface: everything here is serializable so it can be loaded from a
/// config file; function-valued hooks (`use`, `with`, `headHandler`) are
/// registered directly on the orchestrator instead, since closures aren't
/// `Deserialize`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct XgetOptions {
    /// Target parallelism (default: 5).
    #[serde(default = "default_chunks")]
    pub chunks: u32,

    /// Per-segment and meta retry cap. [`INFINITE_RETRIES`] retries forever
    /// (default: 5).
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-request inactivity timeout, in milliseconds (default: 10000).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Initial byte offset (default: 0).
    #[serde(default)]
    pub start: u64,

    /// Caps bytes consumed after `start`. `None` means "to the end of the
    /// resource", derived from the probed total size.
    #[serde(default)]
    pub size: Option<u64>,

    /// Digest algorithm for the hasher tap, one of
    /// [`SUPPORTED_HASH_ALGORITHMS`]. `None` disables hashing.
    #[serde(default)]
    pub hash: Option<String>,

    /// Enable the reassembly buffer. `false` degrades to an unbounded
    /// direct-passthrough handoff with no overlap accounting (default:
    /// true).
    #[serde(default = "default_true")]
    pub cache: bool,

    /// Reassembly buffer capacity in bytes (default: 200 MiB).
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,

    /// Start probing at construction rather than waiting for an explicit
    /// `start()` call (default: true).
    #[serde(default = "default_true")]
    pub auto: bool,

    /// When a chunk overflows the buffer's remaining capacity, replace the
    /// unadmitted tail in place, preserving its position in the admit queue
    /// (`false`, default), or push it to the back of the queue so other
    /// slots get a chance to admit first (`true`).
    #[serde(default)]
    pub reallocate: bool,

    /// Suppress the oversize-cache-size warning against total physical
    /// memory (default: false).
    #[serde(default)]
    pub nowarn: bool,
}

fn default_chunks() -> u32 {
    5
}

fn default_retries() -> u32 {
    5
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_cache_size() -> u64 {
    crate::reassembly::DEFAULT_CAPACITY
}

fn default_true() -> bool {
    true
}

impl Default for XgetOptions {
    fn default() -> Self {
        XgetOptions {
            chunks: default_chunks(),
            retries: default_retries(),
            timeout_ms: default_timeout_ms(),
            start: 0,
            size: None,
            hash: None,
            cache: default_true(),
            cache_size: default_cache_size(),
            auto: default_true(),
            reallocate: false,
            nowarn: false,
        }
    }
}

impl XgetOptions {
    /// Load options from a YAML (or JSON, which is a YAML subset) file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| XgetError::InvalidOption(format!("failed to read config file: {e}")))?;

        let options: XgetOptions = serde_yaml::from_str(&content)
            .map_err(|e| XgetError::InvalidOption(format!("failed to parse config file: {e}")))?;

        options.validate()?;
        Ok(options)
    }

    /// Eagerly validate every field, independent of any probed resource.
    pub fn validate(&self) -> Result<()> {
        if self.chunks == 0 {
            return Err(XgetError::InvalidOption(
                "chunks must be greater than 0".to_string(),
            ));
        }

        if self.timeout_ms == 0 {
            return Err(XgetError::InvalidOption(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.cache && self.cache_size == 0 {
            return Err(XgetError::InvalidOption(
                "cache_size must be greater than 0 when cache is enabled".to_string(),
            ));
        }

        if let Some(algorithm) = &self.hash {
            if !SUPPORTED_HASH_ALGORITHMS.contains(&algorithm.as_str()) {
                return Err(XgetError::HashUnsupported(algorithm.clone()));
            }
        }

        Ok(())
    }

    /// Construct with the common overrides, leaving the rest at default.
    pub fn new(chunks: u32, retries: u32, timeout_ms: u64) -> Result<Self> {
        let options = XgetOptions {
            chunks,
            retries,
            timeout_ms,
            ..Default::default()
        };
        options.validate()?;
        Ok(options)
    }

    /// Replace `self` with `new_options`, returning a summary of what
    /// changed. Used for hot-reloading a long-lived configuration file
    /// between runs.
    pub fn update_from(&mut self, new_options: &XgetOptions) -> Result<ConfigChanges> {
        new_options.validate()?;

        let mut changes = ConfigChanges::default();

        macro_rules! track {
            ($field:ident, $flag:ident) => {
                if self.$field != new_options.$field {
                    changes.$flag = true;
                    self.$field = new_options.$field.clone();
                }
            };
        }

        track!(chunks, chunks_changed);
        track!(retries, retries_changed);
        track!(timeout_ms, timeout_changed);
        track!(start, start_changed);
        track!(size, size_changed);
        track!(hash, hash_changed);
        track!(cache, cache_changed);
        track!(cache_size, cache_size_changed);
        track!(auto, auto_changed);
        track!(reallocate, reallocate_changed);
        track!(nowarn, nowarn_changed);

        Ok(changes)
    }
}

/// Description of which fields changed after [`XgetOptions::update_from`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigChanges {
    pub chunks_changed: bool,
    pub retries_changed: bool,
    pub timeout_changed: bool,
    pub start_changed: bool,
    pub size_changed: bool,
    pub hash_changed: bool,
    pub cache_changed: bool,
    pub cache_size_changed: bool,
    pub auto_changed: bool,
    pub reallocate_changed: bool,
    pub nowarn_changed: bool,
}

impl ConfigChanges {
    pub fn has_changes(&self) -> bool {
        self.chunks_changed
            || self.retries_changed
            || self.timeout_changed
            || self.start_changed
            || self.size_changed
            || self.hash_changed
            || self.cache_changed
            || self.cache_size_changed
            || self.auto_changed
            || self.reallocate_changed
            || self.nowarn_changed
    }
}
