//! xget: a chunked HTTP content retriever.
//!
//! Given a URL, `xget` discovers whether the origin supports byte-range
//! requests, opens N parallel ranged connections covering disjoint segments
//! of the resource, reassembles the bytes in their original order into a
//! single output stream, and optionally computes a cryptographic digest over
//! the reassembled content. Each segment connection is independently
//! retry-resilient.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use xget::{Xget, XgetOptions};
//!
//! # async fn run() -> xget::Result<()> {
//! let xget = Xget::new("https://example.test/big-file.bin", XgetOptions::default())?;
//! let file = tokio::fs::File::create("big-file.bin").await.map_err(xget::XgetError::from)?;
//! xget.pipe(file).await?;
//! println!("done: {:?}", xget.get_hash());
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! Five components compose the fetch engine, in dependency order:
//!
//! - [`range_planner`]: splits a resource into a non-overlapping, gap-free
//!   sequence of byte ranges for the configured chunk count.
//! - [`segment_source`]: a restartable byte producer for one range, resuming
//!   transparently across transport errors up to a retry cap.
//! - [`reassembly`]: the capacity-bounded, per-slot FIFO merge point between
//!   N segment producers and one consumer, guaranteeing output order.
//! - [`pipeline`]: the per-segment transformer chain and the hasher tap on
//!   the merged output.
//! - [`orchestrator`]: wires the above into one fetch; owns lifecycle state
//!   and the event stream.
//!
//! [`probe`] and [`models`] sit underneath all of these: the metadata probe
//! decides chunkability and total size, and the shared data types carry that
//! information through the rest of the pipeline. [`middleware`] holds the
//! `use`/`with` registries, [`config`] the tunable options, [`events`] the
//! lifecycle event stream, and [`error`] the error taxonomy.
//!
//! # Non-goals
//!
//! No on-disk cache of previously fetched content, no cross-process
//! coordination, no transport other than HTTP(S), and no transparent
//! decompression beyond what user-supplied transformers perform.

pub mod config;
pub mod error;
pub mod events;
pub mod middleware;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod probe;
pub mod range_planner;
pub mod reassembly;
pub mod segment_source;

pub use config::XgetOptions;
pub use error::{ErrContext, ErrorSource, Result, XgetError};
pub use events::{EventReceiver, XgetEvent};
pub use models::{HeaderSlice, LoadData, Plan, Range, RetrySlice, SegmentHandle, SegmentState};
pub use orchestrator::{HeadHandlerFn, LifecycleState, Xget, XgetReader};
pub use pipeline::{HasherTap, Pipeline, TaggedPipeline, Transformer};
