//! Orchestrator
//!
//! Ties the probe, range planner, resilient segment sources, transformation
//! pipelines, and the reassembly buffer into one fetch. Owns lifecycle state
//! and the event stream; this is the type callers construct and drive.
//!
//! The design notes call for "one task per segment plus one merging task";
//! that's what [`run`] spawns. There are no locks held across a suspension
//! point anywhere in this crate — the reassembly buffer's mutex is only
//! ever held for the duration of a synchronous admit/read step, per its own
//! module doc.

use crate::config::XgetOptions;
use crate::error::{ErrContext, ErrorSource, Result, XgetError};
use crate::events::{self, EventReceiver, EventSender, XgetEvent};
use crate::middleware::{MiddlewareRegistry, TransformerFactory, WithFn};
use crate::models::{HeaderSlice, LoadData, SegmentHandle};
use crate::pipeline::{HasherTap, TaggedPipeline};
use crate::probe::MetadataProbe;
use crate::range_planner;
use crate::reassembly::ReassemblyBuffer;
use crate::segment_source::{self, ResilientSegmentSource, SourceEvent};

use bytes::{Buf, Bytes};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A user-supplied probe interceptor. Returning `Some(offset)` overrides the
/// configured `start`; `None` leaves it untouched.
pub type HeadHandlerFn = Box<dyn Fn(&HeaderSlice) -> Option<u64> + Send + Sync>;

/// Lifecycle states: `Constructed → Probing → Loaded → Running →
/// (Ended | Errored | Destroyed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Constructed,
    Probing,
    Loaded,
    Running,
    Ended,
    Errored,
    Destroyed,
}

enum OutputItem {
    Chunk(Bytes),
    Error(XgetError),
}

/// Outer `None` means no destroy has been requested; `Some(cause)` carries
/// the (optional) error to surface once the deferred destroy executes.
type DestroyRequest = Option<XgetError>;

struct Shared {
    url: String,
    options: XgetOptions,
    client: reqwest::Client,
    cancel: CancellationToken,
    events_tx: EventSender,
    state: Mutex<LifecycleState>,
    registry: Mutex<MiddlewareRegistry>,
    head_handler: Mutex<Option<HeadHandlerFn>>,
    started: AtomicBool,
    requested: AtomicBool,
    requested_notify: Notify,
    load_data: Mutex<Option<Arc<LoadData>>>,
    hasher: Mutex<Option<Arc<HasherTap>>>,
    buffer: Mutex<Option<Arc<ReassemblyBuffer>>>,
    err_context: Mutex<Option<ErrContext>>,
    destroy_pending: Mutex<Option<DestroyRequest>>,
}

impl Shared {
    fn set_state(&self, state: LifecycleState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn state(&self) -> LifecycleState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Blocks until the first downstream pull (`Xget::pipe`) has occurred,
    /// or until a destroy has been requested in the meantime — whichever
    /// comes first. The caller re-checks `take_deferred_destroy` after this
    /// returns to tell the two apart.
    async fn wait_for_first_pull(&self) {
        loop {
            if self.requested.load(Ordering::SeqCst) {
                return;
            }
            if self.destroy_pending.lock().expect("destroy_pending lock poisoned").is_some() {
                return;
            }
            self.requested_notify.notified().await;
        }
    }
}

/// The chunked HTTP content retriever. Construct with [`Xget::new`],
/// register `use`/`with` hooks while still [`LifecycleState::Constructed`],
/// then drive it with [`Xget::pipe`].
pub struct Xget {
    shared: Arc<Shared>,
    deferred_tx: Mutex<Option<mpsc::Sender<OutputItem>>>,
    output_rx: Mutex<Option<mpsc::Receiver<OutputItem>>>,
}

impl Xget {
    /// Validate `options` and construct an instance in the `Constructed`
    /// state. If `options.auto` is true, probing is kicked off immediately
    /// as a background task; otherwise the caller must call [`Xget::start`].
    pub fn new(url: impl Into<String>, options: XgetOptions) -> Result<Self> {
        options.validate()?;
        let client = segment_source::build_client(Duration::from_millis(options.timeout_ms))?;
        let (events_tx, _rx) = events::channel();
        let (output_tx, output_rx) = mpsc::channel(32);

        let shared = Arc::new(Shared {
            url: url.into(),
            options,
            client,
            cancel: CancellationToken::new(),
            events_tx,
            state: Mutex::new(LifecycleState::Constructed),
            registry: Mutex::new(MiddlewareRegistry::new()),
            head_handler: Mutex::new(None),
            started: AtomicBool::new(false),
            requested: AtomicBool::new(false),
            requested_notify: Notify::new(),
            load_data: Mutex::new(None),
            hasher: Mutex::new(None),
            buffer: Mutex::new(None),
            err_context: Mutex::new(None),
            destroy_pending: Mutex::new(None),
        });

        let xget = Xget {
            shared,
            deferred_tx: Mutex::new(None),
            output_rx: Mutex::new(Some(output_rx)),
        };

        if xget.shared.options.auto {
            xget.spawn_run(output_tx);
        } else {
            *xget.deferred_tx.lock().expect("deferred_tx lock poisoned") = Some(output_tx);
        }
        Ok(xget)
    }

    /// Subscribe to lifecycle events. Each subscriber gets its own receiver;
    /// attach before the first `await` point after construction so `loaded`
    /// isn't missed.
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.events_tx.subscribe()
    }

    /// Register a per-segment transformer factory. Errors if the instance
    /// has already left `Constructed`.
    pub fn use_transformer(&self, tag: impl Into<String>, factory: TransformerFactory) -> Result<()> {
        if self.shared.state() != LifecycleState::Constructed {
            return Err(XgetError::AlreadyLoaded);
        }
        self.shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .use_transformer(tag, factory);
        Ok(())
    }

    /// Register a store-populating `with` hook. Errors if the instance has
    /// already left `Constructed`.
    pub fn with(&self, tag: impl Into<String>, hook: WithFn) -> Result<()> {
        if self.shared.state() != LifecycleState::Constructed {
            return Err(XgetError::AlreadyLoaded);
        }
        self.shared
            .registry
            .lock()
            .expect("registry lock poisoned")
            .with(tag, hook);
        Ok(())
    }

    /// Replace the probe interceptor. Returns `false` once the probe has
    /// already started (too late to matter).
    pub fn set_head_handler(&self, handler: HeadHandlerFn) -> bool {
        if self.shared.state() != LifecycleState::Constructed {
            return false;
        }
        *self.shared.head_handler.lock().expect("head_handler lock poisoned") = Some(handler);
        true
    }

    /// Begin probing when `auto = false`. No-op (returns `false`) if already
    /// started.
    pub fn start(&self) -> bool {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let tx = self.deferred_tx.lock().expect("deferred_tx lock poisoned").take();
        if let Some(tx) = tx {
            self.spawn_run(tx);
        }
        true
    }

    fn spawn_run(&self, output_tx: mpsc::Sender<OutputItem>) {
        self.shared.started.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            match run(shared.clone(), output_tx.clone()).await {
                Ok(()) => {}
                Err(XgetError::Destroyed) => {
                    // A destroy with no cause: state is already Destroyed
                    // (set inside `run`); stay quiet.
                }
                Err(err) => {
                    let context = shared.err_context.lock().expect("err_context lock poisoned").clone();
                    shared.set_state(LifecycleState::Errored);
                    let _ = output_tx.send(OutputItem::Error(err.clone())).await;
                    let _ = shared.events_tx.send(XgetEvent::Error {
                        message: err.to_string(),
                        context,
                    });
                }
            }
        });
    }

    /// Drive the fetch to completion, writing reassembled (and, if
    /// configured, hashed) bytes to `sink` in order. Marks this the "first
    /// pull": segment dispatch will not begin until this has been
    /// called at least once AND the probe has completed.
    pub async fn pipe<W: AsyncWrite + Unpin>(&self, mut sink: W) -> Result<()> {
        self.mark_requested();
        let mut rx = self
            .output_rx
            .lock()
            .expect("output_rx lock poisoned")
            .take()
            .ok_or(XgetError::Destroyed)?;

        while let Some(item) = rx.recv().await {
            match item {
                OutputItem::Chunk(chunk) => {
                    sink.write_all(&chunk).await.map_err(XgetError::from)?;
                }
                OutputItem::Error(err) => return Err(err),
            }
        }
        sink.flush().await.map_err(XgetError::from)?;
        Ok(())
    }

    fn mark_requested(&self) {
        self.shared.requested.store(true, Ordering::SeqCst);
        self.shared.requested_notify.notify_waiters();
    }

    /// Drive the fetch to completion the same way [`Xget::pipe`] does, but
    /// hand back a [`tokio::io::AsyncRead`] instead of writing into a
    /// caller-supplied sink — e.g. for `tokio::io::copy`. Mutually exclusive
    /// with `pipe`: whichever is called first claims the one output channel.
    pub fn into_async_read(&self) -> Result<XgetReader> {
        self.mark_requested();
        let rx = self
            .output_rx
            .lock()
            .expect("output_rx lock poisoned")
            .take()
            .ok_or(XgetError::Destroyed)?;
        Ok(XgetReader {
            rx,
            pending: Bytes::new(),
        })
    }

    /// Resize the reassembly buffer's capacity. Already-admitted bytes are
    /// never evicted; lowering below the current load just lets the buffer
    /// drain naturally as the consumer reads. Errors if the fetch hasn't
    /// reached `Loaded` yet (no buffer exists), or if `n` exceeds total
    /// physical memory.
    pub fn set_cache_size(&self, n: u64) -> Result<()> {
        let buffer = self
            .shared
            .buffer
            .lock()
            .expect("buffer lock poisoned")
            .clone()
            .ok_or_else(|| XgetError::InvalidOption("cache not yet initialized".to_string()))?;
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        buffer.set_capacity(n, system.total_memory())
    }

    /// Snapshot of the running (or final) digest, hex-encoded. `None` if no
    /// `hash` algorithm was configured.
    pub fn get_hash(&self) -> Option<String> {
        self.shared
            .hasher
            .lock()
            .expect("hasher lock poisoned")
            .as_ref()
            .map(|h| h.hex_digest())
    }

    /// Raw digest bytes of everything hashed so far. `None` if no `hash`
    /// algorithm was configured.
    pub fn get_hash_bytes(&self) -> Option<Vec<u8>> {
        self.shared
            .hasher
            .lock()
            .expect("hasher lock poisoned")
            .as_ref()
            .map(|h| h.raw_digest())
    }

    /// Extract the `{tag, source}` annotation for an error previously
    /// surfaced by this instance, if it originated in user middleware.
    pub fn err_context(&self) -> Option<ErrContext> {
        self.shared.err_context.lock().expect("err_context lock poisoned").clone()
    }

    /// Probe result, once available.
    pub fn load_data(&self) -> Option<Arc<LoadData>> {
        self.shared.load_data.lock().expect("load_data lock poisoned").clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.shared.state()
    }

    /// Abort every in-flight segment and terminate the instance. If called
    /// before `loaded`, execution is deferred until the probe completes so
    /// segment objects exist to be torn down.
    pub fn destroy(&self, cause: Option<XgetError>) {
        let state = self.shared.state();
        match state {
            LifecycleState::Destroyed | LifecycleState::Errored | LifecycleState::Ended => {}
            LifecycleState::Constructed | LifecycleState::Probing | LifecycleState::Loaded => {
                *self.shared.destroy_pending.lock().expect("destroy_pending lock poisoned") = Some(cause);
                self.shared.requested_notify.notify_waiters();
            }
            LifecycleState::Running => {
                self.shared.cancel.cancel();
                self.shared.set_state(LifecycleState::Destroyed);
                if let Some(cause) = cause {
                    let _ = self.shared.events_tx.send(XgetEvent::Error {
                        message: cause.to_string(),
                        context: None,
                    });
                }
            }
        }
    }
}

async fn run(shared: Arc<Shared>, output_tx: mpsc::Sender<OutputItem>) -> Result<()> {
    shared.set_state(LifecycleState::Probing);

    let probe = MetadataProbe::new(Duration::from_millis(shared.options.timeout_ms), shared.options.retries)?;
    let outcome = probe.probe(&shared.url, &shared.events_tx).await?;

    let configured_start = shared.options.start;
    let head_slice = HeaderSlice {
        chunks: shared.options.chunks,
        headers: outcome.headers.clone(),
        total_size: outcome.total_size,
        accepts_ranges: outcome.chunkable,
    };
    let override_start = shared
        .head_handler
        .lock()
        .expect("head_handler lock poisoned")
        .as_ref()
        .and_then(|handler| handler(&head_slice));

    let start = if !outcome.chunkable { 0 } else { override_start.unwrap_or(configured_start) };

    let size = range_planner::effective_size(start, outcome.total_size)?;
    let chunk_count =
        range_planner::resolve_chunk_count(shared.options.chunks, size.unwrap_or(0), outcome.chunkable);
    let plan = range_planner::plan(start, size, chunk_count)?;

    let load_data = Arc::new(LoadData {
        url: shared.url.clone(),
        size,
        start,
        total_size: outcome.total_size,
        chunkable: outcome.chunkable,
        headers: outcome.headers.clone(),
        plan: plan.clone(),
    });
    *shared.load_data.lock().expect("load_data lock poisoned") = Some(load_data.clone());
    let _ = shared.events_tx.send(XgetEvent::Loaded(load_data.clone()));
    shared.set_state(LifecycleState::Loaded);

    if let Some(destroy) = take_deferred_destroy(&shared) {
        return Err(finish_destroyed(&shared, destroy));
    }

    let registry_snapshot = {
        let mut registry = shared.registry.lock().expect("registry lock poisoned");
        std::mem::take(&mut *registry)
    };
    let store = registry_snapshot.build_store(&load_data).map_err(|e| annotate(&shared, e))?;
    let _ = shared.events_tx.send(XgetEvent::Set);

    if plan.is_empty() {
        shared.set_state(LifecycleState::Ended);
        let _ = shared.events_tx.send(XgetEvent::End);
        return Ok(());
    }

    shared.wait_for_first_pull().await;
    if let Some(destroy) = take_deferred_destroy(&shared) {
        return Err(finish_destroyed(&shared, destroy));
    }

    shared.set_state(LifecycleState::Running);

    let hasher = match &shared.options.hash {
        Some(algo) => Some(Arc::new(HasherTap::new(algo)?)),
        None => None,
    };
    *shared.hasher.lock().expect("hasher lock poisoned") = hasher.clone();

    let buffer = if shared.options.cache {
        Arc::new(ReassemblyBuffer::new(
            plan.len(),
            shared.options.cache_size,
            shared.options.reallocate,
            shared.options.nowarn,
        ))
    } else {
        Arc::new(ReassemblyBuffer::unbounded(plan.len()))
    };
    *shared.buffer.lock().expect("buffer lock poisoned") = Some(buffer.clone());

    let mut segment_tasks: FuturesUnordered<tokio::task::JoinHandle<Result<()>>> = FuturesUnordered::new();
    for (index, range) in plan.iter().enumerate() {
        let segment_handle = SegmentHandle::new(index, *range);
        let transformers = match registry_snapshot.build_transformers(&segment_handle, &store) {
            Ok(t) => t,
            Err(e) => {
                shared.cancel.cancel();
                drain(&mut segment_tasks).await;
                return Err(annotate(&shared, e));
            }
        };
        let pipeline = TaggedPipeline::new(transformers);
        let source = ResilientSegmentSource::new(
            shared.client.clone(),
            shared.url.clone(),
            index,
            *range,
            shared.options.retries,
            outcome.chunkable,
            shared.cancel.child_token(),
        );
        let buf = buffer.clone();
        let events_tx = shared.events_tx.clone();
        segment_tasks.push(tokio::spawn(run_segment(source, pipeline, buf, index, events_tx)));
    }

    let merge_buffer = buffer.clone();
    let merge_hasher = hasher.clone();
    let merge_tx = output_tx.clone();
    let num_slots = plan.len();
    let merge_handle = tokio::spawn(async move {
        for slot in 0..num_slots {
            loop {
                match merge_buffer.read(slot).await {
                    Some(chunk) => {
                        if let Some(h) = &merge_hasher {
                            h.observe(&chunk);
                        }
                        if merge_tx.send(OutputItem::Chunk(chunk)).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                }
            }
        }
    });

    while let Some(joined) = segment_tasks.next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                shared.cancel.cancel();
                drain(&mut segment_tasks).await;
                merge_handle.abort();
                return Err(annotate(&shared, err));
            }
            Err(join_err) => {
                shared.cancel.cancel();
                drain(&mut segment_tasks).await;
                merge_handle.abort();
                return Err(XgetError::HttpError(format!("segment task panicked: {join_err}")));
            }
        }
    }

    let _ = merge_handle.await;

    shared.set_state(LifecycleState::Ended);
    let _ = shared.events_tx.send(XgetEvent::End);
    Ok(())
}

async fn drain(tasks: &mut FuturesUnordered<tokio::task::JoinHandle<Result<()>>>) {
    while tasks.next().await.is_some() {}
}

fn take_deferred_destroy(shared: &Shared) -> Option<DestroyRequest> {
    shared.destroy_pending.lock().expect("destroy_pending lock poisoned").take()
}

fn finish_destroyed(shared: &Shared, cause: DestroyRequest) -> XgetError {
    shared.set_state(LifecycleState::Destroyed);
    cause.unwrap_or(XgetError::Destroyed)
}

fn annotate(shared: &Shared, err: XgetError) -> XgetError {
    let context = match &err {
        XgetError::TransformError { tag, .. } => Some(ErrContext {
            raw: err.clone(),
            tag: tag.clone(),
            source: ErrorSource::Transform,
        }),
        XgetError::MiddlewareError { tag, .. } => Some(ErrContext {
            raw: err.clone(),
            tag: tag.clone(),
            source: ErrorSource::Middleware,
        }),
        _ => None,
    };
    if let Some(context) = context {
        *shared.err_context.lock().expect("err_context lock poisoned") = Some(context);
    }
    err
}

/// Admit `chunk` into `buffer`, but give up the moment `cancel` fires. Without
/// this race, a segment that already pulled its next chunk before the
/// orchestrator aborted the merge task (see `run`'s error paths) could block
/// on a full buffer whose only reader just disappeared.
async fn write_or_cancel(
    buffer: &ReassemblyBuffer,
    cancel: &CancellationToken,
    index: usize,
    chunk: Option<Bytes>,
) -> Result<()> {
    tokio::select! {
        _ = buffer.write(index, chunk) => Ok(()),
        _ = cancel.cancelled() => Err(XgetError::Destroyed),
    }
}

/// The `AsyncRead` counterpart to [`Xget::pipe`], returned by
/// [`Xget::into_async_read`]. Pulls reassembled (and hashed, if configured)
/// chunks off the same output channel `pipe` would have drained.
pub struct XgetReader {
    rx: mpsc::Receiver<OutputItem>,
    pending: Bytes,
}

impl AsyncRead for XgetReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(OutputItem::Chunk(chunk))) => {
                    this.pending = chunk;
                }
                Poll::Ready(Some(OutputItem::Error(err))) => {
                    return Poll::Ready(Err(std::io::Error::other(err.to_string())));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

async fn run_segment(
    mut source: ResilientSegmentSource,
    mut pipeline: TaggedPipeline,
    buffer: Arc<ReassemblyBuffer>,
    index: usize,
    events: EventSender,
) -> Result<()> {
    let cancel = source.cancel_token();
    loop {
        match source.next(&events).await {
            Ok(SourceEvent::Chunk(chunk)) => {
                let transformed = pipeline.process(chunk).await?;
                write_or_cancel(&buffer, &cancel, index, Some(transformed)).await?;
            }
            Ok(SourceEvent::End) => {
                for trailing in pipeline.finish().await? {
                    write_or_cancel(&buffer, &cancel, index, Some(trailing)).await?;
                }
                write_or_cancel(&buffer, &cancel, index, None).await?;
                info!("segment {index} complete");
                return Ok(());
            }
            Err(err) => {
                debug!("segment {index} terminating with error: {err}");
                error!("segment {index} failed: {err}");
                return Err(err);
            }
        }
    }
}
