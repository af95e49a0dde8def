//! Ordered reassembly buffer
//!
//! The capacity-bounded merge point between N segment producers and one
//! consumer. Segments may fetch ahead of the consumer, but the combined
//! output is always the concatenation of segment 0, 1, …, N-1 in that
//! order; the buffer itself is a staging area, not a reorderer — the
//! merging consumer (in `orchestrator.rs`) enforces index order by reading
//! slot 0 to completion before moving to slot 1.
//!
//! This is the hardest subsystem in the engine: the *admit* operation's
//! true precondition is `capacity_available OR reader_ready_for_this_slot`,
//! because without the bypass a full buffer and a stalled slot-0 reader
//! would deadlock every other segment behind it.

use crate::error::{Result, XgetError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Default buffer capacity: 200 MiB.
pub const DEFAULT_CAPACITY: u64 = 200 * 1024 * 1024;

struct AdmitEntry {
    slot: usize,
    /// `None` is the end-of-stream sentinel; it consumes zero capacity.
    chunk: Option<Bytes>,
    completion: oneshot::Sender<()>,
}

#[derive(Default)]
struct SlotState {
    buffer: VecDeque<Option<Bytes>>,
    pending_writes: usize,
    pending_reads: usize,
}

struct Inner {
    max_capacity: u64,
    length: u64,
    slots: Vec<SlotState>,
    admit_queue: VecDeque<AdmitEntry>,
    pending_readers: Vec<VecDeque<oneshot::Sender<Option<Bytes>>>>,
    reallocate: bool,
    peak_length: u64,
    total_computed: u128,
    tick_index: u64,
}

impl Inner {
    fn write(&mut self, slot: usize, chunk: Option<Bytes>) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let bypass =
            self.slots[slot].pending_writes == 0 && self.slots[slot].pending_reads > 0;
        if bypass {
            self.slots[slot].pending_reads -= 1;
            let reader = self.pending_readers[slot]
                .pop_front()
                .expect("pending_reads counter out of sync with waiting readers");
            let _ = reader.send(chunk);
            let _ = tx.send(());
        } else {
            self.slots[slot].pending_writes += 1;
            self.admit_queue.push_back(AdmitEntry {
                slot,
                chunk,
                completion: tx,
            });
            self.dispatch();
        }
        rx
    }

    /// Walk the admit queue front to back, admitting whatever fits and
    /// bypassing directly to a waiting reader when the store is full.
    fn dispatch(&mut self) {
        let mut i = 0;
        while i < self.admit_queue.len() {
            let slot = self.admit_queue[i].slot;

            if self.length >= self.max_capacity {
                if self.slots[slot].pending_reads > 0 {
                    let entry = self.admit_queue.remove(i).unwrap();
                    self.deliver_to_reader(entry.slot, entry.chunk);
                    self.slots[entry.slot].pending_writes -= 1;
                    let _ = entry.completion.send(());
                    // queue shifted left; revisit index i
                } else {
                    i += 1;
                }
                continue;
            }

            let avail = self.max_capacity - self.length;
            let chunk_len = self.admit_queue[i]
                .chunk
                .as_ref()
                .map(|c| c.len() as u64)
                .unwrap_or(0);

            if chunk_len <= avail {
                let entry = self.admit_queue.remove(i).unwrap();
                if let Some(chunk) = &entry.chunk {
                    self.length += chunk.len() as u64;
                }
                self.slots[entry.slot].pending_writes -= 1;
                self.slots[entry.slot].buffer.push_back(entry.chunk);
                self.tick();
                self.try_satisfy_reader(entry.slot);
                let _ = entry.completion.send(());
                continue;
            }

            // chunk_len > avail > 0: split into head (admitted now) and
            // tail (requeued, completion deferred).
            let avail_usize = avail as usize;
            let chunk = self.admit_queue[i]
                .chunk
                .take()
                .expect("split only applies to a real chunk, never the sentinel");
            let head = chunk.slice(0..avail_usize);
            let tail = chunk.slice(avail_usize..);
            self.slots[slot].buffer.push_back(Some(head));
            self.length += avail;
            self.tick();

            if self.reallocate {
                let mut removed = self.admit_queue.remove(i).unwrap();
                removed.chunk = Some(tail);
                self.admit_queue.push_back(removed);
                // don't advance i: the next entry has shifted into position i
            } else {
                self.admit_queue[i].chunk = Some(tail);
                i += 1;
            }
            self.try_satisfy_reader(slot);
        }
    }

    fn try_satisfy_reader(&mut self, slot: usize) {
        while self.slots[slot].pending_reads > 0 {
            let Some(item) = self.slots[slot].buffer.pop_front() else {
                break;
            };
            if let Some(chunk) = &item {
                self.length -= chunk.len() as u64;
            }
            self.slots[slot].pending_reads -= 1;
            let reader = self.pending_readers[slot]
                .pop_front()
                .expect("pending_reads counter out of sync with waiting readers");
            let _ = reader.send(item);
            self.tick();
        }
    }

    fn deliver_to_reader(&mut self, slot: usize, chunk: Option<Bytes>) {
        self.slots[slot].pending_reads -= 1;
        let reader = self.pending_readers[slot]
            .pop_front()
            .expect("pending_reads counter out of sync with waiting readers");
        let _ = reader.send(chunk);
    }

    fn tick(&mut self) {
        self.peak_length = self.peak_length.max(self.length);
        self.total_computed += u128::from(self.length);
        self.tick_index += 1;
    }
}

/// Point-in-time capacity metrics, mirroring the source's `max`/`average`
/// tracking.
#[derive(Debug, Clone, Copy)]
pub struct BufferMetrics {
    pub current: u64,
    pub peak: u64,
    pub average: f64,
}

/// The shared, capacity-bounded, per-slot FIFO staging area.
pub struct ReassemblyBuffer {
    inner: Mutex<Inner>,
    nowarn: bool,
}

impl ReassemblyBuffer {
    pub fn new(num_slots: usize, max_capacity: u64, reallocate: bool, nowarn: bool) -> Self {
        ReassemblyBuffer {
            inner: Mutex::new(Inner {
                max_capacity,
                length: 0,
                slots: (0..num_slots).map(|_| SlotState::default()).collect(),
                admit_queue: VecDeque::new(),
                pending_readers: (0..num_slots).map(|_| VecDeque::new()).collect(),
                reallocate,
                peak_length: 0,
                total_computed: 0,
                tick_index: 0,
            }),
            nowarn,
        }
    }

    /// A buffer with effectively unlimited capacity: every write admits
    /// immediately. Used when the caller disables the reassembly buffer
    /// (`cache = false`) — the ordering and sentinel machinery is identical,
    /// only backpressure is disabled.
    pub fn unbounded(num_slots: usize) -> Self {
        Self::new(num_slots, u64::MAX, false, true)
    }

    /// Admit `chunk` (or the end-of-stream sentinel, `None`) into `slot`.
    /// Resolves once the chunk has been fully admitted (possibly after one
    /// or more splits), applying backpressure to the caller for as long as
    /// the buffer stays full and the consumer isn't draining this slot.
    pub async fn write(&self, slot: usize, chunk: Option<Bytes>) {
        let rx = {
            let mut inner = self.inner.lock().expect("reassembly buffer lock poisoned");
            inner.write(slot, chunk)
        };
        let _ = rx.await;
    }

    /// Read the next chunk from `slot`, or `None` once that slot's
    /// end-of-stream sentinel has been consumed.
    pub async fn read(&self, slot: usize) -> Option<Bytes> {
        enum Outcome {
            Immediate(Option<Bytes>),
            Pending(oneshot::Receiver<Option<Bytes>>),
        }

        let outcome = {
            let mut inner = self.inner.lock().expect("reassembly buffer lock poisoned");
            if let Some(item) = inner.slots[slot].buffer.pop_front() {
                if let Some(chunk) = &item {
                    inner.length -= chunk.len() as u64;
                }
                inner.tick();
                inner.dispatch();
                Outcome::Immediate(item)
            } else {
                let (tx, rx) = oneshot::channel();
                inner.slots[slot].pending_reads += 1;
                inner.pending_readers[slot].push_back(tx);
                inner.dispatch();
                Outcome::Pending(rx)
            }
        };

        match outcome {
            Outcome::Immediate(item) => item,
            Outcome::Pending(rx) => rx.await.unwrap_or(None),
        }
    }

    /// Resize the buffer's capacity. Already-stored chunks are never
    /// evicted — if `n` is lower than the current load, the store drains
    /// naturally as the consumer reads, rather than rejecting or erroring.
    pub fn set_capacity(&self, n: u64, total_physical_memory: u64) -> Result<()> {
        if n > total_physical_memory {
            return Err(XgetError::InvalidOption(format!(
                "requested cache size {n} exceeds total physical memory {total_physical_memory}"
            )));
        }
        #[allow(clippy::cast_precision_loss)]
        if !self.nowarn && (n as f64) > 0.4 * (total_physical_memory as f64) {
            warn!(
                "cache size {n} exceeds 40% of total physical memory ({total_physical_memory})"
            );
        }
        let mut inner = self.inner.lock().expect("reassembly buffer lock poisoned");
        inner.max_capacity = n;
        inner.dispatch();
        Ok(())
    }

    pub fn metrics(&self) -> BufferMetrics {
        let inner = self.inner.lock().expect("reassembly buffer lock poisoned");
        let average = if inner.tick_index > 0 {
            (inner.total_computed / u128::from(inner.tick_index)) as f64
        } else {
            0.0
        };
        BufferMetrics {
            current: inner.length,
            peak: inner.peak_length,
            average,
        }
    }
}
