//! Audio Ingestion Channel: bounded SPSC FIFO of [`AudioChunk`]s.
//!
//! ```text
//! capture thread ──push──► [ chunk | chunk | … ] ──pop(timeout)──► recognizer
//!        ▲                                                            │
//!        └──────────────── recycled (cleared) chunks ◄────────────────┘
//! ```
//!
//! ## Backpressure policy: reject-new
//!
//! `push` never blocks the capture thread. A chunk that would raise the
//! buffered byte total above the ceiling (or find every slot taken) is
//! rejected and dropped; the backlog already queued is left intact so the
//! consumer still sees an unbroken prefix of the stream. The first rejection
//! of an episode emits one warning notification; the episode ends at the
//! next accepted push.
//!
//! Only the producer increases the byte count and it checks before adding,
//! so the ceiling holds at every observation point.
//!
//! Neither half is `Clone`: one producer, one consumer.

pub mod arena;
pub mod chunk;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::error::{CadenceError, Result};
use crate::ipc::{events::NotificationSource, Notifier};

pub use arena::{ScratchArena, SlotId};
pub use chunk::AudioChunk;

/// Default chunk: 100 ms of 16 kHz mono s16le.
pub const DEFAULT_CHUNK_BYTES: usize = 3_200;

/// Default ceiling: 10 s of 16 kHz mono s16le.
pub const DEFAULT_CEILING_BYTES: usize = 320_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Maximum bytes buffered between producer and consumer.
    pub ceiling_bytes: usize,
    /// Capacity of each chunk the producer hands out.
    pub chunk_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: DEFAULT_CEILING_BYTES,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
        }
    }
}

impl ChannelConfig {
    fn normalized(self) -> Self {
        // Even chunk size so s16 samples never straddle two chunks.
        let chunk_bytes = (self.chunk_bytes.max(2) + 1) & !1;
        Self {
            chunk_bytes,
            ceiling_bytes: self.ceiling_bytes.max(chunk_bytes),
        }
    }

    fn max_chunks(&self) -> usize {
        (self.ceiling_bytes / self.chunk_bytes).max(1)
    }
}

struct Shared {
    ceiling: usize,
    buffered: AtomicUsize,
    backpressure: AtomicBool,
    pushed: AtomicUsize,
    rejected: AtomicUsize,
    popped: AtomicUsize,
}

/// Point-in-time channel counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub ceiling_bytes: usize,
    pub buffered_bytes: usize,
    pub pushed: usize,
    pub rejected: usize,
    pub popped: usize,
}

/// Read-only view of the channel, shareable with any thread.
#[derive(Clone)]
pub struct ChannelMonitor {
    shared: Arc<Shared>,
}

impl ChannelMonitor {
    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            ceiling_bytes: self.shared.ceiling,
            buffered_bytes: self.buffered_bytes(),
            pushed: self.shared.pushed.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            popped: self.shared.popped.load(Ordering::Relaxed),
        }
    }
}

/// Producer half, held by the capture side.
pub struct ChunkProducer {
    tx: Sender<AudioChunk>,
    recycled: Receiver<AudioChunk>,
    shared: Arc<Shared>,
    chunk_bytes: usize,
    notifier: Notifier,
}

/// Consumer half, held by the recognition loop.
pub struct ChunkConsumer {
    rx: Receiver<AudioChunk>,
    recycle: Sender<AudioChunk>,
    shared: Arc<Shared>,
}

/// Create a matched producer/consumer pair.
pub fn create_audio_channel(config: ChannelConfig, notifier: Notifier) -> (ChunkProducer, ChunkConsumer) {
    let config = config.normalized();
    let slots = config.max_chunks();
    let (tx, rx) = crossbeam_channel::bounded(slots);
    let (recycle, recycled) = crossbeam_channel::bounded(slots);
    let shared = Arc::new(Shared {
        ceiling: config.ceiling_bytes,
        buffered: AtomicUsize::new(0),
        backpressure: AtomicBool::new(false),
        pushed: AtomicUsize::new(0),
        rejected: AtomicUsize::new(0),
        popped: AtomicUsize::new(0),
    });

    debug!(
        ceiling_bytes = config.ceiling_bytes,
        chunk_bytes = config.chunk_bytes,
        slots,
        "audio channel created"
    );

    (
        ChunkProducer {
            tx,
            recycled,
            shared: Arc::clone(&shared),
            chunk_bytes: config.chunk_bytes,
            notifier,
        },
        ChunkConsumer {
            rx,
            recycle,
            shared,
        },
    )
}

impl ChunkProducer {
    /// Capacity of chunks handed out by [`acquire`](Self::acquire).
    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// An empty chunk, recycled when one is available, freshly allocated
    /// otherwise.
    pub fn acquire(&mut self) -> AudioChunk {
        match self.recycled.try_recv() {
            Ok(mut chunk) if chunk.capacity() == self.chunk_bytes => {
                chunk.clear();
                chunk
            }
            _ => AudioChunk::with_capacity(self.chunk_bytes),
        }
    }

    /// Enqueue a chunk. Returns `false` when it was rejected under
    /// backpressure (the chunk is dropped).
    pub fn push(&mut self, chunk: AudioChunk) -> bool {
        self.try_push(chunk).is_ok()
    }

    /// Enqueue a chunk, reporting why it was rejected.
    pub fn try_push(&mut self, chunk: AudioChunk) -> Result<()> {
        let len = chunk.len();
        let buffered = self.shared.buffered.load(Ordering::Acquire);
        if buffered + len > self.shared.ceiling {
            return Err(self.reject(buffered));
        }

        // Count before sending: the consumer subtracts right after receiving.
        self.shared.buffered.fetch_add(len, Ordering::AcqRel);
        match self.tx.try_send(chunk) {
            Ok(()) => {
                self.shared.pushed.fetch_add(1, Ordering::Relaxed);
                if self.shared.backpressure.swap(false, Ordering::Relaxed) {
                    info!(buffered = buffered + len, "ingest backpressure cleared");
                }
                Ok(())
            }
            Err(TrySendError::Full(_)) => {
                let buffered = self.shared.buffered.fetch_sub(len, Ordering::AcqRel) - len;
                Err(self.reject(buffered))
            }
            Err(TrySendError::Disconnected(_)) => {
                self.shared.buffered.fetch_sub(len, Ordering::AcqRel);
                Err(CadenceError::invalid_state("push audio", "the consumer is gone"))
            }
        }
    }

    pub fn monitor(&self) -> ChannelMonitor {
        ChannelMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    fn reject(&self, buffered: usize) -> CadenceError {
        let rejected = self.shared.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        let ceiling = self.shared.ceiling;
        if !self.shared.backpressure.swap(true, Ordering::Relaxed) {
            warn!(buffered, ceiling, rejected, "ingest backpressure: rejecting new audio");
            self.notifier.warning(
                NotificationSource::Ingest,
                format!("audio backlog at {buffered}/{ceiling} bytes; dropping new audio until the recognizer catches up"),
            );
        } else {
            debug!(buffered, ceiling, rejected, "chunk rejected");
        }
        CadenceError::CapacityExceeded { buffered, ceiling }
    }
}

impl ChunkConsumer {
    /// Wait up to `timeout` for the next chunk.
    pub fn pop(&mut self, timeout: Duration) -> Option<AudioChunk> {
        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => Some(self.account(chunk)),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_pop(&mut self) -> Option<AudioChunk> {
        self.rx.try_recv().ok().map(|c| self.account(c))
    }

    /// Hand a consumed chunk back to the producer for reuse.
    pub fn recycle(&self, mut chunk: AudioChunk) {
        chunk.clear();
        let _ = self.recycle.try_send(chunk);
    }

    /// Discard everything currently buffered; returns the bytes dropped.
    pub fn drain(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(chunk) = self.try_pop() {
            dropped += chunk.len();
            self.recycle(chunk);
        }
        dropped
    }

    pub fn monitor(&self) -> ChannelMonitor {
        ChannelMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    fn account(&self, chunk: AudioChunk) -> AudioChunk {
        self.shared.buffered.fetch_sub(chunk.len(), Ordering::AcqRel);
        self.shared.popped.fetch_add(1, Ordering::Relaxed);
        chunk
    }
}
