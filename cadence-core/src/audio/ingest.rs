//! Producer-side conversion: arbitrary PCM in, engine-rate s16le chunks out.

use tracing::{debug, warn};

use super::format::{decode_to_mono, encode_s16le, PcmFormat};
use super::resample::RateConverter;
use super::ENGINE_SAMPLE_RATE;
use crate::buffering::{AudioChunk, ChannelMonitor, ChunkProducer};
use crate::error::{CadenceError, Result};
use crate::ipc::{events::NotificationSource, Notifier};

/// Input frames handed to rubato per process call.
const RESAMPLE_BLOCK: usize = 1_024;

/// Outcome of one ingest call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
}

impl IngestReport {
    fn add(&mut self, pushed: bool) {
        if pushed {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
    }
}

/// Wraps the channel producer with decoding, down-mixing, resampling and
/// chunk packing. Owned by the capture side.
pub struct AudioIngest {
    producer: ChunkProducer,
    notifier: Notifier,
    converter: Option<RateConverter>,
    /// Bytes of an incomplete frame from the previous `push_pcm`.
    carry: Vec<u8>,
    mono: Vec<f32>,
    resampled: Vec<f32>,
    encoded: Vec<u8>,
    /// Chunk being filled; pushed once full or on flush.
    open: Option<AudioChunk>,
    last_format: Option<PcmFormat>,
}

impl AudioIngest {
    pub fn new(producer: ChunkProducer, notifier: Notifier) -> Self {
        Self {
            producer,
            notifier,
            converter: None,
            carry: Vec::new(),
            mono: Vec::new(),
            resampled: Vec::new(),
            encoded: Vec::new(),
            open: None,
            last_format: None,
        }
    }

    pub fn monitor(&self) -> ChannelMonitor {
        self.producer.monitor()
    }

    /// Decode interleaved PCM bytes and enqueue them.
    ///
    /// A format error is notified and returned; the channel stays usable
    /// for subsequent calls.
    pub fn push_pcm(&mut self, bytes: &[u8], format: PcmFormat) -> Result<IngestReport> {
        if let Err(e) = format.validate() {
            self.notifier
                .error(NotificationSource::Ingest, format!("dropping audio: {e}"));
            return Err(e);
        }
        if self.last_format != Some(format) {
            // Partial frames of a different layout are meaningless.
            self.carry.clear();
            self.last_format = Some(format);
        }

        let mut mono = std::mem::take(&mut self.mono);
        mono.clear();
        let consumed = if self.carry.is_empty() {
            let n = decode_to_mono(bytes, format, &mut mono);
            self.carry.extend_from_slice(&bytes[n..]);
            n
        } else {
            let mut joined = std::mem::take(&mut self.carry);
            joined.extend_from_slice(bytes);
            let n = decode_to_mono(&joined, format, &mut mono);
            self.carry.extend_from_slice(&joined[n..]);
            n
        };
        debug!(consumed, carried = self.carry.len(), "pcm decoded");

        let report = self.push_samples(&mono, format.sample_rate);
        self.mono = mono;
        report
    }

    /// Enqueue mono f32 samples captured at `sample_rate`.
    pub fn push_samples(&mut self, samples: &[f32], sample_rate: u32) -> Result<IngestReport> {
        self.ensure_converter(sample_rate)?;

        let mut resampled = std::mem::take(&mut self.resampled);
        resampled.clear();
        if let Some(conv) = self.converter.as_mut() {
            conv.process_into(samples, &mut resampled);
        }
        let report = self.pack(&resampled);
        self.resampled = resampled;
        report
    }

    /// Enqueue an already formatted chunk (engine-rate mono s16le).
    pub fn push_chunk(&mut self, chunk: AudioChunk) -> Result<()> {
        self.producer.try_push(chunk)
    }

    /// An empty chunk from the producer's recycle pool.
    pub fn acquire(&mut self) -> AudioChunk {
        self.producer.acquire()
    }

    /// Drain the resampler and push the partially filled chunk, if any.
    pub fn flush(&mut self) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if let Some(conv) = self.converter.as_mut() {
            let mut tail = Vec::new();
            conv.flush_into(&mut tail);
            report = self.pack(&tail)?;
        }
        if let Some(chunk) = self.open.take() {
            if !chunk.is_empty() {
                report.add(self.push_or_fail(chunk)?);
            }
        }
        Ok(report)
    }

    fn ensure_converter(&mut self, sample_rate: u32) -> Result<()> {
        if self
            .converter
            .as_ref()
            .is_some_and(|c| c.input_rate() == sample_rate)
        {
            return Ok(());
        }

        if let Some(mut old) = self.converter.take() {
            let mut tail = Vec::new();
            old.flush_into(&mut tail);
            warn!(
                from = old.input_rate(),
                to = sample_rate,
                "capture rate changed mid-stream"
            );
            self.pack(&tail)?;
        }

        match RateConverter::new(sample_rate, ENGINE_SAMPLE_RATE, RESAMPLE_BLOCK) {
            Ok(conv) => {
                self.converter = Some(conv);
                Ok(())
            }
            Err(e) => {
                self.notifier
                    .error(NotificationSource::Ingest, format!("dropping audio: {e}"));
                Err(e)
            }
        }
    }

    fn pack(&mut self, samples: &[f32]) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        if samples.is_empty() {
            return Ok(report);
        }

        let mut encoded = std::mem::take(&mut self.encoded);
        encoded.clear();
        encode_s16le(samples, &mut encoded);

        let mut rest = &encoded[..];
        let mut outcome = Ok(());
        while !rest.is_empty() {
            let mut chunk = match self.open.take() {
                Some(c) => c,
                None => self.producer.acquire(),
            };
            let n = chunk.fill_from(rest);
            rest = &rest[n..];
            if chunk.is_full() {
                match self.push_or_fail(chunk) {
                    Ok(pushed) => report.add(pushed),
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            } else {
                self.open = Some(chunk);
            }
        }

        self.encoded = encoded;
        outcome.map(|()| report)
    }

    /// `Ok(false)` for a backpressure rejection, `Err` when the channel is gone.
    fn push_or_fail(&mut self, chunk: AudioChunk) -> Result<bool> {
        match self.producer.try_push(chunk) {
            Ok(()) => Ok(true),
            Err(CadenceError::CapacityExceeded { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
