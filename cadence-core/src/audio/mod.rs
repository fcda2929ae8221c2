//! Audio on the producer side of the ingestion channel.
//!
//! ```text
//! PCM bytes / cpal callback ─► decode + down-mix ─► RateConverter ─► s16le chunks ─► channel
//! ```
//!
//! Everything here runs on the capture thread; the recognizer only ever
//! sees engine-rate mono s16le.

pub mod capture;
pub mod format;
pub mod ingest;
pub mod resample;

pub use capture::AudioCapture;
pub use format::{PcmFormat, SampleEncoding};
pub use ingest::{AudioIngest, IngestReport};
pub use resample::RateConverter;

/// Sample rate every recognition engine consumes.
pub const ENGINE_SAMPLE_RATE: u32 = 16_000;

/// Bytes per engine-rate sample (mono s16le).
pub const ENGINE_SAMPLE_BYTES: usize = 2;
