//! Live microphone source via cpal (feature `audio-cpal`).
//!
//! The cpal input callback runs on an OS audio thread. It converts the
//! device buffer to mono f32 and hands it to [`AudioIngest`], whose scratch
//! vectors are reused across callbacks and whose push never blocks.
//!
//! `cpal::Stream` is `!Send` on most platforms, so `AudioCapture` must be
//! created and dropped on the same thread.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use super::ingest::AudioIngest;
use crate::error::{CadenceError, Result};

/// Handle to an active capture stream.
pub struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    running: Arc<AtomicBool>,
    /// Rate reported by the device (Hz).
    pub sample_rate: u32,
}

#[cfg(feature = "audio-cpal")]
impl AudioCapture {
    /// Open the named input device, else the default one, and stream into
    /// `ingest` while `running` is set.
    pub fn open(
        ingest: AudioIngest,
        running: Arc<AtomicBool>,
        preferred_device: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::{SampleFormat, SampleRate, StreamConfig};
        use parking_lot::Mutex;
        use tracing::{error, info, warn};

        let host = cpal::default_host();
        let preferred = preferred_device.and_then(|want| {
            let found = host
                .input_devices()
                .ok()
                .and_then(|mut devices| devices.find(|d| d.name().is_ok_and(|n| n == want)));
            if found.is_none() {
                warn!(device = want, "preferred input device not found, using default");
            }
            found
        });
        let device = match preferred {
            Some(d) => d,
            None => host
                .default_input_device()
                .ok_or_else(|| CadenceError::AudioFormat("no input device available".into()))?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| CadenceError::AudioFormat(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels,
            "opening input device"
        );

        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Shared between the per-format closures; only one is ever built.
        let ingest = Arc::new(Mutex::new(ingest));

        fn forward<T: Copy>(
            data: &[T],
            channels: usize,
            to_f32: impl Fn(T) -> f32,
            mix: &mut Vec<f32>,
            ingest: &Mutex<AudioIngest>,
            sample_rate: u32,
        ) {
            let frames = data.len() / channels;
            mix.clear();
            mix.extend((0..frames).map(|f| {
                let base = f * channels;
                data[base..base + channels].iter().map(|&s| to_f32(s)).sum::<f32>() / channels as f32
            }));
            // try_lock: never stall the audio thread.
            if let Some(mut ing) = ingest.try_lock() {
                if let Err(e) = ing.push_samples(mix, sample_rate) {
                    error!("capture push failed: {e}");
                }
            }
        }

        let on_err = |err: cpal::StreamError| error!("audio stream error: {err}");
        let flag = Arc::clone(&running);
        let sink = Arc::clone(&ingest);
        let mut mix = Vec::new();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _| {
                    if flag.load(Ordering::Relaxed) {
                        forward(data, channels, |s| s, &mut mix, &sink, sample_rate);
                    }
                },
                on_err,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    if flag.load(Ordering::Relaxed) {
                        forward(data, channels, |s| s as f32 / 32768.0, &mut mix, &sink, sample_rate);
                    }
                },
                on_err,
                None,
            ),
            SampleFormat::U8 => device.build_input_stream(
                &config,
                move |data: &[u8], _| {
                    if flag.load(Ordering::Relaxed) {
                        forward(
                            data,
                            channels,
                            |s| (s as f32 - 128.0) / 128.0,
                            &mut mix,
                            &sink,
                            sample_rate,
                        );
                    }
                },
                on_err,
                None,
            ),
            fmt => {
                return Err(CadenceError::AudioFormat(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| CadenceError::AudioFormat(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CadenceError::AudioFormat(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            running,
            sample_rate,
        })
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl AudioCapture {
    pub fn open(
        _ingest: AudioIngest,
        _running: Arc<AtomicBool>,
        _preferred_device: Option<&str>,
    ) -> Result<Self> {
        Err(CadenceError::AudioFormat(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

impl AudioCapture {
    /// Signal the callback to no-op from its next invocation.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
