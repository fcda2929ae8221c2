//! Fixed-ratio sample-rate conversion for the ingest path.
//!
//! Capture devices usually run at 44.1 or 48 kHz while recognizers expect
//! 16 kHz. Equal rates skip rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, warn};

use crate::error::{CadenceError, Result};

/// rubato state for a non-trivial ratio.
struct Stage {
    rubato: FastFixedIn<f32>,
    /// Input frames rubato consumes per call.
    block: usize,
    /// Samples waiting for a complete block.
    pending: Vec<f32>,
    /// Single-channel output scratch, sized to `output_frames_max`.
    scratch: Vec<Vec<f32>>,
}

impl Stage {
    fn run_block(&mut self, out: &mut Vec<f32>) {
        let produced = {
            let block = &self.pending[..self.block];
            self.rubato.process_into_buffer(&[block], &mut self.scratch, None)
        };
        match produced {
            Ok((_, n)) => out.extend_from_slice(&self.scratch[0][..n]),
            Err(e) => warn!(block = self.block, "dropping resampler block: {e}"),
        }
        self.pending.drain(..self.block);
    }
}

/// Mono f32 converter between two fixed rates.
pub struct RateConverter {
    from_hz: u32,
    to_hz: u32,
    stage: Option<Stage>,
}

impl RateConverter {
    /// `block` is the number of input frames handed to rubato at a time.
    ///
    /// # Errors
    /// `AudioFormat` for a zero rate or a ratio rubato cannot handle.
    pub fn new(from_hz: u32, to_hz: u32, block: usize) -> Result<Self> {
        if from_hz == 0 || to_hz == 0 {
            return Err(CadenceError::AudioFormat(format!(
                "cannot convert {from_hz} Hz to {to_hz} Hz"
            )));
        }
        if from_hz == to_hz {
            return Ok(Self {
                from_hz,
                to_hz,
                stage: None,
            });
        }

        let block = block.max(1);
        let rubato = FastFixedIn::<f32>::new(
            f64::from(to_hz) / f64::from(from_hz),
            1.0,
            PolynomialDegree::Cubic,
            block,
            1,
        )
        .map_err(|e| CadenceError::AudioFormat(format!("resampler setup failed: {e}")))?;
        let scratch = vec![vec![0.0; rubato.output_frames_max()]];
        debug!(from_hz, to_hz, block, "rate converter ready");

        Ok(Self {
            from_hz,
            to_hz,
            stage: Some(Stage {
                rubato,
                block,
                pending: Vec::with_capacity(block * 2),
                scratch,
            }),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.from_hz
    }

    pub fn output_rate(&self) -> u32 {
        self.to_hz
    }

    pub fn is_passthrough(&self) -> bool {
        self.stage.is_none()
    }

    /// Append converted audio to `out`. Samples short of a full block stay
    /// queued for the next call or [`flush_into`](Self::flush_into).
    pub fn process_into(&mut self, samples: &[f32], out: &mut Vec<f32>) {
        match self.stage.as_mut() {
            None => out.extend_from_slice(samples),
            Some(stage) => {
                stage.pending.extend_from_slice(samples);
                while stage.pending.len() >= stage.block {
                    stage.run_block(out);
                }
            }
        }
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(samples.len());
        self.process_into(samples, &mut out);
        out
    }

    /// Drain the queued remainder, trimmed to the length the real input maps
    /// to (rubato zero-pads the partial block).
    pub fn flush_into(&mut self, out: &mut Vec<f32>) {
        let (from_hz, to_hz) = (self.from_hz, self.to_hz);
        let Some(stage) = self.stage.as_mut() else {
            return;
        };
        if stage.pending.is_empty() {
            return;
        }

        let queued = stage.pending.len();
        let keep = (queued as u64 * u64::from(to_hz)).div_ceil(u64::from(from_hz)) as usize;
        let result = stage.rubato.process_partial_into_buffer(
            Some(&[stage.pending.as_slice()]),
            &mut stage.scratch,
            None,
        );
        match result {
            Ok((_, n)) => out.extend_from_slice(&stage.scratch[0][..n.min(keep)]),
            Err(e) => warn!(queued, "resampler flush failed: {e}"),
        }
        stage.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_rates_copy_input_through() {
        let mut conv = RateConverter::new(16_000, 16_000, 1_024).unwrap();
        assert!(conv.is_passthrough());
        let ramp: Vec<f32> = (0..300).map(|i| i as f32 / 300.0).collect();
        assert_eq!(conv.process(&ramp), ramp);
    }

    #[test]
    fn downsampling_by_three_yields_a_third() {
        let mut conv = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert_eq!(conv.output_rate(), 16_000);
        let out = conv.process(&[0.25; 960]);
        assert!(out.len().abs_diff(320) <= 10, "got {} samples", out.len());
    }

    #[test]
    fn short_input_waits_for_flush() {
        let mut conv = RateConverter::new(48_000, 16_000, 960).unwrap();
        assert!(conv.process(&[0.0; 500]).is_empty());

        let mut tail = Vec::new();
        conv.flush_into(&mut tail);
        assert!(!tail.is_empty());
        assert!(tail.len() <= 167, "flush emitted {} samples", tail.len());

        // Nothing left after a flush.
        let mut again = Vec::new();
        conv.flush_into(&mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn zero_rate_is_an_audio_format_error() {
        assert!(matches!(
            RateConverter::new(44_100, 0, 512),
            Err(CadenceError::AudioFormat(_))
        ));
    }
}
