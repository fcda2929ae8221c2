//! Deterministic placeholder engines.
//!
//! They do no real inference, but exercise every hook the sessions drive so
//! the host and the test suite can run end-to-end without model weights.

use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{
    validate_model_file, GenerationEngine, GenerationLoader, GenerationModelSpec, ImageEmbedding,
    RecognitionEngine, RecognitionLoader, RecognitionModelSpec, TokenId,
};
use crate::error::{CadenceError, Result};
use crate::vision::Frame;

/// Windows shorter than this (10 ms at 16 kHz) are treated as silence.
const MIN_SAMPLES: usize = 160;

/// Describes each window instead of transcribing it.
pub struct StubRecognizer {
    utterances: u32,
    latency: Duration,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self {
            utterances: 0,
            latency: Duration::ZERO,
        }
    }

    /// Sleep this long per window to mimic decoder cost.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecognitionEngine for StubRecognizer {
    fn transcribe(&mut self, window: &[f32]) -> Result<String> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        if window.len() < MIN_SAMPLES {
            return Ok(String::new());
        }
        self.utterances += 1;
        let rms = (window.iter().map(|s| s * s).sum::<f32>() / window.len() as f32).sqrt();
        Ok(format!(
            "[utterance {}: {} samples, rms {:.3}]",
            self.utterances,
            window.len(),
            rms
        ))
    }

    fn reset(&mut self) {
        debug!("StubRecognizer::reset");
        self.utterances = 0;
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubRecognitionLoader {
    pub latency: Duration,
}

impl RecognitionLoader for StubRecognitionLoader {
    fn load(&self, spec: &RecognitionModelSpec) -> Result<Box<dyn RecognitionEngine>> {
        validate_model_file(&spec.model_path)?;
        debug!(model = %spec.model_path.display(), backend = %spec.backend, "stub recognizer loaded");
        Ok(Box::new(StubRecognizer::new().with_latency(self.latency)))
    }
}

/// Byte-level vocabulary plus one end-of-sequence token.
const VOCAB: usize = 257;
const EOS: TokenId = 256;
const BOS: TokenId = EOS;

/// Echoes the prompt text back, one byte per token, then ends.
///
/// An evaluated image is echoed as a short `[image WxH]` tag.
pub struct StubGenerator {
    has_projector: bool,
    echo: Vec<TokenId>,
    cursor: usize,
    logits: Vec<f32>,
    latency: Duration,
}

impl StubGenerator {
    pub fn new(has_projector: bool) -> Self {
        Self {
            has_projector,
            echo: Vec::new(),
            cursor: 0,
            logits: vec![0.0; VOCAB],
            latency: Duration::ZERO,
        }
    }

    /// Sleep this long per decoded token.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl GenerationEngine for StubGenerator {
    fn tokenize(&mut self, text: &str, add_bos: bool) -> Result<Vec<TokenId>> {
        let mut tokens = Vec::with_capacity(text.len() + 1);
        if add_bos {
            tokens.push(BOS);
        }
        tokens.extend(text.bytes().map(TokenId::from));
        Ok(tokens)
    }

    fn eval_tokens(&mut self, tokens: &[TokenId]) -> Result<()> {
        self.echo.extend(tokens.iter().copied().filter(|&t| t != BOS));
        Ok(())
    }

    fn embed_image(&mut self, frame: &Frame) -> Result<ImageEmbedding> {
        if !self.has_projector {
            return Err(CadenceError::EngineInternal(
                "image supplied but no projector is loaded".into(),
            ));
        }
        Ok(ImageEmbedding {
            values: vec![frame.width as f32, frame.height as f32],
            positions: 1,
        })
    }

    fn eval_image(&mut self, embedding: &ImageEmbedding) -> Result<()> {
        let &[w, h] = embedding.values.as_slice() else {
            return Err(CadenceError::EngineInternal("malformed image embedding".into()));
        };
        let tag = format!("[image {}x{}]", w as u32, h as u32);
        self.echo.extend(tag.bytes().map(TokenId::from));
        Ok(())
    }

    fn next_logits(&mut self) -> Result<&[f32]> {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
        let next = self.echo.get(self.cursor).copied().unwrap_or(EOS);
        self.logits.fill(0.0);
        self.logits[next as usize] = 20.0;
        Ok(&self.logits)
    }

    fn accept(&mut self, _token: TokenId) -> Result<()> {
        self.cursor += 1;
        Ok(())
    }

    fn token_bytes(&self, token: TokenId) -> Vec<u8> {
        u8::try_from(token).map(|b| vec![b]).unwrap_or_default()
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }
}

#[derive(Debug, Clone, Default)]
pub struct StubGenerationLoader {
    pub latency: Duration,
}

impl GenerationLoader for StubGenerationLoader {
    fn load(&self, spec: &GenerationModelSpec) -> Result<Box<dyn GenerationEngine>> {
        validate_model_file(&spec.model_path)?;
        if let Some(projector) = &spec.projector_path {
            validate_model_file(projector)?;
        }
        debug!(model = %spec.model_path.display(), backend = %spec.backend, "stub generator loaded");
        Ok(Box::new(
            StubGenerator::new(spec.projector_path.is_some()).with_latency(self.latency),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizer_ignores_short_windows() {
        let mut r = StubRecognizer::new();
        assert_eq!(r.transcribe(&[0.0; 10]).unwrap(), "");
        assert!(r.transcribe(&[0.5; 1600]).unwrap().starts_with("[utterance 1: 1600 samples"));
    }

    #[test]
    fn generator_echoes_prompt_then_ends() {
        let mut g = StubGenerator::new(false);
        let tokens = g.tokenize("hi", true).unwrap();
        g.eval_tokens(&tokens).unwrap();

        let mut out = Vec::new();
        loop {
            let logits = g.next_logits().unwrap();
            let (best, _) = logits
                .iter()
                .enumerate()
                .fold((0, f32::MIN), |acc, (i, &l)| if l > acc.1 { (i, l) } else { acc });
            let token = best as TokenId;
            if g.is_end_of_sequence(token) {
                break;
            }
            out.extend(g.token_bytes(token));
            g.accept(token).unwrap();
        }
        assert_eq!(out, b"hi");
    }

    #[test]
    fn image_without_projector_is_an_engine_error() {
        let mut g = StubGenerator::new(false);
        let frame = Frame::packed(1, 1, crate::vision::PixelFormat::Rgb888, vec![0u8; 3]).unwrap();
        assert!(matches!(g.embed_image(&frame), Err(CadenceError::EngineInternal(_))));
    }
}
