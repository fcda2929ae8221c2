//! Engine and loader contracts.
//!
//! Numerical kernels and model file parsing live behind these traits. A
//! loader turns a model spec into an exclusively owned engine; sessions hold
//! that engine for their whole lifetime and hand it back on teardown.
//!
//! `&mut self` on the engine methods expresses that decoders are stateful
//! (KV caches, beam state). Engines are `Send` so a session can move one to
//! its worker thread, but never shared.

pub mod stub;

use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::BackendId;
use crate::error::{CadenceError, Result};
use crate::vision::Frame;

pub use stub::{StubGenerationLoader, StubGenerator, StubRecognitionLoader, StubRecognizer};

/// Token id in a generation engine's vocabulary.
pub type TokenId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum DecodingMode {
    Greedy,
    BeamSearch { beam_size: u32 },
}

impl Default for DecodingMode {
    fn default() -> Self {
        Self::Greedy
    }
}

/// What a recognition loader needs to produce an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionModelSpec {
    pub model_path: PathBuf,
    pub backend: BackendId,
    pub threads: usize,
    pub decoding: DecodingMode,
}

/// Speech-to-text engine.
pub trait RecognitionEngine: Send + 'static {
    /// Transcribe one window of 16 kHz mono f32 samples.
    ///
    /// An empty string means nothing was recognised.
    fn transcribe(&mut self, window: &[f32]) -> Result<String>;

    /// Drop decoder state between utterances.
    fn reset(&mut self);
}

pub trait RecognitionLoader: Send + Sync + 'static {
    fn load(&self, spec: &RecognitionModelSpec) -> Result<Box<dyn RecognitionEngine>>;
}

/// What a generation loader needs to produce an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationModelSpec {
    pub model_path: PathBuf,
    /// Vision projector; required for image-conditioned prompts.
    pub projector_path: Option<PathBuf>,
    pub backend: BackendId,
    pub threads: usize,
}

/// Projected image, ready to be evaluated into a generation context.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageEmbedding {
    pub values: Vec<f32>,
    /// Context positions the embedding occupies.
    pub positions: usize,
}

/// Autoregressive text (or vision-language) engine.
///
/// The driving loop is: evaluate the prompt, then repeatedly read
/// [`next_logits`](Self::next_logits), pick a token and [`accept`](Self::accept) it.
pub trait GenerationEngine: Send + 'static {
    fn tokenize(&mut self, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    fn eval_tokens(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// Run the vision projector over a frame.
    fn embed_image(&mut self, frame: &Frame) -> Result<ImageEmbedding>;

    fn eval_image(&mut self, embedding: &ImageEmbedding) -> Result<()>;

    /// Logits over the vocabulary for the next position.
    fn next_logits(&mut self) -> Result<&[f32]>;

    /// Feed a sampled token back into the context.
    fn accept(&mut self, token: TokenId) -> Result<()>;

    /// Raw bytes of a token's piece; may be a partial UTF-8 sequence.
    fn token_bytes(&self, token: TokenId) -> Vec<u8>;

    fn is_end_of_sequence(&self, token: TokenId) -> bool;
}

pub trait GenerationLoader: Send + Sync + 'static {
    fn load(&self, spec: &GenerationModelSpec) -> Result<Box<dyn GenerationEngine>>;
}

/// Check a model file exists, is a regular non-empty file and can be opened.
pub fn validate_model_file(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path)
        .map_err(|e| CadenceError::model_load(path, format!("not found: {e}")))?;
    if !meta.is_file() {
        return Err(CadenceError::model_load(path, "not a regular file"));
    }
    if meta.len() == 0 {
        return Err(CadenceError::model_load(path, "file is empty"));
    }
    File::open(path).map_err(|e| CadenceError::model_load(path, format!("unreadable: {e}")))?;
    Ok(())
}
