//! Generation Session: token-by-token text (and vision-language) generation
//! with cooperative cancellation.
//!
//! ## Per request
//!
//! ```text
//! resolve backend ─► load model (+ projector) ─► evaluate prompt
//!     text before <__image__>, image embedding, text after
//!
//! loop:
//!     run state cancel-requested?  → Interrupted (partial text)
//!     max_tokens reached?          → Completed
//!     next_logits ─► sample ─► end-of-sequence? → Completed
//!     stream the complete UTF-8 fragment, accept the token
//! ```
//!
//! The run state is read exactly once per iteration, before the decode
//! step, so cancellation latency is one decode step.

pub mod sampler;
pub mod utf8;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{BackendDescriptor, BackendId, BackendRegistry};
use crate::engine::run_state::RunState;
use crate::error::{CadenceError, Result};
use crate::inference::{GenerationEngine, GenerationLoader, GenerationModelSpec, ImageEmbedding};
use crate::ipc::{
    events::{NotificationKind, NotificationSource},
    Notifier,
};
use crate::vision::{EmbeddingCache, EmbeddingKey, Frame};

pub use sampler::{Sampler, SamplingParams};
pub use utf8::Utf8Stream;

/// Placeholder in a prompt where the image embedding is evaluated.
pub const IMAGE_MARKER: &str = "<__image__>";

pub const DEFAULT_MAX_TOKENS: usize = 256;

/// One generation call. Fields are fixed once submitted.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model_path: PathBuf,
    pub projector_path: Option<PathBuf>,
    pub prompt: String,
    pub image: Option<Frame>,
    pub backend: BackendId,
    pub allow_fallback: bool,
    pub threads: usize,
    pub sampling: SamplingParams,
    pub max_tokens: usize,
}

impl GenerationRequest {
    pub fn new(model_path: impl Into<PathBuf>, prompt: impl Into<String>) -> Self {
        Self {
            model_path: model_path.into(),
            projector_path: None,
            prompt: prompt.into(),
            image: None,
            backend: BackendId::Cpu,
            allow_fallback: false,
            threads: 4,
            sampling: SamplingParams::default(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    pub fn with_projector(mut self, projector: impl Into<PathBuf>) -> Self {
        self.projector_path = Some(projector.into());
        self
    }

    pub fn with_image(mut self, frame: Frame) -> Self {
        self.image = Some(frame);
        self
    }

    pub fn backend(mut self, backend: BackendId, allow_fallback: bool) -> Self {
        self.backend = backend;
        self.allow_fallback = allow_fallback;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum GenerationResult {
    Completed { text: String, tokens: usize },
    Interrupted { partial: String, tokens: usize },
    Failed { reason: String },
}

impl GenerationResult {
    /// Generated text, partial for an interrupted run, empty on failure.
    pub fn text(&self) -> &str {
        match self {
            Self::Completed { text, .. } => text,
            Self::Interrupted { partial, .. } => partial,
            Self::Failed { .. } => "",
        }
    }

    pub fn tokens(&self) -> usize {
        match self {
            Self::Completed { tokens, .. } | Self::Interrupted { tokens, .. } => *tokens,
            Self::Failed { .. } => 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Resets a run state to idle however the run ends.
struct RunGuard<'a>(&'a RunState);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

pub struct GenerationSession {
    loader: Arc<dyn GenerationLoader>,
    registry: Arc<BackendRegistry>,
    notifier: Notifier,
    embeddings: Arc<EmbeddingCache>,
}

impl GenerationSession {
    pub fn new(
        loader: Arc<dyn GenerationLoader>,
        registry: Arc<BackendRegistry>,
        notifier: Notifier,
        embeddings: Arc<EmbeddingCache>,
    ) -> Self {
        Self {
            loader,
            registry,
            notifier,
            embeddings,
        }
    }

    /// Run one request to completion, interruption or failure.
    ///
    /// `Err` is reserved for rejections before any work starts (backend
    /// unavailable, run state already in use). Everything after that is
    /// reported through the returned [`GenerationResult`]; a token cancelled
    /// before the run began yields `Interrupted` with no tokens.
    pub fn run(&self, request: &GenerationRequest, run: &RunState) -> Result<GenerationResult> {
        let backend = self.registry.resolve(request.backend, request.allow_fallback)?;
        let started = Instant::now();
        let result = match run.begin() {
            Ok(()) => {
                let _guard = RunGuard(run);
                self.generate(request, backend, run)
            }
            Err(CadenceError::CancelledByUser) => {
                run.finish();
                debug!("cancelled before the first step");
                GenerationResult::Interrupted {
                    partial: String::new(),
                    tokens: 0,
                }
            }
            Err(e) => return Err(e),
        };
        match &result {
            GenerationResult::Completed { tokens, .. } => {
                let secs = started.elapsed().as_secs_f64();
                let rate = if secs > 0.0 { *tokens as f64 / secs } else { 0.0 };
                info!(tokens, secs, rate, "generation completed");
                self.notifier.emit(
                    NotificationSource::Generation,
                    NotificationKind::Metric,
                    format!("{tokens} tokens in {:.0} ms ({rate:.1} tok/s)", secs * 1_000.0),
                );
            }
            GenerationResult::Interrupted { tokens, .. } => {
                info!(tokens, "generation interrupted");
                self.notifier.progress(
                    NotificationSource::Generation,
                    format!("generation interrupted after {tokens} tokens"),
                );
            }
            GenerationResult::Failed { reason } => {
                warn!(reason = reason.as_str(), "generation failed");
                self.notifier
                    .error(NotificationSource::Generation, format!("generation failed: {reason}"));
            }
        }
        Ok(result)
    }

    fn generate(&self, request: &GenerationRequest, backend: BackendDescriptor, run: &RunState) -> GenerationResult {
        let spec = GenerationModelSpec {
            model_path: request.model_path.clone(),
            projector_path: request.projector_path.clone(),
            backend: backend.id,
            threads: request.threads.max(1),
        };
        self.notifier.progress(
            NotificationSource::Generation,
            format!("loading {} on {}", spec.model_path.display(), backend.id),
        );
        let mut engine = match self.loader.load(&spec) {
            Ok(engine) => engine,
            Err(e) => return failed(e),
        };

        if let Err(e) = self.eval_prompt(engine.as_mut(), request) {
            return failed(e);
        }

        let mut sampler = Sampler::new(request.sampling);
        let mut utf8 = Utf8Stream::new();
        let mut text = String::new();
        let mut tokens = 0usize;

        loop {
            if run.is_cancel_requested() {
                self.stream(&mut text, utf8.finish());
                return GenerationResult::Interrupted {
                    partial: text,
                    tokens,
                };
            }
            if tokens >= request.max_tokens {
                debug!(tokens, "max tokens reached");
                break;
            }

            let token = match engine.next_logits() {
                Ok(logits) => sampler.sample(logits),
                Err(e) => return failed(e),
            };
            let Some(token) = token else {
                return GenerationResult::Failed {
                    reason: "engine returned no logits".into(),
                };
            };
            if engine.is_end_of_sequence(token) {
                break;
            }

            tokens += 1;
            let piece = utf8.push(&engine.token_bytes(token));
            self.stream(&mut text, piece);
            if let Err(e) = engine.accept(token) {
                return failed(e);
            }
        }

        self.stream(&mut text, utf8.finish());
        GenerationResult::Completed { text, tokens }
    }

    fn eval_prompt(&self, engine: &mut dyn GenerationEngine, request: &GenerationRequest) -> Result<()> {
        let prompt = build_prompt(&request.prompt, request.image.is_some());
        let (before, after) = match (&request.image, prompt.split_once(IMAGE_MARKER)) {
            (Some(_), Some((before, after))) => (before, Some(after)),
            _ => (prompt.as_str(), None),
        };

        let head = engine.tokenize(before, true)?;
        engine.eval_tokens(&head)?;

        if let (Some(frame), Some(after)) = (&request.image, after) {
            let embedding = self.embed(engine, frame, request.projector_path.clone())?;
            engine.eval_image(&embedding)?;
            let tail = engine.tokenize(after, false)?;
            engine.eval_tokens(&tail)?;
        }
        Ok(())
    }

    fn embed(
        &self,
        engine: &mut dyn GenerationEngine,
        frame: &Frame,
        projector: Option<PathBuf>,
    ) -> Result<Arc<ImageEmbedding>> {
        let key = EmbeddingKey {
            fingerprint: frame.fingerprint(),
            projector,
        };
        if let Some(hit) = self.embeddings.get(&key) {
            debug!(fingerprint = %key.fingerprint, "image embedding cache hit");
            return Ok(hit);
        }
        let embedding = Arc::new(engine.embed_image(frame)?);
        self.embeddings.insert(key, Arc::clone(&embedding));
        Ok(embedding)
    }

    fn stream(&self, text: &mut String, piece: String) {
        if piece.is_empty() {
            return;
        }
        text.push_str(&piece);
        self.notifier
            .emit(NotificationSource::Generation, NotificationKind::Token, piece);
    }
}

fn failed(e: CadenceError) -> GenerationResult {
    GenerationResult::Failed {
        reason: e.to_string(),
    }
}

/// Ensure an image prompt carries exactly one marker; strip markers from
/// text-only prompts.
pub fn build_prompt(prompt: &str, has_image: bool) -> String {
    if !has_image {
        if prompt.contains(IMAGE_MARKER) {
            warn!("image marker in a prompt without an image; removing it");
            return prompt.replace(IMAGE_MARKER, "");
        }
        return prompt.to_string();
    }
    if prompt.contains(IMAGE_MARKER) {
        prompt.to_string()
    } else {
        format!("{IMAGE_MARKER}{prompt}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{probe::StaticProbe, CapabilityTable};
    use crate::inference::{StubGenerationLoader, TokenId};
    use crate::ipc::events::Notification;
    use crate::vision::PixelFormat;
    use crossbeam_channel::Receiver;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    fn model_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cadence-gen-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    fn session_with(loader: Arc<dyn GenerationLoader>) -> (GenerationSession, Receiver<Notification>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let notifier = Notifier::new(tx);
        let registry = Arc::new(BackendRegistry::new(
            CapabilityTable::cpu_only(),
            &StaticProbe::cpu_only(),
            notifier.clone(),
        ));
        (
            GenerationSession::new(loader, registry, notifier, Arc::new(EmbeddingCache::default())),
            rx,
        )
    }

    fn tokens_streamed(rx: &Receiver<Notification>) -> String {
        rx.try_iter()
            .filter(|n| n.kind == NotificationKind::Token)
            .map(|n| n.message)
            .collect()
    }

    #[test]
    fn completes_and_streams_every_fragment() {
        let (s, rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let req = GenerationRequest::new(model_file("echo.bin"), "héllo").sampling(SamplingParams::greedy());
        let result = s.run(&req, &RunState::new()).unwrap();

        assert_eq!(
            result,
            GenerationResult::Completed {
                text: "héllo".into(),
                tokens: 6
            }
        );
        assert_eq!(tokens_streamed(&rx), "héllo");
    }

    #[test]
    fn max_tokens_caps_output() {
        let (s, _rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let req = GenerationRequest::new(model_file("cap.bin"), "abcdef")
            .sampling(SamplingParams::greedy())
            .max_tokens(3);
        let result = s.run(&req, &RunState::new()).unwrap();
        assert_eq!(result.text(), "abc");
        assert_eq!(result.tokens(), 3);
    }

    #[test]
    fn image_marker_is_prepended_and_image_evaluated() {
        let (s, _rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let frame = Frame::packed(2, 1, PixelFormat::Rgb888, vec![9u8; 6]).unwrap();
        let req = GenerationRequest::new(model_file("vlm.bin"), " what is this")
            .with_projector(model_file("mmproj.bin"))
            .with_image(frame)
            .sampling(SamplingParams::greedy());
        let result = s.run(&req, &RunState::new()).unwrap();
        assert_eq!(result.text(), "[image 2x1] what is this");
    }

    #[test]
    fn unchanged_frame_reuses_cached_embedding() {
        let (s, _rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let frame = Frame::packed(2, 2, PixelFormat::Rgb888, vec![1u8; 12]).unwrap();
        let req = GenerationRequest::new(model_file("vlm2.bin"), "x")
            .with_projector(model_file("mmproj2.bin"))
            .with_image(frame)
            .sampling(SamplingParams::greedy());
        s.run(&req, &RunState::new()).unwrap();
        s.run(&req, &RunState::new()).unwrap();
        assert_eq!(s.embeddings.stats.hits.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[test]
    fn load_failure_is_a_failed_result_not_an_error() {
        let (s, rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let req = GenerationRequest::new(std::env::temp_dir().join("cadence-no-such-model.bin"), "hi");
        let result = s.run(&req, &RunState::new()).unwrap();
        assert!(matches!(result, GenerationResult::Failed { .. }));
        assert!(rx.try_iter().any(|n| n.kind == NotificationKind::Error));
    }

    #[test]
    fn unavailable_backend_is_rejected_before_work() {
        let (s, rx) = session_with(Arc::new(StubGenerationLoader::default()));
        let req = GenerationRequest::new(model_file("npu.bin"), "hello").backend(BackendId::Npu, false);
        let err = s.run(&req, &RunState::new()).unwrap_err();
        assert!(matches!(err, CadenceError::BackendUnavailable { backend: BackendId::Npu, .. }));

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events.len(), 1);
        assert!(events.iter().all(|n| n.kind != NotificationKind::Token));
    }

    /// Emits `a` forever and counts decode steps.
    struct Endless {
        steps: Arc<Mutex<usize>>,
        logits: Vec<f32>,
    }

    impl GenerationEngine for Endless {
        fn tokenize(&mut self, text: &str, _add_bos: bool) -> Result<Vec<TokenId>> {
            Ok(text.bytes().map(TokenId::from).collect())
        }
        fn eval_tokens(&mut self, _tokens: &[TokenId]) -> Result<()> {
            Ok(())
        }
        fn embed_image(&mut self, _frame: &Frame) -> Result<ImageEmbedding> {
            Err(CadenceError::EngineInternal("no projector".into()))
        }
        fn eval_image(&mut self, _embedding: &ImageEmbedding) -> Result<()> {
            Ok(())
        }
        fn next_logits(&mut self) -> Result<&[f32]> {
            *self.steps.lock() += 1;
            thread::sleep(Duration::from_millis(2));
            Ok(&self.logits)
        }
        fn accept(&mut self, _token: TokenId) -> Result<()> {
            Ok(())
        }
        fn token_bytes(&self, _token: TokenId) -> Vec<u8> {
            b"a".to_vec()
        }
        fn is_end_of_sequence(&self, _token: TokenId) -> bool {
            false
        }
    }

    struct EndlessLoader(Arc<Mutex<usize>>);

    impl GenerationLoader for EndlessLoader {
        fn load(&self, _spec: &GenerationModelSpec) -> Result<Box<dyn GenerationEngine>> {
            Ok(Box::new(Endless {
                steps: Arc::clone(&self.0),
                logits: vec![1.0, 0.0],
            }))
        }
    }

    #[test]
    fn cancel_interrupts_within_one_step() {
        let steps = Arc::new(Mutex::new(0usize));
        let (s, _rx) = session_with(Arc::new(EndlessLoader(Arc::clone(&steps))));
        let run = RunState::new();
        let caller = run.clone();

        let canceller = thread::spawn(move || {
            while !caller.is_running() {
                thread::yield_now();
            }
            thread::sleep(Duration::from_millis(30));
            assert!(caller.request_cancel());
        });

        let req = GenerationRequest::new("unused.bin", "go")
            .sampling(SamplingParams::greedy())
            .max_tokens(usize::MAX);
        let result = s.run(&req, &run).unwrap();
        canceller.join().unwrap();

        match result {
            GenerationResult::Interrupted { partial, tokens } => {
                assert_eq!(partial.len(), tokens);
                // Every decode step produced one token; none ran after the cancel.
                assert_eq!(*steps.lock(), tokens);
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
        assert_eq!(run.phase(), crate::engine::run_state::RunPhase::Idle);
    }

    #[test]
    fn cancel_before_begin_produces_no_tokens() {
        let steps = Arc::new(Mutex::new(0usize));
        let (s, rx) = session_with(Arc::new(EndlessLoader(Arc::clone(&steps))));
        let run = RunState::new();
        assert!(run.request_cancel());

        let req = GenerationRequest::new("unused.bin", "go").sampling(SamplingParams::greedy());
        let result = s.run(&req, &run).unwrap();

        assert_eq!(
            result,
            GenerationResult::Interrupted {
                partial: String::new(),
                tokens: 0
            }
        );
        assert_eq!(*steps.lock(), 0);
        assert_eq!(tokens_streamed(&rx), "");
        // The token is reusable afterwards.
        assert_eq!(run.phase(), crate::engine::run_state::RunPhase::Idle);
    }

    #[test]
    fn prompt_building() {
        assert_eq!(build_prompt("hi", true), "<__image__>hi");
        assert_eq!(build_prompt("a <__image__> b", true), "a <__image__> b");
        assert_eq!(build_prompt("a <__image__> b", false), "a  b");
    }
}
