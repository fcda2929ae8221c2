//! `CadenceEngine`: the host-facing façade.
//!
//! ## Lifecycle
//!
//! ```text
//! CadenceEngine::new()                 registry built, nothing loaded
//!     ├─► recognition_init()           model loaded, channel open   (Ready)
//!     │     └─► audio_ingest()         producer half for the capture side
//!     │     └─► recognition_start()    consumer thread spawned      (Running)
//!     │           └─► recognition_stop()                            (Stopped)
//!     ├─► generate()                   blocking, on the caller's thread
//!     │     └─► request_cancel()       from any other thread
//!     └─► capture_gate()               camera-driven generation
//! ```
//!
//! Recognition and generation draw from one [`ActiveLimit`]; a request
//! beyond it is rejected with `Busy` rather than queued. Every generation
//! token, including the capture gate's, is tracked in one [`RunRegistry`]
//! so `request_cancel` and `is_running` see all of them.
//!
//! `CadenceEngine` is `Send + Sync`; wrap it in an `Arc` to drive it from
//! several threads.

pub mod run_state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::{AudioIngest, ENGINE_SAMPLE_RATE};
use crate::backend::{BackendDescriptor, BackendId, BackendRegistry, Workload};
use crate::buffering::{ChannelConfig, ChannelMonitor};
use crate::error::{CadenceError, Result};
use crate::generation::{GenerationRequest, GenerationResult, GenerationSession};
use crate::inference::{GenerationLoader, RecognitionLoader};
use crate::ipc::{events::NotificationSource, Notifier};
use crate::recognition::{
    DiagnosticsSnapshot, RecognitionParams, RecognitionSession, RecognitionState, SessionConfig,
};
use crate::vision::{CaptureGate, EmbeddingCache, Frame, MultimodalRunner};

pub use run_state::{ActiveLimit, ActiveSlot, Registration, RunPhase, RunRegistry, RunState};

/// Configuration for `CadenceEngine`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ingestion channel ceiling and chunk size.
    pub channel: ChannelConfig,
    /// Recognition window per inference step (ms of 16 kHz audio). Default: 1000.
    pub window_ms: u32,
    /// Smallest residual window still transcribed on stop (ms). Default: 250.
    pub min_flush_ms: u32,
    /// Upper bound on one blocking pop in the consumer loop. Default: 100 ms.
    pub poll_timeout: Duration,
    /// Consecutive engine errors before a session stops itself. Default: 3.
    pub max_engine_errors: usize,
    /// Repetitions per window in stress-test mode. Default: 3.
    pub stress_iterations: usize,
    /// Where transcription+record mode writes WAV files. `None` = temp dir.
    pub record_dir: Option<PathBuf>,
    /// Inferences (recognition + generation) allowed at once. Default: 1.
    pub max_active_inferences: usize,
    /// The capture gate considers every Nth frame. Default: 30.
    pub frame_stride: u32,
    /// Image embeddings kept for unchanged camera views. Default: 8.
    pub embedding_cache_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            window_ms: 1_000,
            min_flush_ms: 250,
            poll_timeout: Duration::from_millis(100),
            max_engine_errors: 3,
            stress_iterations: 3,
            record_dir: None,
            max_active_inferences: 1,
            frame_stride: 30,
            embedding_cache_entries: crate::vision::cache::DEFAULT_EMBEDDING_CACHE_ENTRIES,
        }
    }
}

impl EngineConfig {
    fn ms_to_samples(ms: u32) -> usize {
        (ENGINE_SAMPLE_RATE as usize * ms as usize) / 1_000
    }

    pub fn window_samples(&self) -> usize {
        Self::ms_to_samples(self.window_ms).max(1)
    }

    pub fn min_flush_samples(&self) -> usize {
        Self::ms_to_samples(self.min_flush_ms)
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            channel: self.channel,
            window_samples: self.window_samples(),
            min_flush_samples: self.min_flush_samples(),
            poll_timeout: self.poll_timeout,
            max_engine_errors: self.max_engine_errors,
            stress_iterations: self.stress_iterations,
            record_dir: self.record_dir.clone(),
        }
    }
}

/// The engines the façade drives.
#[derive(Clone)]
pub struct Loaders {
    pub recognition: Arc<dyn RecognitionLoader>,
    pub generation: Arc<dyn GenerationLoader>,
}

pub struct CadenceEngine {
    config: EngineConfig,
    notifier: Notifier,
    registry: Arc<BackendRegistry>,
    limit: ActiveLimit,
    recognition: Mutex<RecognitionSession>,
    /// Readable while `recognition` is held by a blocking stop.
    recognition_state: Arc<Mutex<RecognitionState>>,
    generation: Arc<GenerationSession>,
    /// Tokens of every generation in progress, gate runs included.
    active_runs: RunRegistry,
    embeddings: Arc<EmbeddingCache>,
}

impl CadenceEngine {
    /// Build with the backend registry detected on this device.
    pub fn new(config: EngineConfig, loaders: Loaders, notifier: Notifier) -> Self {
        let registry = Arc::new(BackendRegistry::detect(notifier.clone()));
        Self::with_registry(config, loaders, registry, notifier)
    }

    pub fn with_registry(
        config: EngineConfig,
        loaders: Loaders,
        registry: Arc<BackendRegistry>,
        notifier: Notifier,
    ) -> Self {
        let limit = ActiveLimit::new(config.max_active_inferences);
        let embeddings = Arc::new(EmbeddingCache::new(config.embedding_cache_entries));
        let recognition = RecognitionSession::new(
            loaders.recognition,
            Arc::clone(&registry),
            limit.clone(),
            notifier.clone(),
            config.session_config(),
        );
        let recognition_state = recognition.state_handle();
        let generation = Arc::new(GenerationSession::new(
            loaders.generation,
            Arc::clone(&registry),
            notifier.clone(),
            Arc::clone(&embeddings),
        ));

        info!(
            backends = ?registry.list_available().iter().map(|d| d.name).collect::<Vec<_>>(),
            max_active = limit.limit(),
            "cadence engine ready"
        );

        Self {
            config,
            notifier,
            registry,
            limit,
            recognition: Mutex::new(recognition),
            recognition_state,
            generation,
            active_runs: RunRegistry::new(),
            embeddings,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ── Backends ─────────────────────────────────────────────────────────

    pub fn list_backends(&self) -> Vec<BackendDescriptor> {
        self.registry.list_available()
    }

    pub fn resolve_backend(&self, requested: BackendId, allow_fallback: bool) -> Result<BackendDescriptor> {
        self.registry.resolve(requested, allow_fallback)
    }

    pub fn resolve_benchmark_backend(
        &self,
        requested: BackendId,
        workload: Workload,
        allow_fallback: bool,
    ) -> Result<BackendDescriptor> {
        self.registry.resolve_benchmark(requested, workload, allow_fallback)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    // ── Recognition ──────────────────────────────────────────────────────

    pub fn recognition_init(&self, params: RecognitionParams) -> Result<()> {
        self.recognition.lock().init(params)
    }

    pub fn recognition_start(&self) -> Result<()> {
        self.recognition.lock().start()
    }

    pub fn recognition_stop(&self) -> Result<()> {
        self.recognition.lock().stop()
    }

    pub fn recognition_reset(&self, params: RecognitionParams) -> Result<()> {
        self.recognition.lock().reset(params)
    }

    pub fn recognition_finalize(&self) {
        self.recognition.lock().finalize();
    }

    pub fn recognition_state(&self) -> RecognitionState {
        *self.recognition_state.lock()
    }

    pub fn recognition_diagnostics(&self) -> DiagnosticsSnapshot {
        self.recognition.lock().diagnostics()
    }

    pub fn channel_monitor(&self) -> Option<ChannelMonitor> {
        self.recognition.lock().channel_monitor()
    }

    /// Producer half of the ingestion channel; once per `recognition_init`.
    pub fn audio_ingest(&self) -> Result<AudioIngest> {
        self.recognition.lock().take_ingest()
    }

    // ── Generation ───────────────────────────────────────────────────────

    /// Run a generation request on the calling thread.
    ///
    /// `Err` only for rejections before any work (`Busy`,
    /// `BackendUnavailable`); every other outcome is a [`GenerationResult`].
    pub fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        self.generate_with(request, &RunState::new())
    }

    /// As [`generate`](Self::generate), with a caller-owned run token.
    ///
    /// The token is registered for the whole call, so
    /// [`request_cancel`](Self::request_cancel) reaches it even before
    /// decoding starts.
    pub fn generate_with(&self, request: &GenerationRequest, run: &RunState) -> Result<GenerationResult> {
        let _registered = self.active_runs.register(run);
        let outcome = self
            .acquire_slot(NotificationSource::Generation)
            .and_then(|_slot| self.generation.run(request, run));
        clear_rejected_cancel(&outcome, run);
        outcome
    }

    /// Ask every generation in progress (gate runs included) to stop.
    /// Returns how many cancels were recorded.
    pub fn request_cancel(&self) -> usize {
        let n = self.active_runs.request_cancel_all();
        if n > 0 {
            info!(runs = n, "cancel requested");
        }
        n
    }

    /// Whether any generation, gate runs included, is currently decoding.
    pub fn is_running(&self) -> bool {
        self.active_runs.any_running()
    }

    // ── Vision ───────────────────────────────────────────────────────────

    /// A capture gate that answers frames with `template` plus the frame.
    pub fn capture_gate(&self, template: GenerationRequest) -> Result<CaptureGate> {
        let runner = self.vision_runner(template);
        CaptureGate::new(self.config.frame_stride, Arc::new(runner), self.notifier.clone())
    }

    fn vision_runner(&self, template: GenerationRequest) -> VisionRunner {
        VisionRunner {
            session: Arc::clone(&self.generation),
            limit: self.limit.clone(),
            notifier: self.notifier.clone(),
            runs: self.active_runs.clone(),
            template,
            next: Mutex::new(RunState::new()),
        }
    }

    pub fn embedding_cache(&self) -> &Arc<EmbeddingCache> {
        &self.embeddings
    }

    fn acquire_slot(&self, source: NotificationSource) -> Result<ActiveSlot> {
        acquire_or_notify(&self.limit, &self.notifier, source)
    }
}

fn acquire_or_notify(limit: &ActiveLimit, notifier: &Notifier, source: NotificationSource) -> Result<ActiveSlot> {
    limit.try_acquire().map_err(|e| {
        warn!(active = limit.active(), limit = limit.limit(), "inference rejected: busy");
        notifier.warning(source, format!("request rejected: {e}"));
        e
    })
}

/// A call rejected before it began (`Busy`, `BackendUnavailable`) leaves
/// the caller's token reusable.
fn clear_rejected_cancel(outcome: &Result<GenerationResult>, run: &RunState) {
    if matches!(
        outcome,
        Err(CadenceError::Busy { .. } | CadenceError::BackendUnavailable { .. })
    ) {
        run.clear_cancel();
    }
}

impl Drop for CadenceEngine {
    fn drop(&mut self) {
        self.request_cancel();
        self.recognition.get_mut().finalize();
    }
}

/// Gate-side runner: the template request plus the captured frame.
///
/// `next` is the token the next (or current) run uses. It is swapped for a
/// fresh one after each run, so a cancel that lands after a run finished
/// never carries over to the following frame.
struct VisionRunner {
    session: Arc<GenerationSession>,
    limit: ActiveLimit,
    notifier: Notifier,
    runs: RunRegistry,
    template: GenerationRequest,
    next: Mutex<RunState>,
}

impl MultimodalRunner for VisionRunner {
    fn run(&self, frame: &Frame) -> Result<GenerationResult> {
        let run = self.next.lock().clone();
        let outcome = {
            let _registered = self.runs.register(&run);
            acquire_or_notify(&self.limit, &self.notifier, NotificationSource::Gate).and_then(|_slot| {
                let request = self.template.clone().with_image(frame.clone());
                self.session.run(&request, &run)
            })
        };
        *self.next.lock() = RunState::new();
        outcome
    }

    fn cancel(&self) -> bool {
        self.next.lock().request_cancel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{probe::StaticProbe, CapabilityTable};
    use crate::error::CadenceError;
    use crate::generation::SamplingParams;
    use crate::inference::{StubGenerationLoader, StubRecognitionLoader};
    use crate::recognition::OperatingMode;
    use crate::vision::{GateDecision, PixelFormat};
    use std::thread;
    use std::time::Instant;

    fn model_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cadence-engine-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        std::fs::write(&path, b"weights").unwrap();
        path
    }

    fn engine(latency: Duration) -> CadenceEngine {
        let notifier = Notifier::tracing();
        let registry = Arc::new(BackendRegistry::new(
            CapabilityTable::cpu_only(),
            &StaticProbe::cpu_only(),
            notifier.clone(),
        ));
        let config = EngineConfig {
            frame_stride: 1,
            poll_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        CadenceEngine::with_registry(
            config,
            Loaders {
                recognition: Arc::new(StubRecognitionLoader::default()),
                generation: Arc::new(StubGenerationLoader { latency }),
            },
            registry,
            notifier,
        )
    }

    #[test]
    fn window_sizes_follow_milliseconds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.window_samples(), 16_000);
        assert_eq!(cfg.min_flush_samples(), 4_000);
    }

    #[test]
    fn running_recognition_makes_generation_busy() {
        let e = engine(Duration::ZERO);
        e.recognition_init(RecognitionParams::new(
            model_file("asr.bin"),
            1,
            OperatingMode::Normal,
            BackendId::Cpu,
        ))
        .unwrap();
        e.recognition_start().unwrap();

        let req = GenerationRequest::new(model_file("llm.bin"), "hi");
        assert!(matches!(e.generate(&req), Err(CadenceError::Busy { .. })));

        e.recognition_stop().unwrap();
        assert!(e.generate(&req).unwrap().is_completed());
    }

    #[test]
    fn request_cancel_interrupts_generate_from_another_thread() {
        let e = Arc::new(engine(Duration::from_millis(5)));
        let req = GenerationRequest::new(model_file("slow.bin"), "a long enough prompt to cancel midway")
            .sampling(SamplingParams::greedy());

        let worker = {
            let e = Arc::clone(&e);
            thread::spawn(move || e.generate(&req))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !e.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(e.request_cancel(), 1);

        let result = worker.join().unwrap().unwrap();
        assert!(matches!(result, GenerationResult::Interrupted { .. }));
        assert!(!e.is_running());
    }

    #[test]
    fn generate_with_registers_the_callers_token() {
        let e = Arc::new(engine(Duration::from_millis(5)));
        let req = GenerationRequest::new(model_file("own.bin"), "a prompt long enough to cancel")
            .sampling(SamplingParams::greedy());
        let run = RunState::new();

        let worker = {
            let e = Arc::clone(&e);
            let run = run.clone();
            thread::spawn(move || e.generate_with(&req, &run))
        };
        let deadline = Instant::now() + Duration::from_secs(2);
        while !run.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(e.is_running());
        assert_eq!(e.request_cancel(), 1);

        let result = worker.join().unwrap().unwrap();
        assert!(matches!(result, GenerationResult::Interrupted { .. }));
        assert_eq!(run.phase(), RunPhase::Idle);
        assert!(e.active_runs.is_empty());
    }

    #[test]
    fn busy_rejection_leaves_the_token_reusable() {
        let e = engine(Duration::ZERO);
        let _held = e.limit.try_acquire().unwrap();
        let run = RunState::new();
        run.request_cancel();
        let req = GenerationRequest::new(model_file("busy.bin"), "hi");
        assert!(matches!(e.generate_with(&req, &run), Err(CadenceError::Busy { .. })));
        assert_eq!(run.phase(), RunPhase::Idle);
    }

    #[test]
    fn request_cancel_reaches_a_running_gate_inference() {
        let e = engine(Duration::from_millis(5));
        let template = GenerationRequest::new(model_file("gate-vlm.bin"), "describe the scene in detail")
            .with_projector(model_file("gate-proj.bin"))
            .sampling(SamplingParams::greedy());
        let gate = e.capture_gate(template).unwrap();

        let frame = Frame::packed(2, 2, PixelFormat::Rgba8888, vec![7u8; 16]).unwrap();
        assert!(matches!(gate.on_frame(frame.clone()), GateDecision::Dispatched(_)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !e.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(e.is_running());
        assert_eq!(e.request_cancel(), 1);

        assert!(gate.wait_idle(Duration::from_secs(2)));
        assert!(!e.is_running());
        assert!(gate.last_result().is_none());
        assert_eq!(gate.stats().completed, 0);
        // The next frame runs on a fresh token.
        assert!(matches!(gate.on_frame(frame), GateDecision::Dispatched(_)));
        assert!(gate.wait_idle(Duration::from_secs(2)));
        assert_eq!(gate.stats().completed, 1);
    }

    #[test]
    fn gate_runner_honours_a_cancel_issued_before_its_run() {
        let e = engine(Duration::ZERO);
        let template = GenerationRequest::new(model_file("early.bin"), "describe")
            .with_projector(model_file("early-proj.bin"))
            .sampling(SamplingParams::greedy());
        let runner = e.vision_runner(template);
        let frame = Frame::packed(2, 2, PixelFormat::Rgba8888, vec![3u8; 16]).unwrap();

        assert!(runner.cancel());
        assert!(!runner.cancel());
        assert_eq!(
            runner.run(&frame).unwrap(),
            GenerationResult::Interrupted {
                partial: String::new(),
                tokens: 0
            }
        );
        // The following frame gets a fresh token.
        assert!(runner.run(&frame).unwrap().is_completed());
        assert!(e.active_runs.is_empty());
    }

    #[test]
    fn capture_gate_runs_template_against_frames() {
        let e = engine(Duration::ZERO);
        let template = GenerationRequest::new(model_file("vlm.bin"), "describe")
            .with_projector(model_file("proj.bin"))
            .sampling(SamplingParams::greedy());
        let gate = e.capture_gate(template).unwrap();

        let frame = Frame::packed(3, 2, PixelFormat::Rgba8888, vec![0u8; 24]).unwrap();
        assert!(matches!(gate.on_frame(frame.clone()), GateDecision::Dispatched(_)));
        assert!(gate.wait_idle(Duration::from_secs(2)));
        assert_eq!(
            gate.on_frame(frame),
            GateDecision::Cached("[image 3x2]describe".into())
        );
    }
}
