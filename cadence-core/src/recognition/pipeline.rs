//! Blocking consumer loop for a running recognition session.
//!
//! ## Per iteration
//!
//! ```text
//! 1. Check the run state (cancel point)
//! 2. pop(poll_timeout) one chunk from the ingestion channel
//! 3. Decode s16le into the window slot of the scratch arena
//! 4. Whenever the window is full: transcribe, notify, clear (non-sliding)
//! 5. Recycle the chunk
//! ```
//!
//! On exit a residual window of at least `min_flush_samples` is transcribed
//! and the engine plus consumer are handed back to the session through the
//! thread's return value.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, error, info, info_span, warn};

use super::{OperatingMode, RecognitionState};
use crate::audio::format::s16le_samples;
use crate::audio::ENGINE_SAMPLE_RATE;
use crate::buffering::{ChunkConsumer, ScratchArena, SlotId};
use crate::engine::run_state::{ActiveSlot, RunState};
use crate::error::{CadenceError, Result};
use crate::inference::RecognitionEngine;
use crate::ipc::{
    events::{NotificationKind, NotificationSource},
    Notifier,
};

#[derive(Default)]
pub struct RecognitionDiagnostics {
    pub chunks_in: AtomicUsize,
    pub samples_in: AtomicUsize,
    pub windows: AtomicUsize,
    pub transcribe_calls: AtomicUsize,
    pub engine_errors: AtomicUsize,
    pub transcripts_emitted: AtomicUsize,
    pub samples_recorded: AtomicUsize,
}

impl RecognitionDiagnostics {
    pub fn reset(&self) {
        self.chunks_in.store(0, Ordering::Relaxed);
        self.samples_in.store(0, Ordering::Relaxed);
        self.windows.store(0, Ordering::Relaxed);
        self.transcribe_calls.store(0, Ordering::Relaxed);
        self.engine_errors.store(0, Ordering::Relaxed);
        self.transcripts_emitted.store(0, Ordering::Relaxed);
        self.samples_recorded.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            samples_in: self.samples_in.load(Ordering::Relaxed),
            windows: self.windows.load(Ordering::Relaxed),
            transcribe_calls: self.transcribe_calls.load(Ordering::Relaxed),
            engine_errors: self.engine_errors.load(Ordering::Relaxed),
            transcripts_emitted: self.transcripts_emitted.load(Ordering::Relaxed),
            samples_recorded: self.samples_recorded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub chunks_in: usize,
    pub samples_in: usize,
    pub windows: usize,
    pub transcribe_calls: usize,
    pub engine_errors: usize,
    pub transcripts_emitted: usize,
    pub samples_recorded: usize,
}

/// Loop tuning, fixed for the life of one run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub window_samples: usize,
    pub min_flush_samples: usize,
    pub poll_timeout: Duration,
    pub max_engine_errors: usize,
    pub mode: OperatingMode,
    pub stress_iterations: usize,
    pub record_dir: Option<PathBuf>,
}

/// Everything the loop owns while it runs.
pub struct LoopContext {
    pub session_id: u64,
    pub engine: Box<dyn RecognitionEngine>,
    pub consumer: ChunkConsumer,
    pub run: RunState,
    pub notifier: Notifier,
    pub diagnostics: Arc<RecognitionDiagnostics>,
    pub state: Arc<Mutex<RecognitionState>>,
    pub config: LoopConfig,
    /// Released when the loop returns.
    pub slot: ActiveSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Cancelled by the session.
    Stopped,
    /// Gave up after too many consecutive engine errors.
    EngineFailed,
}

/// What the loop hands back to its session.
pub struct LoopOutcome {
    pub engine: Box<dyn RecognitionEngine>,
    pub consumer: ChunkConsumer,
    pub exit: LoopExit,
}

/// Run until the run state leaves `Running` or the engine keeps failing.
pub fn run(ctx: LoopContext) -> LoopOutcome {
    let span = info_span!("recognition", session = ctx.session_id, mode = ?ctx.config.mode);
    let _enter = span.enter();
    info!(
        window_samples = ctx.config.window_samples,
        poll_ms = ctx.config.poll_timeout.as_millis() as u64,
        "recognition loop started"
    );

    let LoopContext {
        session_id,
        engine,
        mut consumer,
        run,
        notifier,
        diagnostics,
        state,
        config,
        slot,
    } = ctx;

    let mut arena = ScratchArena::new();
    let window = arena.reserve(config.window_samples.max(1));
    let mut stepper = Stepper {
        engine,
        notifier,
        diagnostics,
        config,
        consecutive_errors: 0,
        latencies: Vec::new(),
    };
    let mut recorder = match stepper.config.mode {
        OperatingMode::TranscribeRecord => WavRecorder::open(session_id, &stepper.config, &stepper.notifier),
        _ => None,
    };

    let mut exit = LoopExit::Stopped;
    'outer: loop {
        // Sole cancellation point: once per iteration, before any pop.
        if !run.is_running() {
            break;
        }

        let Some(chunk) = consumer.pop(stepper.config.poll_timeout) else {
            continue;
        };
        stepper.diagnostics.chunks_in.fetch_add(1, Ordering::Relaxed);

        let samples_in = chunk.len() / 2;
        stepper
            .diagnostics
            .samples_in
            .fetch_add(samples_in, Ordering::Relaxed);
        if let Some(rec) = recorder.as_mut() {
            rec.write(chunk.as_bytes(), &stepper.diagnostics);
        }

        let mut samples = s16le_samples(chunk.as_bytes());
        loop {
            arena.extend_iter(window, samples.by_ref());
            if arena.remaining(window) > 0 {
                break;
            }
            let ok = stepper.step(&arena, window);
            arena.clear(window);
            if !ok {
                exit = LoopExit::EngineFailed;
                drop(samples);
                consumer.recycle(chunk);
                break 'outer;
            }
        }
        drop(samples);
        consumer.recycle(chunk);
    }

    if exit == LoopExit::Stopped && arena.len(window) >= stepper.config.min_flush_samples.max(1) {
        debug!(residual = arena.len(window), "flushing residual window");
        stepper.step(&arena, window);
    }
    arena.clear(window);

    if exit == LoopExit::EngineFailed {
        let mut st = state.lock();
        if *st == RecognitionState::Running {
            *st = RecognitionState::Stopped;
        }
    }

    if let Some(rec) = recorder.take() {
        rec.finish(&stepper.notifier);
    }
    if stepper.config.mode == OperatingMode::Benchmark {
        stepper.report_benchmark();
    }

    let snap = stepper.diagnostics.snapshot();
    info!(
        chunks_in = snap.chunks_in,
        samples_in = snap.samples_in,
        windows = snap.windows,
        transcribe_calls = snap.transcribe_calls,
        engine_errors = snap.engine_errors,
        transcripts_emitted = snap.transcripts_emitted,
        samples_recorded = snap.samples_recorded,
        ?exit,
        "recognition loop stopped: diagnostics"
    );
    drop(slot);

    LoopOutcome {
        engine: stepper.engine,
        consumer,
        exit,
    }
}

/// Runs one inference step per full window, according to the mode.
struct Stepper {
    engine: Box<dyn RecognitionEngine>,
    notifier: Notifier,
    diagnostics: Arc<RecognitionDiagnostics>,
    config: LoopConfig,
    consecutive_errors: usize,
    latencies: Vec<Duration>,
}

impl Stepper {
    /// Returns `false` once the consecutive error budget is exhausted.
    fn step(&mut self, arena: &ScratchArena, window: SlotId) -> bool {
        let samples = arena.get(window);
        self.diagnostics.windows.fetch_add(1, Ordering::Relaxed);

        let outcome = match self.config.mode {
            OperatingMode::StressTest => self.stress(samples),
            _ => self.transcribe_timed(samples),
        };

        match outcome {
            Ok(text) => {
                self.consecutive_errors = 0;
                if !text.is_empty() {
                    self.diagnostics
                        .transcripts_emitted
                        .fetch_add(1, Ordering::Relaxed);
                    self.notifier
                        .emit(NotificationSource::Recognition, NotificationKind::Transcript, text);
                }
                true
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.diagnostics.engine_errors.fetch_add(1, Ordering::Relaxed);
                error!(consecutive = self.consecutive_errors, "transcription failed: {e}");
                self.notifier
                    .error(NotificationSource::Recognition, format!("transcription failed: {e}"));
                if self.consecutive_errors >= self.config.max_engine_errors.max(1) {
                    self.notifier.error(
                        NotificationSource::Recognition,
                        format!(
                            "stopping recognition after {} consecutive engine errors",
                            self.consecutive_errors
                        ),
                    );
                    return false;
                }
                true
            }
        }
    }

    fn transcribe_timed(&mut self, samples: &[f32]) -> Result<String> {
        let started = Instant::now();
        self.diagnostics.transcribe_calls.fetch_add(1, Ordering::Relaxed);
        let text = self.engine.transcribe(samples)?;
        let elapsed = started.elapsed();

        if self.config.mode == OperatingMode::Benchmark {
            let audio_ms = samples.len() as f64 * 1_000.0 / ENGINE_SAMPLE_RATE as f64;
            let rtf = elapsed.as_secs_f64() * 1_000.0 / audio_ms.max(f64::EPSILON);
            self.latencies.push(elapsed);
            self.notifier.emit(
                NotificationSource::Recognition,
                NotificationKind::Metric,
                format!(
                    "step {}: {:.1} ms for {:.0} ms of audio (rtf {rtf:.3})",
                    self.latencies.len(),
                    elapsed.as_secs_f64() * 1_000.0,
                    audio_ms
                ),
            );
        }
        Ok(text)
    }

    /// Transcribe the same window repeatedly and flag divergent outputs.
    fn stress(&mut self, samples: &[f32]) -> Result<String> {
        let iterations = self.config.stress_iterations.max(1);
        let first = self.transcribe_timed(samples)?;
        let mut divergent = 0usize;
        for _ in 1..iterations {
            if self.transcribe_timed(samples)? != first {
                divergent += 1;
            }
        }
        if divergent > 0 {
            warn!(iterations, divergent, "non-deterministic transcription");
            self.notifier.warning(
                NotificationSource::Recognition,
                format!("stress test: {divergent} of {iterations} runs diverged from the first"),
            );
        }
        Ok(first)
    }

    fn report_benchmark(&self) {
        let Some(summary) = LatencySummary::from_samples(&self.latencies) else {
            return;
        };
        info!(
            steps = summary.count,
            min_ms = summary.min_ms,
            avg_ms = summary.avg_ms,
            p50_ms = summary.p50_ms,
            max_ms = summary.max_ms,
            "benchmark summary"
        );
        self.notifier.emit(
            NotificationSource::Recognition,
            NotificationKind::Metric,
            summary.to_string(),
        );
    }
}

/// Min/avg/p50/max over a set of step latencies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub min_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub max_ms: f64,
}

impl LatencySummary {
    pub fn from_samples(latencies: &[Duration]) -> Option<Self> {
        if latencies.is_empty() {
            return None;
        }
        let mut ms: Vec<f64> = latencies.iter().map(|d| d.as_secs_f64() * 1_000.0).collect();
        ms.sort_by(|a, b| a.total_cmp(b));
        Some(Self {
            count: ms.len(),
            min_ms: ms[0],
            avg_ms: ms.iter().sum::<f64>() / ms.len() as f64,
            p50_ms: ms[ms.len() / 2],
            max_ms: ms[ms.len() - 1],
        })
    }
}

impl std::fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "benchmark: {} steps, min {:.1} ms, avg {:.1} ms, p50 {:.1} ms, max {:.1} ms",
            self.count, self.min_ms, self.avg_ms, self.p50_ms, self.max_ms
        )
    }
}

/// 16-bit mono WAV sink for transcription+record mode.
struct WavRecorder {
    path: PathBuf,
    writer: hound::WavWriter<BufWriter<File>>,
    failed: bool,
}

impl WavRecorder {
    fn open(session_id: u64, config: &LoopConfig, notifier: &Notifier) -> Option<Self> {
        let dir = config
            .record_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        match Self::create(&dir, session_id) {
            Ok(rec) => {
                info!(path = %rec.path.display(), "recording session audio");
                Some(rec)
            }
            Err(e) => {
                warn!("recording disabled: {e}");
                notifier.warning(
                    NotificationSource::Recognition,
                    format!("recording disabled: {e}"),
                );
                None
            }
        }
    }

    fn create(dir: &Path, session_id: u64) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let path = dir.join(format!("cadence-{session_id}-{stamp}.wav"));
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: ENGINE_SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| CadenceError::Other(anyhow::anyhow!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer,
            failed: false,
        })
    }

    fn write(&mut self, s16le: &[u8], diagnostics: &RecognitionDiagnostics) {
        if self.failed {
            return;
        }
        for b in s16le.chunks_exact(2) {
            if let Err(e) = self.writer.write_sample(i16::from_le_bytes([b[0], b[1]])) {
                error!(path = %self.path.display(), "recording write failed: {e}");
                self.failed = true;
                return;
            }
        }
        diagnostics
            .samples_recorded
            .fetch_add(s16le.len() / 2, Ordering::Relaxed);
    }

    fn finish(self, notifier: &Notifier) {
        let path = self.path;
        match self.writer.finalize() {
            Ok(()) => notifier.progress(
                NotificationSource::Recognition,
                format!("recording saved to {}", path.display()),
            ),
            Err(e) => notifier.error(
                NotificationSource::Recognition,
                format!("recording {} could not be finalized: {e}", path.display()),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::{create_audio_channel, ChannelConfig, ChunkProducer};
    use crate::engine::run_state::ActiveLimit;
    use crate::ipc::events::Notification;
    use crossbeam_channel::Receiver;
    use std::collections::VecDeque;
    use std::thread;

    /// Replays scripted results and records window lengths.
    struct ScriptedEngine {
        script: VecDeque<Result<String>>,
        windows: Arc<Mutex<Vec<usize>>>,
    }

    impl ScriptedEngine {
        fn new(script: Vec<Result<String>>) -> (Self, Arc<Mutex<Vec<usize>>>) {
            let windows = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: script.into(),
                    windows: Arc::clone(&windows),
                },
                windows,
            )
        }
    }

    impl RecognitionEngine for ScriptedEngine {
        fn transcribe(&mut self, window: &[f32]) -> Result<String> {
            self.windows.lock().push(window.len());
            self.script.pop_front().unwrap_or_else(|| Ok("…".into()))
        }

        fn reset(&mut self) {}
    }

    struct Harness {
        producer: ChunkProducer,
        run: RunState,
        state: Arc<Mutex<RecognitionState>>,
        events: Receiver<Notification>,
        handle: thread::JoinHandle<LoopOutcome>,
    }

    fn spawn(engine: ScriptedEngine, config: LoopConfig) -> Harness {
        let (tx, events) = crossbeam_channel::unbounded();
        let notifier = Notifier::new(tx);
        let (producer, consumer) = create_audio_channel(
            ChannelConfig {
                ceiling_bytes: 64_000,
                chunk_bytes: 3_200,
            },
            notifier.clone(),
        );
        let run = RunState::new();
        run.begin().unwrap();
        let state = Arc::new(Mutex::new(RecognitionState::Running));
        let ctx = LoopContext {
            session_id: 1,
            engine: Box::new(engine),
            consumer,
            run: run.clone(),
            notifier,
            diagnostics: Arc::new(RecognitionDiagnostics::default()),
            state: Arc::clone(&state),
            config,
            slot: ActiveLimit::new(1).try_acquire().unwrap(),
        };
        let handle = thread::spawn(move || super::run(ctx));
        Harness {
            producer,
            run,
            state,
            events,
            handle,
        }
    }

    fn config(mode: OperatingMode) -> LoopConfig {
        LoopConfig {
            window_samples: 1_600,
            min_flush_samples: 800,
            poll_timeout: Duration::from_millis(20),
            max_engine_errors: 2,
            mode,
            stress_iterations: 3,
            record_dir: None,
        }
    }

    fn push_samples(p: &mut ChunkProducer, n: usize) {
        let mut chunk = p.acquire();
        chunk.fill_from(&vec![0x10u8; n * 2]);
        assert!(p.push(chunk));
    }

    fn texts(events: &Receiver<Notification>, kind: NotificationKind) -> Vec<String> {
        events
            .try_iter()
            .filter(|n| n.kind == kind)
            .map(|n| n.message)
            .collect()
    }

    #[test]
    fn windows_reset_per_step_and_residual_flushes_on_stop() {
        let (engine, windows) = ScriptedEngine::new(vec![Ok("one".into()), Ok("two".into()), Ok("tail".into())]);
        let mut h = spawn(engine, config(OperatingMode::Normal));

        push_samples(&mut h.producer, 1_600);
        push_samples(&mut h.producer, 1_600);
        push_samples(&mut h.producer, 900);
        thread::sleep(Duration::from_millis(100));

        h.run.request_cancel();
        let outcome = h.handle.join().unwrap();
        assert_eq!(outcome.exit, LoopExit::Stopped);
        assert_eq!(*windows.lock(), vec![1_600, 1_600, 900]);
        assert_eq!(texts(&h.events, NotificationKind::Transcript), vec!["one", "two", "tail"]);
    }

    #[test]
    fn short_residual_is_dropped() {
        let (engine, windows) = ScriptedEngine::new(vec![]);
        let mut h = spawn(engine, config(OperatingMode::Normal));
        push_samples(&mut h.producer, 100);
        thread::sleep(Duration::from_millis(60));
        h.run.request_cancel();
        h.handle.join().unwrap();
        assert!(windows.lock().is_empty());
    }

    #[test]
    fn consecutive_engine_errors_stop_the_loop() {
        let (engine, _) = ScriptedEngine::new(vec![
            Err(CadenceError::EngineInternal("boom".into())),
            Err(CadenceError::EngineInternal("boom".into())),
        ]);
        let mut h = spawn(engine, config(OperatingMode::Normal));
        push_samples(&mut h.producer, 1_600);
        push_samples(&mut h.producer, 1_600);

        let outcome = h.handle.join().unwrap();
        assert_eq!(outcome.exit, LoopExit::EngineFailed);
        assert_eq!(*h.state.lock(), RecognitionState::Stopped);
        assert_eq!(texts(&h.events, NotificationKind::Error).len(), 3);
    }

    #[test]
    fn stress_mode_reports_divergence() {
        let (engine, windows) =
            ScriptedEngine::new(vec![Ok("a".into()), Ok("b".into()), Ok("a".into())]);
        let mut h = spawn(engine, config(OperatingMode::StressTest));
        push_samples(&mut h.producer, 1_600);
        thread::sleep(Duration::from_millis(80));
        h.run.request_cancel();
        h.handle.join().unwrap();

        assert_eq!(windows.lock().len(), 3);
        let events: Vec<Notification> = h.events.try_iter().collect();
        assert!(events
            .iter()
            .any(|n| n.kind == NotificationKind::Warning && n.message.contains("1 of 3")));
        assert!(events
            .iter()
            .any(|n| n.kind == NotificationKind::Transcript && n.message == "a"));
    }

    #[test]
    fn benchmark_mode_emits_step_metrics_and_summary() {
        let (engine, _) = ScriptedEngine::new(vec![Ok("x".into()), Ok("y".into())]);
        let mut h = spawn(engine, config(OperatingMode::Benchmark));
        push_samples(&mut h.producer, 1_600);
        push_samples(&mut h.producer, 1_600);
        thread::sleep(Duration::from_millis(80));
        h.run.request_cancel();
        h.handle.join().unwrap();

        let metrics = texts(&h.events, NotificationKind::Metric);
        assert_eq!(metrics.len(), 3);
        assert!(metrics[2].starts_with("benchmark: 2 steps"));
    }

    #[test]
    fn record_mode_writes_every_consumed_sample() {
        let dir = std::env::temp_dir().join(format!("cadence-rec-{}", std::process::id()));
        let mut cfg = config(OperatingMode::TranscribeRecord);
        cfg.record_dir = Some(dir.clone());
        let (engine, _) = ScriptedEngine::new(vec![]);
        let mut h = spawn(engine, cfg);
        push_samples(&mut h.producer, 1_600);
        push_samples(&mut h.producer, 400);
        thread::sleep(Duration::from_millis(60));
        h.run.request_cancel();
        h.handle.join().unwrap();

        let wav = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.extension().is_some_and(|x| x == "wav"))
            .expect("recording written");
        let reader = hound::WavReader::open(&wav).unwrap();
        assert_eq!(reader.spec().sample_rate, ENGINE_SAMPLE_RATE);
        assert_eq!(reader.len(), 2_000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn latency_summary_orders_samples() {
        let s = LatencySummary::from_samples(&[
            Duration::from_millis(30),
            Duration::from_millis(10),
            Duration::from_millis(20),
        ])
        .unwrap();
        assert_eq!(s.count, 3);
        assert!((s.min_ms - 10.0).abs() < 1e-6);
        assert!((s.p50_ms - 20.0).abs() < 1e-6);
        assert!((s.max_ms - 30.0).abs() < 1e-6);
        assert!(LatencySummary::from_samples(&[]).is_none());
    }
}
