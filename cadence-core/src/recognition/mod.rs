//! Recognition Session: owns one speech engine and its consumer thread.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──init──► Ready ──start──► Running ──stop──► Stopped
//!                           ▲                                   │
//!                           └──────────────reset────────────────┘
//! any state ──finalize──► Uninitialized
//! ```
//!
//! A failed transition leaves the previous state (and engine) untouched.
//! The engine is moved into the consumer thread on `start` and comes back
//! through the thread's join handle on `stop`, so it is never shared. If the
//! thread cannot be spawned the engine is reclaimed and the session stays
//! `Ready`.

pub mod pipeline;

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::audio::AudioIngest;
use crate::backend::{BackendDescriptor, BackendId, BackendRegistry, Workload};
use crate::buffering::{create_audio_channel, ChannelConfig, ChannelMonitor, ChunkConsumer};
use crate::engine::run_state::{ActiveLimit, RunState};
use crate::error::{CadenceError, Result};
use crate::inference::{DecodingMode, RecognitionEngine, RecognitionLoader, RecognitionModelSpec};
use crate::ipc::{events::NotificationSource, Notifier};

pub use pipeline::{DiagnosticsSnapshot, LatencySummary, LoopExit, RecognitionDiagnostics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecognitionState {
    Uninitialized,
    Ready,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RecognitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperatingMode {
    #[default]
    Normal,
    StressTest,
    Benchmark,
    TranscribeRecord,
}

/// Model binding for `init` / `reset`.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionParams {
    pub model_path: PathBuf,
    pub threads: usize,
    pub mode: OperatingMode,
    pub backend: BackendId,
    pub allow_fallback: bool,
    pub decoding: DecodingMode,
}

impl RecognitionParams {
    pub fn new(model_path: impl Into<PathBuf>, threads: usize, mode: OperatingMode, backend: BackendId) -> Self {
        Self {
            model_path: model_path.into(),
            threads,
            mode,
            backend,
            allow_fallback: false,
            decoding: DecodingMode::Greedy,
        }
    }

    pub fn allow_fallback(mut self, allow: bool) -> Self {
        self.allow_fallback = allow;
        self
    }

    pub fn decoding(mut self, decoding: DecodingMode) -> Self {
        self.decoding = decoding;
        self
    }
}

/// Session-wide tuning taken from the engine configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel: ChannelConfig,
    pub window_samples: usize,
    pub min_flush_samples: usize,
    pub poll_timeout: Duration,
    pub max_engine_errors: usize,
    pub stress_iterations: usize,
    pub record_dir: Option<PathBuf>,
}

type LoopBody = Box<dyn FnOnce() -> Option<pipeline::LoopOutcome> + Send>;
type Spawner = fn(String, LoopBody) -> io::Result<JoinHandle<Option<pipeline::LoopOutcome>>>;

fn spawn_named(name: String, body: LoopBody) -> io::Result<JoinHandle<Option<pipeline::LoopOutcome>>> {
    thread::Builder::new().name(name).spawn(body)
}

/// Engine plus the backend and params it was loaded with.
struct Bound {
    engine: Box<dyn RecognitionEngine>,
    backend: BackendDescriptor,
    params: RecognitionParams,
}

pub struct RecognitionSession {
    loader: Arc<dyn RecognitionLoader>,
    registry: Arc<BackendRegistry>,
    limit: ActiveLimit,
    notifier: Notifier,
    config: SessionConfig,
    state: Arc<Mutex<RecognitionState>>,
    diagnostics: Arc<RecognitionDiagnostics>,
    bound: Option<Bound>,
    /// Params of the running session while the engine lives on the worker.
    running_params: Option<(RecognitionParams, BackendDescriptor)>,
    consumer: Option<ChunkConsumer>,
    ingest: Option<AudioIngest>,
    monitor: Option<ChannelMonitor>,
    run: RunState,
    worker: Option<JoinHandle<Option<pipeline::LoopOutcome>>>,
    spawn: Spawner,
    runs: u64,
}

impl RecognitionSession {
    pub fn new(
        loader: Arc<dyn RecognitionLoader>,
        registry: Arc<BackendRegistry>,
        limit: ActiveLimit,
        notifier: Notifier,
        config: SessionConfig,
    ) -> Self {
        Self {
            loader,
            registry,
            limit,
            notifier,
            config,
            state: Arc::new(Mutex::new(RecognitionState::Uninitialized)),
            diagnostics: Arc::new(RecognitionDiagnostics::default()),
            bound: None,
            running_params: None,
            consumer: None,
            ingest: None,
            monitor: None,
            run: RunState::new(),
            worker: None,
            spawn: spawn_named,
            runs: 0,
        }
    }

    pub fn state(&self) -> RecognitionState {
        *self.state.lock()
    }

    /// Shared handle for observers that must not contend with the session.
    pub fn state_handle(&self) -> Arc<Mutex<RecognitionState>> {
        Arc::clone(&self.state)
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn channel_monitor(&self) -> Option<ChannelMonitor> {
        self.monitor.clone()
    }

    /// Backend the current engine runs on, once initialised.
    pub fn backend(&self) -> Option<BackendDescriptor> {
        self.bound
            .as_ref()
            .map(|b| b.backend)
            .or_else(|| self.running_params.as_ref().map(|(_, d)| *d))
    }

    /// `Uninitialized -> Ready`: resolve the backend, load the engine and
    /// open the ingestion channel.
    pub fn init(&mut self, params: RecognitionParams) -> Result<()> {
        self.expect_state("init", &[RecognitionState::Uninitialized])?;

        let bound = self.bind(params)?;
        let (producer, consumer) = create_audio_channel(self.config.channel, self.notifier.clone());
        self.monitor = Some(producer.monitor());
        self.ingest = Some(AudioIngest::new(producer, self.notifier.clone()));
        self.consumer = Some(consumer);

        info!(
            model = %bound.params.model_path.display(),
            backend = %bound.backend.id,
            mode = ?bound.params.mode,
            "recognition session ready"
        );
        self.bound = Some(bound);
        self.set_state(RecognitionState::Ready);
        Ok(())
    }

    /// Hand the producer side to the capture source. Available once per init.
    pub fn take_ingest(&mut self) -> Result<AudioIngest> {
        match self.ingest.take() {
            Some(ingest) => Ok(ingest),
            None => Err(CadenceError::invalid_state(
                "take the audio ingest",
                match self.state() {
                    RecognitionState::Uninitialized => "uninitialized".to_string(),
                    _ => "it was already taken".to_string(),
                },
            )),
        }
    }

    /// `Ready -> Running`: spawn the consumer thread.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state("start", &[RecognitionState::Ready])?;

        let slot = match self.limit.try_acquire() {
            Ok(slot) => slot,
            Err(e) => {
                self.notifier
                    .warning(NotificationSource::Recognition, format!("start rejected: {e}"));
                return Err(e);
            }
        };
        if self.bound.is_none() || self.consumer.is_none() {
            return Err(CadenceError::invalid_state("start", "no engine is bound"));
        }
        self.run.begin()?;
        let (Some(bound), Some(consumer)) = (self.bound.take(), self.consumer.take()) else {
            self.run.finish();
            return Err(CadenceError::invalid_state("start", "no engine is bound"));
        };
        self.diagnostics.reset();
        self.runs += 1;

        let ctx = pipeline::LoopContext {
            session_id: self.runs,
            engine: bound.engine,
            consumer,
            run: self.run.clone(),
            notifier: self.notifier.clone(),
            diagnostics: Arc::clone(&self.diagnostics),
            state: Arc::clone(&self.state),
            config: pipeline::LoopConfig {
                window_samples: self.config.window_samples,
                min_flush_samples: self.config.min_flush_samples,
                poll_timeout: self.config.poll_timeout,
                max_engine_errors: self.config.max_engine_errors,
                mode: bound.params.mode,
                stress_iterations: self.config.stress_iterations,
                record_dir: self.config.record_dir.clone(),
            },
            slot,
        };
        self.running_params = Some((bound.params, bound.backend));

        // Running before the thread exists, so an immediate engine failure
        // on the worker can move it on to Stopped.
        self.set_state(RecognitionState::Running);
        let handoff = Arc::new(Mutex::new(Some(ctx)));
        let body: LoopBody = {
            let handoff = Arc::clone(&handoff);
            Box::new(move || {
                let ctx = handoff.lock().take();
                ctx.map(pipeline::run)
            })
        };
        let spawned = (self.spawn)(format!("cadence-recognition-{}", self.runs), body);

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                self.notifier
                    .progress(NotificationSource::Recognition, "recognition started");
                Ok(())
            }
            Err(e) => {
                let running = self.running_params.take();
                if let (Some(ctx), Some((params, backend))) = (handoff.lock().take(), running) {
                    self.consumer = Some(ctx.consumer);
                    self.bound = Some(Bound {
                        engine: ctx.engine,
                        backend,
                        params,
                    });
                }
                self.run.finish();
                self.set_state(RecognitionState::Ready);
                error!("failed to spawn recognition thread: {e}");
                self.notifier
                    .error(NotificationSource::Recognition, format!("recognition start failed: {e}"));
                Err(CadenceError::Io(e))
            }
        }
    }

    /// `Running -> Stopped`: cancel the loop, join it and take the engine back.
    ///
    /// Returns within one poll timeout plus any in-flight transcription.
    /// Also reaps a loop that already stopped itself after engine failures.
    pub fn stop(&mut self) -> Result<()> {
        let current = self.state();
        let reapable = current == RecognitionState::Stopped && self.worker.is_some();
        if current != RecognitionState::Running && !reapable {
            return Err(CadenceError::invalid_state("stop", current));
        }

        if current == RecognitionState::Running {
            self.set_state(RecognitionState::Stopping);
        }
        self.run.request_cancel();
        let result = self.join_worker();
        self.set_state(RecognitionState::Stopped);
        if result.is_ok() {
            self.notifier
                .progress(NotificationSource::Recognition, "recognition stopped");
        }
        result
    }

    /// `Stopped | Ready -> Ready`, re-binding to a (possibly different) model
    /// without tearing down the channel.
    ///
    /// The same params keep the loaded engine and clear its decoder state;
    /// different params load a new one. A loop that stopped itself after
    /// engine failures is joined first.
    pub fn reset(&mut self, params: RecognitionParams) -> Result<()> {
        self.expect_state("reset", &[RecognitionState::Stopped, RecognitionState::Ready])?;
        if self.worker.is_some() {
            self.join_worker()?;
        }
        if self.consumer.is_none() {
            return Err(CadenceError::invalid_state("reset", "the audio channel is gone"));
        }

        let bound = match self.bound.take() {
            Some(mut bound) if bound.params == params => {
                bound.engine.reset();
                debug!(model = %params.model_path.display(), "recognition engine state cleared");
                bound
            }
            previous => match self.bind(params) {
                Ok(bound) => bound,
                Err(e) => {
                    self.bound = previous;
                    return Err(e);
                }
            },
        };
        if let Some(consumer) = self.consumer.as_mut() {
            let dropped = consumer.drain();
            if dropped > 0 {
                info!(dropped, "discarded buffered audio on reset");
            }
        }
        self.bound = Some(bound);
        self.running_params = None;
        self.set_state(RecognitionState::Ready);
        Ok(())
    }

    /// Any state `-> Uninitialized`, releasing the engine and the channel.
    pub fn finalize(&mut self) {
        if self.worker.is_some() {
            self.run.request_cancel();
            if let Err(e) = self.join_worker() {
                warn!("recognition worker ended abnormally during finalize: {e}");
            }
        }
        self.bound = None;
        self.running_params = None;
        self.consumer = None;
        self.ingest = None;
        self.monitor = None;
        self.set_state(RecognitionState::Uninitialized);
    }

    fn bind(&self, params: RecognitionParams) -> Result<Bound> {
        let backend = if params.mode == OperatingMode::Benchmark {
            self.registry
                .resolve_benchmark(params.backend, Workload::SpeechRecognition, params.allow_fallback)?
        } else {
            self.registry.resolve(params.backend, params.allow_fallback)?
        };

        let spec = RecognitionModelSpec {
            model_path: params.model_path.clone(),
            backend: backend.id,
            threads: params.threads.max(1),
            decoding: params.decoding,
        };
        let engine = self.loader.load(&spec).map_err(|e| {
            error!(model = %spec.model_path.display(), "recognition model load failed: {e}");
            self.notifier
                .error(NotificationSource::Recognition, format!("cannot load model: {e}"));
            e
        })?;
        Ok(Bound {
            engine,
            backend,
            params,
        })
    }

    fn join_worker(&mut self) -> Result<()> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };
        let joined = handle.join();
        self.run.finish();
        let running = self.running_params.take();

        match joined {
            Ok(Some(outcome)) => {
                self.consumer = Some(outcome.consumer);
                if let Some((params, backend)) = running {
                    self.bound = Some(Bound {
                        engine: outcome.engine,
                        backend,
                        params,
                    });
                }
                Ok(())
            }
            Ok(None) | Err(_) => {
                error!("recognition thread ended abnormally; engine lost");
                self.notifier
                    .error(NotificationSource::Recognition, "recognition thread ended abnormally");
                Err(CadenceError::EngineInternal(
                    "recognition thread ended abnormally".into(),
                ))
            }
        }
    }

    fn expect_state(&self, op: &'static str, allowed: &[RecognitionState]) -> Result<()> {
        let current = self.state();
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(CadenceError::invalid_state(op, current))
        }
    }

    fn set_state(&self, next: RecognitionState) {
        *self.state.lock() = next;
    }
}

impl Drop for RecognitionSession {
    fn drop(&mut self) {
        self.finalize();
    }
}
