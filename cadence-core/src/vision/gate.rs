//! Capture-Triggered Inference Gate.
//!
//! Sits on the camera callback. Every `stride`-th frame is fingerprinted and
//! either answered from the last completed result, reported as already in
//! flight, passed through while the worker is busy, or dispatched to the
//! gate's worker thread. The capture thread never waits on inference: the
//! only lock it takes guards a few words of state.
//!
//! At most one multimodal inference is in flight. Only completed results
//! are remembered; an interrupted or failed run leaves the previous answer.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{FpsMeter, Frame, FrameFingerprint};
use crate::error::{CadenceError, Result};
use crate::generation::GenerationResult;
use crate::ipc::{
    events::{NotificationKind, NotificationSource},
    Notifier,
};

/// Runs one image-conditioned inference for the gate.
pub trait MultimodalRunner: Send + Sync + 'static {
    /// Blocking; called on the gate's worker thread only.
    fn run(&self, frame: &Frame) -> Result<GenerationResult>;

    /// Ask the in-progress (or about to start) [`run`](Self::run) to stop
    /// early. Returns whether the cancel was recorded.
    fn cancel(&self) -> bool;
}

/// What the gate did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Not on the stride; ignored.
    PassThrough,
    /// Handed to the worker.
    Dispatched(FrameFingerprint),
    /// Same view as the last completed inference.
    Cached(String),
    /// Same view as the inference still running.
    Pending,
    /// A different view is still being processed; this one is dropped.
    Busy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateStats {
    pub frames: u64,
    pub dispatched: u64,
    pub cached: u64,
    pub pending: u64,
    pub busy: u64,
    pub completed: u64,
}

#[derive(Default)]
struct GateState {
    in_flight: Option<FrameFingerprint>,
    job: Option<Frame>,
    last: Option<(FrameFingerprint, String)>,
    shutdown: bool,
    stats: GateStats,
}

struct Shared {
    state: Mutex<GateState>,
    /// Signals the worker: a job arrived or shutdown.
    work: Condvar,
    /// Signals waiters: the worker went idle.
    idle: Condvar,
}

pub struct CaptureGate {
    stride: u64,
    counter: AtomicU64,
    shared: Arc<Shared>,
    runner: Arc<dyn MultimodalRunner>,
    fps: Mutex<FpsMeter>,
    worker: Option<JoinHandle<()>>,
}

impl CaptureGate {
    pub fn new(stride: u32, runner: Arc<dyn MultimodalRunner>, notifier: Notifier) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(GateState::default()),
            work: Condvar::new(),
            idle: Condvar::new(),
        });
        let worker = {
            let shared = Arc::clone(&shared);
            let runner = Arc::clone(&runner);
            thread::Builder::new()
                .name("cadence-capture-gate".into())
                .spawn(move || worker_loop(shared, runner, notifier))?
        };
        info!(stride, "capture gate started");
        Ok(Self {
            stride: u64::from(stride.max(1)),
            counter: AtomicU64::new(0),
            shared,
            runner,
            fps: Mutex::new(FpsMeter::new()),
            worker: Some(worker),
        })
    }

    /// Called from the capture thread for every frame.
    pub fn on_frame(&self, frame: Frame) -> GateDecision {
        self.fps.lock().tick(frame.captured_at);
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.stride != 0 {
            return GateDecision::PassThrough;
        }

        let fingerprint = frame.fingerprint();
        let mut st = self.shared.state.lock();
        st.stats.frames += 1;

        let cached = match &st.last {
            Some((fp, text)) if *fp == fingerprint => Some(text.clone()),
            _ => None,
        };
        if let Some(text) = cached {
            st.stats.cached += 1;
            return GateDecision::Cached(text);
        }
        let in_flight = st.in_flight;
        match in_flight {
            Some(fp) if fp == fingerprint => {
                st.stats.pending += 1;
                GateDecision::Pending
            }
            Some(_) => {
                st.stats.busy += 1;
                GateDecision::Busy
            }
            None => {
                st.in_flight = Some(fingerprint);
                st.job = Some(frame);
                st.stats.dispatched += 1;
                self.shared.work.notify_one();
                debug!(%fingerprint, "frame dispatched");
                GateDecision::Dispatched(fingerprint)
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.shared.state.lock().in_flight.is_some()
    }

    /// Last completed result and the view it belongs to.
    pub fn last_result(&self) -> Option<(FrameFingerprint, String)> {
        self.shared.state.lock().last.clone()
    }

    pub fn stats(&self) -> GateStats {
        self.shared.state.lock().stats
    }

    pub fn fps(&self) -> Option<f32> {
        self.fps.lock().fps()
    }

    /// Interrupt the dispatched inference, if any. Returns whether the
    /// runner recorded the cancel.
    pub fn cancel_in_flight(&self) -> bool {
        self.is_busy() && self.runner.cancel()
    }

    /// Block until no inference is in flight, or `timeout` elapses.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.state.lock();
        while st.in_flight.is_some() {
            if self.shared.idle.wait_until(&mut st, deadline).timed_out() {
                return st.in_flight.is_none();
            }
        }
        true
    }
}

impl Drop for CaptureGate {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            st.job = None;
            self.shared.work.notify_all();
        }
        self.runner.cancel();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!("capture gate worker panicked");
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, runner: Arc<dyn MultimodalRunner>, notifier: Notifier) {
    loop {
        let frame = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    return;
                }
                if let Some(frame) = st.job.take() {
                    break frame;
                }
                shared.work.wait(&mut st);
            }
        };

        let fingerprint = frame.fingerprint();
        let outcome = runner.run(&frame);

        let mut st = shared.state.lock();
        st.in_flight = None;
        match outcome {
            Ok(GenerationResult::Completed { text, .. }) => {
                st.stats.completed += 1;
                notifier.emit(
                    NotificationSource::Gate,
                    NotificationKind::Transcript,
                    text.clone(),
                );
                st.last = Some((fingerprint, text));
            }
            Ok(GenerationResult::Interrupted { tokens, .. }) => {
                debug!(%fingerprint, tokens, "gate inference interrupted");
                notifier.progress(
                    NotificationSource::Gate,
                    format!("frame {fingerprint} dropped: {}", CadenceError::CancelledByUser),
                );
            }
            Ok(GenerationResult::Failed { reason }) => {
                warn!(%fingerprint, reason = reason.as_str(), "gate inference failed");
            }
            Err(e) => {
                warn!(%fingerprint, "gate inference rejected: {e}");
                notifier.warning(NotificationSource::Gate, format!("frame skipped: {e}"));
            }
        }
        shared.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CadenceError;
    use crate::vision::PixelFormat;
    use std::sync::atomic::AtomicBool;

    /// Blocks each run until released, or until cancelled.
    struct GatedRunner {
        release: Mutex<bool>,
        cv: Condvar,
        cancelled: AtomicBool,
        runs: AtomicU64,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                release: Mutex::new(false),
                cv: Condvar::new(),
                cancelled: AtomicBool::new(false),
                runs: AtomicU64::new(0),
            })
        }

        fn release(&self) {
            *self.release.lock() = true;
            self.cv.notify_all();
        }
    }

    impl MultimodalRunner for GatedRunner {
        fn run(&self, frame: &Frame) -> Result<GenerationResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let mut go = self.release.lock();
            while !*go && !self.cancelled.load(Ordering::SeqCst) {
                self.cv.wait_for(&mut go, Duration::from_millis(5));
            }
            *go = false;
            if self.cancelled.swap(false, Ordering::SeqCst) {
                return Ok(GenerationResult::Interrupted {
                    partial: String::new(),
                    tokens: 0,
                });
            }
            Ok(GenerationResult::Completed {
                text: format!("saw {}", frame.data[0]),
                tokens: 2,
            })
        }

        fn cancel(&self) -> bool {
            let recorded = !self.cancelled.swap(true, Ordering::SeqCst);
            self.cv.notify_all();
            recorded
        }
    }

    fn frame(fill: u8) -> Frame {
        Frame::packed(2, 2, PixelFormat::Rgba8888, vec![fill; 16]).unwrap()
    }

    fn gate(stride: u32, runner: Arc<GatedRunner>) -> CaptureGate {
        CaptureGate::new(stride, runner, Notifier::tracing()).unwrap()
    }

    #[test]
    fn only_every_nth_frame_is_considered() {
        let runner = GatedRunner::new();
        let g = gate(3, Arc::clone(&runner));
        assert_eq!(g.on_frame(frame(1)), GateDecision::PassThrough);
        assert_eq!(g.on_frame(frame(1)), GateDecision::PassThrough);
        assert!(matches!(g.on_frame(frame(1)), GateDecision::Dispatched(_)));
        runner.release();
        assert!(g.wait_idle(Duration::from_secs(1)));
    }

    #[test]
    fn dedupes_in_flight_and_completed_frames() {
        let runner = GatedRunner::new();
        let g = gate(1, Arc::clone(&runner));

        assert!(matches!(g.on_frame(frame(1)), GateDecision::Dispatched(_)));
        assert_eq!(g.on_frame(frame(1)), GateDecision::Pending);
        assert_eq!(g.on_frame(frame(2)), GateDecision::Busy);

        runner.release();
        assert!(g.wait_idle(Duration::from_secs(1)));

        // Idempotent: the same view keeps answering from the cache.
        for _ in 0..3 {
            assert_eq!(g.on_frame(frame(1)), GateDecision::Cached("saw 1".into()));
        }
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        let stats = g.stats();
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.cached, 3);
        assert_eq!(stats.completed, 1);
    }

    #[test]
    fn cancelled_run_is_not_cached() {
        let runner = GatedRunner::new();
        let g = gate(1, Arc::clone(&runner));
        assert!(!g.cancel_in_flight());
        assert!(matches!(g.on_frame(frame(5)), GateDecision::Dispatched(_)));
        while runner.runs.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        assert!(g.cancel_in_flight());
        assert!(g.wait_idle(Duration::from_secs(1)));
        assert!(g.last_result().is_none());
        assert!(matches!(g.on_frame(frame(5)), GateDecision::Dispatched(_)));
        runner.release();
        assert!(g.wait_idle(Duration::from_secs(1)));
    }

    #[test]
    fn capture_thread_never_blocks_on_a_slow_run() {
        let runner = GatedRunner::new();
        let g = gate(1, Arc::clone(&runner));
        g.on_frame(frame(1));
        let start = Instant::now();
        for i in 0..100u8 {
            g.on_frame(frame(i.wrapping_add(2)));
        }
        assert!(start.elapsed() < Duration::from_millis(200));
        runner.release();
        assert!(g.wait_idle(Duration::from_secs(1)));
    }

    #[test]
    fn rejected_runs_clear_the_slot() {
        struct Rejecting;
        impl MultimodalRunner for Rejecting {
            fn run(&self, _frame: &Frame) -> Result<GenerationResult> {
                Err(CadenceError::Busy { limit: 1 })
            }
            fn cancel(&self) -> bool {
                false
            }
        }
        let g = CaptureGate::new(1, Arc::new(Rejecting), Notifier::tracing()).unwrap();
        g.on_frame(frame(1));
        assert!(g.wait_idle(Duration::from_secs(1)));
        assert!(matches!(g.on_frame(frame(1)), GateDecision::Dispatched(_)));
        assert!(g.wait_idle(Duration::from_secs(1)));
    }

    #[test]
    fn drop_cancels_in_flight_run() {
        let runner = GatedRunner::new();
        let g = gate(1, Arc::clone(&runner));
        g.on_frame(frame(9));
        while runner.runs.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }
        let start = Instant::now();
        drop(g);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
