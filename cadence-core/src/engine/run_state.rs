//! Per-inference cancellation token and the active-inference limit.

use std::fmt;
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::error::{CadenceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunPhase {
    Idle = 0,
    Running = 1,
    CancelRequested = 2,
}

impl RunPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Running,
            2 => Self::CancelRequested,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::CancelRequested => "cancel requested",
        })
    }
}

/// Tri-state run token shared between an inference loop and its caller.
///
/// The loop observes it with acquire loads; the caller is the only party
/// that moves it to `CancelRequested`. Cloning shares the same token.
///
/// A cancel may land before the loop calls [`begin`](Self::begin); the
/// loop then sees `CancelledByUser` instead of starting.
#[derive(Clone, Default)]
pub struct RunState(Arc<AtomicU8>);

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.phase() == RunPhase::Running
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.phase() == RunPhase::CancelRequested
    }

    /// `Idle -> Running`.
    ///
    /// # Errors
    /// `CancelledByUser` when a cancel arrived before the run started (the
    /// token stays `CancelRequested` until [`finish`](Self::finish)),
    /// `InvalidState` when the token is already running.
    pub fn begin(&self) -> Result<()> {
        self.0
            .compare_exchange(
                RunPhase::Idle as u8,
                RunPhase::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|cur| match RunPhase::from_u8(cur) {
                RunPhase::CancelRequested => CadenceError::CancelledByUser,
                phase => CadenceError::invalid_state("begin inference", phase),
            })
    }

    /// `Idle | Running -> CancelRequested`. Returns whether a cancel was
    /// recorded; a second request on the same run returns false.
    pub fn request_cancel(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                match RunPhase::from_u8(cur) {
                    RunPhase::Idle | RunPhase::Running => Some(RunPhase::CancelRequested as u8),
                    RunPhase::CancelRequested => None,
                }
            })
            .is_ok()
    }

    /// `CancelRequested -> Idle` for a run that never started.
    pub fn clear_cancel(&self) -> bool {
        self.0
            .compare_exchange(
                RunPhase::CancelRequested as u8,
                RunPhase::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Whether both handles share one token.
    pub fn same_token(&self, other: &RunState) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Back to `Idle` once the loop has wound down.
    pub fn finish(&self) {
        self.0.store(RunPhase::Idle as u8, Ordering::Release);
    }
}

impl fmt::Debug for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RunState").field(&self.phase()).finish()
    }
}

/// Every token with an inference in progress on a façade, started or about
/// to start. Cancels and `is_running` queries go through here.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<Vec<RunState>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `run` until the returned guard drops.
    pub fn register(&self, run: &RunState) -> Registration {
        self.runs.lock().push(run.clone());
        Registration {
            runs: Arc::clone(&self.runs),
            run: run.clone(),
        }
    }

    /// Cancel every registered run. Returns how many cancels were recorded.
    pub fn request_cancel_all(&self) -> usize {
        self.runs
            .lock()
            .iter()
            .filter(|r| r.request_cancel())
            .count()
    }

    pub fn any_running(&self) -> bool {
        self.runs.lock().iter().any(RunState::is_running)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

/// Removes its token from the [`RunRegistry`] on drop.
#[derive(Debug)]
pub struct Registration {
    runs: Arc<Mutex<Vec<RunState>>>,
    run: RunState,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut runs = self.runs.lock();
        if let Some(i) = runs.iter().position(|r| r.same_token(&self.run)) {
            runs.swap_remove(i);
        }
    }
}

/// Bounds how many inferences may run at once across a façade.
#[derive(Debug, Clone)]
pub struct ActiveLimit {
    limit: usize,
    active: Arc<AtomicUsize>,
}

impl ActiveLimit {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Claim a slot, or `Busy` when all are taken.
    pub fn try_acquire(&self) -> Result<ActiveSlot> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .map(|_| ActiveSlot {
                active: Arc::clone(&self.active),
            })
            .map_err(|_| CadenceError::Busy { limit: self.limit })
    }
}

/// Held for the duration of one inference; releases its slot on drop.
#[derive(Debug)]
pub struct ActiveSlot {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
