//! # cadence-core
//!
//! On-device inference orchestration: backend selection, bounded audio
//! ingestion, streaming recognition, interruptible generation and
//! camera-triggered multimodal inference.
//!
//! ## Architecture
//!
//! ```text
//! capture → AudioIngest → bounded chunk channel → recognition loop (thread)
//!                                                      │
//!                                          RecognitionEngine::transcribe
//!                                                      │
//!                                               Notifier (Transcript)
//!
//! GenerationRequest → GenerationSession::run ── RunState ◄── request_cancel
//!                          │                 (checked per token)
//!                   EmbeddingCache ◄── CaptureGate ◄── camera frames
//! ```
//!
//! Engines are trait objects; [`inference::stub`] provides deterministic
//! ones for tests and the CLI.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod backend;
pub mod buffering;
pub mod engine;
pub mod error;
pub mod generation;
pub mod inference;
pub mod ipc;
pub mod recognition;
pub mod settings;
pub mod vision;

// Convenience re-exports for downstream crates
pub use backend::{BackendDescriptor, BackendId, BackendRegistry};
pub use engine::{CadenceEngine, EngineConfig, Loaders, RunState};
pub use error::{CadenceError, Result};
pub use generation::{GenerationRequest, GenerationResult, SamplingParams};
pub use inference::{GenerationEngine, GenerationLoader, RecognitionEngine, RecognitionLoader};
pub use ipc::{
    events::{Notification, NotificationKind, NotificationSource},
    Notifier,
};
pub use recognition::{OperatingMode, RecognitionParams, RecognitionState};
pub use settings::Settings;
pub use vision::{CaptureGate, Frame, GateDecision, PixelFormat};
