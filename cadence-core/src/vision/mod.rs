//! Camera-side multimodal inference: frames, fingerprints, the capture gate
//! and the image embedding cache it shares with generation.

pub mod cache;
pub mod fps;
pub mod frame;
pub mod gate;

pub use cache::{EmbeddingCache, EmbeddingKey};
pub use fps::FpsMeter;
pub use frame::{Frame, FrameFingerprint, PixelFormat};
pub use gate::{CaptureGate, GateDecision, GateStats, MultimodalRunner};
