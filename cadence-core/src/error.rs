use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendId;

/// All errors produced by cadence-core.
#[derive(Debug, Error)]
pub enum CadenceError {
    #[error("backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("model load failed for {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("ingestion channel full: {buffered} of {ceiling} bytes buffered")]
    CapacityExceeded { buffered: usize, ceiling: usize },

    #[error("cancelled by user")]
    CancelledByUser,

    #[error("engine error: {0}")]
    EngineInternal(String),

    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },

    #[error("inference slot busy: {limit} active inference(s) allowed")]
    Busy { limit: usize },

    #[error("audio format error: {0}")]
    AudioFormat(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CadenceError {
    pub(crate) fn model_load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ModelLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state(op: &'static str, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            op,
            state: state.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
