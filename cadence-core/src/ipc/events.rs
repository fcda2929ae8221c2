//! Notification types pushed upward to the host.
//!
//! Every session reports through the same one-way channel. Each notification
//! carries a pre-formatted human-readable `message`; `source` and `kind` let
//! the host route it without parsing text.

use serde::{Deserialize, Serialize};

/// Emitted for every progress, output or error report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// Monotonically increasing sequence number (per `Notifier`).
    pub seq: u64,
    /// Which component produced the notification.
    pub source: NotificationSource,
    /// What the notification reports.
    pub kind: NotificationKind,
    /// Formatted, human-readable text.
    pub message: String,
}

/// Component that produced a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSource {
    Backend,
    Ingest,
    Recognition,
    Generation,
    Gate,
}

/// Kind of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Lifecycle / progress information.
    Progress,
    /// Recognised text for one window.
    Transcript,
    /// One streamed generation fragment.
    Token,
    /// Timing report (benchmark / stress-test modes).
    Metric,
    /// A recoverable condition was handled locally (fallback, backpressure).
    Warning,
    /// A request was rejected or an operation failed.
    Error,
}
