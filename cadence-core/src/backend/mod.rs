//! Backend Registry: capability negotiation between the host and the
//! compute backends linked into this build.
//!
//! ## Availability
//!
//! ```text
//! available(id) = compiled_in(id) && probe.is_present(id)
//! ```
//!
//! `compiled_in` comes from a [`CapabilityTable`] built once at startup from
//! the Cargo features (`gpu`, `npu`, `dsp`). Presence comes from a
//! [`DeviceProbe`]. The CPU fallback is always both, so at least one
//! descriptor is always available.
//!
//! The registry is immutable after construction and is shared by reference
//! without locking.

pub mod probe;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use probe::{DeviceProbe, StaticProbe, SystemProbe};

use crate::error::{CadenceError, Result};
use crate::ipc::{events::NotificationSource, Notifier};

/// Compute backend identifier. The discriminant is the stable ordinal
/// exposed to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendId {
    Cpu = 0,
    Gpu = 1,
    Npu = 2,
    Dsp = 3,
}

impl BackendId {
    pub const COUNT: usize = 4;
    pub const ALL: [BackendId; Self::COUNT] =
        [BackendId::Cpu, BackendId::Gpu, BackendId::Npu, BackendId::Dsp];

    pub fn ordinal(self) -> u32 {
        self as u32
    }

    pub fn from_ordinal(ordinal: u32) -> Result<Self> {
        Self::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or_else(|| CadenceError::UnknownBackend(format!("ordinal {ordinal}")))
    }

    pub fn name(self) -> &'static str {
        match self {
            BackendId::Cpu => "cpu",
            BackendId::Gpu => "gpu",
            BackendId::Npu => "npu",
            BackendId::Dsp => "dsp",
        }
    }

    pub fn is_accelerator(self) -> bool {
        self != BackendId::Cpu
    }

    /// Fallback rank: higher is preferred when several backends are usable.
    fn default_rank(self) -> u8 {
        match self {
            BackendId::Cpu => 0,
            BackendId::Gpu => 1,
            BackendId::Dsp => 2,
            BackendId::Npu => 3,
        }
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendId {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "ggml" | "0" => Ok(BackendId::Cpu),
            "gpu" | "opencl" | "vulkan" | "1" => Ok(BackendId::Gpu),
            "npu" | "htp" | "2" => Ok(BackendId::Npu),
            "dsp" | "hexagon" | "3" => Ok(BackendId::Dsp),
            other => Err(CadenceError::UnknownBackend(other.to_string())),
        }
    }
}

/// Immutable description of one compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub name: &'static str,
    /// The integration is statically linked into this binary.
    pub compiled_in: bool,
    /// The device probe found the hardware.
    pub present: bool,
    /// Preference when choosing automatically; higher wins.
    pub rank: u8,
}

impl BackendDescriptor {
    pub fn is_available(&self) -> bool {
        self.compiled_in && self.present
    }

    fn unavailable_reason(&self) -> &'static str {
        match (self.compiled_in, self.present) {
            (false, _) => "not compiled into this build",
            (true, false) => "not present on this device",
            (true, true) => "available",
        }
    }
}

/// Which integrations were linked into the binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityTable {
    compiled: [bool; BackendId::COUNT],
}

impl CapabilityTable {
    /// The table for this build, derived from enabled Cargo features.
    pub fn from_build() -> Self {
        Self {
            compiled: [true, cfg!(feature = "gpu"), cfg!(feature = "npu"), cfg!(feature = "dsp")],
        }
    }

    pub fn cpu_only() -> Self {
        Self {
            compiled: [true, false, false, false],
        }
    }

    pub fn with(mut self, id: BackendId, compiled_in: bool) -> Self {
        self.compiled[id.ordinal() as usize] = compiled_in;
        self
    }

    pub fn is_compiled_in(&self, id: BackendId) -> bool {
        id == BackendId::Cpu || self.compiled[id.ordinal() as usize]
    }
}

/// Workload class, used to reject benchmark requests whose numbers would be
/// meaningless on the CPU fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    SpeechRecognition,
    TextGeneration,
    Multimodal,
    ImageGeneration,
}

impl Workload {
    pub fn accelerator_only(self) -> bool {
        matches!(self, Workload::ImageGeneration)
    }
}

/// Registry of every backend known to this build, with availability fixed at
/// construction.
#[derive(Debug, Clone)]
pub struct BackendRegistry {
    descriptors: [BackendDescriptor; BackendId::COUNT],
    notifier: Notifier,
}

impl BackendRegistry {
    /// Build from the compiled-in table and the system device probe.
    pub fn detect(notifier: Notifier) -> Self {
        Self::new(CapabilityTable::from_build(), &SystemProbe, notifier)
    }

    pub fn new(table: CapabilityTable, probe: &dyn DeviceProbe, notifier: Notifier) -> Self {
        let descriptors = BackendId::ALL.map(|id| BackendDescriptor {
            id,
            name: id.name(),
            compiled_in: table.is_compiled_in(id),
            present: id == BackendId::Cpu || probe.is_present(id),
            rank: id.default_rank(),
        });

        for d in &descriptors {
            info!(
                backend = d.name,
                compiled_in = d.compiled_in,
                present = d.present,
                rank = d.rank,
                "backend capability"
            );
        }

        Self {
            descriptors,
            notifier,
        }
    }

    pub fn descriptor(&self, id: BackendId) -> BackendDescriptor {
        self.descriptors[id.ordinal() as usize]
    }

    pub fn cpu(&self) -> BackendDescriptor {
        self.descriptor(BackendId::Cpu)
    }

    /// Every available backend, highest rank first. Pure read.
    pub fn list_available(&self) -> Vec<BackendDescriptor> {
        let mut out: Vec<_> = self
            .descriptors
            .iter()
            .copied()
            .filter(BackendDescriptor::is_available)
            .collect();
        out.sort_by(|a, b| b.rank.cmp(&a.rank));
        out
    }

    /// Highest-ranked available backend; the CPU when nothing else is usable.
    pub fn best_available(&self) -> BackendDescriptor {
        self.list_available()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.cpu())
    }

    /// Resolve a requested backend.
    ///
    /// - available → its descriptor
    /// - unavailable, `allow_fallback` → the CPU descriptor, plus one warning
    ///   notification
    /// - unavailable, no fallback → `BackendUnavailable`, plus one error
    ///   notification
    pub fn resolve(&self, requested: BackendId, allow_fallback: bool) -> Result<BackendDescriptor> {
        let descriptor = self.descriptor(requested);
        if descriptor.is_available() {
            return Ok(descriptor);
        }

        let reason = descriptor.unavailable_reason();
        if allow_fallback {
            warn!(requested = %requested, reason, "backend unavailable: falling back to cpu");
            self.notifier.warning(
                NotificationSource::Backend,
                format!("backend {requested} is {reason}; falling back to cpu"),
            );
            return Ok(self.cpu());
        }

        warn!(requested = %requested, reason, "backend unavailable: request rejected");
        self.notifier.error(
            NotificationSource::Backend,
            format!("backend {requested} is {reason} and fallback was not permitted"),
        );
        Err(CadenceError::BackendUnavailable {
            backend: requested,
            reason: reason.to_string(),
        })
    }

    /// Resolve by host-facing ordinal.
    pub fn resolve_ordinal(&self, ordinal: u32, allow_fallback: bool) -> Result<BackendDescriptor> {
        let id = match BackendId::from_ordinal(ordinal) {
            Ok(id) => id,
            Err(e) => {
                self.notifier
                    .error(NotificationSource::Backend, format!("unknown backend ordinal {ordinal}"));
                return Err(e);
            }
        };
        self.resolve(id, allow_fallback)
    }

    /// Resolve for a benchmark run.
    ///
    /// Accelerator-only workloads never fall back: a CPU number is not
    /// comparable to the accelerator number the caller asked for.
    pub fn resolve_benchmark(
        &self,
        requested: BackendId,
        workload: Workload,
        allow_fallback: bool,
    ) -> Result<BackendDescriptor> {
        if !workload.accelerator_only() {
            return self.resolve(requested, allow_fallback);
        }

        let descriptor = self.descriptor(requested);
        let reason = if !requested.is_accelerator() {
            Some("cpu cannot run this accelerator-only benchmark")
        } else if !descriptor.is_available() {
            Some(descriptor.unavailable_reason())
        } else {
            None
        };

        match reason {
            None => Ok(descriptor),
            Some(reason) => {
                warn!(requested = %requested, ?workload, reason, "benchmark rejected");
                self.notifier.error(
                    NotificationSource::Backend,
                    format!("{workload:?} benchmark on {requested} rejected: {reason}"),
                );
                Err(CadenceError::BackendUnavailable {
                    backend: requested,
                    reason: reason.to_string(),
                })
            }
        }
    }
}
