//! Runtime device-presence probes.
//!
//! A backend being compiled in says nothing about the device we are running
//! on: a DSP integration can be linked into a build that lands on a handset
//! without the matching co-processor. The probe answers the second half of
//! the availability question.

use std::path::Path;

use super::BackendId;

/// Answers "is the hardware for this backend present right now?".
pub trait DeviceProbe: Send + Sync {
    fn is_present(&self, id: BackendId) -> bool;
}

/// Probe that looks for the accelerator device nodes exposed by the kernel.
///
/// Any backend can be force-disabled with `CADENCE_DISABLE_<NAME>=1`
/// (e.g. `CADENCE_DISABLE_NPU=1`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

const GPU_NODES: &[&str] = &["/dev/dri/renderD128", "/dev/kgsl-3d0", "/dev/mali0"];
const NPU_NODES: &[&str] = &["/dev/fastrpc-cdsp", "/dev/cdsprpc-smd", "/dev/accel/accel0"];
const DSP_NODES: &[&str] = &["/dev/fastrpc-adsp", "/dev/adsprpc-smd"];

impl DeviceProbe for SystemProbe {
    fn is_present(&self, id: BackendId) -> bool {
        if disabled_by_env(id) {
            return false;
        }
        match id {
            BackendId::Cpu => true,
            BackendId::Gpu => any_node_exists(GPU_NODES),
            BackendId::Npu => any_node_exists(NPU_NODES),
            BackendId::Dsp => any_node_exists(DSP_NODES),
        }
    }
}

/// Probe with a fixed answer per backend. Useful for hosts that already know
/// the device profile, and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    present: [bool; BackendId::COUNT],
}

impl StaticProbe {
    /// Only the CPU is present.
    pub fn cpu_only() -> Self {
        Self {
            present: [true, false, false, false],
        }
    }

    /// Every backend is present.
    pub fn all() -> Self {
        Self {
            present: [true; BackendId::COUNT],
        }
    }

    pub fn with(mut self, id: BackendId, present: bool) -> Self {
        self.present[id.ordinal() as usize] = present;
        self
    }
}

impl DeviceProbe for StaticProbe {
    fn is_present(&self, id: BackendId) -> bool {
        id == BackendId::Cpu || self.present[id.ordinal() as usize]
    }
}

fn any_node_exists(nodes: &[&str]) -> bool {
    nodes.iter().any(|p| Path::new(p).exists())
}

fn disabled_by_env(id: BackendId) -> bool {
    if id == BackendId::Cpu {
        return false;
    }
    let key = format!("CADENCE_DISABLE_{}", id.name().to_ascii_uppercase());
    std::env::var(key)
        .ok()
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}
