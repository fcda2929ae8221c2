//! Persistent engine settings (JSON file in the platform data directory).
//!
//! Values are normalised after every load or `set`, and `CADENCE_*`
//! environment variables win over the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendId;
use crate::buffering::{ChannelConfig, DEFAULT_CEILING_BYTES, DEFAULT_CHUNK_BYTES};
use crate::engine::EngineConfig;
use crate::error::{CadenceError, Result};
use crate::generation::{GenerationRequest, SamplingParams, DEFAULT_MAX_TOKENS};
use crate::inference::DecodingMode;
use crate::recognition::{OperatingMode, RecognitionParams};

/// Every key accepted by [`Settings::set`] and [`Settings::get`].
pub const KEYS: &[&str] = &[
    "temperature",
    "topP",
    "threads",
    "decoding",
    "beamSize",
    "mode",
    "backend",
    "allowBackendFallback",
    "maxTokens",
    "seed",
    "maxActiveInferences",
    "channelCeilingBytes",
    "chunkBytes",
    "pollTimeoutMs",
    "windowMs",
    "frameStride",
    "recordDir",
    "recognitionModel",
    "generationModel",
    "projector",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct Settings {
    pub temperature: f32,
    pub top_p: f32,
    pub threads: usize,
    /// `greedy` or `beam`.
    pub decoding: String,
    pub beam_size: u32,
    pub mode: OperatingMode,
    /// A backend name, or `auto` for the best available one.
    pub backend: String,
    pub allow_backend_fallback: bool,
    pub max_tokens: usize,
    pub seed: Option<u64>,
    pub max_active_inferences: usize,
    pub channel_ceiling_bytes: usize,
    pub chunk_bytes: usize,
    pub poll_timeout_ms: u64,
    pub window_ms: u32,
    pub frame_stride: u32,
    pub record_dir: Option<PathBuf>,
    pub recognition_model: Option<PathBuf>,
    pub generation_model: Option<PathBuf>,
    pub projector: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            threads: 4,
            decoding: "greedy".into(),
            beam_size: 5,
            mode: OperatingMode::Normal,
            backend: "cpu".into(),
            allow_backend_fallback: true,
            max_tokens: DEFAULT_MAX_TOKENS,
            seed: None,
            max_active_inferences: 1,
            channel_ceiling_bytes: DEFAULT_CEILING_BYTES,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            poll_timeout_ms: 100,
            window_ms: 1_000,
            frame_stride: 30,
            record_dir: None,
            recognition_model: None,
            generation_model: None,
            projector: None,
        }
    }
}

impl Settings {
    pub fn normalize(&mut self) {
        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, 2.0)
        } else {
            0.7
        };
        self.top_p = if self.top_p.is_finite() && self.top_p > 0.0 {
            self.top_p.min(1.0)
        } else {
            1.0
        };
        self.threads = self.threads.clamp(1, 64);
        self.decoding = normalize_decoding(&self.decoding);
        self.beam_size = self.beam_size.clamp(1, 16);
        self.backend = normalize_backend(&self.backend);
        self.max_tokens = self.max_tokens.clamp(1, 8_192);
        self.max_active_inferences = self.max_active_inferences.clamp(1, 8);
        self.chunk_bytes = self.chunk_bytes.clamp(320, 64_000);
        self.channel_ceiling_bytes = self.channel_ceiling_bytes.clamp(self.chunk_bytes, 16_000_000);
        self.poll_timeout_ms = self.poll_timeout_ms.clamp(10, 1_000);
        self.window_ms = self.window_ms.clamp(100, 30_000);
        self.frame_stride = self.frame_stride.clamp(1, 600);
        self.record_dir = normalize_path(self.record_dir.take());
        self.recognition_model = normalize_path(self.recognition_model.take());
        self.generation_model = normalize_path(self.generation_model.take());
        self.projector = normalize_path(self.projector.take());
    }

    /// Set one key from its textual form, then re-normalise.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let v = value.trim();
        match key {
            "temperature" => self.temperature = parse(key, v)?,
            "topP" => self.top_p = parse(key, v)?,
            "threads" => self.threads = parse(key, v)?,
            "decoding" => {
                self.decoding = match v.to_ascii_lowercase().as_str() {
                    "greedy" | "beam" | "beam_search" | "beamsearch" => normalize_decoding(v),
                    _ => return Err(invalid(key, "expected greedy or beam")),
                }
            }
            "beamSize" => self.beam_size = parse(key, v)?,
            "mode" => self.mode = parse_mode(v).ok_or_else(|| invalid(key, "unknown operating mode"))?,
            "backend" => {
                if !v.eq_ignore_ascii_case("auto") {
                    v.parse::<BackendId>().map_err(|e| invalid(key, e))?;
                }
                self.backend = normalize_backend(v);
            }
            "allowBackendFallback" => self.allow_backend_fallback = parse_bool(key, v)?,
            "maxTokens" => self.max_tokens = parse(key, v)?,
            "seed" => self.seed = if is_unset(v) { None } else { Some(parse(key, v)?) },
            "maxActiveInferences" => self.max_active_inferences = parse(key, v)?,
            "channelCeilingBytes" => self.channel_ceiling_bytes = parse(key, v)?,
            "chunkBytes" => self.chunk_bytes = parse(key, v)?,
            "pollTimeoutMs" => self.poll_timeout_ms = parse(key, v)?,
            "windowMs" => self.window_ms = parse(key, v)?,
            "frameStride" => self.frame_stride = parse(key, v)?,
            "recordDir" => self.record_dir = optional_path(v),
            "recognitionModel" => self.recognition_model = optional_path(v),
            "generationModel" => self.generation_model = optional_path(v),
            "projector" => self.projector = optional_path(v),
            _ => return Err(invalid(key, "unknown key")),
        }
        self.normalize();
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let path = |p: &Option<PathBuf>| p.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
        Some(match key {
            "temperature" => self.temperature.to_string(),
            "topP" => self.top_p.to_string(),
            "threads" => self.threads.to_string(),
            "decoding" => self.decoding.clone(),
            "beamSize" => self.beam_size.to_string(),
            "mode" => mode_name(self.mode).into(),
            "backend" => self.backend.clone(),
            "allowBackendFallback" => self.allow_backend_fallback.to_string(),
            "maxTokens" => self.max_tokens.to_string(),
            "seed" => self.seed.map(|s| s.to_string()).unwrap_or_default(),
            "maxActiveInferences" => self.max_active_inferences.to_string(),
            "channelCeilingBytes" => self.channel_ceiling_bytes.to_string(),
            "chunkBytes" => self.chunk_bytes.to_string(),
            "pollTimeoutMs" => self.poll_timeout_ms.to_string(),
            "windowMs" => self.window_ms.to_string(),
            "frameStride" => self.frame_stride.to_string(),
            "recordDir" => path(&self.record_dir),
            "recognitionModel" => path(&self.recognition_model),
            "generationModel" => path(&self.generation_model),
            "projector" => path(&self.projector),
            _ => return None,
        })
    }

    /// Apply `CADENCE_<KEY>` overrides (`topP` → `CADENCE_TOP_P`).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Overrides from any lookup; malformed values are logged and skipped.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for key in KEYS {
            let var = env_var_name(key);
            let Some(value) = lookup(&var) else { continue };
            match self.set(key, &value) {
                Ok(()) => debug!(var = %var, "setting overridden from environment"),
                Err(e) => warn!(var = %var, error = %e, "ignoring environment override"),
            }
        }
    }

    /// `None` means "best available".
    pub fn backend_id(&self) -> Option<BackendId> {
        self.backend.parse().ok()
    }

    pub fn decoding_mode(&self) -> DecodingMode {
        match self.decoding.as_str() {
            "beam" => DecodingMode::BeamSearch {
                beam_size: self.beam_size,
            },
            _ => DecodingMode::Greedy,
        }
    }

    pub fn sampling(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            seed: self.seed,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            channel: ChannelConfig {
                ceiling_bytes: self.channel_ceiling_bytes,
                chunk_bytes: self.chunk_bytes,
            },
            window_ms: self.window_ms,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            record_dir: self.record_dir.clone(),
            max_active_inferences: self.max_active_inferences,
            frame_stride: self.frame_stride,
            ..EngineConfig::default()
        }
    }

    /// Recognition binding for `model`, with `auto` resolved to `best`.
    pub fn recognition_params(&self, model: impl Into<PathBuf>, best: BackendId) -> RecognitionParams {
        RecognitionParams::new(model, self.threads, self.mode, self.backend_id().unwrap_or(best))
            .allow_fallback(self.allow_backend_fallback)
            .decoding(self.decoding_mode())
    }

    pub fn generation_request(
        &self,
        model: impl Into<PathBuf>,
        prompt: impl Into<String>,
        best: BackendId,
    ) -> GenerationRequest {
        let mut request = GenerationRequest::new(model, prompt)
            .backend(self.backend_id().unwrap_or(best), self.allow_backend_fallback)
            .threads(self.threads)
            .sampling(self.sampling())
            .max_tokens(self.max_tokens);
        if let Some(projector) = &self.projector {
            request = request.with_projector(projector.clone());
        }
        request
    }
}

pub fn normalize_backend(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "auto" | "best" => "auto".into(),
        other => other
            .parse::<BackendId>()
            .map(|b| b.name().to_string())
            .unwrap_or_else(|_| "auto".into()),
    }
}

pub fn normalize_decoding(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "beam" | "beam_search" | "beamsearch" => "beam".into(),
        _ => "greedy".into(),
    }
}

fn parse_mode(raw: &str) -> Option<OperatingMode> {
    match raw.trim().to_ascii_lowercase().replace(['-', '_', ' '], "").as_str() {
        "normal" | "0" => Some(OperatingMode::Normal),
        "stresstest" | "stress" | "1" => Some(OperatingMode::StressTest),
        "benchmark" | "bench" | "2" => Some(OperatingMode::Benchmark),
        "transcriberecord" | "record" | "3" => Some(OperatingMode::TranscribeRecord),
        _ => None,
    }
}

fn mode_name(mode: OperatingMode) -> &'static str {
    match mode {
        OperatingMode::Normal => "normal",
        OperatingMode::StressTest => "stressTest",
        OperatingMode::Benchmark => "benchmark",
        OperatingMode::TranscribeRecord => "transcribeRecord",
    }
}

fn env_var_name(key: &str) -> String {
    let mut out = String::from("CADENCE_");
    for c in key.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
        }
        out.push(c.to_ascii_uppercase());
    }
    out
}

fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| invalid(key, e))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, "expected a boolean")),
    }
}

fn is_unset(raw: &str) -> bool {
    raw.is_empty() || raw.eq_ignore_ascii_case("none")
}

fn optional_path(raw: &str) -> Option<PathBuf> {
    (!is_unset(raw)).then(|| PathBuf::from(raw))
}

fn normalize_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn invalid(key: &str, reason: impl std::fmt::Display) -> CadenceError {
    CadenceError::InvalidSetting {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Cadence")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("cadence")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> Settings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| match serde_json::from_str::<Settings>(&raw) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "settings file unreadable, using defaults");
                None
            }
        })
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(|e| CadenceError::Other(e.into()))?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn every_key_round_trips_through_get() {
        let s = Settings::default();
        for key in KEYS {
            assert!(s.get(key).is_some(), "{key}");
        }
        assert!(s.get("nope").is_none());
    }

    #[test]
    fn set_parses_aliases_and_clamps() {
        let mut s = Settings::default();
        s.set("backend", "htp").unwrap();
        assert_eq!(s.backend, "npu");
        assert_eq!(s.backend_id(), Some(BackendId::Npu));
        s.set("backend", "auto").unwrap();
        assert_eq!(s.backend_id(), None);

        s.set("decoding", "beam_search").unwrap();
        s.set("beamSize", "40").unwrap();
        assert_eq!(s.decoding_mode(), DecodingMode::BeamSearch { beam_size: 16 });

        s.set("mode", "stress-test").unwrap();
        assert_eq!(s.get("mode").as_deref(), Some("stressTest"));

        s.set("temperature", "5").unwrap();
        assert_eq!(s.temperature, 2.0);
        s.set("seed", "none").unwrap();
        assert_eq!(s.seed, None);
    }

    #[test]
    fn set_rejects_bad_values_without_changing_state() {
        let mut s = Settings::default();
        assert!(matches!(s.set("threads", "many"), Err(CadenceError::InvalidSetting { .. })));
        assert!(s.set("backend", "tpu").is_err());
        assert!(s.set("allowBackendFallback", "maybe").is_err());
        assert!(s.set("colour", "blue").is_err());
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn overrides_use_screaming_snake_names() {
        let env: HashMap<&str, &str> = [
            ("CADENCE_TOP_P", "0.5"),
            ("CADENCE_POLL_TIMEOUT_MS", "40"),
            ("CADENCE_THREADS", "garbage"),
        ]
        .into_iter()
        .collect();
        let mut s = Settings::default();
        s.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(s.top_p, 0.5);
        assert_eq!(s.poll_timeout_ms, 40);
        assert_eq!(s.threads, 4);
    }

    #[test]
    fn engine_config_carries_tuning() {
        let mut s = Settings::default();
        s.set("windowMs", "500").unwrap();
        s.set("maxActiveInferences", "2").unwrap();
        let cfg = s.engine_config();
        assert_eq!(cfg.window_samples(), 8_000);
        assert_eq!(cfg.max_active_inferences, 2);
        assert_eq!(cfg.poll_timeout, Duration::from_millis(100));
    }

    #[test]
    fn save_then_load_preserves_values() {
        let path = std::env::temp_dir()
            .join(format!("cadence-settings-{}", std::process::id()))
            .join("settings.json");
        let mut s = Settings::default();
        s.set("frameStride", "12").unwrap();
        s.set("generationModel", "/models/vlm.gguf").unwrap();
        save_settings(&path, &s).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded, s);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let loaded = load_settings(Path::new("/nonexistent/cadence/settings.json"));
        assert_eq!(loaded, Settings::default());
    }
}
