//! Cadence command-line host.
//!
//! Wires the core façade to deterministic stub engines so the orchestration
//! (backend selection, ingestion, recognition, generation, the capture gate)
//! can be exercised end to end from a shell.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{atomic::AtomicBool, Arc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use cadence_core::{
    audio::AudioCapture,
    backend::BackendId,
    engine::Loaders,
    inference::{StubGenerationLoader, StubRecognitionLoader},
    ipc::{NotificationSink, TracingSink},
    settings::{default_settings_path, load_settings, save_settings, KEYS},
    CadenceEngine, Frame, GateDecision, Notification, NotificationKind, Notifier, PixelFormat,
    Settings,
};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "cadence", version, about = "On-device inference orchestration")]
struct Cli {
    /// Settings file (defaults to the platform data directory).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every known backend and whether it is usable here.
    Backends,
    /// Read or change persisted settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
    /// Transcribe a WAV file through the recognition pipeline.
    Transcribe {
        wav: PathBuf,
        /// Recognition model (overrides `recognitionModel`).
        #[arg(long)]
        model: Option<PathBuf>,
        /// Feed audio at real-time pace instead of as fast as possible.
        #[arg(long)]
        realtime: bool,
    },
    /// Transcribe the microphone (needs the `audio-cpal` feature).
    Listen {
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        /// Input device name; the default device otherwise.
        #[arg(long)]
        device: Option<String>,
    },
    /// Generate a completion for a prompt.
    Generate {
        prompt: String,
        /// Generation model (overrides `generationModel`).
        #[arg(long)]
        model: Option<PathBuf>,
        /// Attach a synthetic WIDTHxHEIGHT camera frame.
        #[arg(long)]
        image: Option<String>,
        /// Cancel the run after this many milliseconds.
        #[arg(long)]
        cancel_after_ms: Option<u64>,
    },
    /// Feed synthetic camera frames through the capture gate.
    Watch {
        #[arg(long, default_value = "Describe the scene.")]
        prompt: String,
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = 120)]
        frames: u32,
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// The synthetic scene changes every N frames.
        #[arg(long, default_value_t = 60)]
        change_every: u32,
    },
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Print every setting as JSON.
    Show,
    Get { key: String },
    Set { key: String, value: String },
    /// Print the accepted keys.
    Keys,
}

/// Prints transcripts and streamed tokens to stdout; everything else goes to
/// the log.
struct ConsoleSink {
    transcripts: Mutex<Vec<String>>,
}

impl NotificationSink for ConsoleSink {
    fn notify(&self, n: Notification) {
        match n.kind {
            NotificationKind::Transcript => {
                println!("{}", n.message);
                self.transcripts.lock().push(n.message);
            }
            NotificationKind::Token => {
                print!("{}", n.message);
                let _ = std::io::stdout().flush();
            }
            _ => TracingSink.notify(n),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cadence=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings_path = cli.settings.clone().unwrap_or_else(default_settings_path);
    let mut settings = load_settings(&settings_path);
    settings.apply_env_overrides();

    match cli.command {
        Command::Settings { action } => settings_command(action, &settings_path),
        Command::Backends => {
            let (engine, _) = build_engine(&settings);
            backends(&engine)
        }
        Command::Transcribe { wav, model, realtime } => {
            let model = model
                .or_else(|| settings.recognition_model.clone())
                .context("no recognition model: pass --model or set recognitionModel")?;
            let (engine, sink) = build_engine(&settings);
            transcribe(&engine, &sink, &settings, &wav, model, realtime)
        }
        Command::Listen { model, seconds, device } => {
            let model = model
                .or_else(|| settings.recognition_model.clone())
                .context("no recognition model: pass --model or set recognitionModel")?;
            let (engine, _) = build_engine(&settings);
            listen(&engine, &settings, model, Duration::from_secs(seconds), device.as_deref())
        }
        Command::Generate {
            prompt,
            model,
            image,
            cancel_after_ms,
        } => {
            let model = model
                .or_else(|| settings.generation_model.clone())
                .context("no generation model: pass --model or set generationModel")?;
            let (engine, _) = build_engine(&settings);
            generate(Arc::new(engine), &settings, model, prompt, image, cancel_after_ms)
        }
        Command::Watch {
            prompt,
            model,
            frames,
            fps,
            change_every,
        } => {
            let model = model
                .or_else(|| settings.generation_model.clone())
                .context("no generation model: pass --model or set generationModel")?;
            let (engine, _) = build_engine(&settings);
            watch(&engine, &settings, model, prompt, frames, fps, change_every)
        }
    }
}

fn build_engine(settings: &Settings) -> (CadenceEngine, Arc<ConsoleSink>) {
    let sink = Arc::new(ConsoleSink {
        transcripts: Mutex::new(Vec::new()),
    });
    let notifier = Notifier::from_arc(sink.clone());
    let loaders = Loaders {
        recognition: Arc::new(StubRecognitionLoader::default()),
        generation: Arc::new(StubGenerationLoader::default()),
    };
    (CadenceEngine::new(settings.engine_config(), loaders, notifier), sink)
}

fn best_backend(engine: &CadenceEngine) -> BackendId {
    engine.registry().best_available().id
}

fn settings_command(action: SettingsAction, path: &Path) -> anyhow::Result<()> {
    // Persist only file values; environment overrides stay transient.
    let mut stored = load_settings(path);
    match action {
        SettingsAction::Show => println!("{}", serde_json::to_string_pretty(&stored)?),
        SettingsAction::Keys => KEYS.iter().for_each(|k| println!("{k}")),
        SettingsAction::Get { key } => match stored.get(&key) {
            Some(value) => println!("{value}"),
            None => bail!("unknown setting: {key}"),
        },
        SettingsAction::Set { key, value } => {
            stored.set(&key, &value)?;
            save_settings(path, &stored)?;
            info!(key = key.as_str(), path = %path.display(), "setting saved");
            println!("{key} = {}", stored.get(&key).unwrap_or_default());
        }
    }
    Ok(())
}

fn backends(engine: &CadenceEngine) -> anyhow::Result<()> {
    let all: Vec<_> = BackendId::ALL
        .iter()
        .map(|&id| engine.registry().descriptor(id))
        .collect();
    println!("{}", serde_json::to_string_pretty(&all)?);
    println!("best available: {}", best_backend(engine));
    Ok(())
}

/// Interleaved WAV samples averaged to mono `f32`.
fn read_wav(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn transcribe(
    engine: &CadenceEngine,
    sink: &ConsoleSink,
    settings: &Settings,
    wav: &Path,
    model: PathBuf,
    realtime: bool,
) -> anyhow::Result<()> {
    let (samples, rate) = read_wav(wav)?;
    info!(
        samples = samples.len(),
        rate,
        secs = samples.len() as f64 / rate.max(1) as f64,
        "wav loaded"
    );

    engine.recognition_init(settings.recognition_params(model, best_backend(engine)))?;
    let mut ingest = engine.audio_ingest()?;
    let monitor = ingest.monitor();
    let ceiling = settings.channel_ceiling_bytes;
    engine.recognition_start()?;

    let block = (rate as usize / 10).max(1);
    let started = Instant::now();
    let mut rejected = 0usize;
    for (i, piece) in samples.chunks(block).enumerate() {
        // Stay well under the ceiling instead of tripping backpressure.
        while monitor.buffered_bytes() > ceiling / 2 {
            thread::sleep(Duration::from_millis(5));
        }
        rejected += ingest.push_samples(piece, rate)?.rejected;
        if realtime {
            let due = started + Duration::from_millis(100 * (i as u64 + 1));
            thread::sleep(due.saturating_duration_since(Instant::now()));
        }
    }
    rejected += ingest.flush()?.rejected;
    if rejected > 0 {
        warn!(rejected, "chunks rejected by backpressure");
    }

    let drain_deadline = Instant::now() + Duration::from_secs(30);
    while monitor.buffered_bytes() > 0 && Instant::now() < drain_deadline {
        thread::sleep(Duration::from_millis(10));
    }
    engine.recognition_stop()?;

    let diag = engine.recognition_diagnostics();
    info!(
        windows = diag.windows,
        transcripts = sink.transcripts.lock().len(),
        engine_errors = diag.engine_errors,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "transcription finished"
    );
    engine.recognition_finalize();
    Ok(())
}

fn listen(
    engine: &CadenceEngine,
    settings: &Settings,
    model: PathBuf,
    duration: Duration,
    device: Option<&str>,
) -> anyhow::Result<()> {
    engine.recognition_init(settings.recognition_params(model, best_backend(engine)))?;
    let ingest = engine.audio_ingest()?;
    engine.recognition_start()?;

    let running = Arc::new(AtomicBool::new(true));
    let capture = match AudioCapture::open(ingest, Arc::clone(&running), device) {
        Ok(capture) => capture,
        Err(e) => {
            engine.recognition_finalize();
            return Err(e.into());
        }
    };
    info!(rate = capture.sample_rate, secs = duration.as_secs(), "listening");
    thread::sleep(duration);
    capture.stop();
    drop(capture);

    engine.recognition_stop()?;
    let diag = engine.recognition_diagnostics();
    info!(
        chunks = diag.chunks_in,
        windows = diag.windows,
        transcripts = diag.transcripts_emitted,
        "listening finished"
    );
    engine.recognition_finalize();
    Ok(())
}

fn parse_dimensions(raw: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = raw
        .split_once(['x', 'X'])
        .context("image size must look like 640x480")?;
    Ok((w.trim().parse()?, h.trim().parse()?))
}

/// Flat grey frame whose brightness encodes `scene`.
fn synthetic_frame(width: u32, height: u32, scene: u32) -> anyhow::Result<Frame> {
    let shade = (scene.wrapping_mul(37) % 256) as u8;
    let data = vec![shade; (width * height * 4) as usize];
    Ok(Frame::packed(width, height, PixelFormat::Rgba8888, data)?)
}

fn generate(
    engine: Arc<CadenceEngine>,
    settings: &Settings,
    model: PathBuf,
    prompt: String,
    image: Option<String>,
    cancel_after_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut request = settings.generation_request(model, prompt, best_backend(&engine));
    if let Some(size) = image {
        let (w, h) = parse_dimensions(&size)?;
        request = request.with_image(synthetic_frame(w, h, 0)?);
    }

    let canceller = cancel_after_ms.map(|ms| {
        let engine = Arc::clone(&engine);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(ms));
            if engine.request_cancel() > 0 {
                info!(after_ms = ms, "cancel requested");
            }
        })
    });

    let result = engine.generate(&request)?;
    println!();
    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(handle) = canceller {
        let _ = handle.join();
    }
    Ok(())
}

fn watch(
    engine: &CadenceEngine,
    settings: &Settings,
    model: PathBuf,
    prompt: String,
    frames: u32,
    fps: u32,
    change_every: u32,
) -> anyhow::Result<()> {
    let template = settings.generation_request(model, prompt, best_backend(engine));
    if template.projector_path.is_none() {
        bail!("watch needs a projector: set the `projector` setting");
    }
    let gate = engine.capture_gate(template)?;
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);

    for i in 0..frames {
        let frame = synthetic_frame(64, 48, i / change_every.max(1))?;
        match gate.on_frame(frame) {
            GateDecision::PassThrough => {}
            GateDecision::Cached(text) => info!(frame = i, "cached: {text}"),
            decision => info!(frame = i, ?decision, "gate"),
        }
        thread::sleep(interval);
    }
    gate.wait_idle(Duration::from_secs(5));

    if let Some(fps) = gate.fps() {
        info!(fps, "capture rate");
    }
    println!("{}", serde_json::to_string_pretty(&gate.stats())?);
    if let Some((fingerprint, text)) = gate.last_result() {
        println!("last [{fingerprint}]: {text}");
    }
    Ok(())
}
