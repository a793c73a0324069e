//! Configuration parsing for the relay pipeline.
//!
//! This module owns translation of CLI arguments into a `RelayConfig` struct
//! which downstream stages use without re-parsing flags.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Result, anyhow, bail};
use clap::Args;
use video_ingest::{FfmpegOptions, MIN_FPS};

use crate::pipeline::emit::frame_period;

/// TCP port the sink listens on when none is given.
pub const DEFAULT_PORT: u16 = 1377;
/// Minimum detection score reported by the transform.
pub const DEFAULT_CONFIDENCE: f32 = 0.25;
/// Divisor applied to both source dimensions before the transform.
pub const DEFAULT_WORKING_SCALE: u32 = 2;
/// Time the sink gets to exit after its stdin is closed.
pub const DEFAULT_SINK_GRACE_MS: u64 = 2_000;
const MAX_SINK_GRACE: Duration = Duration::from_secs(60);
/// Square model input used by the detector.
pub const DEFAULT_MODEL_INPUT: u32 = 640;

/// Canonical configuration shared by every stage in the pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct RelayConfig {
    /// File path, device index/path, network URI or `synthetic://` pattern.
    pub source: String,
    /// TCP port the MPEG-TS sink listens on.
    pub port: u16,
    /// Rewind the source at end of stream instead of stopping.
    pub looping: bool,
    /// Detection score threshold in `[0, 1]`.
    pub confidence: f32,
    /// TorchScript detector; `None` relays frames unannotated.
    pub model_path: Option<PathBuf>,
    /// Detector input `(width, height)`.
    pub model_input: (u32, u32),
    /// Force CPU inference.
    pub use_cpu: bool,
    /// Source dimensions are divided by this before the transform.
    pub working_scale: u32,
    /// Emit rate override; the probed rate is used otherwise.
    pub fps: Option<f64>,
    /// Bounded wait for the sink to exit before it is killed.
    pub sink_grace: Duration,
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    /// Emit debug logging (phase timings, detections).
    pub verbose: bool,
    /// Telemetry and instrumentation options.
    pub telemetry: TelemetryOptions,
}

#[derive(Clone, Debug, Default, PartialEq)]
/// Optional telemetry knobs for tracing and metrics export.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing pipeline spans.
    pub chrome_trace_path: Option<PathBuf>,
    /// Serve Prometheus metrics on this address.
    pub metrics_addr: Option<SocketAddr>,
}

impl RelayConfig {
    /// Configuration for `source` with every other setting at its default.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            port: DEFAULT_PORT,
            looping: false,
            confidence: DEFAULT_CONFIDENCE,
            model_path: None,
            model_input: (DEFAULT_MODEL_INPUT, DEFAULT_MODEL_INPUT),
            use_cpu: false,
            working_scale: DEFAULT_WORKING_SCALE,
            fps: None,
            sink_grace: Duration::from_millis(DEFAULT_SINK_GRACE_MS),
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            verbose: false,
            telemetry: TelemetryOptions::default(),
        }
    }

    /// Options handed to the ffmpeg-backed source.
    pub fn source_options(&self) -> FfmpegOptions {
        FfmpegOptions {
            ffmpeg: self.ffmpeg.clone(),
            ffprobe: self.ffprobe.clone(),
            fps_override: self.fps,
        }
    }

    /// Check the invariants every stage relies on.
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            bail!("source must not be empty");
        }
        if self.port == 0 {
            bail!("--port must be between 1 and 65535");
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            bail!("--conf must be between 0 and 1");
        }
        if self.working_scale == 0 {
            bail!("--scale must be at least 1");
        }
        if let Some(fps) = self.fps {
            if frame_period(fps).is_none() {
                bail!("--fps must be a finite rate of at least {MIN_FPS}");
            }
        }
        if self.sink_grace > MAX_SINK_GRACE {
            bail!("--sink-grace-ms must not exceed {} ms", MAX_SINK_GRACE.as_millis());
        }
        if self.model_input.0 == 0 || self.model_input.1 == 0 {
            bail!("--model-size must be a positive integer");
        }
        Ok(())
    }
}

/// CLI arguments accepted by the relay.
#[derive(Debug, Args)]
pub struct RelayCliArgs {
    /// Video file, device index or path, stream URI or synthetic://WxH@FPS.
    #[arg(value_name = "SOURCE")]
    pub source: Option<String>,

    /// Source flag (overrides positional).
    #[arg(long = "source", value_name = "URI")]
    pub source_flag: Option<String>,
    /// TCP port the MPEG-TS output listens on.
    #[arg(long = "port", value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,
    /// Rewind the source when it ends.
    #[arg(long = "loop", action = clap::ArgAction::SetTrue)]
    pub looping: bool,
    /// Detection confidence threshold (0-1).
    #[arg(long = "conf", value_name = "SCORE", default_value_t = DEFAULT_CONFIDENCE)]
    pub confidence: f32,
    /// TorchScript detector to annotate frames with.
    #[arg(long = "model", value_name = "PATH")]
    pub model: Option<PathBuf>,
    /// Square detector input size in pixels.
    #[arg(long = "model-size", value_name = "PX", default_value_t = DEFAULT_MODEL_INPUT)]
    pub model_size: u32,
    /// Force CPU inference.
    #[arg(long = "cpu", action = clap::ArgAction::SetTrue)]
    pub use_cpu: bool,
    /// Divide source dimensions by this before running the transform.
    #[arg(long = "scale", value_name = "N", default_value_t = DEFAULT_WORKING_SCALE)]
    pub scale: u32,
    /// Output frame rate (defaults to the source rate).
    #[arg(long = "fps", value_name = "FPS")]
    pub fps: Option<f64>,
    /// Milliseconds the sink gets to exit before it is killed.
    #[arg(long = "sink-grace-ms", value_name = "MS", default_value_t = DEFAULT_SINK_GRACE_MS)]
    pub sink_grace_ms: u64,
    /// ffmpeg binary used for decoding and output.
    #[arg(long = "ffmpeg", value_name = "PATH", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,
    /// ffprobe binary used to read stream properties.
    #[arg(long = "ffprobe", value_name = "PATH", default_value = "ffprobe")]
    pub ffprobe: PathBuf,
    /// Enable verbose logging (phase timings, detections).
    #[arg(long = "verbose", short = 'v', action = clap::ArgAction::SetTrue)]
    pub verbose: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9000).
    #[arg(long = "metrics-addr", value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl TryFrom<RelayCliArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: RelayCliArgs) -> Result<Self> {
        let source = args.source_flag.or(args.source).ok_or_else(|| {
            anyhow!("Missing source. Provide --source <uri> or positional <source>.")
        })?;

        let config = Self {
            port: args.port,
            looping: args.looping,
            confidence: args.confidence,
            model_path: args.model,
            model_input: (args.model_size, args.model_size),
            use_cpu: args.use_cpu,
            working_scale: args.scale,
            fps: args.fps,
            sink_grace: Duration::from_millis(args.sink_grace_ms),
            ffmpeg: args.ffmpeg,
            ffprobe: args.ffprobe,
            verbose: args.verbose,
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
                metrics_addr: args.metrics_addr,
            },
            ..Self::new(source)
        };
        config.validate()?;
        Ok(config)
    }
}
