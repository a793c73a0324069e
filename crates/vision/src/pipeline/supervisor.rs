//! Pipeline supervisor tying together ingest, transform, emit and the sink.
//!
//! The supervisor owns the two slots and the lifecycle, runs each stage on its
//! own named thread and releases the source and sink once every stage has
//! returned.

use std::{
    io,
    sync::{Arc, Mutex, Once, PoisonError, Weak},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow, bail};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ml_core::{AnnotatedFrame, FrameTransform, IdentityTransform};
use tracing::{debug, error, info, warn};
use video_ingest::{DEFAULT_FPS, Frame, MIN_FPS, VideoSource};

use crate::pipeline::{
    config::RelayConfig,
    emit::{EmitStats, frame_period, run_emitter},
    ingest::{IngestStats, run_ingest},
    sink::{FfmpegSink, FrameSink, SinkAbort, SinkSettings},
    slot::LatestSlot,
    state::{PipelineState, StopOnExit, StopReason},
    telemetry,
    transform::{TransformSettings, TransformStats, run_transformer},
    watchdog::{PipelineHealth, Watchdog},
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineSettings {
    pub looping: bool,
    pub transform: TransformSettings,
    /// Emit rate.
    pub fps: f64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            looping: false,
            transform: TransformSettings::default(),
            fps: DEFAULT_FPS,
        }
    }
}

const SINK_GUARD_POLL: Duration = Duration::from_millis(10);

/// Outcome of a finished run.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PipelineReport {
    pub stop_reason: Option<StopReason>,
    pub ingest: IngestStats,
    pub transform: TransformStats,
    pub emit: EmitStats,
    pub exit_lag: StageExitLag,
    pub elapsed: Duration,
}

/// How long each stage kept running after the winning stop request.
/// `None` for a stage that panicked.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StageExitLag {
    pub ingest: Option<Duration>,
    pub transform: Option<Duration>,
    pub emit: Option<Duration>,
}

pub struct Pipeline<S, T, K> {
    source: S,
    transform: T,
    sink: K,
    settings: PipelineSettings,
    state: Arc<PipelineState>,
    health: Arc<PipelineHealth>,
    watchdog: bool,
}

impl<S, T, K> Pipeline<S, T, K>
where
    S: VideoSource,
    T: FrameTransform,
    K: FrameSink,
{
    pub fn new(source: S, transform: T, sink: K, settings: PipelineSettings) -> Self {
        Self {
            source,
            transform,
            sink,
            settings,
            state: Arc::new(PipelineState::new()),
            health: Arc::new(PipelineHealth::new()),
            watchdog: false,
        }
    }

    /// Share an externally owned lifecycle, e.g. one a signal handler can stop.
    pub fn with_state(mut self, state: Arc<PipelineState>) -> Self {
        self.state = state;
        self
    }

    /// Run the advisory stall watchdog alongside the stages.
    pub fn with_watchdog(mut self, enabled: bool) -> Self {
        self.watchdog = enabled;
        self
    }

    pub fn state(&self) -> Arc<PipelineState> {
        self.state.clone()
    }

    /// Run every stage to completion. Blocks until the pipeline has stopped.
    pub fn run(self) -> Result<PipelineReport> {
        let Pipeline {
            mut source,
            mut transform,
            mut sink,
            settings,
            state,
            health,
            watchdog,
        } = self;

        let Some(period) = frame_period(settings.fps) else {
            bail!("emit rate must be at least {MIN_FPS} fps, got {}", settings.fps);
        };
        let info = source.info();
        let _span = tracing::info_span!(
            "relay.pipeline",
            width = info.width,
            height = info.height,
            fps = settings.fps,
            looping = settings.looping,
            transform = transform.name()
        )
        .entered();
        metrics::gauge!("relay_emit_fps").set(settings.fps);

        let watchdog = if watchdog {
            Some(Watchdog::spawn(health.clone()).context("failed to start watchdog")?)
        } else {
            None
        };

        let raw: LatestSlot<Frame> = LatestSlot::new();
        let annotated: LatestSlot<AnnotatedFrame> = LatestSlot::new();
        let sink_abort = sink.abort_handle();
        let started = Instant::now();

        let stages = thread::scope(|scope| -> Result<_> {
            let (state, health, raw, annotated) = (&*state, &*health, &raw, &annotated);
            let spawn_failed = |err: io::Error| {
                state.request_stop(StopReason::StageFailed);
                anyhow!(err).context("failed to spawn stage thread")
            };
            let (emit_done_tx, emit_done_rx) = crossbeam_channel::bounded::<()>(0);

            let ingest = telemetry::spawn_scoped(scope, "relay-ingest", || {
                let _guard = StopOnExit::new(state, StopReason::StageFailed);
                let stats = run_ingest(&mut source, raw, state, settings.looping, health);
                (stats, Instant::now())
            })
            .map_err(spawn_failed)?;
            let transformer = telemetry::spawn_scoped(scope, "relay-transform", || {
                let _guard = StopOnExit::new(state, StopReason::StageFailed);
                let stats = run_transformer(
                    &mut transform,
                    raw,
                    annotated,
                    state,
                    &settings.transform,
                    health,
                );
                (stats, Instant::now())
            })
            .map_err(spawn_failed)?;
            let emitter = telemetry::spawn_scoped(scope, "relay-emit", || {
                let _done = emit_done_tx;
                let _guard = StopOnExit::new(state, StopReason::StageFailed);
                let stats = run_emitter(&mut sink, annotated, state, period, health);
                (stats, Instant::now())
            })
            .map_err(spawn_failed)?;
            if let Some(abort) = sink_abort {
                telemetry::spawn_scoped(scope, "relay-sink-guard", move || {
                    release_stalled_sink(state, &emit_done_rx, &abort)
                })
                .map_err(spawn_failed)?;
            }

            Ok((
                join_stage(ingest.join(), "ingest"),
                join_stage(transformer.join(), "transform"),
                join_stage(emitter.join(), "emit"),
            ))
        });

        state.mark_stopped();
        sink.close();
        source.close();
        if let Some(watchdog) = watchdog {
            watchdog.stop();
        }
        let (ingest, transform, emit) = stages?;
        let (ingest, ingest_done) = ingest.unzip();
        let (transform, transform_done) = transform.unzip();
        let (emit, emit_done) = emit.unzip();

        let stop_at = state.stop_requested_at();
        let lag = |done: Option<Instant>| Some(done?.saturating_duration_since(stop_at?));
        let report = PipelineReport {
            stop_reason: state.stop_reason(),
            ingest: ingest.unwrap_or_default(),
            transform: transform.unwrap_or_default(),
            emit: emit.unwrap_or_default(),
            exit_lag: StageExitLag {
                ingest: lag(ingest_done),
                transform: lag(transform_done),
                emit: lag(emit_done),
            },
            elapsed: started.elapsed(),
        };
        debug!("stage exit after stop request: {:?}", report.exit_lag);
        info!(
            "relay stopped ({}): {} frame(s) ingested, {} transformed, {} emitted ({} repeat(s)) in {:.1?}",
            report.stop_reason.map_or("unknown", StopReason::label),
            report.ingest.frames,
            report.transform.published,
            report.emit.writes,
            report.emit.repeats,
            report.elapsed
        );
        Ok(report)
    }
}

fn join_stage<R>(joined: thread::Result<R>, stage: &str) -> Option<R> {
    joined.map_err(|_| error!("{stage} stage panicked")).ok()
}

/// Once the pipeline stops, give the emitter the sink's grace period to
/// return, then kill the sink so a write blocked on a stalled consumer fails.
fn release_stalled_sink(state: &PipelineState, emit_done: &Receiver<()>, abort: &SinkAbort) {
    while state.is_running() {
        if let Err(RecvTimeoutError::Disconnected) = emit_done.recv_timeout(SINK_GUARD_POLL) {
            return;
        }
    }
    if let Err(RecvTimeoutError::Timeout) = emit_done.recv_timeout(abort.grace()) {
        abort.kill();
    }
}

/// Assemble the relay described by `config` and run it until it stops.
///
/// Startup failures (source, model or sink) are returned as errors; once the
/// stages are running every stop is reported through [`PipelineReport`].
pub fn run(config: RelayConfig) -> Result<PipelineReport> {
    let _telemetry_guard = telemetry::enter_runtime(&config.telemetry, config.verbose);
    config.validate()?;
    if let Some(addr) = config.telemetry.metrics_addr {
        let addr = telemetry::install_metrics_exporter(addr)?;
        info!("Prometheus metrics available at http://{addr}/metrics");
    }

    let state = Arc::new(PipelineState::new());
    route_interrupts_to(&state);

    let source = video_ingest::open_source(&config.source, config.source_options())
        .with_context(|| format!("failed to open source {}", config.source))?;
    let info = source.info();
    let fps = if frame_period(info.fps).is_some() {
        info.fps
    } else {
        warn!("source rate {} fps is unusable; emitting at {DEFAULT_FPS}", info.fps);
        DEFAULT_FPS
    };
    info!(
        "source: {} ({}x{} @ {:.2} fps)",
        config.source, info.width, info.height, fps
    );

    let transform = build_transform(&config)?;
    let sink = FfmpegSink::spawn(
        &SinkSettings {
            ffmpeg: config.ffmpeg.clone(),
            port: config.port,
            grace: config.sink_grace,
        },
        info.width,
        info.height,
        fps,
    )
    .context("failed to start output stream")?;

    let settings = PipelineSettings {
        looping: config.looping,
        transform: TransformSettings {
            confidence: config.confidence,
            working_scale: config.working_scale,
            ..TransformSettings::default()
        },
        fps,
    };
    Pipeline::new(source, transform, sink, settings)
        .with_state(state)
        .with_watchdog(true)
        .run()
}

fn build_transform(config: &RelayConfig) -> Result<Box<dyn FrameTransform>> {
    match &config.model_path {
        #[cfg(feature = "with-tch")]
        Some(path) => {
            let detector =
                ml_core::detector::Detector::load(path, config.model_input, config.use_cpu)?;
            info!(
                "detector {} loaded on {:?}",
                path.display(),
                detector.device()
            );
            Ok(Box::new(detector))
        }
        #[cfg(not(feature = "with-tch"))]
        Some(path) => bail!(
            "cannot load {}: this build lacks the `with-tch` feature",
            path.display()
        ),
        None => {
            warn!("no --model given; frames are relayed unannotated");
            Ok(Box::new(IdentityTransform))
        }
    }
}

/// Ctrl+C stops whichever pipeline was started last.
fn route_interrupts_to(state: &Arc<PipelineState>) {
    static HANDLER: Once = Once::new();
    static TARGET: Mutex<Option<Weak<PipelineState>>> = Mutex::new(None);

    *TARGET.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(state));
    HANDLER.call_once(|| {
        if let Err(err) = ctrlc::set_handler(|| {
            let target = TARGET.lock().unwrap_or_else(PoisonError::into_inner).clone();
            if let Some(state) = target.and_then(|weak| weak.upgrade()) {
                state.request_stop(StopReason::Interrupted);
            }
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}
