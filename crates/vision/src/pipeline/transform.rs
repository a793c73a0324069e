//! Transform stage: annotate the newest ingested frame and overwrite slot B.
//!
//! Frames superseded in slot A while a transform call runs are never looked
//! at. A failed call drops that frame and the loop moves on.

use std::time::{Duration, Instant};

use ml_core::{AnnotatedFrame, FrameTransform, TransformError};
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::pipeline::{
    config::{DEFAULT_CONFIDENCE, DEFAULT_WORKING_SCALE},
    scale::{resize_frame, working_size},
    slot::LatestSlot,
    state::PipelineState,
    watchdog::{HealthComponent, PipelineHealth},
};

/// Upper bound on one idle wait for a new input frame.
pub(crate) const INPUT_POLL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TransformSettings {
    pub confidence: f32,
    pub working_scale: u32,
    /// Log phase timings every this many transform calls; 0 disables.
    pub report_every: u64,
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            confidence: DEFAULT_CONFIDENCE,
            working_scale: DEFAULT_WORKING_SCALE,
            report_every: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransformStats {
    /// Transform calls made, successful or not.
    pub invocations: u64,
    pub published: u64,
    pub failures: u64,
    /// Ingested frames that were overwritten before the stage could take them.
    pub superseded: u64,
}

/// Per-phase durations of one transform call. The downscale is also where the
/// stage takes its private copy of the shared frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct PhaseSample {
    downscale: Duration,
    transform: Duration,
    upscale: Duration,
}

#[derive(Default)]
struct PhaseTimings {
    total: PhaseSample,
    samples: u32,
}

impl PhaseTimings {
    fn record(&mut self, sample: PhaseSample) {
        for (phase, spent) in [
            ("downscale", sample.downscale),
            ("transform", sample.transform),
            ("upscale", sample.upscale),
        ] {
            metrics::histogram!("relay_transform_seconds", "phase" => phase)
                .record(spent.as_secs_f64());
        }
        self.total.downscale += sample.downscale;
        self.total.transform += sample.transform;
        self.total.upscale += sample.upscale;
        self.samples += 1;
    }

    fn report(&mut self, invocations: u64) {
        if self.samples == 0 {
            return;
        }
        let avg_ms = |total: Duration| total.as_secs_f64() * 1_000.0 / f64::from(self.samples);
        debug!(
            "transform #{invocations}: downscale {:.2} ms, transform {:.2} ms, upscale {:.2} ms (avg of {})",
            avg_ms(self.total.downscale),
            avg_ms(self.total.transform),
            avg_ms(self.total.upscale),
            self.samples
        );
        *self = Self::default();
    }
}

/// Run the transform loop until the pipeline leaves the running state.
pub fn run_transformer<T: FrameTransform + ?Sized>(
    transform: &mut T,
    input: &LatestSlot<Frame>,
    output: &LatestSlot<AnnotatedFrame>,
    state: &PipelineState,
    settings: &TransformSettings,
    health: &PipelineHealth,
) -> TransformStats {
    let _span = tracing::info_span!(
        "transform.worker",
        transform = transform.name(),
        scale = settings.working_scale
    )
    .entered();
    let mut stats = TransformStats::default();
    let mut timings = PhaseTimings::default();
    let mut seen: u64 = 0;

    while state.is_running() {
        health.beat(HealthComponent::Transform);
        let Some(snapshot) = input.wait_newer(seen, INPUT_POLL) else {
            continue;
        };
        if seen > 0 {
            stats.superseded += snapshot.generation - seen - 1;
        }
        seen = snapshot.generation;

        stats.invocations += 1;
        match transform_one(transform, &snapshot.value, settings, &mut timings) {
            Ok(annotated) => {
                output.publish(annotated);
                stats.published += 1;
            }
            Err(err) => {
                stats.failures += 1;
                metrics::counter!("relay_transform_failures_total").increment(1);
                warn!("skipping frame #{}: {err}", snapshot.value.sequence);
            }
        }

        if settings.report_every > 0 && stats.invocations % settings.report_every == 0 {
            timings.report(stats.invocations);
        }
    }

    stats
}

fn transform_one<T: FrameTransform + ?Sized>(
    transform: &mut T,
    frame: &Frame,
    settings: &TransformSettings,
    timings: &mut PhaseTimings,
) -> Result<AnnotatedFrame, TransformError> {
    let started = Instant::now();
    let (work_w, work_h) = working_size(frame.width, frame.height, settings.working_scale);
    let working = resize_frame(frame, work_w, work_h)?;
    let downscaled = Instant::now();

    let annotated = transform.infer(&working, settings.confidence)?;
    let transformed = Instant::now();

    let sx = frame.width as f32 / annotated.frame.width.max(1) as f32;
    let sy = frame.height as f32 / annotated.frame.height.max(1) as f32;
    let restored = AnnotatedFrame {
        frame: resize_frame(&annotated.frame, frame.width, frame.height)?,
        detections: annotated
            .detections
            .iter()
            .map(|d| d.scaled(sx, sy))
            .collect(),
    };
    let finished = Instant::now();

    timings.record(PhaseSample {
        downscale: downscaled - started,
        transform: transformed - downscaled,
        upscale: finished - transformed,
    });
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc, Mutex,
            atomic::{AtomicU64, Ordering},
        },
        thread,
    };

    use ml_core::IdentityTransform;

    use super::*;
    use crate::pipeline::state::StopReason;

    /// Records what it was asked to transform; optionally slow or failing.
    struct ScriptedTransform {
        calls: Arc<AtomicU64>,
        sequences: Arc<Mutex<Vec<u64>>>,
        sizes: Arc<Mutex<Vec<(u32, u32)>>>,
        delay: Duration,
        fail_odd: bool,
    }

    impl ScriptedTransform {
        fn new() -> Self {
            Self {
                calls: Arc::default(),
                sequences: Arc::default(),
                sizes: Arc::default(),
                delay: Duration::ZERO,
                fail_odd: false,
            }
        }
    }

    impl FrameTransform for ScriptedTransform {
        fn name(&self) -> &str {
            "scripted"
        }

        fn infer(
            &mut self,
            frame: &Frame,
            _confidence: f32,
        ) -> Result<AnnotatedFrame, TransformError> {
            thread::sleep(self.delay);
            self.sequences.lock().unwrap().push(frame.sequence);
            self.sizes.lock().unwrap().push((frame.width, frame.height));
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_odd && frame.sequence % 2 == 1 {
                return Err(TransformError::Inference("odd frame".into()));
            }
            Ok(AnnotatedFrame::passthrough(frame.clone()))
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    #[test]
    fn failed_frames_are_skipped_and_the_loop_continues() {
        let input = LatestSlot::new();
        let output = LatestSlot::new();
        let state = PipelineState::new();
        let health = PipelineHealth::new();
        let mut scripted = ScriptedTransform::new();
        scripted.fail_odd = true;
        let calls = scripted.calls.clone();

        let stats = thread::scope(|s| {
            let worker = s.spawn(|| {
                run_transformer(
                    &mut scripted,
                    &input,
                    &output,
                    &state,
                    &TransformSettings::default(),
                    &health,
                )
            });
            for seq in 0..6u64 {
                input.publish(Frame::solid(16, 8, [5, 5, 5]).with_sequence(seq));
                assert!(wait_until(Duration::from_secs(5), || {
                    calls.load(Ordering::SeqCst) == seq + 1
                }));
            }
            state.request_stop(StopReason::Interrupted);
            worker.join().unwrap()
        });

        assert_eq!(stats.invocations, 6);
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.published, 3);
        assert_eq!(output.generation(), 3);
        assert_eq!(output.latest().unwrap().value.frame.sequence, 4);
    }

    #[test]
    fn slow_transform_sees_only_the_newest_frames() {
        const FRAMES: u64 = 200;
        let input = LatestSlot::new();
        let output = LatestSlot::new();
        let state = PipelineState::new();
        let health = PipelineHealth::new();
        let mut scripted = ScriptedTransform::new();
        scripted.delay = Duration::from_millis(20);
        let sequences = scripted.sequences.clone();

        let stats = thread::scope(|s| {
            let worker = s.spawn(|| {
                run_transformer(
                    &mut scripted,
                    &input,
                    &output,
                    &state,
                    &TransformSettings::default(),
                    &health,
                )
            });
            for seq in 0..FRAMES {
                input.publish(Frame::solid(16, 8, [9, 9, 9]).with_sequence(seq));
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(100));
            state.request_stop(StopReason::Interrupted);
            worker.join().unwrap()
        });

        let seen = sequences.lock().unwrap().clone();
        assert!(stats.invocations < FRAMES, "{} calls", stats.invocations);
        assert!(stats.superseded > 0);
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        // The last frame is always picked up once the ingest side goes quiet.
        assert_eq!(seen.last(), Some(&(FRAMES - 1)));
    }

    #[test]
    fn transform_runs_at_working_resolution_and_output_is_restored() {
        let input = LatestSlot::new();
        let output = LatestSlot::new();
        let state = PipelineState::new();
        let health = PipelineHealth::new();
        let mut scripted = ScriptedTransform::new();
        let sizes = scripted.sizes.clone();
        let calls = scripted.calls.clone();

        thread::scope(|s| {
            let worker = s.spawn(|| {
                run_transformer(
                    &mut scripted,
                    &input,
                    &output,
                    &state,
                    &TransformSettings::default(),
                    &health,
                )
            });
            input.publish(Frame::solid(64, 48, [40, 80, 120]));
            assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) == 1));
            state.request_stop(StopReason::Interrupted);
            worker.join().unwrap();
        });

        assert_eq!(sizes.lock().unwrap().as_slice(), &[(32, 24)]);
        let out = output.latest().unwrap();
        assert_eq!((out.value.frame.width, out.value.frame.height), (64, 48));
        assert_eq!(out.value.frame.data.len(), 64 * 48 * 3);
        assert!(out.value.frame.data.chunks(3).all(|px| px == [40, 80, 120]));
    }

    #[test]
    fn inference_time_is_booked_to_the_transform_phase() {
        let mut scripted = ScriptedTransform::new();
        scripted.delay = Duration::from_millis(20);
        let mut timings = PhaseTimings::default();
        let frame = Frame::solid(64, 48, [1, 2, 3]);

        transform_one(&mut scripted, &frame, &TransformSettings::default(), &mut timings).unwrap();

        assert_eq!(timings.samples, 1);
        let total = timings.total;
        assert!(total.transform >= scripted.delay, "{total:?}");
        assert!(total.downscale < scripted.delay, "{total:?}");
        assert!(total.upscale < scripted.delay, "{total:?}");
        timings.report(30);
        assert_eq!(timings.samples, 0);
        assert_eq!(timings.total, PhaseSample::default());
    }

    #[test]
    fn stops_without_input() {
        let state = PipelineState::new();
        state.request_stop(StopReason::SinkClosed);
        let stats = run_transformer(
            &mut IdentityTransform,
            &LatestSlot::new(),
            &LatestSlot::new(),
            &state,
            &TransformSettings::default(),
            &PipelineHealth::new(),
        );
        assert_eq!(stats, TransformStats::default());
    }
}
