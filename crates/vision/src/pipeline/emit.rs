//! Emit stage: write the newest annotated frame to the sink at a fixed rate.
//!
//! When the transform has nothing newer the previous frame is written again,
//! so the output keeps its cadence. A tick that runs long is followed
//! immediately by the next one; missed ticks are not made up.

use std::{
    thread,
    time::{Duration, Instant},
};

use ml_core::AnnotatedFrame;
use tracing::{debug, error, info};
use video_ingest::MIN_FPS;

use crate::pipeline::{
    sink::FrameSink,
    slot::LatestSlot,
    state::{PipelineState, StopReason},
    watchdog::{HealthComponent, PipelineHealth},
};

/// Upper bound on one wait for the first annotated frame.
pub(crate) const STARTUP_POLL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EmitStats {
    pub ticks: u64,
    /// Payloads handed to the sink, repeats included.
    pub writes: u64,
    /// Ticks with nothing to write.
    pub skipped: u64,
    /// Writes of a frame already written on an earlier tick.
    pub repeats: u64,
    /// Ticks that took longer than the period.
    pub overruns: u64,
}

/// Time left to sleep in a tick that started `elapsed` ago, if any.
pub fn pacing_delay(period: Duration, elapsed: Duration) -> Option<Duration> {
    period.checked_sub(elapsed).filter(|delay| !delay.is_zero())
}

/// Period between writes for a nominal frame rate, if the rate is usable.
pub fn frame_period(fps: f64) -> Option<Duration> {
    if !fps.is_finite() || fps < MIN_FPS {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|period| !period.is_zero())
}

/// Run the emit loop until the pipeline leaves the running state or the sink fails.
pub fn run_emitter<K: FrameSink + ?Sized>(
    sink: &mut K,
    input: &LatestSlot<AnnotatedFrame>,
    state: &PipelineState,
    period: Duration,
    health: &PipelineHealth,
) -> EmitStats {
    let _span = tracing::info_span!("emit.worker", period_ms = period.as_secs_f64() * 1_000.0)
        .entered();
    let mut stats = EmitStats::default();

    while state.is_running() && !input.wait_written(STARTUP_POLL) {
        health.beat(HealthComponent::Emit);
    }
    if state.is_running() {
        info!("first annotated frame ready; emitting");
    }

    let mut last_generation = 0;
    while state.is_running() {
        let tick = Instant::now();
        health.beat(HealthComponent::Emit);
        stats.ticks += 1;

        match input.latest() {
            Some(snapshot) => {
                if snapshot.generation == last_generation {
                    stats.repeats += 1;
                    metrics::counter!("relay_frames_repeated_total").increment(1);
                }
                last_generation = snapshot.generation;
                if let Err(err) = sink.write_frame(&snapshot.value.frame.data) {
                    error!("sink write failed: {err}");
                    state.request_stop(StopReason::SinkClosed);
                    break;
                }
                stats.writes += 1;
                metrics::counter!("relay_frames_emitted_total").increment(1);
            }
            None => stats.skipped += 1,
        }

        match pacing_delay(period, tick.elapsed()) {
            Some(delay) => thread::sleep(delay),
            None => {
                stats.overruns += 1;
                metrics::counter!("relay_emit_overruns_total").increment(1);
            }
        }
    }

    debug!(
        "emitter stopped: {} write(s), {} repeat(s), {} overrun(s)",
        stats.writes, stats.repeats, stats.overruns
    );
    stats
}
