//! Ingest stage: pull frames from the source as fast as it yields them and
//! overwrite slot A with each one.

use std::{thread, time::Duration};

use tracing::{debug, error, info, warn};
use video_ingest::{Frame, VideoSource};

use crate::pipeline::{
    slot::LatestSlot,
    state::{PipelineState, StopReason},
    watchdog::{HealthComponent, PipelineHealth},
};

/// Read failures in a row, without a good frame in between, before a looping
/// source is given up on. End of stream never counts.
pub const MAX_CONSECUTIVE_SOURCE_RESTARTS: u32 = 5;

/// Pause before rewinding a looping source whose last pass yielded nothing.
const EMPTY_PASS_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Frames published into the slot.
    pub frames: u64,
    /// End-of-stream events seen.
    pub end_of_stream: u64,
    /// Successful rewinds, for end of stream and for read failures.
    pub restarts: u64,
}

/// Run the ingest loop until the pipeline stops or the source ends.
///
/// Sequence numbers start at zero and keep growing across restarts.
pub fn run_ingest<S: VideoSource + ?Sized>(
    source: &mut S,
    output: &LatestSlot<Frame>,
    state: &PipelineState,
    looping: bool,
    health: &PipelineHealth,
) -> IngestStats {
    let _span = tracing::info_span!("ingest.worker", looping).entered();
    let mut stats = IngestStats::default();
    let mut failures: u32 = 0;
    let mut produced_since_restart = false;

    while state.is_running() {
        health.beat(HealthComponent::Ingest);
        let reason = match source.read_frame() {
            Ok(Some(frame)) => {
                failures = 0;
                produced_since_restart = true;
                output.publish(frame.with_sequence(stats.frames));
                stats.frames += 1;
                metrics::counter!("relay_frames_ingested_total").increment(1);
                continue;
            }
            Ok(None) => {
                stats.end_of_stream += 1;
                if !looping {
                    info!("source ended after {} frame(s)", stats.frames);
                    state.request_stop(StopReason::SourceExhausted);
                    break;
                }
                if !produced_since_restart && stats.restarts > 0 {
                    thread::sleep(EMPTY_PASS_BACKOFF);
                }
                "end of stream"
            }
            Err(err) => {
                if !looping {
                    error!("source read failed: {err}");
                    state.request_stop(StopReason::SourceFailed);
                    break;
                }
                failures += 1;
                warn!("source read failed: {err}");
                "read failure"
            }
        };

        if failures > MAX_CONSECUTIVE_SOURCE_RESTARTS {
            error!("source failed {failures} times in a row; giving up");
            state.request_stop(StopReason::SourceFailed);
            break;
        }
        if let Err(err) = source.seek_to_start() {
            error!("failed to rewind source after {reason}: {err}");
            state.request_stop(StopReason::SourceFailed);
            break;
        }
        stats.restarts += 1;
        produced_since_restart = false;
        metrics::counter!("relay_source_restarts_total").increment(1);
        debug!("source restarted after {reason} (restart #{})", stats.restarts);
    }

    stats
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use video_ingest::{CaptureError, SourceInfo, SyntheticSource};

    use super::*;
    use crate::pipeline::state::Lifecycle;

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Frame,
        End,
        Fail,
    }

    /// Replays a fixed timeline of reads; rewinding does not reset it.
    struct ScriptedSource {
        script: Vec<Step>,
        pos: usize,
        /// Returned once the script runs out.
        tail: Step,
        /// Asked to stop when the script runs out.
        stop_on_exhaust: Option<Arc<PipelineState>>,
        seeks: u64,
        running_at_seek: Vec<bool>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>, tail: Step) -> Self {
            Self {
                script,
                pos: 0,
                tail,
                stop_on_exhaust: None,
                seeks: 0,
                running_at_seek: Vec::new(),
            }
        }
    }

    impl VideoSource for ScriptedSource {
        fn info(&self) -> SourceInfo {
            SourceInfo {
                width: 4,
                height: 2,
                fps: 30.0,
            }
        }

        fn read_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            let step = match self.script.get(self.pos) {
                Some(step) => *step,
                None => {
                    if let Some(state) = &self.stop_on_exhaust {
                        state.request_stop(StopReason::Interrupted);
                    }
                    self.tail
                }
            };
            self.pos += 1;
            match step {
                Step::Frame => Ok(Some(Frame::solid(4, 2, [1, 2, 3]))),
                Step::End => Ok(None),
                Step::Fail => Err(CaptureError::Closed),
            }
        }

        fn seek_to_start(&mut self) -> Result<(), CaptureError> {
            self.seeks += 1;
            if let Some(state) = &self.stop_on_exhaust {
                self.running_at_seek.push(state.is_running());
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    #[test]
    fn looping_source_rewinds_once_per_end_of_stream() {
        use Step::*;
        let state = Arc::new(PipelineState::new());
        let mut source = ScriptedSource::new(
            vec![Frame, Frame, End, Frame, End, Frame, Frame, End, Frame],
            Frame,
        );
        source.stop_on_exhaust = Some(state.clone());
        let slot = LatestSlot::new();

        let stats = run_ingest(&mut source, &slot, &state, true, &PipelineHealth::new());

        assert_eq!(source.seeks, 3);
        assert_eq!(stats.end_of_stream, 3);
        assert_eq!(stats.restarts, 3);
        assert!(source.running_at_seek.iter().all(|running| *running));
        assert_eq!(state.stop_reason(), Some(StopReason::Interrupted));
    }

    #[test]
    fn end_of_stream_without_loop_stops_the_pipeline() {
        let state = PipelineState::new();
        let slot = LatestSlot::new();
        let mut source = SyntheticSource::new(8, 6, 30.0)
            .unpaced()
            .with_frame_count(3);

        let stats = run_ingest(&mut source, &slot, &state, false, &PipelineHealth::new());

        assert_eq!(stats.frames, 3);
        assert_eq!(source.seek_count(), 0);
        assert_eq!(state.lifecycle(), Lifecycle::Stopping);
        assert_eq!(state.stop_reason(), Some(StopReason::SourceExhausted));
        let last = slot.latest().unwrap();
        assert_eq!(last.generation, 3);
        assert_eq!(last.value.sequence, 2);
    }

    #[test]
    fn sequences_keep_growing_across_restarts() {
        let state = Arc::new(PipelineState::new());
        let mut source = ScriptedSource::new(
            vec![Step::Frame, Step::End, Step::Frame, Step::Frame],
            Step::Frame,
        );
        source.stop_on_exhaust = Some(state.clone());
        let slot = LatestSlot::new();
        let stats = run_ingest(&mut source, &slot, &state, true, &PipelineHealth::new());
        // The tail frame read after the stop request is still published.
        assert_eq!(stats.frames, 4);
        assert_eq!(slot.latest().unwrap().value.sequence, 3);
    }

    #[test]
    fn read_error_without_loop_is_terminal() {
        let state = PipelineState::new();
        let mut source = ScriptedSource::new(vec![Step::Frame, Step::Fail], Step::Frame);
        let stats = run_ingest(
            &mut source,
            &LatestSlot::new(),
            &state,
            false,
            &PipelineHealth::new(),
        );
        assert_eq!(stats.frames, 1);
        assert_eq!(source.seeks, 0);
        assert_eq!(state.stop_reason(), Some(StopReason::SourceFailed));
    }

    #[test]
    fn looping_source_gives_up_after_repeated_failures() {
        let state = PipelineState::new();
        let mut source = ScriptedSource::new(vec![Step::Frame], Step::Fail);
        run_ingest(
            &mut source,
            &LatestSlot::new(),
            &state,
            true,
            &PipelineHealth::new(),
        );
        assert_eq!(source.seeks, u64::from(MAX_CONSECUTIVE_SOURCE_RESTARTS));
        assert_eq!(state.stop_reason(), Some(StopReason::SourceFailed));
    }

    #[test]
    fn good_frames_reset_the_failure_budget() {
        use Step::*;
        let state = Arc::new(PipelineState::new());
        let mut script = Vec::new();
        for _ in 0..3 {
            script.extend([Fail, Fail, Fail, Fail, Frame]);
        }
        let mut source = ScriptedSource::new(script, Frame);
        source.stop_on_exhaust = Some(state.clone());
        run_ingest(
            &mut source,
            &LatestSlot::new(),
            &state,
            true,
            &PipelineHealth::new(),
        );
        assert_eq!(source.seeks, 12);
        assert_eq!(state.stop_reason(), Some(StopReason::Interrupted));
    }

    #[test]
    fn empty_looping_source_keeps_rewinding_until_stopped() {
        let state = Arc::new(PipelineState::new());
        let mut source = ScriptedSource::new(Vec::new(), Step::End);
        let stats = std::thread::scope(|s| {
            let stopper = s.spawn(|| {
                std::thread::sleep(Duration::from_millis(200));
                state.request_stop(StopReason::Interrupted);
            });
            let stats = run_ingest(
                &mut source,
                &LatestSlot::new(),
                &state,
                true,
                &PipelineHealth::new(),
            );
            stopper.join().unwrap();
            stats
        });
        assert_eq!(state.stop_reason(), Some(StopReason::Interrupted));
        assert!(stats.end_of_stream > u64::from(MAX_CONSECUTIVE_SOURCE_RESTARTS) + 1);
        assert_eq!(stats.end_of_stream, source.seeks);
        assert_eq!(stats.restarts, source.seeks);
    }
}
